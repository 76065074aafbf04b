//! Ghostline - sync a set of buckets over stdio.
//!
//! Lines read from stdin are server messages (`<channel>:<cmd>:<payload>`);
//! an entity header (`<channel>:e:<key>.<version>`) is followed by one line
//! of data. Messages for the server are written to stdout, logs to stderr.
//!
//! Lines starting with `/` edit the in-memory store instead:
//!
//! ```text
//! /put <bucket> <key> <json object>
//! /del <bucket> <key>
//! /versions <bucket> <key> <count>
//! /reindex <bucket>
//! /reset <bucket>
//! /status <bucket>
//! /snapshot <bucket>
//! ```

use std::sync::Arc;

use ghostline_client::{ChannelTransport, Config, SyncClient};
use ghostline_engine::value::attributes;
use ghostline_engine::{BucketSchema, MemoryStorage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ghostline_client=debug,ghostline_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(client_id = %config.client_id, buckets = ?config.buckets, "Starting Ghostline");

    let storage = Arc::new(MemoryStorage::new());
    let (transport, mut outbound) = ChannelTransport::pair();
    let client = SyncClient::new_shared(
        Arc::new(config.sync_config()),
        storage.clone(),
        Arc::new(transport),
    );
    storage.add_observer(client.observer());

    for name in &config.buckets {
        client.add_bucket(BucketSchema::dynamic(name.clone()), None)?;
    }
    client.start()?;

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            println!("{message}");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            if let Err(e) = run_command(&client, &storage, command).await {
                tracing::warn!(command, error = %e, "command failed");
            }
            continue;
        }

        let mut message = line.to_string();
        if is_entity_header(line) {
            if let Some(body) = lines.next_line().await? {
                message.push('\n');
                message.push_str(&body);
            }
        }
        if let Err(e) = client.receive(&message) {
            tracing::warn!(error = %e, "dropping message");
        }
    }

    client.shutdown().await;
    writer.abort();
    Ok(())
}

/// `<channel>:e:<key>.<version>` with no data on the same line.
fn is_entity_header(line: &str) -> bool {
    line.split_once(':')
        .is_some_and(|(channel, rest)| {
            channel.parse::<u32>().is_ok() && rest.starts_with("e:") && !rest.contains('\n')
        })
}

async fn run_command(
    client: &SyncClient,
    storage: &MemoryStorage,
    command: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut parts = command.splitn(4, ' ');
    let verb = parts.next().unwrap_or_default();
    let bucket = parts.next().ok_or("missing bucket")?;

    match verb {
        "put" => {
            let key = parts.next().ok_or("missing key")?;
            let json: serde_json::Value = serde_json::from_str(parts.next().unwrap_or("{}"))?;
            if !json.is_object() {
                return Err("record must be a JSON object".into());
            }
            storage.put_local(bucket, key, attributes(json));
            storage.save();
        }
        "del" => {
            let key = parts.next().ok_or("missing key")?;
            storage.remove_local(bucket, key);
            storage.save();
        }
        "versions" => {
            let key = parts.next().ok_or("missing key")?;
            let count = parts.next().unwrap_or("1").trim().parse()?;
            client.request_versions(bucket, key, count)?;
        }
        "reindex" => client.reindex(bucket)?,
        "reset" => client.reset(bucket).await?,
        "status" => {
            let status = client.status(bucket).await?;
            eprintln!("{}", serde_json::to_string_pretty(&status)?);
        }
        "snapshot" => {
            let snapshot = client.snapshot(bucket).await?;
            eprintln!("{}", snapshot.to_json_pretty()?);
        }
        other => return Err(format!("unknown command: {other}").into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_headers_take_a_data_line() {
        assert!(is_entity_header("0:e:n1.3"));
        assert!(!is_entity_header("0:c:[]"));
        assert!(!is_entity_header("notes:e:n1.3"));
    }
}
