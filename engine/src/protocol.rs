//! Wire codec.
//!
//! Every message travels on a numbered channel, one channel per bucket:
//! `"<channel>:<command>:<payload>"`. Within a channel the commands are:
//!
//! | direction | command                         | meaning                            |
//! |-----------|---------------------------------|------------------------------------|
//! | out       | `i:1:<mark>::<limit>`           | request an index page              |
//! | out       | `c:<change>`                    | send a change                      |
//! | out       | `cv:<cv>`                       | resume from a checkpoint           |
//! | out       | `e:<key>.<version>`             | fetch one version of a record      |
//! | in        | `i:<page>`                      | index page                         |
//! | in        | `c:[<change>, ...]`             | changes, acks and errors           |
//! | in        | `cv:?`                          | checkpoint unknown, reindex        |
//! | in        | `cv:<cv>`                       | checkpoint marker                  |
//! | in        | `e:<key>.<version>\n<data\|?>`  | a record version (`?` if missing)  |

use crate::change::Change;
use crate::reconcile::{IndexEntry, IndexPage, IndexRequest};
use crate::value::Attributes;
use crate::{error::Result, ChangeVersion, Error, Key, Version};
use serde::Deserialize;

/// Message sent to the server on a bucket's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Index(IndexRequest),
    Change(Change),
    ChangeVersion(ChangeVersion),
    Entity { key: Key, version: Version },
}

impl Outbound {
    /// Encode without the channel prefix.
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            Outbound::Index(request) => format!(
                "i:1:{}::{}",
                request.mark.as_deref().unwrap_or_default(),
                request.limit
            ),
            Outbound::Change(change) => format!(
                "c:{}",
                serde_json::to_string(change).map_err(|e| Error::MalformedMessage(e.to_string()))?
            ),
            Outbound::ChangeVersion(cv) => format!("cv:{cv}"),
            Outbound::Entity { key, version } => format!("e:{key}.{version}"),
        })
    }
}

/// Message received from the server on a bucket's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Index(IndexPage),
    Changes(Vec<Change>),
    /// The server does not know the checkpoint we resumed from.
    UnknownChangeVersion,
    /// Standalone checkpoint marker.
    ChangeVersion(ChangeVersion),
    Entity {
        key: Key,
        version: Version,
        /// `None` when the server has no such version.
        data: Option<Attributes>,
    },
}

impl Inbound {
    /// Decode a message stripped of its channel prefix.
    pub fn decode(message: &str) -> Result<Self> {
        let (command, payload) = message
            .split_once(':')
            .ok_or_else(|| Error::MalformedMessage(truncate(message)))?;
        match command {
            "i" => decode_index(payload).map(Inbound::Index),
            "c" => serde_json::from_str(payload)
                .map(Inbound::Changes)
                .map_err(|e| Error::MalformedMessage(format!("changes: {e}"))),
            "cv" => match payload.trim() {
                "?" => Ok(Inbound::UnknownChangeVersion),
                "" => Err(Error::MalformedMessage("empty change version".into())),
                cv => Ok(Inbound::ChangeVersion(cv.to_string())),
            },
            "e" => decode_entity(payload),
            other => Err(Error::UnknownCommand(other.to_string())),
        }
    }
}

/// Index page as sent on the wire. Older servers put the entries under
/// `current` and carry no separate checkpoint.
#[derive(Deserialize)]
struct RawIndexPage {
    #[serde(default)]
    index: Vec<IndexEntry>,
    #[serde(default)]
    current: Option<serde_json::Value>,
    #[serde(default)]
    mark: Option<serde_json::Value>,
}

fn decode_index(payload: &str) -> Result<IndexPage> {
    let raw: RawIndexPage = serde_json::from_str(payload)
        .map_err(|e| Error::MalformedMessage(format!("index: {e}")))?;
    let mut page = IndexPage {
        index: raw.index,
        current: None,
        mark: raw.mark.and_then(|m| scalar(&m)),
    };
    match raw.current {
        Some(serde_json::Value::Array(entries)) => {
            let entries: Vec<IndexEntry> =
                serde_json::from_value(serde_json::Value::Array(entries))
                    .map_err(|e| Error::MalformedMessage(format!("index: {e}")))?;
            page.index.extend(entries);
        }
        Some(other) => page.current = scalar(&other),
        None => {}
    }
    Ok(page)
}

fn scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decode_entity(payload: &str) -> Result<Inbound> {
    let (header, body) = payload.split_once('\n').unwrap_or((payload, "?"));
    let (key, version) = header
        .rsplit_once('.')
        .ok_or_else(|| Error::MalformedMessage(format!("entity header: {}", truncate(header))))?;
    let version = version
        .parse()
        .map_err(|_| Error::MalformedMessage(format!("entity version: {version}")))?;
    let data = match body.trim() {
        "?" | "" => None,
        json => {
            let value: serde_json::Value = serde_json::from_str(json)
                .map_err(|e| Error::MalformedMessage(format!("entity data: {e}")))?;
            match crate::value::Value::from(value) {
                crate::value::Value::Object(attrs) => Some(attrs),
                _ => return Err(Error::MalformedMessage("entity data is not an object".into())),
            }
        }
    };
    Ok(Inbound::Entity {
        key: key.to_string(),
        version,
        data,
    })
}

/// Prefix a message with its channel.
pub fn with_channel(channel: u32, message: &str) -> String {
    format!("{channel}:{message}")
}

/// Split a channel prefix off a message.
pub fn split_channel(message: &str) -> Result<(u32, &str)> {
    let (channel, rest) = message
        .split_once(':')
        .ok_or_else(|| Error::MalformedMessage(truncate(message)))?;
    let channel = channel
        .parse()
        .map_err(|_| Error::MalformedMessage(format!("channel: {channel}")))?;
    Ok((channel, rest))
}

fn truncate(message: &str) -> String {
    message.chars().take(64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Operation;
    use crate::value::Value;

    #[test]
    fn encode_outbound() {
        let first = Outbound::Index(IndexRequest {
            mark: None,
            limit: 500,
        });
        assert_eq!(first.encode().unwrap(), "i:1:::500");

        let next = Outbound::Index(IndexRequest {
            mark: Some("m1".into()),
            limit: 50,
        });
        assert_eq!(next.encode().unwrap(), "i:1:m1::50");

        assert_eq!(
            Outbound::ChangeVersion("abc".into()).encode().unwrap(),
            "cv:abc"
        );
        assert_eq!(
            Outbound::Entity {
                key: "k.1".into(),
                version: 3
            }
            .encode()
            .unwrap(),
            "e:k.1.3"
        );

        let change = Change::remove("k", "me", Some(2)).with_ccid("c1");
        assert_eq!(
            Outbound::Change(change).encode().unwrap(),
            r#"c:{"id":"k","clientid":"me","ccid":"c1","o":"-","sv":2}"#
        );
    }

    #[test]
    fn decode_index_page() {
        let msg = r#"i:{"index":[{"id":"a","v":1},{"id":"b","v":2,"d":{"t":"x"}}],"current":"cv5","mark":"m"}"#;
        let Inbound::Index(page) = Inbound::decode(msg).unwrap() else {
            panic!("expected index");
        };
        assert_eq!(page.index.len(), 2);
        assert_eq!(page.current.as_deref(), Some("cv5"));
        assert_eq!(page.mark.as_deref(), Some("m"));
        assert_eq!(page.index[1].d.as_ref().unwrap()["t"], Value::from("x"));
    }

    #[test]
    fn decode_index_with_entries_under_current() {
        let msg = r#"i:{"current":[{"id":"a","v":1}]}"#;
        let Inbound::Index(page) = Inbound::decode(msg).unwrap() else {
            panic!("expected index");
        };
        assert_eq!(page.index.len(), 1);
        assert_eq!(page.current, None);
        assert_eq!(page.mark, None);
    }

    #[test]
    fn decode_changes() {
        let msg = r#"c:[{"id":"a","clientid":"x","ccids":["c1"],"o":"M","v":{},"sv":1,"ev":2,"cv":"cv2"},{"id":"b","ccid":"c2","o":"-","error":409}]"#;
        let Inbound::Changes(changes) = Inbound::decode(msg).unwrap() else {
            panic!("expected changes");
        };
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].operation, Operation::Remove);
        assert_eq!(changes[1].error, Some(409));
    }

    #[test]
    fn decode_entity_versions() {
        let found = Inbound::decode("e:note.v2.7\n{\"t\":\"x\"}").unwrap();
        assert_eq!(
            found,
            Inbound::Entity {
                key: "note.v2".into(),
                version: 7,
                data: Some(crate::value::attributes(serde_json::json!({"t": "x"}))),
            }
        );

        let missing = Inbound::decode("e:note.7\n?").unwrap();
        assert!(matches!(missing, Inbound::Entity { data: None, .. }));
    }

    #[test]
    fn decode_errors() {
        assert_eq!(
            Inbound::decode("cv:?").unwrap(),
            Inbound::UnknownChangeVersion
        );
        assert_eq!(
            Inbound::decode("cv:5f1a").unwrap(),
            Inbound::ChangeVersion("5f1a".into())
        );
        assert!(matches!(
            Inbound::decode("cv:"),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            Inbound::decode("x:1"),
            Err(Error::UnknownCommand(c)) if c == "x"
        ));
        assert!(matches!(
            Inbound::decode("garbage"),
            Err(Error::MalformedMessage(_))
        ));
        assert!(Inbound::decode("c:not json").is_err());
    }

    #[test]
    fn channels() {
        assert_eq!(with_channel(2, "cv:?"), "2:cv:?");
        assert_eq!(split_channel("2:cv:?").unwrap(), (2, "cv:?"));
        assert!(split_channel("h:1").is_err());
    }
}
