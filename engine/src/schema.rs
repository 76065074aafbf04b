//! Bucket schemas and member validation.
//!
//! A schema maps attribute names to member types. The member type decides
//! how the attribute is validated, how it is decoded from the wire and which
//! diff [`Strategy`] is used for it.

use crate::diff::{DiffOp, DiffPolicy, ObjectDiff, Strategy};
use crate::value::{Attributes, Value};
use crate::{error::Result, BucketName, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Member types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberType {
    Text,
    Number,
    Boolean,
    /// Seconds since the epoch, stored as a number but never merged.
    Date,
    List,
    Object,
    /// Reference to a binary blob
    Binary,
    /// Reference to a record in another (or the same) bucket
    Entity,
}

impl MemberType {
    /// The diff strategy used for members of this type.
    pub fn strategy(self) -> Strategy {
        match self {
            MemberType::Text => Strategy::Text,
            MemberType::Number => Strategy::Numeric,
            MemberType::List => Strategy::List,
            MemberType::Object => Strategy::Object,
            MemberType::Boolean | MemberType::Date | MemberType::Binary | MemberType::Entity => {
                Strategy::Replace
            }
        }
    }
}

impl std::fmt::Display for MemberType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberType::Text => write!(f, "Text"),
            MemberType::Number => write!(f, "Number"),
            MemberType::Boolean => write!(f, "Boolean"),
            MemberType::Date => write!(f, "Date"),
            MemberType::List => write!(f, "List"),
            MemberType::Object => write!(f, "Object"),
            MemberType::Binary => write!(f, "Binary"),
            MemberType::Entity => write!(f, "Entity"),
        }
    }
}

/// Definition of a member in a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Attribute name
    pub name: String,
    /// Member type
    pub member_type: MemberType,
    /// Bucket holding the referenced records, for entity members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_bucket: Option<BucketName>,
}

impl Member {
    /// Create a new member definition.
    pub fn new(name: impl Into<String>, member_type: MemberType) -> Self {
        Self {
            name: name.into(),
            member_type,
            target_bucket: None,
        }
    }

    /// Create an entity member pointing into `target_bucket`.
    pub fn entity(name: impl Into<String>, target_bucket: impl Into<BucketName>) -> Self {
        Self {
            name: name.into(),
            member_type: MemberType::Entity,
            target_bucket: Some(target_bucket.into()),
        }
    }

    /// Validate a value against this member. Null is always accepted.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let valid = match (self.member_type, value) {
            (_, Value::Null) => true,
            (MemberType::Text, Value::String(_)) => true,
            (MemberType::Number | MemberType::Date, Value::Number(_)) => true,
            (MemberType::Boolean, Value::Bool(_)) => true,
            (MemberType::List, Value::List(_)) => true,
            (MemberType::Object, Value::Object(_)) => true,
            (MemberType::Binary, Value::Binary(_) | Value::String(_)) => true,
            (MemberType::Entity, Value::Entity(_) | Value::String(_)) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                member: self.name.clone(),
                expected: self.member_type.to_string(),
                got: value.type_name().to_string(),
            })
        }
    }

    /// Re-type a value decoded from plain JSON.
    ///
    /// References travel as strings; this turns them back into
    /// [`Value::Entity`] / [`Value::Binary`].
    pub fn decode(&self, value: Value) -> Value {
        match (self.member_type, value) {
            (MemberType::Entity, Value::String(key)) => Value::entity(key),
            (MemberType::Binary, Value::String(id)) => Value::binary(id),
            (_, value) => value,
        }
    }
}

/// Schema for a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSchema {
    /// Bucket name
    pub name: BucketName,
    /// Member definitions
    pub members: Vec<Member>,
    /// Whether attributes without a member definition are synced too
    #[serde(default)]
    pub dynamic: bool,
}

impl BucketSchema {
    /// Create a new bucket schema.
    pub fn new(name: impl Into<BucketName>, members: Vec<Member>) -> Self {
        Self {
            name: name.into(),
            members,
            dynamic: false,
        }
    }

    /// A schema with no declared members that syncs every attribute.
    pub fn dynamic(name: impl Into<BucketName>) -> Self {
        Self::new(name, Vec::new()).with_dynamic(true)
    }

    /// Builder-style method to toggle dynamic members.
    pub fn with_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Builder-style method to add a member.
    pub fn with_member(mut self, member: Member) -> Self {
        self.members.push(member);
        self
    }

    /// Get a member by name.
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Diff policy built from the member types.
    pub fn policy(&self) -> DiffPolicy {
        self.members
            .iter()
            .fold(DiffPolicy::new(), |policy, member| {
                policy.with(member.name.clone(), member.member_type.strategy())
            })
    }

    /// Whether an attribute is synced by this bucket.
    pub fn tracks(&self, name: &str) -> bool {
        self.dynamic || self.member(name).is_some()
    }

    /// Keep only synced attributes.
    pub fn project(&self, attrs: &Attributes) -> Attributes {
        attrs
            .iter()
            .filter(|(name, _)| self.tracks(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Decode attributes received from the server.
    pub fn decode(&self, attrs: Attributes) -> Attributes {
        attrs
            .into_iter()
            .filter(|(name, _)| self.tracks(name))
            .map(|(name, value)| match self.member(&name) {
                Some(member) => {
                    let value = member.decode(value);
                    (name, value)
                }
                None => (name, value),
            })
            .collect()
    }

    /// Decode a diff received from the server. Untracked members are dropped.
    ///
    /// Only whole-value ops can carry references, so nested ops are kept.
    pub fn decode_diff(&self, diff: ObjectDiff) -> ObjectDiff {
        diff.into_iter()
            .filter(|(name, _)| self.tracks(name))
            .map(|(name, op)| {
                let op = match (self.member(&name), op) {
                    (Some(member), DiffOp::Add(value)) => DiffOp::Add(member.decode(value)),
                    (Some(member), DiffOp::Replace(value)) => {
                        DiffOp::Replace(member.decode(value))
                    }
                    (_, op) => op,
                };
                (name, op)
            })
            .collect()
    }

    /// Validate attributes against the declared members.
    pub fn validate(&self, attrs: &Attributes) -> Result<()> {
        for (name, value) in attrs {
            match self.member(name) {
                Some(member) => member.validate(value)?,
                None if self.dynamic => {}
                None => {
                    return Err(Error::InvalidAttributes(format!(
                        "unknown member '{name}' in bucket '{}'",
                        self.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Entity references held by a record: `(member, target bucket, key)`.
    pub fn references<'a>(
        &'a self,
        attrs: &'a Attributes,
    ) -> impl Iterator<Item = (&'a str, &'a BucketName, &'a str)> + 'a {
        self.members.iter().filter_map(move |member| {
            let target = member.target_bucket.as_ref()?;
            let entity = attrs.get(&member.name)?.as_entity()?;
            Some((member.name.as_str(), target, entity.key.as_str()))
        })
    }
}

/// Schema for every bucket a client syncs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Bucket schemas by name
    pub buckets: BTreeMap<BucketName, BucketSchema>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bucket to the schema.
    pub fn add_bucket(&mut self, bucket: BucketSchema) -> &mut Self {
        self.buckets.insert(bucket.name.clone(), bucket);
        self
    }

    /// Builder-style method to add a bucket.
    pub fn with_bucket(mut self, bucket: BucketSchema) -> Self {
        self.add_bucket(bucket);
        self
    }

    /// Get a bucket schema by name.
    pub fn get_bucket(&self, name: &str) -> Result<&BucketSchema> {
        self.buckets
            .get(name)
            .ok_or_else(|| Error::BucketNotFound(name.to_string()))
    }
}
