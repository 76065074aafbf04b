//! Structural diff, apply and transform over typed values.
//!
//! The engine works member by member. How a member is diffed is decided by
//! its [`Strategy`], which comes from the bucket schema (or is inferred from
//! the values for dynamic members):
//!
//! | strategy | op     | merge behaviour                                   |
//! |----------|--------|---------------------------------------------------|
//! | Replace  | `r`    | whole value, later diff wins                      |
//! | Numeric  | `I`    | arithmetic delta, commutes                        |
//! | Text     | `d`    | character delta, rebased by position              |
//! | List     | `L`    | index edits, rebased by the other side's edits    |
//! | Object   | `O`    | recursive per key, disjoint keys never conflict   |
//!
//! Object members can additionally be added (`+`) or removed (`-`).

pub mod list;
pub mod text;

pub use list::{ListDiff, ListEdit};
pub use text::{TextDelta, TextEdit};

use crate::error::ApplyError;
use crate::value::{Attributes, Number, Value};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Per-key diff of an object. Only changed keys are present.
pub type ObjectDiff = BTreeMap<String, DiffOp>;

/// A single diff operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOp {
    /// Key added to an object.
    Add(Value),
    /// Key removed from an object.
    Remove,
    /// Whole value replaced.
    Replace(Value),
    /// Number changed by a delta.
    Increment(Number),
    /// Text edited.
    Text(TextDelta),
    /// List edited.
    List(ListDiff),
    /// Nested object edited.
    Object(ObjectDiff),
}

impl DiffOp {
    /// Wire name of the operation.
    pub fn code(&self) -> &'static str {
        match self {
            DiffOp::Add(_) => "+",
            DiffOp::Remove => "-",
            DiffOp::Replace(_) => "r",
            DiffOp::Increment(_) => "I",
            DiffOp::Text(_) => "d",
            DiffOp::List(_) => "L",
            DiffOp::Object(_) => "O",
        }
    }
}

impl Serialize for DiffOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("o", self.code())?;
        match self {
            DiffOp::Add(v) | DiffOp::Replace(v) => map.serialize_entry("v", v)?,
            DiffOp::Remove => {}
            DiffOp::Increment(n) => map.serialize_entry("v", &Value::Number(*n))?,
            DiffOp::Text(delta) => map.serialize_entry("v", &delta.to_delta_string())?,
            DiffOp::List(list) => map.serialize_entry("v", list)?,
            DiffOp::Object(object) => map.serialize_entry("v", object)?,
        }
        map.end()
    }
}

#[derive(Deserialize)]
struct RawOp {
    o: String,
    #[serde(default)]
    v: Option<serde_json::Value>,
}

impl<'de> Deserialize<'de> for DiffOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawOp::deserialize(deserializer)?;
        let value = |raw: RawOp| {
            raw.v
                .ok_or_else(|| D::Error::custom(format!("diff op '{}' requires a value", raw.o)))
        };
        match raw.o.as_str() {
            "+" => Ok(DiffOp::Add(Value::from(value(raw)?))),
            "-" => Ok(DiffOp::Remove),
            "r" => Ok(DiffOp::Replace(Value::from(value(raw)?))),
            "I" => match Value::from(value(raw)?) {
                Value::Number(n) => Ok(DiffOp::Increment(n)),
                other => Err(D::Error::custom(format!(
                    "increment requires a number, got {}",
                    other.type_name()
                ))),
            },
            "d" => match value(raw)? {
                serde_json::Value::String(s) => TextDelta::parse(&s)
                    .map(DiffOp::Text)
                    .map_err(D::Error::custom),
                _ => Err(D::Error::custom("text delta must be a string")),
            },
            "L" => serde_json::from_value(value(raw)?)
                .map(DiffOp::List)
                .map_err(D::Error::custom),
            "O" => serde_json::from_value(value(raw)?)
                .map(DiffOp::Object)
                .map_err(D::Error::custom),
            other => Err(D::Error::custom(format!("unknown diff op '{other}'"))),
        }
    }
}

/// How a member is diffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Pick from the runtime types of both values.
    #[default]
    Infer,
    Replace,
    Numeric,
    Text,
    List,
    Object,
}

impl Strategy {
    fn infer(from: &Value, to: &Value) -> Strategy {
        match (from, to) {
            (Value::Number(_), Value::Number(_)) => Strategy::Numeric,
            (Value::String(_), Value::String(_)) => Strategy::Text,
            (Value::List(_), Value::List(_)) => Strategy::List,
            (Value::Object(_), Value::Object(_)) => Strategy::Object,
            _ => Strategy::Replace,
        }
    }
}

/// Member name to [`Strategy`] mapping for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffPolicy {
    members: BTreeMap<String, Strategy>,
}

impl DiffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style method to set a member's strategy.
    pub fn with(mut self, member: impl Into<String>, strategy: Strategy) -> Self {
        self.members.insert(member.into(), strategy);
        self
    }

    pub fn strategy(&self, member: &str) -> Strategy {
        self.members.get(member).copied().unwrap_or_default()
    }
}

/// Which of two concurrent diffs the server orders later.
///
/// The later diff wins conflicting members, since it is the one the server
/// applies last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Later {
    /// The diff being rebased lands later.
    Op,
    /// The diff it is rebased onto lands later.
    Onto,
}

/// Diff two values. `None` when they are equal.
pub fn diff(from: &Value, to: &Value, policy: &DiffPolicy) -> Option<DiffOp> {
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            let d = diff_attributes(a, b, policy);
            (!d.is_empty()).then_some(DiffOp::Object(d))
        }
        _ => diff_with(from, to, Strategy::Infer),
    }
}

/// Diff two values using an explicit strategy.
pub fn diff_with(from: &Value, to: &Value, strategy: Strategy) -> Option<DiffOp> {
    if from == to {
        return None;
    }
    let strategy = match strategy {
        Strategy::Infer => Strategy::infer(from, to),
        other => other,
    };
    match (strategy, from, to) {
        (Strategy::Numeric, Value::Number(a), Value::Number(b)) => {
            Some(DiffOp::Increment(b.sub(*a)))
        }
        (Strategy::Text, Value::String(a), Value::String(b)) => {
            Some(DiffOp::Text(text::diff(a, b)))
        }
        (Strategy::List, Value::List(a), Value::List(b)) => Some(DiffOp::List(list::diff(a, b))),
        (Strategy::Object, Value::Object(a), Value::Object(b)) => {
            let d = diff_attributes(a, b, &DiffPolicy::default());
            (!d.is_empty()).then_some(DiffOp::Object(d))
        }
        _ => Some(DiffOp::Replace(to.clone())),
    }
}

/// Diff two attribute maps. Only changed keys are included.
pub fn diff_attributes(from: &Attributes, to: &Attributes, policy: &DiffPolicy) -> ObjectDiff {
    let mut out = ObjectDiff::new();
    for (key, old) in from {
        match to.get(key) {
            None => {
                out.insert(key.clone(), DiffOp::Remove);
            }
            Some(new) => {
                if let Some(op) = diff_with(old, new, policy.strategy(key)) {
                    out.insert(key.clone(), op);
                }
            }
        }
    }
    for (key, new) in to {
        if !from.contains_key(key) {
            out.insert(key.clone(), DiffOp::Add(new.clone()));
        }
    }
    out
}

/// Apply a diff to a value.
pub fn apply(value: &Value, op: &DiffOp) -> Result<Value, ApplyError> {
    apply_member(Some(value), op)?.ok_or(ApplyError::IncompatibleType {
        op: "-",
        found: value.type_name().to_string(),
    })
}

/// Apply an object diff to an attribute map.
pub fn apply_attributes(attrs: &Attributes, diff: &ObjectDiff) -> Result<Attributes, ApplyError> {
    let mut out = attrs.clone();
    for (key, op) in diff {
        match apply_member(attrs.get(key), op)? {
            Some(value) => {
                out.insert(key.clone(), value);
            }
            None => {
                out.remove(key);
            }
        }
    }
    Ok(out)
}

/// Apply one op to a possibly absent member. `None` means absent.
fn apply_member(current: Option<&Value>, op: &DiffOp) -> Result<Option<Value>, ApplyError> {
    let incompatible = |current: Option<&Value>| ApplyError::IncompatibleType {
        op: op.code(),
        found: current.map_or("missing", Value::type_name).to_string(),
    };
    match op {
        DiffOp::Add(v) | DiffOp::Replace(v) => Ok(Some(v.clone())),
        DiffOp::Remove => Ok(None),
        DiffOp::Increment(delta) => match current {
            Some(Value::Number(n)) => Ok(Some(Value::Number(n.add(*delta)))),
            other => Err(incompatible(other)),
        },
        DiffOp::Text(delta) => match current {
            Some(Value::String(s)) => Ok(Some(Value::String(delta.apply(s)?))),
            other => Err(incompatible(other)),
        },
        DiffOp::List(edits) => match current {
            Some(Value::List(items)) => Ok(Some(Value::List(edits.apply(items)?))),
            other => Err(incompatible(other)),
        },
        DiffOp::Object(diff) => match current {
            Some(Value::Object(map)) => Ok(Some(Value::Object(apply_attributes(map, diff)?))),
            other => Err(incompatible(other)),
        },
    }
}

/// Rebase `op` so it applies after `onto`; both were computed against
/// `base`. `None` means nothing of `op` survives.
pub fn transform(
    op: &DiffOp,
    onto: &DiffOp,
    base: &Value,
    later: Later,
) -> Result<Option<DiffOp>, ApplyError> {
    transform_member(op, onto, Some(base), later)
}

/// Rebase an object diff so it applies after `onto`.
pub fn transform_attributes(
    op: &ObjectDiff,
    onto: &ObjectDiff,
    base: &Attributes,
    later: Later,
) -> Result<ObjectDiff, ApplyError> {
    let mut out = ObjectDiff::new();
    for (key, member_op) in op {
        let rebased = match onto.get(key) {
            Some(onto_op) => transform_member(member_op, onto_op, base.get(key), later)?,
            None => Some(member_op.clone()),
        };
        if let Some(rebased) = rebased {
            out.insert(key.clone(), rebased);
        }
    }
    Ok(out)
}

fn transform_member(
    op: &DiffOp,
    onto: &DiffOp,
    base: Option<&Value>,
    later: Later,
) -> Result<Option<DiffOp>, ApplyError> {
    let op_wins = later == Later::Op;
    match (op, onto, base) {
        (DiffOp::Increment(delta), DiffOp::Increment(_), _) => Ok(Some(DiffOp::Increment(*delta))),
        (DiffOp::Text(a), DiffOp::Text(b), Some(Value::String(s))) => {
            let len = s.chars().count();
            if a.base_len() != len {
                return Err(ApplyError::mismatch(format!(
                    "text delta expects {} characters, base has {len}",
                    a.base_len()
                )));
            }
            let (rebased, _) = text::transform(a, b, op_wins)?;
            Ok((!rebased.is_noop()).then_some(DiffOp::Text(rebased)))
        }
        (DiffOp::List(a), DiffOp::List(b), Some(Value::List(_))) => {
            let (rebased, _) = list::transform(a, b, op_wins);
            Ok((!rebased.is_empty()).then_some(DiffOp::List(rebased)))
        }
        (DiffOp::Object(a), DiffOp::Object(b), Some(Value::Object(map))) => {
            let rebased = transform_attributes(a, b, map, later)?;
            Ok((!rebased.is_empty()).then_some(DiffOp::Object(rebased)))
        }
        _ => resolve_conflict(op, onto, base, op_wins),
    }
}

/// Two ops that cannot be merged member-wise: the later one wins outright.
fn resolve_conflict(
    op: &DiffOp,
    onto: &DiffOp,
    base: Option<&Value>,
    op_wins: bool,
) -> Result<Option<DiffOp>, ApplyError> {
    if !op_wins {
        return Ok(None);
    }
    let target = apply_member(base, op)?;
    let landed = apply_member(base, onto)?;
    Ok(match (target, landed) {
        (None, None) => None,
        (None, Some(_)) => Some(DiffOp::Remove),
        (Some(target), None) => Some(DiffOp::Add(target)),
        (Some(target), Some(landed)) if target == landed => None,
        (Some(target), Some(_)) => Some(DiffOp::Replace(target)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::attributes;
    use serde_json::json;

    fn obj(json: serde_json::Value) -> Attributes {
        attributes(json)
    }

    /// Apply both diffs in both orders and check they meet.
    fn converge(
        base: serde_json::Value,
        local: serde_json::Value,
        remote: serde_json::Value,
    ) -> Attributes {
        let (base, local, remote) = (obj(base), obj(local), obj(remote));
        let policy = DiffPolicy::default();
        let local_diff = diff_attributes(&base, &local, &policy);
        let remote_diff = diff_attributes(&base, &remote, &policy);

        // client: local already applied, remote rebased onto it
        let remote_prime =
            transform_attributes(&remote_diff, &local_diff, &base, Later::Onto).unwrap();
        let client = apply_attributes(&local, &remote_prime).unwrap();

        // server: remote first, then local rebased onto it
        let local_prime =
            transform_attributes(&local_diff, &remote_diff, &base, Later::Op).unwrap();
        let server = apply_attributes(&apply_attributes(&base, &remote_diff).unwrap(), &local_prime)
            .unwrap();

        assert_eq!(client, server);
        client
    }

    #[test]
    fn diff_includes_only_changed_keys() {
        let from = obj(json!({"a": 1, "b": "x", "c": true}));
        let to = obj(json!({"a": 1, "b": "y", "d": null}));
        let d = diff_attributes(&from, &to, &DiffPolicy::default());

        assert!(!d.contains_key("a"));
        assert!(matches!(d["b"], DiffOp::Text(_)));
        assert_eq!(d["c"], DiffOp::Remove);
        assert_eq!(d["d"], DiffOp::Add(Value::Null));
        assert_eq!(apply_attributes(&from, &d).unwrap(), to);
    }

    #[test]
    fn policy_overrides_inference() {
        let policy = DiffPolicy::new().with("title", Strategy::Replace);
        let d = diff_attributes(
            &obj(json!({"title": "a"})),
            &obj(json!({"title": "b"})),
            &policy,
        );
        assert_eq!(d["title"], DiffOp::Replace(Value::from("b")));
    }

    #[test]
    fn nested_objects_diff_recursively() {
        let from = obj(json!({"meta": {"a": 1, "b": 2}}));
        let to = obj(json!({"meta": {"a": 1, "b": 5}}));
        let d = diff_attributes(&from, &to, &DiffPolicy::default());
        let DiffOp::Object(inner) = &d["meta"] else {
            panic!("expected object diff");
        };
        assert_eq!(inner.len(), 1);
        assert_eq!(inner["b"], DiffOp::Increment(Number::Int(3)));
    }

    #[test]
    fn numeric_deltas_accumulate() {
        let (v, v1, v2) = (Value::from(10), Value::from(4), Value::from(25));
        let policy = DiffPolicy::default();
        let d1 = diff(&v, &v1, &policy).unwrap();
        let d2 = diff(&v1, &v2, &policy).unwrap();
        let total = diff(&v, &v2, &policy).unwrap();

        let stepwise = apply(&apply(&v, &d1).unwrap(), &d2).unwrap();
        let reversed = apply(&apply(&v, &d2).unwrap(), &d1).unwrap();
        assert_eq!(stepwise, v2);
        assert_eq!(reversed, v2);
        assert_eq!(apply(&v, &total).unwrap(), v2);
    }

    #[test]
    fn apply_type_mismatch() {
        let err = apply(&Value::from("text"), &DiffOp::Increment(Number::Int(1))).unwrap_err();
        assert_eq!(
            err,
            ApplyError::IncompatibleType {
                op: "I",
                found: "Text".into()
            }
        );
    }

    #[test]
    fn string_transform_example() {
        let base = Value::from("hello");
        let policy = DiffPolicy::default();
        let diff_a = diff(&base, &Value::from("hullo"), &policy).unwrap();
        let diff_b = diff(&base, &Value::from("hello!"), &policy).unwrap();

        let rebased = transform(&diff_b, &diff_a, &base, Later::Onto)
            .unwrap()
            .unwrap();
        assert_eq!(
            apply(&Value::from("hullo"), &rebased).unwrap(),
            Value::from("hullo!")
        );
    }

    #[test]
    fn concurrent_counter_edits_merge() {
        let merged = converge(json!({"n": 10}), json!({"n": 12}), json!({"n": 7}));
        assert_eq!(merged["n"], Value::from(9));
    }

    #[test]
    fn disjoint_members_never_conflict() {
        let merged = converge(
            json!({"title": "a", "done": false}),
            json!({"title": "a", "done": true}),
            json!({"title": "b", "done": false}),
        );
        assert_eq!(merged, obj(json!({"title": "b", "done": true})));
    }

    #[test]
    fn replace_conflict_goes_to_later_diff() {
        // the local change reaches the server after the remote one
        let merged = converge(
            json!({"done": false, "tags": ["x"]}),
            json!({"done": true, "tags": ["x"]}),
            json!({"done": null, "tags": ["x"]}),
        );
        assert_eq!(merged["done"], Value::Bool(true));
    }

    #[test]
    fn remove_versus_edit() {
        let merged = converge(
            json!({"note": "draft"}),
            json!({"note": "draft v2"}),
            json!({}),
        );
        assert_eq!(merged["note"], Value::from("draft v2"));

        let merged = converge(json!({"note": "draft"}), json!({}), json!({"note": "edited"}));
        assert!(!merged.contains_key("note"));
    }

    #[test]
    fn both_add_same_key() {
        let merged = converge(json!({}), json!({"k": 1}), json!({"k": 2}));
        assert_eq!(merged["k"], Value::from(1));
    }

    #[test]
    fn wire_format() {
        let d = diff_attributes(
            &obj(json!({"n": 1, "s": "hello", "l": [1], "gone": 1})),
            &obj(json!({"n": 3, "s": "hullo", "l": [1, 2], "new": "x"})),
            &DiffPolicy::default(),
        );
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(
            json,
            json!({
                "gone": {"o": "-"},
                "l": {"o": "L", "v": [{"o": "+", "i": 1, "v": 2}]},
                "n": {"o": "I", "v": 2},
                "new": {"o": "+", "v": "x"},
                "s": {"o": "d", "v": "=1\t+u\t-1\t=3"}
            })
        );
        let back: ObjectDiff = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn wire_format_rejects_unknown_op() {
        let err = serde_json::from_value::<DiffOp>(json!({"o": "?", "v": 1})).unwrap_err();
        assert!(err.to_string().contains("unknown diff op"));
        assert!(serde_json::from_value::<DiffOp>(json!({"o": "r"})).is_err());
    }
}
