use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Field name to value. Absent and `null` are distinct: a field that was never
/// written is absent, a field that was cleared is `null`.
pub type FieldMap = BTreeMap<String, Value>;

/// Names of the fields whose value differs between `old` and `new`.
/// A field missing on one side counts as `null`.
pub fn changed_fields(old: &FieldMap, new: &FieldMap) -> BTreeSet<String> {
    let null = Value::Null;
    old.keys()
        .chain(new.keys())
        .filter(|k| old.get(*k).unwrap_or(&null) != new.get(*k).unwrap_or(&null))
        .cloned()
        .collect()
}

/// `base` overlaid with `overlay`; overlay wins.
pub fn merged(base: &FieldMap, overlay: &FieldMap) -> FieldMap {
    let mut out = base.clone();
    out.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

/// The entries of `fields` named in `names`. Names without an entry map to `null`.
pub fn subset<'a>(fields: &FieldMap, names: impl IntoIterator<Item = &'a String>) -> FieldMap {
    names
        .into_iter()
        .map(|n| (n.clone(), fields.get(n).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Deserialize a typed view of a resource from its fields.
/// Unknown fields are ignored, so a view may cover only part of a record.
pub fn from_fields<T: DeserializeOwned>(fields: &FieldMap, kind: &str) -> Result<T> {
    serde_json::from_value(Value::Object(
        fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    ))
    .with_context(|| format!("Could not deserialize fields of {} resource", kind))
}

/// Serialize a typed view back to fields.
pub fn to_fields<T: Serialize>(value: &T) -> Result<FieldMap> {
    match serde_json::to_value(value)? {
        Value::Object(o) => Ok(o.into_iter().collect()),
        other => bail!("Expected an object of fields, got {}", other),
    }
}
