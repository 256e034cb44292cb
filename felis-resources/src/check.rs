//! Field checks shared by the resource kinds.

use anyhow::{bail, Result};
use felis_core::{error::ValidationError, FieldMap};
use felis_ledger::{Resolver, ResourceRecord};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A non-empty string field.
pub fn required_str<'f>(fields: &'f FieldMap, name: &str) -> Result<&'f str> {
    match fields.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            bail!(ValidationError::new(format!("`{}' is required", name)))
        }
        Some(other) => bail!(ValidationError::new(format!(
            "`{}' must be a string, not {}",
            name, other
        ))),
    }
}

/// An optional field of type `T`; absent and `null` both read as `None`.
pub fn optional<T: DeserializeOwned>(fields: &FieldMap, name: &str) -> Result<Option<T>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match serde_json::from_value(value.clone()) {
            Ok(v) => Ok(Some(v)),
            Err(e) => bail!(ValidationError::new(format!(
                "invalid value for `{}': {}",
                name, e
            ))),
        },
    }
}

/// Fill in `value` when the field is absent or `null`.
pub fn default_field(fields: &mut FieldMap, name: &str, value: impl Into<Value>) {
    match fields.get(name) {
        None | Some(Value::Null) => {
            fields.insert(name.to_string(), value.into());
        }
        Some(_) => {}
    }
}

/// A dataset or snapshot name: one path component.
pub fn dataset_name<'f>(fields: &'f FieldMap) -> Result<&'f str> {
    let name = required_str(fields, "name")?;
    if name.contains(['/', '@', ' ']) {
        bail!(ValidationError::new(format!(
            "`{}' is not a valid name: it may not contain `/', `@' or spaces",
            name
        )));
    }
    Ok(name)
}

/// The resource referred to by `field`, which must be one of `kinds`.
pub fn related_of_kind(
    resolver: &Resolver<'_>,
    fields: &FieldMap,
    field: &str,
    kinds: &[&str],
) -> Result<Option<ResourceRecord>> {
    let Some(id) = Resolver::related_id(fields, field)? else {
        return Ok(None);
    };
    let record = resolver.record(id)?;
    if !kinds.contains(&record.kind.as_str()) {
        bail!(ValidationError::new(format!(
            "`{}' must refer to a {}, but {} is a {}",
            field,
            kinds.join(" or "),
            id,
            record.kind
        )));
    }
    Ok(Some(record))
}

/// Like [`related_of_kind`], for relations that must be set.
pub fn required_related(
    resolver: &Resolver<'_>,
    fields: &FieldMap,
    field: &str,
    kinds: &[&str],
) -> Result<ResourceRecord> {
    match related_of_kind(resolver, fields, field, kinds)? {
        Some(record) => Ok(record),
        None => bail!(ValidationError::new(format!("`{}' is required", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> FieldMap {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_required_str() {
        assert_eq!(required_str(&fields(json!({"name": "data"})), "name").unwrap(), "data");
        assert!(required_str(&fields(json!({"name": ""})), "name").is_err());
        assert!(required_str(&fields(json!({"name": 3})), "name").is_err());
        assert!(required_str(&FieldMap::new(), "name").is_err());
    }

    #[test]
    fn test_optional() {
        let f = fields(json!({"quota": 5, "mountpoint": null, "bad": "x"}));
        assert_eq!(optional::<u64>(&f, "quota").unwrap(), Some(5));
        assert_eq!(optional::<String>(&f, "mountpoint").unwrap(), None);
        assert_eq!(optional::<u64>(&f, "missing").unwrap(), None);
        let err = optional::<u64>(&f, "bad").unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
    }

    #[test]
    fn test_dataset_name() {
        assert!(dataset_name(&fields(json!({"name": "www"}))).is_ok());
        assert!(dataset_name(&fields(json!({"name": "tank/www"}))).is_err());
        assert!(dataset_name(&fields(json!({"name": "www@1"}))).is_err());
    }

    #[test]
    fn test_default_field() {
        let mut f = fields(json!({"console": null, "status": "running"}));
        default_field(&mut f, "console", false);
        default_field(&mut f, "status", "stopped");
        assert_eq!(f["console"], json!(false));
        assert_eq!(f["status"], json!("running"));
    }
}
