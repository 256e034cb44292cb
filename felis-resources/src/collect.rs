//! Periodic collectors: they observe the host and write what they see back
//! through the ledger as ordinary field updates.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use felis_core::{
    error::{RctlUpdateFailed, TaskFailed, ZfsStatUpdateFailed},
    FieldMap,
};
use felis_ledger::{
    exec::{self, CommandRunner},
    Ledger,
};
use serde_json::{json, Value};

use crate::{
    jail::JailStatus,
    zfs::FILESYSTEM_KINDS,
};

const AUTHOR: &str = "collector";

/// Wrap a failed command in the collector's own error.
fn collector_error<E>(e: anyhow::Error, wrap: impl FnOnce(TaskFailed) -> E) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    match e.downcast::<TaskFailed>() {
        Ok(failed) => wrap(failed).into(),
        Err(e) => e,
    }
}

/// Parse `rctl -u` output, `resource=amount` per line, into `rctl_<resource>` fields.
pub fn parse_rctl_usage(output: &str) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (resource, amount) = line
            .split_once('=')
            .with_context(|| format!("unexpected rctl usage line: {:?}", line))?;
        let amount: i64 = amount
            .parse()
            .with_context(|| format!("unexpected rctl usage amount: {:?}", line))?;
        fields.insert(format!("rctl_{}", resource), json!(amount));
    }
    Ok(fields)
}

/// Record the current resource usage of every running jail. Returns how many
/// jails changed.
pub fn update_rctl_usage(ledger: &Ledger, runner: &dyn CommandRunner) -> Result<usize> {
    let mut changed = 0;
    for jail in ledger.store().resources(Some("jail")) {
        let status = jail.fields.get("status").cloned().unwrap_or(Value::Null);
        if serde_json::from_value::<JailStatus>(status).ok() != Some(JailStatus::Running) {
            continue;
        }
        let Some(name) = jail.fields.get("name").and_then(Value::as_str) else {
            continue;
        };
        let output = exec::exec(runner, &format!("rctl -u jail:{}", name))
            .map_err(|e| collector_error(e, RctlUpdateFailed))?;
        let usage = parse_rctl_usage(&output.stdout)?;
        if !ledger.update(jail.id, usage, Some(AUTHOR))?.is_empty() {
            changed += 1;
        }
    }
    Ok(changed)
}

/// `used`, `avail` and `refer` per dataset name, from `zfs list -Hp`.
pub fn parse_zfs_list(output: &str) -> BTreeMap<String, FieldMap> {
    let mut stats = BTreeMap::new();
    for line in output.lines().filter(|l| !l.is_empty()) {
        let columns: Vec<&str> = line.split('\t').collect();
        let [name, used, avail, refer, ..] = columns.as_slice() else {
            tracing::warn!("unexpected zfs list line: {:?}", line);
            continue;
        };
        let mut fields = FieldMap::new();
        for (field, value) in [("used", used), ("avail", avail), ("refer", refer)] {
            // "-" for values that do not apply
            let value = value.parse::<u64>().map_or(Value::Null, Value::from);
            fields.insert(field.to_string(), value);
        }
        stats.insert(name.to_string(), fields);
    }
    stats
}

/// Record space usage of every filesystem-backed resource. Returns how many
/// resources changed.
pub fn update_zfs_stats(ledger: &Ledger, runner: &dyn CommandRunner) -> Result<usize> {
    let output =
        exec::exec(runner, "zfs list -Hp").map_err(|e| collector_error(e, ZfsStatUpdateFailed))?;
    let stats = parse_zfs_list(&output.stdout);
    let resolver = ledger.resolver();
    let mut changed = 0;
    for kind in FILESYSTEM_KINDS {
        for record in ledger.store().resources(Some(*kind)) {
            let fields = resolver.resource_fields(record.id)?;
            let Some(row) = fields
                .get("zpath")
                .and_then(Value::as_str)
                .and_then(|zpath| stats.get(zpath))
            else {
                continue;
            };
            if !ledger.update(record.id, row.clone(), Some(AUTHOR))?.is_empty() {
                changed += 1;
            }
        }
    }
    Ok(changed)
}

/// Run every collector once. A failing collector does not stop the others.
pub fn collect(ledger: &Ledger, runner: &dyn CommandRunner) {
    let _span = tracing::info_span!("collect").entered();
    match update_rctl_usage(ledger, runner) {
        Ok(changed) => tracing::debug!("rctl usage changed for {} jails", changed),
        Err(e) => tracing::warn!("{:#}", e),
    }
    match update_zfs_stats(ledger, runner) {
        Ok(changed) => tracing::debug!("zfs statistics changed for {} datasets", changed),
        Err(e) => tracing::warn!("{:#}", e),
    }
}
