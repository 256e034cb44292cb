//! ZFS datasets: filesystems, snapshots and clones.
//!
//! Jails, worlds and skels build on these hook tables and computed values.

use anyhow::{bail, Result};
use felis_core::{error::ValidationError, FieldMap};
use felis_ledger::{HookContext, HookTable, Relation, ResourceKind, Resolver};
use serde_json::{json, Value};

use crate::{
    check::{dataset_name, optional, related_of_kind, required_related},
    size::size_prefixed,
};

/// Kinds backed by a ZFS filesystem.
pub const FILESYSTEM_KINDS: &[&str] = &["filesystem", "clone", "world", "jail"];
/// Kinds backed by a ZFS snapshot.
pub const SNAPSHOT_KINDS: &[&str] = &["snapshot", "skel"];

pub(crate) const PARENT: Relation = Relation {
    field: "parent",
    alias: "parent",
    protects: true,
};
pub(crate) const BASE: Relation = Relation {
    field: "base",
    alias: "base",
    protects: true,
};

fn os_managed(ctx: &HookContext<'_>) -> Result<bool> {
    Ok(ctx.get::<Option<bool>>("os_managed")?.unwrap_or(false))
}

fn create_filesystem(ctx: &mut HookContext<'_>) -> Result<()> {
    if os_managed(ctx)? {
        tracing::info!("{} exists on the host, not creating it", ctx.render("{zpath}")?);
        return Ok(());
    }
    let mut command = String::from("zfs create");
    if ctx.get::<Option<String>>("mountpoint")?.is_some() {
        command.push_str(" -o mountpoint={mountpoint}");
    }
    if ctx.get::<Option<u64>>("quota")?.is_some() {
        command.push_str(" -o quota={quota_prefixed}");
    }
    command.push_str(" {zpath}");
    ctx.exec(&command)?;
    Ok(())
}

fn destroy_dataset(ctx: &mut HookContext<'_>) -> Result<()> {
    if os_managed(ctx)? {
        return Ok(());
    }
    ctx.exec("zfs destroy {zpath}")?;
    Ok(())
}

fn rename_dataset(ctx: &mut HookContext<'_>) -> Result<()> {
    let old = ctx.command_old("{zpath}")?;
    let new = ctx.command("{zpath}")?;
    ctx.exec_rendered(&format!("zfs rename {} {}", old, new))?;
    Ok(())
}

fn set_quota(ctx: &mut HookContext<'_>) -> Result<()> {
    ctx.exec("zfs set quota={quota_prefixed} {zpath}")?;
    Ok(())
}

fn set_mountpoint(ctx: &mut HookContext<'_>) -> Result<()> {
    match ctx.get::<Option<String>>("mountpoint")? {
        Some(_) => ctx.exec("zfs set mountpoint={mountpoint} {zpath}")?,
        None => ctx.exec("zfs set mountpoint=none {zpath}")?,
    };
    Ok(())
}

pub fn filesystem_hooks() -> HookTable {
    HookTable::new()
        .on_create(None, create_filesystem)
        .on_delete(None, destroy_dataset)
        .on_update("name", Some(80), rename_dataset)
        .on_update("mountpoint", Some(30), set_mountpoint)
        .on_update("quota", Some(20), set_quota)
}

/// `zpath` (the dataset), `path` (where it is mounted) and `quota_prefixed`.
pub fn filesystem_computed(fields: &FieldMap, resolver: &Resolver<'_>) -> Result<FieldMap> {
    let name = fields.get("name").and_then(Value::as_str).unwrap_or_default();
    let parent = resolver.related(fields, "parent")?;
    let parent_str = |key: &str| {
        parent
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let zpath = match parent_str("zpath") {
        Some(parent) => format!("{}/{}", parent, name),
        None => name.to_string(),
    };
    let path = match optional::<String>(fields, "mountpoint")? {
        Some(mountpoint) => mountpoint,
        None => match parent_str("path") {
            Some(parent) => format!("{}/{}", parent, name),
            None => format!("/{}", name),
        },
    };
    let quota = optional::<u64>(fields, "quota")?;
    Ok(FieldMap::from([
        ("zpath".to_string(), json!(zpath)),
        ("path".to_string(), json!(path)),
        ("quota_prefixed".to_string(), json!(size_prefixed(quota))),
    ]))
}

/// Name, parent and mountpoint checks. A quota above the parent's is
/// lowered to the parent's.
pub fn validate_filesystem(fields: &mut FieldMap, resolver: &Resolver<'_>) -> Result<()> {
    dataset_name(fields)?;
    optional::<String>(fields, "mountpoint")?;
    optional::<bool>(fields, "os_managed")?;
    let parent = related_of_kind(resolver, fields, "parent", FILESYSTEM_KINDS)?;
    if let Some(quota) = optional::<u64>(fields, "quota")? {
        let parent_quota = match &parent {
            Some(parent) => optional::<u64>(&parent.fields, "quota")?,
            None => None,
        };
        if let Some(limit) = parent_quota.filter(|limit| quota > *limit) {
            tracing::info!(
                "quota {} is above the parent's, lowering it to {}",
                size_prefixed(Some(quota)),
                size_prefixed(Some(limit))
            );
            fields.insert("quota".to_string(), json!(limit));
        }
    }
    Ok(())
}

fn create_snapshot(ctx: &mut HookContext<'_>) -> Result<()> {
    ctx.exec("zfs snapshot {zpath}")?;
    Ok(())
}

fn refuse_rebase(_ctx: &mut HookContext<'_>) -> Result<()> {
    bail!(ValidationError::new("the base of a snapshot cannot change"))
}

pub fn snapshot_hooks() -> HookTable {
    HookTable::new()
        .on_create(None, create_snapshot)
        .on_delete(None, destroy_dataset)
        .on_update("name", Some(80), rename_dataset)
        .on_update("base", None, refuse_rebase)
}

/// `zpath` of a snapshot: `<base zpath>@<name>`.
pub fn snapshot_computed(fields: &FieldMap, resolver: &Resolver<'_>) -> Result<FieldMap> {
    let name = fields.get("name").and_then(Value::as_str).unwrap_or_default();
    let zpath = resolver
        .related(fields, "base")?
        .and_then(|base| base.get("zpath").and_then(Value::as_str).map(str::to_string))
        .map(|base| format!("{}@{}", base, name));
    Ok(FieldMap::from([(
        "zpath".to_string(),
        zpath.map_or(Value::Null, Value::from),
    )]))
}

pub fn validate_snapshot(fields: &mut FieldMap, resolver: &Resolver<'_>) -> Result<()> {
    dataset_name(fields)?;
    required_related(resolver, fields, "base", FILESYSTEM_KINDS)?;
    Ok(())
}

fn create_clone(ctx: &mut HookContext<'_>) -> Result<()> {
    ctx.exec("zfs clone {base.zpath} {zpath}")?;
    Ok(())
}

/// Filesystem hooks, created by cloning the base snapshot. The clone is not
/// destroyed with its record.
pub fn clone_hooks() -> HookTable {
    filesystem_hooks()
        .on_create(None, create_clone)
        .without_delete()
}

pub fn validate_clone(
    fields: &mut FieldMap,
    resolver: &Resolver<'_>,
    base_kinds: &[&str],
) -> Result<()> {
    validate_filesystem(fields, resolver)?;
    required_related(resolver, fields, "base", base_kinds)?;
    Ok(())
}

pub struct Filesystem {
    hooks: HookTable,
}

impl Filesystem {
    pub fn new() -> Self {
        Filesystem {
            hooks: filesystem_hooks(),
        }
    }
}

impl ResourceKind for Filesystem {
    fn name(&self) -> &'static str {
        "filesystem"
    }
    fn hooks(&self) -> &HookTable {
        &self.hooks
    }
    fn relations(&self) -> &[Relation] {
        &[PARENT]
    }
    fn computed(&self, fields: &FieldMap, resolver: &Resolver<'_>) -> Result<FieldMap> {
        filesystem_computed(fields, resolver)
    }
    fn validate(&self, fields: &mut FieldMap, resolver: &Resolver<'_>) -> Result<()> {
        validate_filesystem(fields, resolver)
    }
}

pub struct Snapshot {
    hooks: HookTable,
}

impl Snapshot {
    pub fn new() -> Self {
        Snapshot {
            hooks: snapshot_hooks(),
        }
    }
}

impl ResourceKind for Snapshot {
    fn name(&self) -> &'static str {
        "snapshot"
    }
    fn hooks(&self) -> &HookTable {
        &self.hooks
    }
    fn relations(&self) -> &[Relation] {
        &[BASE]
    }
    fn computed(&self, fields: &FieldMap, resolver: &Resolver<'_>) -> Result<FieldMap> {
        snapshot_computed(fields, resolver)
    }
    fn validate(&self, fields: &mut FieldMap, resolver: &Resolver<'_>) -> Result<()> {
        validate_snapshot(fields, resolver)
    }
}

pub struct CloneFs {
    hooks: HookTable,
}

impl CloneFs {
    pub fn new() -> Self {
        CloneFs {
            hooks: clone_hooks(),
        }
    }
}

impl ResourceKind for CloneFs {
    fn name(&self) -> &'static str {
        "clone"
    }
    fn hooks(&self) -> &HookTable {
        &self.hooks
    }
    fn relations(&self) -> &[Relation] {
        &[PARENT, BASE]
    }
    fn computed(&self, fields: &FieldMap, resolver: &Resolver<'_>) -> Result<FieldMap> {
        filesystem_computed(fields, resolver)
    }
    fn validate(&self, fields: &mut FieldMap, resolver: &Resolver<'_>) -> Result<()> {
        validate_clone(fields, resolver, SNAPSHOT_KINDS)
    }
}
