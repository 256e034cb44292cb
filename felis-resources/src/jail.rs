//! Worlds, skels and jails, with their status lifecycles.

use std::{
    fmt::Display,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use felis_core::{
    error::{JailError, ValidationError, WorldError},
    fsm::{Edge, Fsm},
    FieldMap, ResourceId,
};
use felis_ledger::{HookContext, HookTable, Relation, ResourceKind, Resolver};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    check::{default_field, optional, related_of_kind},
    zfs::{
        clone_hooks, filesystem_computed, filesystem_hooks, snapshot_computed, snapshot_hooks,
        validate_clone, validate_filesystem, validate_snapshot, BASE, PARENT,
    },
    Config,
};

/// Jail properties a skel must define, with their jail.conf(5) names.
pub const JAIL_PROPERTIES: &[(&str, &str)] = &[
    ("domainname", "host.domainname"),
    ("exec_system_user", "exec.system_user"),
    ("exec_jail_user", "exec.jail_user"),
    ("exec_start", "exec.start"),
    ("exec_stop", "exec.stop"),
    ("mount_devfs", "mount.devfs"),
    ("mount_fdescfs", "mount.fdescfs"),
    ("mount_procfs", "mount.procfs"),
    ("devfs_ruleset", "devfs_ruleset"),
    ("enforce_statfs", "enforce_statfs"),
    ("allow_raw_sockets", "allow.raw_sockets"),
    ("allow_socket_af", "allow.socket_af"),
    ("allow_set_hostname", "allow.set_hostname"),
    ("allow_sysvipc", "allow.sysvipc"),
    ("allow_mount", "allow.mount"),
    ("allow_mount_zfs", "allow.mount.zfs"),
    ("allow_mount_procfs", "allow.mount.procfs"),
    ("allow_mount_devfs", "allow.mount.devfs"),
    ("allow_chflags", "allow.chflags"),
];

/// Console access to a running jail, provided outside of felis.
pub trait ConsoleControl: Send + Sync {
    fn open(&self, jail: &FieldMap) -> Result<()>;
    fn close(&self, jail: &FieldMap) -> Result<()>;
}

/// Makes sure a skel's jail.conf(5) file is in place before a jail starts.
/// `skel` carries the computed `config_file`.
pub trait JailConfWriter: Send + Sync {
    fn ensure(&self, skel: &FieldMap) -> Result<()>;
}

/// No console daemon is configured: opening fails, closing does nothing.
pub struct UnmanagedConsole;

impl ConsoleControl for UnmanagedConsole {
    fn open(&self, jail: &FieldMap) -> Result<()> {
        bail!(JailError {
            jail: resource_name(jail),
            message: "console access is not configured".to_string(),
        })
    }
    fn close(&self, _jail: &FieldMap) -> Result<()> {
        Ok(())
    }
}

/// Expects the configuration files to be rendered by someone else.
pub struct PrewrittenJailConf;

impl JailConfWriter for PrewrittenJailConf {
    fn ensure(&self, skel: &FieldMap) -> Result<()> {
        let path = skel
            .get("config_file")
            .and_then(Value::as_str)
            .context("skel has no configuration file")?;
        if !Path::new(path).is_file() {
            bail!("jail configuration {} has not been written", path);
        }
        Ok(())
    }
}

fn resource_name(fields: &FieldMap) -> String {
    fields
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("?")
        .to_string()
}

fn status_field<S: for<'de> Deserialize<'de>>(fields: &FieldMap) -> Result<Option<S>> {
    optional(fields, "status")
}

/// Run the transition from the previous to the current `status` and set the
/// status the transition asks for next.
fn switch_status<'a, S>(ctx: &mut HookContext<'a>, fsm: Fsm<S, HookContext<'a>>) -> Result<()>
where
    S: Copy + PartialEq + Display + Default + Serialize + for<'de> Deserialize<'de>,
{
    let old: S = ctx.get_old::<Option<S>>("status")?.unwrap_or_default();
    let new: S = ctx.get("status")?;
    if old == new {
        return Ok(());
    }
    if let Some(next) = fsm.transition(old, new, ctx)? {
        tracing::debug!("{} -> {}, next {}", old, new, next);
        ctx.set("status", next)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldStatus {
    #[default]
    Updated,
    Updating,
    UpdatingSrc,
    BuildingWorld,
    PackagingWorld,
    InstallingWorld,
    CleaningUp,
    UpdateFailed,
}

impl Display for WorldStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorldStatus::Updated => "updated",
            WorldStatus::Updating => "updating",
            WorldStatus::UpdatingSrc => "updating_src",
            WorldStatus::BuildingWorld => "building_world",
            WorldStatus::PackagingWorld => "packaging_world",
            WorldStatus::InstallingWorld => "installing_world",
            WorldStatus::CleaningUp => "cleaning_up",
            WorldStatus::UpdateFailed => "update_failed",
        };
        f.write_str(s)
    }
}

fn rebuild_script(config: &Config, step: &str) -> Result<String> {
    let script = config.scripts_dir.join("rebuild_world.sh");
    let script = script
        .to_str()
        .with_context(|| format!("script path is not valid UTF-8: {}", script.display()))?;
    Ok(format!("{} {}", shlex::try_quote(script)?, step))
}

/// Run one rebuild step. A failure does not fail the changeset; the world
/// moves to `update_failed` instead.
fn world_step(
    ctx: &mut HookContext<'_>,
    config: &Config,
    step: &str,
    next: WorldStatus,
) -> Option<WorldStatus> {
    let result = (|| -> Result<()> {
        if step == "installworld" {
            stop_world_jails(ctx, config)?;
        }
        ctx.exec_rendered(&rebuild_script(config, step)?)?;
        Ok(())
    })();
    match result {
        Ok(_) => Some(next),
        Err(e) => {
            tracing::error!("{} failed for world {}: {:#}", step, resource_name(ctx.fields()), e);
            Some(WorldStatus::UpdateFailed)
        }
    }
}

/// Stop the running jails that use this world, and wait for them.
fn stop_world_jails(ctx: &HookContext<'_>, config: &Config) -> Result<()> {
    let Some(world) = ctx.id() else {
        return Ok(());
    };
    let ledger = ctx.ledger();
    let jails = || {
        ledger
            .store()
            .resources(Some("jail"))
            .into_iter()
            .filter(move |jail| {
                matches!(Resolver::related_id(&jail.fields, "world_template"), Ok(Some(w)) if w == world)
            })
    };
    let is_stopped = |fields: &FieldMap| {
        matches!(status_field::<JailStatus>(fields), Ok(None | Some(JailStatus::Stopped)))
    };

    let running: Vec<ResourceId> = jails()
        .filter(|jail| matches!(status_field::<JailStatus>(&jail.fields), Ok(Some(JailStatus::Running))))
        .map(|jail| jail.id)
        .collect();
    for jail in &running {
        tracing::info!("stopping jail {} to install the world", jail);
        ledger.update(
            *jail,
            FieldMap::from([("status".to_string(), json!(JailStatus::Stopping))]),
            ctx.changeset().author.as_deref(),
        )?;
    }

    let deadline = Instant::now() + config.world_stop_timeout;
    loop {
        let busy: Vec<String> = jails()
            .filter(|jail| !is_stopped(&jail.fields))
            .map(|jail| resource_name(&jail.fields))
            .collect();
        if busy.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            bail!(WorldError {
                world: resource_name(ctx.fields()),
                message: format!("jails {} did not stop", busy.join(", ")),
            });
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(200)));
    }
}

fn world_fsm<'a>(config: &Arc<Config>) -> Fsm<WorldStatus, HookContext<'a>> {
    use WorldStatus::*;
    let step = |name: &'static str, next: WorldStatus| {
        let config = config.clone();
        move |ctx: &mut HookContext<'a>| -> Result<Option<WorldStatus>> {
            Ok(world_step(ctx, &config, name, next))
        }
    };
    Fsm::new()
        .chain(&[
            Updated,
            Updating,
            UpdatingSrc,
            BuildingWorld,
            PackagingWorld,
            InstallingWorld,
            CleaningUp,
            Updated,
        ])
        .allow(Edge::Is(UpdateFailed), Edge::Is(Updating))
        .allow(Edge::Any, Edge::Is(UpdateFailed))
        .on(Updated, Updating, |_| Ok(Some(UpdatingSrc)))
        .on(UpdateFailed, Updating, |_| Ok(Some(UpdatingSrc)))
        .on(Updating, UpdatingSrc, step("updatesrc", BuildingWorld))
        .on(UpdatingSrc, BuildingWorld, step("buildworld", PackagingWorld))
        .on(BuildingWorld, PackagingWorld, step("packageworld", InstallingWorld))
        .on(PackagingWorld, InstallingWorld, step("installworld", CleaningUp))
        .on(InstallingWorld, CleaningUp, step("cleanup", Updated))
}

/// A FreeBSD world kept in its own filesystem and shared by jails.
pub struct World {
    hooks: HookTable,
}

impl World {
    pub fn new(config: Arc<Config>) -> Self {
        World {
            hooks: filesystem_hooks().on_update("status", None, move |ctx| {
                switch_status(ctx, world_fsm(&config))
            }),
        }
    }
}

impl ResourceKind for World {
    fn name(&self) -> &'static str {
        "world"
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
        validate_filesystem(fields, resolver)?;
        default_field(fields, "status", json!(WorldStatus::Updated));
        status_field::<WorldStatus>(fields)?;
        optional::<String>(fields, "src_conf")?;
        optional::<String>(fields, "make_conf")?;
        Ok(())
    }
}

/// A snapshot that jails are cloned from, with the jail properties they share.
pub struct Skel {
    hooks: HookTable,
    config: Arc<Config>,
}

impl Skel {
    pub fn new(config: Arc<Config>) -> Self {
        Skel {
            hooks: snapshot_hooks().without_delete(),
            config,
        }
    }
}

impl ResourceKind for Skel {
    fn name(&self) -> &'static str {
        "skel"
    }
    fn hooks(&self) -> &HookTable {
        &self.hooks
    }
    fn relations(&self) -> &[Relation] {
        &[BASE]
    }
    fn computed(&self, fields: &FieldMap, resolver: &Resolver<'_>) -> Result<FieldMap> {
        let mut computed = snapshot_computed(fields, resolver)?;
        let config_file = match fields.get("id").and_then(Value::as_u64) {
            Some(id) => {
                let file = format!("{}_{}.conf", id, resource_name(fields));
                let path = self.config.work_dir.join("jail.conf.d").join(file);
                Value::from(path.to_string_lossy().into_owned())
            }
            None => Value::Null,
        };
        computed.insert("config_file".to_string(), config_file);
        Ok(computed)
    }
    fn validate(&self, fields: &mut FieldMap, resolver: &Resolver<'_>) -> Result<()> {
        validate_snapshot(fields, resolver)?;
        for (property, _) in JAIL_PROPERTIES {
            match fields.get(*property) {
                None | Some(Value::Null) => {}
                Some(Value::String(s)) if s.is_empty() => {}
                Some(_) => continue,
            }
            bail!(ValidationError::new(format!(
                "jail property `{}' cannot be empty for a skel",
                property
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JailStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl Display for JailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JailStatus::Stopped => "stopped",
            JailStatus::Starting => "starting",
            JailStatus::Running => "running",
            JailStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

fn start_jail(ctx: &mut HookContext<'_>, conf: &dyn JailConfWriter) -> Result<Option<JailStatus>> {
    let skel = ctx
        .resolver()
        .related(ctx.fields(), "base")?
        .context("jail has no skel")?;
    conf.ensure(&skel)?;
    tracing::info!("starting jail {}", resource_name(ctx.fields()));
    let output = ctx.exec("jail -i -cmr -f {skel.config_file} {name}")?;
    let jid: i64 = output
        .first_line()
        .trim()
        .parse()
        .with_context(|| format!("jail(8) did not report a jid: {:?}", output.stdout))?;
    ctx.set("jid", jid)?;
    Ok(Some(JailStatus::Running))
}

fn stop_jail(ctx: &mut HookContext<'_>) -> Result<Option<JailStatus>> {
    ctx.set("console", false)?;
    tracing::info!("stopping jail {}", resource_name(ctx.fields()));
    ctx.exec_best_effort("jail -r -f {skel.config_file} {name}")?;
    Ok(Some(JailStatus::Stopped))
}

fn jail_fsm<'a>(config: &Arc<Config>) -> Fsm<JailStatus, HookContext<'a>> {
    use JailStatus::*;
    let conf = config.jail_conf.clone();
    Fsm::new()
        .chain(&[Stopped, Starting, Running, Stopping, Stopped])
        .on(Stopped, Starting, move |ctx: &mut HookContext<'a>| {
            start_jail(ctx, conf.as_ref())
        })
        .on(Starting, Running, |ctx: &mut HookContext<'a>| {
            tracing::info!("jail {} started", resource_name(ctx.fields()));
            Ok(None)
        })
        .on(Running, Stopping, stop_jail)
        .on(Stopping, Stopped, |ctx: &mut HookContext<'a>| {
            ctx.set("jid", Value::Null)?;
            tracing::info!("jail {} stopped", resource_name(ctx.fields()));
            Ok(None)
        })
}

fn switch_console(ctx: &mut HookContext<'_>, console: &dyn ConsoleControl) -> Result<()> {
    if ctx.get::<Option<bool>>("console")?.unwrap_or(false) {
        if status_field::<JailStatus>(ctx.fields())? != Some(JailStatus::Running) {
            bail!(JailError {
                jail: resource_name(ctx.fields()),
                message: "cannot open a console on a jail that is not running".to_string(),
            });
        }
        console.open(ctx.fields())
    } else {
        console.close(ctx.fields())
    }
}

fn remove_jail(ctx: &mut HookContext<'_>, console: &dyn ConsoleControl) -> Result<()> {
    match status_field::<JailStatus>(ctx.fields())? {
        Some(JailStatus::Running | JailStatus::Starting) => {
            ctx.exec_best_effort("jail -r -f {skel.config_file} {name}")?;
        }
        Some(JailStatus::Stopped | JailStatus::Stopping) | None => {}
    }
    if let Err(e) = console.close(ctx.fields()) {
        tracing::warn!("could not close the console: {:#}", e);
    }
    Ok(())
}

/// A jail, running from a clone of its skel.
pub struct Jail {
    hooks: HookTable,
}

impl Jail {
    pub fn new(config: Arc<Config>) -> Self {
        let fsm_config = config.clone();
        let console = config.console.clone();
        let delete_console = config.console.clone();
        Jail {
            hooks: clone_hooks()
                .on_delete(Some(60), move |ctx| remove_jail(ctx, delete_console.as_ref()))
                .on_update("status", Some(70), move |ctx| {
                    switch_status(ctx, jail_fsm(&fsm_config))
                })
                .on_update("console", None, move |ctx| {
                    switch_console(ctx, console.as_ref())
                }),
        }
    }
}

impl ResourceKind for Jail {
    fn name(&self) -> &'static str {
        "jail"
    }
    fn hooks(&self) -> &HookTable {
        &self.hooks
    }
    fn relations(&self) -> &[Relation] {
        &[
            PARENT,
            BASE,
            Relation {
                field: "base",
                alias: "skel",
                protects: false,
            },
            Relation {
                field: "world_template",
                alias: "world",
                protects: true,
            },
        ]
    }
    fn computed(&self, fields: &FieldMap, resolver: &Resolver<'_>) -> Result<FieldMap> {
        filesystem_computed(fields, resolver)
    }
    fn validate(&self, fields: &mut FieldMap, resolver: &Resolver<'_>) -> Result<()> {
        validate_clone(fields, resolver, &["skel"])?;
        related_of_kind(resolver, fields, "world_template", &["world"])?;
        default_field(fields, "status", json!(JailStatus::Stopped));
        default_field(fields, "console", false);
        status_field::<JailStatus>(fields)?;
        optional::<bool>(fields, "console")?;
        optional::<i64>(fields, "jid")?;
        Ok(())
    }
}
