//! rctl(8) resource limits on jails.

use anyhow::{bail, Result};
use felis_core::{error::ValidationError, FieldMap};
use felis_ledger::{HookContext, HookTable, Relation, ResourceKind, Resolver};

use crate::check::{optional, required_related, required_str};

const SIGNALS: [&str; 4] = ["log", "devctl", "sigkill", "sigterm"];

/// rctl(8) resources, with the actions besides [`SIGNALS`] each one allows.
pub const RESOURCES: &[(&str, Option<&str>)] = &[
    ("cputime", None),
    ("datasize", Some("deny")),
    ("stacksize", Some("deny")),
    ("coredumpsize", Some("deny")),
    ("memoryuse", Some("deny")),
    ("memorylocked", Some("deny")),
    ("maxproc", Some("deny")),
    ("openfiles", Some("deny")),
    ("vmemoryuse", Some("deny")),
    ("pseudoterminals", Some("deny")),
    ("swapuse", Some("deny")),
    ("nthr", Some("deny")),
    ("msgqqueued", Some("deny")),
    ("msgqsize", Some("deny")),
    ("nmsgq", Some("deny")),
    ("nsem", Some("deny")),
    ("nsemop", Some("deny")),
    ("nshm", Some("deny")),
    ("shmsize", Some("deny")),
    ("wallclock", None),
    ("pcpu", Some("deny")),
    ("readbps", Some("throttle")),
    ("writebps", Some("throttle")),
    ("readiops", Some("throttle")),
    ("writeiops", Some("throttle")),
];

/// Whether rctl(8) accepts `action` for `resource`; `None` for an unknown resource.
pub fn action_allowed(resource: &str, action: &str) -> Option<bool> {
    RESOURCES
        .iter()
        .find(|(name, _)| *name == resource)
        .map(|(_, extra)| SIGNALS.contains(&action) || *extra == Some(action))
}

fn add_rule(ctx: &mut HookContext<'_>) -> Result<()> {
    let mut command = String::from("rctl -a jail:{jail.name}:{resource}:{action}={amount}");
    if ctx.get::<Option<String>>("per")?.is_some() {
        command.push_str("/{per}");
    }
    ctx.exec(&command)?;
    Ok(())
}

fn remove_rule(ctx: &mut HookContext<'_>) -> Result<()> {
    let command = ctx.command_old("rctl -r jail:{jail.name}:{resource}:{action}")?;
    ctx.exec_rendered(&command)?;
    Ok(())
}

fn replace_rule(ctx: &mut HookContext<'_>) -> Result<()> {
    let removed = remove_rule(ctx);
    if let Err(e) = removed {
        tracing::warn!("could not remove the previous rule: {:#}", e);
    }
    add_rule(ctx)
}

/// One `jail:<name>:<resource>:<action>=<amount>[/<per>]` rule.
pub struct RctlRule {
    hooks: HookTable,
}

impl RctlRule {
    pub fn new() -> Self {
        let mut hooks = HookTable::new()
            .on_create(None, add_rule)
            .on_delete(None, remove_rule);
        for field in ["jail", "resource", "action", "amount", "per"] {
            hooks = hooks.on_update(field, None, replace_rule);
        }
        RctlRule { hooks }
    }
}

impl ResourceKind for RctlRule {
    fn name(&self) -> &'static str {
        "rctlrule"
    }
    fn hooks(&self) -> &HookTable {
        &self.hooks
    }
    fn relations(&self) -> &[Relation] {
        &[Relation {
            field: "jail",
            alias: "jail",
            protects: true,
        }]
    }
    fn validate(&self, fields: &mut FieldMap, resolver: &Resolver<'_>) -> Result<()> {
        let resource = required_str(fields, "resource")?;
        let action = required_str(fields, "action")?;
        match action_allowed(resource, action) {
            Some(true) => {}
            Some(false) => bail!(ValidationError::new(format!(
                "action `{}' is not allowed for rctl resource `{}'",
                action, resource
            ))),
            None => bail!(ValidationError::new(format!(
                "unknown rctl resource `{}'",
                resource
            ))),
        }
        if optional::<i64>(fields, "amount")?.is_none() {
            bail!(ValidationError::new("`amount' is required"));
        }
        optional::<String>(fields, "per")?;
        required_related(resolver, fields, "jail", &["jail"])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{fields, skel_fields, Harness};
    use felis_core::{ChangesetState, ResourceId};
    use serde_json::json;

    #[test]
    fn test_action_allowed() {
        assert_eq!(action_allowed("memoryuse", "deny"), Some(true));
        assert_eq!(action_allowed("cputime", "deny"), Some(false));
        assert_eq!(action_allowed("readbps", "throttle"), Some(true));
        assert_eq!(action_allowed("memoryuse", "throttle"), Some(false));
        assert_eq!(action_allowed("wallclock", "sigterm"), Some(true));
        assert_eq!(action_allowed("bandwidth", "log"), None);
        assert_eq!(RESOURCES.len(), 25);
    }

    fn jail(h: &Harness, name: &str) -> ResourceId {
        let tank = h.pool("tank");
        let (skel, _) = h.create("skel", skel_fields("v1", tank));
        let (jail, _) = h.create(
            "jail",
            json!({"name": name, "parent": tank.num(), "base": skel.num()}),
        );
        jail
    }

    #[test]
    fn test_rule_lifecycle() {
        let h = Harness::new();
        let www = jail(&h, "www");
        let db = jail(&h, "db");
        h.settle();
        h.runner.clear_commands();

        let (rule, _) = h.create(
            "rctlrule",
            json!({"jail": www.num(), "resource": "memoryuse", "action": "deny", "amount": 1073741824}),
        );
        h.settle();
        h.update(rule, json!({"amount": 536870912, "per": "process"}));
        h.settle();
        h.update(rule, json!({"jail": db.num()}));
        h.settle();
        h.delete(rule);
        h.settle();
        assert_eq!(
            h.runner.commands(),
            vec![
                "rctl -a jail:www:memoryuse:deny=1073741824",
                // amount and per each replace the rule
                "rctl -r jail:www:memoryuse:deny",
                "rctl -a jail:www:memoryuse:deny=536870912/process",
                "rctl -r jail:www:memoryuse:deny",
                "rctl -a jail:www:memoryuse:deny=536870912/process",
                "rctl -r jail:www:memoryuse:deny",
                "rctl -a jail:db:memoryuse:deny=536870912/process",
                "rctl -r jail:db:memoryuse:deny",
            ]
        );
    }

    #[test]
    fn test_replace_tolerates_missing_rule() {
        let h = Harness::new();
        let www = jail(&h, "www");
        let (rule, _) = h.create(
            "rctlrule",
            json!({"jail": www.num(), "resource": "maxproc", "action": "log", "amount": 100}),
        );
        h.settle();
        h.runner.fail_on("rctl -r", 1, "rctl: rule not found");
        let recorded = h.update(rule, json!({"amount": 200}));
        h.settle();
        assert_eq!(h.state(recorded[0].id), ChangesetState::Committed);
        assert_eq!(
            h.runner.commands().last().unwrap(),
            "rctl -a jail:www:maxproc:log=200"
        );

        // removing for good does not tolerate a failure
        let cs = h.delete(rule);
        h.settle();
        assert_eq!(h.state(cs.id), ChangesetState::RolledBack);
    }

    #[test]
    fn test_invalid_rules() {
        let h = Harness::new();
        let www = jail(&h, "www");
        for bad in [
            json!({"jail": www.num(), "resource": "cputime", "action": "deny", "amount": 10}),
            json!({"jail": www.num(), "resource": "bandwidth", "action": "log", "amount": 10}),
            json!({"jail": www.num(), "resource": "maxproc", "action": "log"}),
            json!({"resource": "maxproc", "action": "log", "amount": 10}),
        ] {
            let err = h.ledger.create("rctlrule", fields(bad), None).unwrap_err();
            assert!(err.downcast_ref::<ValidationError>().is_some(), "{:#}", err);
        }
    }

    #[test]
    fn test_jail_with_rules_cannot_go() {
        let h = Harness::new();
        let www = jail(&h, "www");
        h.create(
            "rctlrule",
            json!({"jail": www.num(), "resource": "maxproc", "action": "log", "amount": 100}),
        );
        assert!(h.ledger.delete(www, None).is_err());
    }
}
