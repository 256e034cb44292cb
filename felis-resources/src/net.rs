//! Network interfaces and the addresses jails use on them.

use std::net::IpAddr;

use anyhow::{bail, Result};
use felis_core::{error::ValidationError, FieldMap};
use felis_ledger::{HookContext, HookTable, Relation, ResourceKind, Resolver};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::check::{default_field, optional, related_of_kind, required_related, required_str};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    #[default]
    Unknown,
    Bridge,
    Loopback,
}

impl InterfaceType {
    /// Interfaces of this type are called `<prefix><unit number>`.
    fn prefix(self) -> Option<&'static str> {
        match self {
            InterfaceType::Unknown => None,
            InterfaceType::Bridge => Some("bridge"),
            InterfaceType::Loopback => Some("lo"),
        }
    }
}

fn has_unit_number(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c.is_ascii_digit())
}

fn create_interface(ctx: &mut HookContext<'_>) -> Result<()> {
    if ctx.get::<Option<bool>>("os_managed")?.unwrap_or(true) {
        return Ok(());
    }
    match ctx.get::<Option<InterfaceType>>("type")?.unwrap_or_default() {
        InterfaceType::Bridge | InterfaceType::Loopback => {
            ctx.exec("ifconfig {name} create")?;
        }
        InterfaceType::Unknown => {
            tracing::debug!("not creating interface of unknown type");
        }
    }
    Ok(())
}

/// A network interface jails can have addresses on. Unless `os_managed` is
/// cleared, the interface is assumed to exist already.
pub struct Interface {
    hooks: HookTable,
}

impl Interface {
    pub fn new() -> Self {
        Interface {
            hooks: HookTable::new().on_create(None, create_interface),
        }
    }
}

impl ResourceKind for Interface {
    fn name(&self) -> &'static str {
        "interface"
    }
    fn hooks(&self) -> &HookTable {
        &self.hooks
    }
    fn validate(&self, fields: &mut FieldMap, _resolver: &Resolver<'_>) -> Result<()> {
        default_field(fields, "type", json!(InterfaceType::Unknown));
        default_field(fields, "os_managed", true);
        optional::<bool>(fields, "os_managed")?;
        let kind = optional::<InterfaceType>(fields, "type")?.unwrap_or_default();
        let name = required_str(fields, "name")?;
        if let Some(prefix) = kind.prefix() {
            if !has_unit_number(name, prefix) {
                bail!(ValidationError::new(format!(
                    "a {} interface name must be `{}' followed by a number, not `{}'",
                    json!(kind).as_str().unwrap_or_default(),
                    prefix,
                    name
                )));
            }
        }
        Ok(())
    }
}

/// An address and prefix length on an interface, optionally held by a jail.
/// Recorded for lineage only; no commands run for it.
pub struct IpAddress {
    hooks: HookTable,
}

impl IpAddress {
    pub fn new() -> Self {
        IpAddress {
            hooks: HookTable::new(),
        }
    }
}

fn address(fields: &FieldMap) -> Result<IpAddr> {
    let text = required_str(fields, "address")?;
    match text.parse() {
        Ok(address) => Ok(address),
        Err(_) => bail!(ValidationError::new(format!(
            "`{}' is not an IP address",
            text
        ))),
    }
}

impl ResourceKind for IpAddress {
    fn name(&self) -> &'static str {
        "ipaddress"
    }
    fn hooks(&self) -> &HookTable {
        &self.hooks
    }
    fn relations(&self) -> &[Relation] {
        &[
            Relation {
                field: "jail",
                alias: "jail",
                protects: true,
            },
            Relation {
                field: "interface",
                alias: "interface",
                protects: true,
            },
        ]
    }
    fn computed(&self, fields: &FieldMap, _resolver: &Resolver<'_>) -> Result<FieldMap> {
        let protocol = match address(fields) {
            Ok(IpAddr::V4(_)) => json!(4),
            Ok(IpAddr::V6(_)) => json!(6),
            Err(_) => Value::Null,
        };
        Ok(FieldMap::from([("protocol".to_string(), protocol)]))
    }
    fn validate(&self, fields: &mut FieldMap, resolver: &Resolver<'_>) -> Result<()> {
        let parsed = address(fields)?;
        // v4-mapped v6 addresses are stored as plain v4
        let parsed = match parsed {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(parsed, IpAddr::V4),
            IpAddr::V4(_) => parsed,
        };
        fields.insert("address".to_string(), json!(parsed.to_string()));

        let max = if parsed.is_ipv4() { 32 } else { 128 };
        match optional::<u8>(fields, "netmask")? {
            Some(netmask) if netmask <= max => {}
            Some(netmask) => bail!(ValidationError::new(format!(
                "netmask /{} is too long for {}",
                netmask, parsed
            ))),
            None => bail!(ValidationError::new("`netmask' is required")),
        }
        required_related(resolver, fields, "interface", &["interface"])?;
        related_of_kind(resolver, fields, "jail", &["jail"])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{fields, Harness};

    #[test]
    fn test_interface_names() {
        assert!(has_unit_number("bridge0", "bridge"));
        assert!(has_unit_number("lo12", "lo"));
        assert!(!has_unit_number("bridge", "bridge"));
        assert!(!has_unit_number("em0", "lo"));

        let h = Harness::new();
        let err = h
            .ledger
            .create("interface", fields(json!({"name": "br0", "type": "bridge"})), None)
            .unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
        assert!(h
            .ledger
            .create("interface", fields(json!({"name": "em0"})), None)
            .is_ok());
    }

    #[test]
    fn test_create_interface() {
        let h = Harness::new();
        let (em0, _) = h.create("interface", json!({"name": "em0"}));
        h.create("interface", json!({"name": "bridge0", "type": "bridge"}));
        h.create(
            "interface",
            json!({"name": "bridge1", "type": "bridge", "os_managed": false}),
        );
        h.create(
            "interface",
            json!({"name": "lo1", "type": "loopback", "os_managed": false}),
        );
        h.settle();
        assert_eq!(
            h.runner.commands(),
            vec!["ifconfig bridge1 create", "ifconfig lo1 create"]
        );
        let em0 = h.ledger.resource(em0).unwrap().fields;
        assert_eq!(em0["type"], json!("unknown"));
        assert_eq!(em0["os_managed"], json!(true));
    }

    #[test]
    fn test_interface_delete_runs_nothing() {
        let h = Harness::new();
        let (lo1, _) = h.create(
            "interface",
            json!({"name": "lo1", "type": "loopback", "os_managed": false}),
        );
        h.settle();
        let cs = h.delete(lo1);
        assert_eq!(cs.state(), felis_core::ChangesetState::Committed);
        assert_eq!(h.runner.commands(), vec!["ifconfig lo1 create"]);
    }

    #[test]
    fn test_addresses() {
        let h = Harness::new();
        let (em0, _) = h.create("interface", json!({"name": "em0"}));
        let (v4, _) = h.create(
            "ipaddress",
            json!({"interface": em0.num(), "address": "192.0.2.10", "netmask": 24}),
        );
        let (v6, _) = h.create(
            "ipaddress",
            json!({"interface": em0.num(), "address": "2001:db8::10", "netmask": 64}),
        );
        let (mapped, _) = h.create(
            "ipaddress",
            json!({"interface": em0.num(), "address": "::ffff:192.0.2.11", "netmask": 24}),
        );
        let resolver = h.ledger.resolver();
        assert_eq!(resolver.resource_fields(v4).unwrap()["protocol"], json!(4));
        assert_eq!(resolver.resource_fields(v6).unwrap()["protocol"], json!(6));
        assert_eq!(
            h.ledger.resource(mapped).unwrap().fields["address"],
            json!("192.0.2.11")
        );
        assert!(h.scheduler.sweep().is_idle());
        assert!(h.runner.commands().is_empty());

        // the interface is in use
        assert!(h.ledger.delete(em0, None).is_err());
    }

    #[test]
    fn test_invalid_addresses() {
        let h = Harness::new();
        let (em0, _) = h.create("interface", json!({"name": "em0"}));
        for bad in [
            json!({"interface": em0.num(), "address": "192.0.2.300", "netmask": 24}),
            json!({"interface": em0.num(), "address": "192.0.2.1", "netmask": 33}),
            json!({"interface": em0.num(), "address": "192.0.2.1"}),
            json!({"address": "192.0.2.1", "netmask": 24}),
            json!({"interface": em0.num(), "jail": em0.num(), "address": "192.0.2.1", "netmask": 24}),
        ] {
            let err = h.ledger.create("ipaddress", fields(bad), None).unwrap_err();
            assert!(err.downcast_ref::<ValidationError>().is_some(), "{:#}", err);
        }
    }
}
