use anyhow::{bail, Result};
use clap::Subcommand;
use felis_core::{FieldMap, ResourceId};
use serde_json::Value;

use crate::{application::App, options::Options};

/// `NAME=VALUE`; the value is read as JSON, or taken as a string when it is not JSON.
fn parse_assignment(s: &str) -> Result<(String, Value), String> {
    let Some((name, value)) = s.split_once('=') else {
        return Err(format!("expected NAME=VALUE, got `{}'", s));
    };
    if name.is_empty() {
        return Err(format!("missing field name in `{}'", s));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn to_fields(assignments: &[(String, Value)]) -> FieldMap {
    assignments.iter().cloned().collect()
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Record a new resource
    Create {
        /// filesystem, snapshot, clone, world, skel, jail, interface, ipaddress or rctlrule
        kind: String,
        /// Field values
        #[arg(value_name = "NAME=VALUE", value_parser = parse_assignment)]
        fields: Vec<(String, Value)>,
        #[arg(long)]
        author: Option<String>,
    },
    /// Change fields of a resource
    Update {
        id: u64,
        #[arg(value_name = "NAME=VALUE", value_parser = parse_assignment, required = true)]
        fields: Vec<(String, Value)>,
        #[arg(long)]
        author: Option<String>,
    },
    /// Remove a resource
    Delete {
        id: u64,
        #[arg(long)]
        author: Option<String>,
    },
    /// Print a resource with its derived values as JSON
    Show { id: u64 },
    /// List resources, optionally of one kind
    List { kind: Option<String> },
}

pub(crate) fn resource(options: &Options, command: &Command) -> Result<()> {
    let app = App::open(options, None)?;
    let ledger = &app.ledger;
    match command {
        Command::Create {
            kind,
            fields,
            author,
        } => {
            let (id, cs) = ledger.create(kind, to_fields(fields), author.as_deref())?;
            println!("{} {} recorded as changeset {} ({})", kind, id, cs.id, cs.state());
        }
        Command::Update { id, fields, author } => {
            let recorded = ledger.update(ResourceId::new(*id), to_fields(fields), author.as_deref())?;
            if recorded.is_empty() {
                println!("nothing changed");
            }
            for cs in recorded {
                println!(
                    "changeset {} {} ({})",
                    cs.id,
                    cs.field.as_deref().unwrap_or("-"),
                    cs.state()
                );
            }
        }
        Command::Delete { id, author } => {
            let cs = ledger.delete(ResourceId::new(*id), author.as_deref())?;
            println!("recorded as changeset {} ({})", cs.id, cs.state());
        }
        Command::Show { id } => {
            let id = ResourceId::new(*id);
            let record = ledger.resource(id)?;
            let fields = ledger.resolver().full_fields(&record.kind, &record.snapshot())?;
            let shown = serde_json::json!({"kind": record.kind, "fields": fields});
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        Command::List { kind } => {
            if let Some(kind) = kind {
                if ledger.registry().kind(kind).is_err() {
                    bail!("unknown resource kind `{}'", kind);
                }
            }
            for record in ledger.store().resources(kind.as_deref()) {
                let name = record
                    .fields
                    .get("name")
                    .or_else(|| record.fields.get("address"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                println!("{} {} {}", record.id, record.kind, name);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("quota=1073741824").unwrap(),
            ("quota".to_string(), json!(1073741824))
        );
        assert_eq!(
            parse_assignment("name=www").unwrap(),
            ("name".to_string(), json!("www"))
        );
        assert_eq!(
            parse_assignment("mountpoint=null").unwrap(),
            ("mountpoint".to_string(), Value::Null)
        );
        assert_eq!(
            parse_assignment("exec_start=/bin/sh /etc/rc").unwrap(),
            ("exec_start".to_string(), json!("/bin/sh /etc/rc"))
        );
        assert!(parse_assignment("quota").is_err());
        assert!(parse_assignment("=3").is_err());
    }

    #[test]
    fn test_create_update_delete() {
        let dir = tempfile::tempdir().unwrap();
        let options = crate::application::tests::options(dir.path());
        resource(
            &options,
            &Command::Create {
                kind: "filesystem".to_string(),
                fields: vec![parse_assignment("name=data").unwrap()],
                author: None,
            },
        )
        .unwrap();
        resource(
            &options,
            &Command::Update {
                id: 1,
                fields: vec![parse_assignment("description=scratch").unwrap()],
                author: Some("root".to_string()),
            },
        )
        .unwrap();
        resource(&options, &Command::Show { id: 1 }).unwrap();
        resource(&options, &Command::Delete { id: 1, author: None }).unwrap();
        assert!(resource(&options, &Command::Show { id: 1 }).is_err());
        assert!(resource(&options, &Command::List { kind: Some("pool".to_string()) }).is_err());
    }
}
