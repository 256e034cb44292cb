use anyhow::Result;
use chrono::{DateTime, Utc};
use felis_core::{ChangeKind, Changeset, ChangesetFilter, ChangesetState, ResourceId};

use crate::{application::App, options::Options};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// Only changesets of this resource id
    #[arg(long)]
    entity: Option<u64>,

    /// Only changesets of this resource kind
    #[arg(long)]
    kind: Option<String>,

    /// CREATE, UPDATE or DELETE
    #[arg(long)]
    change_kind: Option<ChangeKind>,

    #[arg(long)]
    author: Option<String>,

    /// Created at or after this RFC 3339 time
    #[arg(long)]
    since: Option<DateTime<Utc>>,

    /// Created before this RFC 3339 time
    #[arg(long)]
    until: Option<DateTime<Utc>>,

    /// pending, running, committed or rolled_back
    #[arg(long)]
    state: Option<ChangesetState>,

    /// Print one JSON object per line
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl Args {
    fn filter(&self) -> ChangesetFilter {
        ChangesetFilter {
            entity: self.entity.map(ResourceId::new),
            entity_kind: self.kind.clone(),
            change_kind: self.change_kind,
            author: self.author.clone(),
            since: self.since,
            until: self.until,
            state: self.state,
        }
    }
}

fn describe(cs: &Changeset) -> String {
    let subject = cs
        .subject()
        .map_or_else(|| "-".to_string(), |id| id.to_string());
    let mut line = format!(
        "{} {} {} {}",
        cs.id, cs.change_kind, cs.entity_kind, subject
    );
    if let Some(field) = &cs.field {
        line.push_str(&format!(" {}", field));
    }
    line.push_str(&format!(
        "  priority {}  {}  {}",
        cs.priority,
        cs.state(),
        cs.created.to_rfc3339()
    ));
    if let Some(author) = &cs.author {
        line.push_str(&format!("  by {}", author));
    }
    line
}

pub(crate) fn list(options: &Options, args: &Args) -> Result<()> {
    let app = App::open(options, None)?;
    for cs in app.ledger.feed(&args.filter()) {
        if args.json {
            println!("{}", serde_json::to_string(&cs)?);
        } else {
            println!("{}", describe(&cs));
        }
    }
    Ok(())
}
