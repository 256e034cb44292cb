use anyhow::{Context as _, Result};
use felis_core::{
    error::ValidationError,
    fields::{changed_fields, from_fields, subset},
    template, ChangeKind, Changeset, FieldMap, ResourceId,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{
    cache::Snapshot,
    exec::{self, CommandOutput, CommandRunner},
    ledger::Ledger,
    registry::Resolver,
};

/// What a hook sees: the changeset it carries out, the resource's fields
/// around it, and the means to run commands.
///
/// For CREATE and UPDATE the acting fields are the resource's values as
/// carried out so far (see [`Ledger::acting_fields`]), so a change queued
/// behind a rename acts on the new name; for DELETE they are the fields the
/// resource had when deleted.
/// Fields a hook sets are written back through the ledger once the changeset
/// commits.
pub struct HookContext<'a> {
    ledger: &'a Ledger,
    runner: &'a dyn CommandRunner,
    changeset: &'a Changeset,
    old: Option<FieldMap>,
    fields: FieldMap,
    initial: FieldMap,
}

impl<'a> HookContext<'a> {
    pub fn new(
        ledger: &'a Ledger,
        runner: &'a dyn CommandRunner,
        changeset: &'a Changeset,
        snapshot: Snapshot,
    ) -> Result<HookContext<'a>> {
        let fields = match changeset.change_kind {
            ChangeKind::Delete => snapshot.old.clone().or_else(|| changeset.old_values.clone()),
            ChangeKind::Update => ledger.acting_fields(changeset),
            ChangeKind::Create => ledger.acting_fields(changeset).or(snapshot.new),
        };
        let fields = match fields {
            Some(fields) => fields,
            None => {
                return Err(ValidationError::new(format!(
                    "{} {} no longer exists",
                    changeset.entity_kind,
                    changeset
                        .subject()
                        .map_or_else(|| "?".to_string(), |id| id.to_string())
                ))
                .into())
            }
        };
        Ok(HookContext {
            ledger,
            runner,
            changeset,
            old: snapshot.old,
            initial: fields.clone(),
            fields,
        })
    }

    pub fn changeset(&self) -> &Changeset {
        self.changeset
    }

    pub fn kind(&self) -> &str {
        &self.changeset.entity_kind
    }

    pub fn id(&self) -> Option<ResourceId> {
        self.changeset.subject()
    }

    pub fn ledger(&self) -> &'a Ledger {
        self.ledger
    }

    pub fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }

    pub fn resolver(&self) -> Resolver<'a> {
        self.ledger.resolver()
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Fields before the changeset; `None` for a CREATE.
    pub fn old(&self) -> Option<&FieldMap> {
        self.old.as_ref()
    }

    /// A field of the acting resource; `null` when absent.
    pub fn value(&self, name: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.fields.get(name).unwrap_or(&NULL)
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        serde_json::from_value(self.value(name).clone())
            .with_context(|| format!("Invalid field `{}' of {} resource", name, self.kind()))
    }

    /// A field as it was before the changeset.
    pub fn get_old<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .old
            .as_ref()
            .and_then(|old| old.get(name))
            .cloned()
            .unwrap_or(Value::Null);
        serde_json::from_value(value).with_context(|| {
            format!("Invalid previous field `{}' of {} resource", name, self.kind())
        })
    }

    /// A typed view of the acting resource.
    pub fn view<T: DeserializeOwned>(&self) -> Result<T> {
        from_fields(&self.fields, self.kind())
    }

    pub fn set(&mut self, name: &str, value: impl Serialize) -> Result<()> {
        self.fields
            .insert(name.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn render(&self, template: &str) -> Result<String> {
        let context = self.resolver().render_context(self.kind(), &self.fields)?;
        template::render(template, &context)
    }

    /// Render a command line; substituted values stay single arguments.
    pub fn command(&self, template: &str) -> Result<String> {
        let context = self.resolver().render_context(self.kind(), &self.fields)?;
        template::render_command(template, &context)
    }

    /// [`HookContext::command`] against the fields before the changeset.
    pub fn command_old(&self, template: &str) -> Result<String> {
        let old = self.old.as_ref().unwrap_or(&self.fields);
        let context = self.resolver().render_context(self.kind(), old)?;
        template::render_command(template, &context)
    }

    /// Render and run a command. A nonzero exit is a `TaskFailed` error.
    pub fn exec(&self, template: &str) -> Result<CommandOutput> {
        exec::exec(self.runner, &self.command(template)?)
    }

    /// Like [`HookContext::exec`], but a nonzero exit only logs a warning.
    pub fn exec_best_effort(&self, template: &str) -> Result<Option<CommandOutput>> {
        exec::best_effort(self.exec(template))
    }

    /// Run an already rendered command.
    pub fn exec_rendered(&self, command: &str) -> Result<CommandOutput> {
        exec::exec(self.runner, command)
    }

    /// Fields the hook changed, to be written back to the resource.
    pub fn into_writes(self) -> FieldMap {
        if self.changeset.change_kind == ChangeKind::Delete {
            return FieldMap::new();
        }
        let mut changed = changed_fields(&self.initial, &self.fields);
        changed.remove("id");
        subset(&self.fields, &changed)
    }
}
