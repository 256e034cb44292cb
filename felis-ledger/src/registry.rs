//! Declarations of resource kinds: which changes have side effects, at what
//! priority, how kinds relate to each other and which values they derive.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{bail, Result};
use felis_core::{
    changeset::NO_SIDE_EFFECT, error::ValidationError, ChangeKind, FieldMap, ResourceId,
};
use serde_json::Value;

use crate::{
    context::HookContext,
    store::{ResourceRecord, Store},
};

pub type HookFn = Arc<dyn Fn(&mut HookContext<'_>) -> Result<()> + Send + Sync>;

/// The side-effecting handler for one kind of change.
#[derive(Clone)]
pub struct Hook {
    /// `None` uses the default priority of the change kind.
    pub priority: Option<u16>,
    pub handler: HookFn,
}

impl Hook {
    pub fn priority_for(&self, change_kind: ChangeKind) -> u16 {
        self.priority
            .unwrap_or_else(|| change_kind.default_priority())
    }
}

/// The hooks of one resource kind.
///
/// Kinds that extend another kind start from a copy of its table, then add,
/// replace or remove entries.
#[derive(Clone, Default)]
pub struct HookTable {
    create: Option<Hook>,
    delete: Option<Hook>,
    update: BTreeMap<String, Hook>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(
        mut self,
        priority: Option<u16>,
        handler: impl Fn(&mut HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.create = Some(Hook {
            priority,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn on_delete(
        mut self,
        priority: Option<u16>,
        handler: impl Fn(&mut HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.delete = Some(Hook {
            priority,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn on_update(
        mut self,
        field: &str,
        priority: Option<u16>,
        handler: impl Fn(&mut HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.update.insert(
            field.to_string(),
            Hook {
                priority,
                handler: Arc::new(handler),
            },
        );
        self
    }

    pub fn without_create(mut self) -> Self {
        self.create = None;
        self
    }

    pub fn without_delete(mut self) -> Self {
        self.delete = None;
        self
    }

    pub fn without_update(mut self, field: &str) -> Self {
        self.update.remove(field);
        self
    }

    pub fn hook(&self, change_kind: ChangeKind, field: Option<&str>) -> Option<&Hook> {
        match (change_kind, field) {
            (ChangeKind::Create, _) => self.create.as_ref(),
            (ChangeKind::Delete, _) => self.delete.as_ref(),
            (ChangeKind::Update, Some(field)) => self.update.get(field),
            (ChangeKind::Update, None) => None,
        }
    }

    /// Fields with an update hook.
    pub fn hooked_fields(&self) -> impl Iterator<Item = &str> {
        self.update.keys().map(String::as_str)
    }
}

/// A field that holds the id of another resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    pub field: &'static str,
    /// Name under which the related resource's fields appear in command templates.
    pub alias: &'static str,
    /// The related resource cannot be deleted while this one refers to it.
    pub protects: bool,
}

/// A resource kind taking part in the ledger.
pub trait ResourceKind: Send + Sync {
    fn name(&self) -> &'static str;

    fn hooks(&self) -> &HookTable;

    fn relations(&self) -> &[Relation] {
        &[]
    }

    /// Values derived from the fields, available to command templates.
    fn computed(&self, _fields: &FieldMap, _resolver: &Resolver<'_>) -> Result<FieldMap> {
        Ok(FieldMap::new())
    }

    /// Check and normalise fields before every create and update.
    fn validate(&self, _fields: &mut FieldMap, _resolver: &Resolver<'_>) -> Result<()> {
        Ok(())
    }
}

/// All resource kinds, registered once at start-up.
#[derive(Clone, Default)]
pub struct Registry {
    kinds: BTreeMap<&'static str, Arc<dyn ResourceKind>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: impl ResourceKind + 'static) -> Self {
        self.kinds.insert(kind.name(), Arc::new(kind));
        self
    }

    pub fn kind(&self, name: &str) -> Result<&dyn ResourceKind> {
        match self.kinds.get(name) {
            Some(kind) => Ok(kind.as_ref()),
            None => Err(ValidationError::new(format!("unknown resource kind `{}'", name)).into()),
        }
    }

    pub fn kind_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kinds.keys().copied()
    }

    pub fn hook(&self, kind: &str, change_kind: ChangeKind, field: Option<&str>) -> Option<&Hook> {
        self.kinds
            .get(kind)
            .and_then(|k| k.hooks().hook(change_kind, field))
    }

    /// Priority of a change. Changes without a hook get [`NO_SIDE_EFFECT`].
    pub fn priority(&self, kind: &str, change_kind: ChangeKind, field: Option<&str>) -> u16 {
        self.hook(kind, change_kind, field)
            .map_or(NO_SIDE_EFFECT, |h| h.priority_for(change_kind))
    }

    pub fn resolver<'a>(&'a self, store: &'a dyn Store) -> Resolver<'a> {
        Resolver {
            registry: self,
            store,
        }
    }
}

/// Looks up resources together with their derived values.
#[derive(Clone, Copy)]
pub struct Resolver<'a> {
    registry: &'a Registry,
    store: &'a dyn Store,
}

impl<'a> Resolver<'a> {
    pub fn store(&self) -> &'a dyn Store {
        self.store
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    pub fn record(&self, id: ResourceId) -> Result<ResourceRecord> {
        match self.store.resource(id) {
            Some(record) => Ok(record),
            None => bail!(ValidationError::new(format!("resource {} does not exist", id))),
        }
    }

    /// The id stored in `field`, if set.
    pub fn related_id(fields: &FieldMap, field: &str) -> Result<Option<ResourceId>> {
        match fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => match n.as_u64() {
                Some(id) => Ok(Some(ResourceId::new(id))),
                None => bail!(ValidationError::new(format!(
                    "`{}' is not a resource id: {}",
                    field, n
                ))),
            },
            Some(other) => bail!(ValidationError::new(format!(
                "`{}' is not a resource id: {}",
                field, other
            ))),
        }
    }

    /// Fields of `kind` plus its computed values.
    pub fn full_fields(&self, kind: &str, fields: &FieldMap) -> Result<FieldMap> {
        let mut out = fields.clone();
        out.extend(self.registry.kind(kind)?.computed(fields, self)?);
        Ok(out)
    }

    /// The stored resource `id` with its identity and computed values.
    pub fn resource_fields(&self, id: ResourceId) -> Result<FieldMap> {
        let record = self.record(id)?;
        self.full_fields(&record.kind, &record.snapshot())
    }

    /// Full fields of the resource referred to by `field`.
    pub fn related(&self, fields: &FieldMap, field: &str) -> Result<Option<FieldMap>> {
        Self::related_id(fields, field)?
            .map(|id| self.resource_fields(id))
            .transpose()
    }

    /// What command templates of `kind` may refer to: its fields, its computed
    /// values, and the full fields of each related resource under its alias.
    pub fn render_context(&self, kind: &str, fields: &FieldMap) -> Result<FieldMap> {
        let mut context = self.full_fields(kind, fields)?;
        for relation in self.registry.kind(kind)?.relations() {
            if let Some(related) = self.related(fields, relation.field)? {
                context.insert(
                    relation.alias.to_string(),
                    Value::Object(related.into_iter().collect()),
                );
            }
        }
        Ok(context)
    }

    /// Resources that refer to `id` through a protecting relation.
    pub fn dependents(&self, id: ResourceId) -> Vec<ResourceRecord> {
        self.store
            .resources(None)
            .into_iter()
            .filter(|r| r.id != id)
            .filter(|r| match self.registry.kind(&r.kind) {
                Ok(kind) => kind.relations().iter().any(|rel| {
                    rel.protects
                        && matches!(Self::related_id(&r.fields, rel.field), Ok(Some(target)) if target == id)
                }),
                Err(_) => false,
            })
            .collect()
    }

    /// Fail unless every relation of `kind` in `fields` points at an existing resource.
    pub fn check_relations(&self, kind: &str, fields: &FieldMap) -> Result<()> {
        for relation in self.registry.kind(kind)?.relations() {
            if let Some(id) = Self::related_id(fields, relation.field)? {
                self.record(id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Volume {
        hooks: HookTable,
    }
    impl ResourceKind for Volume {
        fn name(&self) -> &'static str {
            "volume"
        }
        fn hooks(&self) -> &HookTable {
            &self.hooks
        }
        fn relations(&self) -> &[Relation] {
            &[Relation {
                field: "parent",
                alias: "parent",
                protects: true,
            }]
        }
        fn computed(&self, fields: &FieldMap, resolver: &Resolver<'_>) -> Result<FieldMap> {
            let name = fields.get("name").and_then(Value::as_str).unwrap_or_default();
            let path = match resolver.related(fields, "parent")? {
                Some(parent) => format!("{}/{}", parent["path"].as_str().unwrap_or_default(), name),
                None => name.to_string(),
            };
            Ok([("path".to_string(), json!(path))].into_iter().collect())
        }
    }

    fn registry() -> Registry {
        let base = HookTable::new()
            .on_create(None, |_| Ok(()))
            .on_delete(None, |_| Ok(()))
            .on_update("name", Some(80), |_| Ok(()))
            .on_update("size", None, |_| Ok(()));
        Registry::new().register(Volume {
            hooks: base.without_update("size").on_update("quota", Some(20), |_| Ok(())),
        })
    }

    fn fields(v: Value) -> FieldMap {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_priorities() {
        let registry = registry();
        assert_eq!(registry.priority("volume", ChangeKind::Create, None), 100);
        assert_eq!(registry.priority("volume", ChangeKind::Delete, None), 90);
        assert_eq!(registry.priority("volume", ChangeKind::Update, Some("name")), 80);
        assert_eq!(registry.priority("volume", ChangeKind::Update, Some("quota")), 20);
        // removed from the inherited table
        assert_eq!(registry.priority("volume", ChangeKind::Update, Some("size")), 0);
        assert_eq!(registry.priority("volume", ChangeKind::Update, Some("description")), 0);
        assert_eq!(registry.priority("volume", ChangeKind::Update, None), 0);
        assert_eq!(registry.priority("nothing", ChangeKind::Create, None), 0);
    }

    #[test]
    fn test_default_update_priority() {
        let registry = Registry::new().register(Volume {
            hooks: HookTable::new().on_update("size", None, |_| Ok(())),
        });
        assert_eq!(registry.priority("volume", ChangeKind::Update, Some("size")), 50);
        assert_eq!(registry.priority("volume", ChangeKind::Create, None), 0);
    }

    #[test]
    fn test_unknown_kind() {
        let err = registry().kind("pool").err().unwrap();
        assert!(err.downcast_ref::<ValidationError>().is_some());
    }

    #[test]
    fn test_render_context_and_dependents() {
        let registry = registry();
        let store = MemoryStore::new();
        let resolver = registry.resolver(&store);
        let tank = ResourceRecord {
            id: store.next_resource_id().unwrap(),
            kind: "volume".to_string(),
            fields: fields(json!({"name": "tank"})),
        };
        store.put_resource(&tank).unwrap();
        let data = fields(json!({"name": "data", "parent": tank.id.num()}));

        let context = resolver.render_context("volume", &data).unwrap();
        assert_eq!(context["path"], json!("tank/data"));
        assert_eq!(context["parent"]["path"], json!("tank"));
        assert_eq!(context["parent"]["id"], json!(tank.id.num()));

        assert!(resolver.dependents(tank.id).is_empty());
        let child = ResourceRecord {
            id: store.next_resource_id().unwrap(),
            kind: "volume".to_string(),
            fields: data,
        };
        store.put_resource(&child).unwrap();
        assert_eq!(resolver.dependents(tank.id), vec![child.clone()]);
        assert!(resolver.check_relations("volume", &child.fields).is_ok());
        assert!(resolver
            .check_relations("volume", &fields(json!({"parent": 99})))
            .is_err());
    }
}
