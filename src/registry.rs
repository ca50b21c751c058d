//! The component registry: canonical scene state.
//!
//! One table per kind, keyed by slot. The registry owns every live record,
//! maintains the `(kind, name)` lookup index and the reverse-reference index,
//! and produces the broadcast message for each mutation. All validation is
//! fail-fast: a rejected operation leaves the state untouched.

use std::collections::{BTreeMap, HashMap};

use serde_cbor::Value;
use thiserror::Error;

use crate::components::{Component, ComponentUpdate, ValidationError};
use crate::ids::{ComponentId, ComponentKind, IdAllocator, IdError};
use crate::protocol::{create_tag, delete_tag, update_tag, ProtocolError, TaggedMessage};

/// Snapshot emission order. Referenced kinds come before referring kinds, so
/// a client replaying the snapshot never sees a dangling ID.
pub const SNAPSHOT_ORDER: [ComponentKind; 13] = [
    ComponentKind::Method,
    ComponentKind::Signal,
    ComponentKind::Buffer,
    ComponentKind::BufferView,
    ComponentKind::Image,
    ComponentKind::Sampler,
    ComponentKind::Texture,
    ComponentKind::Material,
    ComponentKind::Geometry,
    ComponentKind::Light,
    ComponentKind::Table,
    ComponentKind::Entity,
    ComponentKind::Plot,
];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("component {0} not found")]
    NotFound(ComponentId),
    #[error("reference to dead component {0}")]
    DanglingRef(ComponentId),
    #[error("{0} is referenced by {count} live component(s)", count = .1.len())]
    InUse(ComponentId, Vec<ComponentId>),
    #[error("update kind {patch} does not match component {id}")]
    KindMismatch { id: ComponentId, patch: ComponentKind },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// How registry failures surface to an invoking client.
impl From<RegistryError> for crate::protocol::MethodException {
    fn from(err: RegistryError) -> Self {
        use crate::protocol::MethodException;
        match &err {
            RegistryError::InUse(..) => MethodException::in_use(err.to_string()),
            RegistryError::Protocol(_) => MethodException::internal_error(),
            _ => MethodException::invalid_parameters(err.to_string()),
        }
    }
}

#[derive(Debug)]
struct StoredComponent {
    id: ComponentId,
    component: Component,
    /// Creation sequence; orders snapshots and name-lookup recency.
    seq: u64,
}

/// Canonical store of all live components.
pub struct Registry {
    allocator: IdAllocator,
    tables: [BTreeMap<u32, StoredComponent>; 13],
    /// `(kind, name)` → ids, oldest first.
    names: HashMap<(ComponentKind, String), Vec<ComponentId>>,
    /// referenced id → ids of the components referring to it.
    referrers: HashMap<ComponentId, Vec<ComponentId>>,
    next_seq: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            allocator: IdAllocator::new(),
            tables: Default::default(),
            names: HashMap::new(),
            referrers: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Whether `id` names a live component.
    pub fn alive(&self, id: ComponentId) -> bool {
        self.allocator.alive(id)
    }

    pub fn get(&self, id: ComponentId) -> Result<&Component, RegistryError> {
        self.stored(id).map(|s| &s.component)
    }

    fn stored(&self, id: ComponentId) -> Result<&StoredComponent, RegistryError> {
        self.tables[id.kind.index()]
            .get(&id.slot)
            .filter(|s| s.id == id)
            .ok_or(RegistryError::NotFound(id))
    }

    /// Live IDs of `kind`, in creation order.
    pub fn ids_by_kind(&self, kind: ComponentKind) -> Vec<ComponentId> {
        let mut stored: Vec<&StoredComponent> = self.tables[kind.index()].values().collect();
        stored.sort_by_key(|s| s.seq);
        stored.iter().map(|s| s.id).collect()
    }

    /// Most recently created live component of `kind` with `name`.
    pub fn id_by_name(&self, kind: ComponentKind, name: &str) -> Option<ComponentId> {
        self.names
            .get(&(kind, name.to_owned()))
            .and_then(|ids| ids.last())
            .copied()
    }

    /// Validate, store, and index a new component; returns its ID and the
    /// `Create` broadcast message.
    pub fn create(
        &mut self,
        component: Component,
    ) -> Result<(ComponentId, TaggedMessage), RegistryError> {
        component.validate()?;
        let refs = component.refs();
        for &r in &refs {
            if !self.allocator.alive(r) {
                return Err(RegistryError::DanglingRef(r));
            }
        }

        let kind = component.kind();
        let id = self.allocator.alloc(kind);
        let message = match create_message(id, &component) {
            Ok(message) => message,
            Err(err) => {
                let _ = self.allocator.free(id);
                return Err(err);
            }
        };
        let seq = self.next_seq;
        self.next_seq += 1;

        for r in refs {
            self.referrers.entry(r).or_default().push(id);
        }
        if let Some(name) = component.name() {
            self.names
                .entry((kind, name.to_owned()))
                .or_default()
                .push(id);
        }
        self.tables[kind.index()].insert(id.slot, StoredComponent { id, component, seq });
        Ok((id, message))
    }

    /// Apply a field-overwrite delta. Returns `None` for an empty patch
    /// (no-op, nothing broadcast), otherwise the `Update` message carrying
    /// only the changed fields.
    pub fn update(
        &mut self,
        id: ComponentId,
        patch: &ComponentUpdate,
    ) -> Result<Option<TaggedMessage>, RegistryError> {
        if patch.kind() != id.kind {
            return Err(RegistryError::KindMismatch {
                id,
                patch: patch.kind(),
            });
        }
        if patch.is_empty() {
            return Ok(None);
        }

        // Validate against a patched copy before committing anything.
        let old = self.stored(id)?;
        let mut updated = old.component.clone();
        patch.apply(&mut updated);
        updated.validate()?;
        let new_refs = updated.refs();
        for &r in &new_refs {
            if !self.allocator.alive(r) {
                return Err(RegistryError::DanglingRef(r));
            }
        }

        let old_refs = old.component.refs();
        let old_name = old.component.name().map(str::to_owned);
        let message = update_message(id, patch)?;

        for r in old_refs {
            self.drop_referrer(r, id);
        }
        for r in new_refs {
            self.referrers.entry(r).or_default().push(id);
        }
        if old_name.as_deref() != updated.name() {
            if let Some(name) = old_name {
                self.drop_name(id.kind, &name, id);
            }
            if let Some(name) = updated.name() {
                self.names
                    .entry((id.kind, name.to_owned()))
                    .or_default()
                    .push(id);
            }
        }

        self.tables[id.kind.index()]
            .get_mut(&id.slot)
            .expect("validated above")
            .component = updated;
        Ok(Some(message))
    }

    /// Remove a component. Fails with `InUse` while any live component still
    /// references it.
    pub fn delete(&mut self, id: ComponentId) -> Result<TaggedMessage, RegistryError> {
        let stored = self.stored(id)?;
        if let Some(referrers) = self.referrers.get(&id) {
            if !referrers.is_empty() {
                return Err(RegistryError::InUse(id, referrers.clone()));
            }
        }

        let refs = stored.component.refs();
        let name = stored.component.name().map(str::to_owned);

        let message = delete_message(id);
        self.tables[id.kind.index()].remove(&id.slot);
        self.referrers.remove(&id);
        for r in refs {
            self.drop_referrer(r, id);
        }
        if let Some(name) = name {
            self.drop_name(id.kind, &name, id);
        }
        self.allocator.free(id)?;
        Ok(message)
    }

    /// Ordered `Create` messages reconstructing the current state.
    pub fn snapshot(&self) -> Result<Vec<TaggedMessage>, RegistryError> {
        let mut messages = Vec::new();
        for kind in SNAPSHOT_ORDER {
            let mut stored: Vec<&StoredComponent> = self.tables[kind.index()].values().collect();
            stored.sort_by_key(|s| s.seq);
            for s in stored {
                messages.push(create_message(s.id, &s.component)?);
            }
        }
        Ok(messages)
    }

    /// Number of live components across all kinds.
    pub fn len(&self) -> usize {
        self.tables.iter().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drop_referrer(&mut self, referenced: ComponentId, referrer: ComponentId) {
        if let Some(list) = self.referrers.get_mut(&referenced) {
            if let Some(pos) = list.iter().position(|&r| r == referrer) {
                list.remove(pos);
            }
            if list.is_empty() {
                self.referrers.remove(&referenced);
            }
        }
    }

    fn drop_name(&mut self, kind: ComponentKind, name: &str, id: ComponentId) {
        if let Some(ids) = self.names.get_mut(&(kind, name.to_owned())) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.names.remove(&(kind, name.to_owned()));
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// `Create` message: the component's fields plus its `id`.
fn create_message(id: ComponentId, component: &Component) -> Result<TaggedMessage, RegistryError> {
    let payload = match component {
        Component::Method(c) => serde_cbor::value::to_value(c),
        Component::Signal(c) => serde_cbor::value::to_value(c),
        Component::Entity(c) => serde_cbor::value::to_value(c),
        Component::Plot(c) => serde_cbor::value::to_value(c),
        Component::Buffer(c) => serde_cbor::value::to_value(c),
        Component::BufferView(c) => serde_cbor::value::to_value(c),
        Component::Material(c) => serde_cbor::value::to_value(c),
        Component::Image(c) => serde_cbor::value::to_value(c),
        Component::Texture(c) => serde_cbor::value::to_value(c),
        Component::Sampler(c) => serde_cbor::value::to_value(c),
        Component::Light(c) => serde_cbor::value::to_value(c),
        Component::Geometry(c) => serde_cbor::value::to_value(c),
        Component::Table(c) => serde_cbor::value::to_value(c),
    }
    .map_err(ProtocolError::from)?;
    Ok(TaggedMessage {
        tag: create_tag(id.kind),
        payload: with_id(payload, id),
    })
}

fn update_message(id: ComponentId, patch: &ComponentUpdate) -> Result<TaggedMessage, RegistryError> {
    let tag = update_tag(id.kind).expect("updatable kind");
    let payload = patch.to_payload().map_err(ProtocolError::from)?;
    Ok(TaggedMessage {
        tag,
        payload: with_id(payload, id),
    })
}

fn delete_message(id: ComponentId) -> TaggedMessage {
    let mut map = BTreeMap::new();
    map.insert(Value::Text("id".into()), id_value(id));
    TaggedMessage {
        tag: delete_tag(id.kind),
        payload: Value::Map(map),
    }
}

pub(crate) fn id_value(id: ComponentId) -> Value {
    Value::Array(vec![
        Value::Integer(id.slot as i128),
        Value::Integer(id.gen as i128),
    ])
}

fn with_id(payload: Value, id: ComponentId) -> Value {
    let mut map = match payload {
        Value::Map(map) => map,
        _ => BTreeMap::new(),
    };
    map.insert(Value::Text("id".into()), id_value(id));
    Value::Map(map)
}
