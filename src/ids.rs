//! Typed component identifiers and the slot/generation allocator.
//!
//! Every component is addressed by a `(slot, generation)` pair tagged with its
//! kind. Slots are handed out in increasing order and recycled after deletion
//! with a bumped generation, so a held ID can always be checked for staleness:
//! it is live iff its generation matches the allocator's current generation
//! for that slot.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The thirteen component kinds of the NOODLES scene graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentKind {
    Method,
    Signal,
    Entity,
    Plot,
    Buffer,
    BufferView,
    Material,
    Image,
    Texture,
    Sampler,
    Light,
    Geometry,
    Table,
}

impl ComponentKind {
    /// All kinds, in declaration order.
    pub const ALL: [ComponentKind; 13] = [
        ComponentKind::Method,
        ComponentKind::Signal,
        ComponentKind::Entity,
        ComponentKind::Plot,
        ComponentKind::Buffer,
        ComponentKind::BufferView,
        ComponentKind::Material,
        ComponentKind::Image,
        ComponentKind::Texture,
        ComponentKind::Sampler,
        ComponentKind::Light,
        ComponentKind::Geometry,
        ComponentKind::Table,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ComponentKind::Method => "method",
            ComponentKind::Signal => "signal",
            ComponentKind::Entity => "entity",
            ComponentKind::Plot => "plot",
            ComponentKind::Buffer => "buffer",
            ComponentKind::BufferView => "buffer view",
            ComponentKind::Material => "material",
            ComponentKind::Image => "image",
            ComponentKind::Texture => "texture",
            ComponentKind::Sampler => "sampler",
            ComponentKind::Light => "light",
            ComponentKind::Geometry => "geometry",
            ComponentKind::Table => "table",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind-erased component ID. Equality, hashing, and ordering are by
/// `(kind, slot, generation)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    pub kind: ComponentKind,
    pub slot: u32,
    pub gen: u32,
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}/{}|", self.kind, self.slot, self.gen)
    }
}

/// Errors from ID conversion and the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("expected a {expected} id, got {actual}")]
    KindMismatch {
        expected: ComponentKind,
        actual: ComponentId,
    },
    #[error("stale id {0}")]
    Stale(ComponentId),
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident => $kind:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            pub slot: u32,
            pub gen: u32,
        }

        impl $name {
            pub const KIND: ComponentKind = ComponentKind::$kind;

            pub fn new(slot: u32, gen: u32) -> Self {
                Self { slot, gen }
            }
        }

        impl From<$name> for ComponentId {
            fn from(id: $name) -> ComponentId {
                ComponentId {
                    kind: ComponentKind::$kind,
                    slot: id.slot,
                    gen: id.gen,
                }
            }
        }

        impl TryFrom<ComponentId> for $name {
            type Error = IdError;

            fn try_from(id: ComponentId) -> Result<Self, IdError> {
                if id.kind == ComponentKind::$kind {
                    Ok(Self { slot: id.slot, gen: id.gen })
                } else {
                    Err(IdError::KindMismatch {
                        expected: ComponentKind::$kind,
                        actual: id,
                    })
                }
            }
        }

        // On the wire an ID is the two-element array [slot, gen]; the kind is
        // implied by the message tag or the field the ID sits in.
        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                (self.slot, self.gen).serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let (slot, gen) = <(u32, u32)>::deserialize(deserializer)?;
                Ok(Self { slot, gen })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}|{}/{}|", stringify!($name), self.slot, self.gen)
            }
        }
    };
}

typed_id!(MethodId => Method);
typed_id!(SignalId => Signal);
typed_id!(EntityId => Entity);
typed_id!(PlotId => Plot);
typed_id!(BufferId => Buffer);
typed_id!(BufferViewId => BufferView);
typed_id!(MaterialId => Material);
typed_id!(ImageId => Image);
typed_id!(TextureId => Texture);
typed_id!(SamplerId => Sampler);
typed_id!(LightId => Light);
typed_id!(GeometryId => Geometry);
typed_id!(TableId => Table);

/// Per-kind slot table: current generation per slot, the free list, and the
/// slots retired after generation exhaustion.
#[derive(Debug, Default)]
struct SlotTable {
    generations: Vec<u32>,
    free: VecDeque<u32>,
    retired: HashSet<u32>,
}

/// Issues and recycles typed IDs.
///
/// Freed slots are reused FIFO with an incremented generation. A slot whose
/// generation would overflow is retired instead of being recycled, so
/// generations never wrap.
#[derive(Debug)]
pub struct IdAllocator {
    tables: [SlotTable; 13],
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            tables: Default::default(),
        }
    }

    /// Allocate the next ID for `kind`: the oldest free slot, or a new one.
    pub fn alloc(&mut self, kind: ComponentKind) -> ComponentId {
        let table = &mut self.tables[kind.index()];
        let slot = match table.free.pop_front() {
            Some(slot) => slot,
            None => {
                table.generations.push(0);
                (table.generations.len() - 1) as u32
            }
        };
        ComponentId {
            kind,
            slot,
            gen: table.generations[slot as usize],
        }
    }

    /// Release `id`, bumping its slot's generation. Stale IDs are rejected.
    pub fn free(&mut self, id: ComponentId) -> Result<(), IdError> {
        if !self.alive(id) {
            return Err(IdError::Stale(id));
        }
        let table = &mut self.tables[id.kind.index()];
        let gen = &mut table.generations[id.slot as usize];
        match gen.checked_add(1) {
            Some(next) => {
                *gen = next;
                table.free.push_back(id.slot);
            }
            // Generation exhausted: retire the slot rather than wrap.
            None => {
                table.retired.insert(id.slot);
            }
        }
        Ok(())
    }

    /// Whether `id` names the current occupant of its slot.
    pub fn alive(&self, id: ComponentId) -> bool {
        let table = &self.tables[id.kind.index()];
        match table.generations.get(id.slot as usize) {
            Some(&gen) => {
                gen == id.gen
                    && !table.free.contains(&id.slot)
                    && !table.retired.contains(&id.slot)
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn force_generation(&mut self, kind: ComponentKind, slot: u32, gen: u32) {
        self.tables[kind.index()].generations[slot as usize] = gen;
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
