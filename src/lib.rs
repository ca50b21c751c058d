//! # noodles-server — NOODLES collaborative scene server
//!
//! An authoritative websocket server for the NOODLES protocol: clients
//! observe and mutate a shared, typed scene graph through CBOR-encoded
//! messages.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                    ┌── Registry (components, names, refs)
//!             ├── Session ── Core ┤
//! Client B ──┘        │           ├── Dispatcher ── user handlers
//!                     │           └── Delegates (table row storage)
//!                     │
//!              BroadcastSet
//!        (encode once, fan out to
//!         per-session FIFO queues)
//! ```
//!
//! The core state lives behind a single async mutex. Sessions decode inbound
//! frames and apply them serially under that lock; every mutation broadcasts
//! a lifecycle message, so the order handlers run in is the order every
//! client observes.
//!
//! ## Modules
//!
//! - [`ids`] — typed `(slot, generation)` identifiers and their allocator
//! - [`components`] — the thirteen component kinds and their validation
//! - [`registry`] — canonical state, name index, reverse references
//! - [`protocol`] — message tags, CBOR framing, communication payloads
//! - [`broadcast`] — encode-once fan-out to session queues
//! - [`session`] — per-connection state machine
//! - [`dispatch`] — method resolution, argument validation, replies
//! - [`delegate`] — per-kind behavior, table row operations
//! - [`server`] — the runtime and the handler-facing interface

pub mod broadcast;
pub mod components;
pub mod delegate;
pub mod dispatch;
pub mod ids;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use components::{
    Attribute, AttributeSemantic, BoundingBox, Buffer, BufferType, BufferView, ColumnType,
    Component,
    ComponentUpdate, DirectionalLight, Entity, EntityUpdate, Format, Geometry, GeometryPatch,
    Image, Index, IndexFormat, InstanceSource, Light, LightUpdate, MagFilter, Material,
    MaterialUpdate, Method, MethodArg, MinFilter, PbrInfo, Plot, PlotUpdate, PointLight,
    PrimitiveType, RenderRepresentation, Sampler, SamplerMode, Selection, SelectionRange, Signal,
    SpotLight, Table, TableColumnInfo, TableInitData, TableUpdatePatch, TextRepresentation,
    Texture, TextureRef, ValidationError, WebRepresentation,
};
pub use delegate::{
    ComponentDelegate, DelegateFactory, DelegateMap, ServerTableDelegate, TableChange, TableOps,
};
pub use dispatch::MethodContext;
pub use ids::{
    BufferId, BufferViewId, ComponentId, ComponentKind, EntityId, GeometryId, ImageId, LightId,
    MaterialId, MethodId, PlotId, SamplerId, SignalId, TableId, TextureId,
};
pub use protocol::{InvokeContext, MethodException, Reply, SignalInvoke};
pub use registry::{Registry, RegistryError};
pub use server::{
    MethodHandler, Server, ServerConfig, ServerError, ServerState, StartingComponent,
};
