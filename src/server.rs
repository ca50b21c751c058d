//! The NOODLES server runtime.
//!
//! `Server` owns the accept loop and the shared core state; `ServerState` is
//! the interface handler code sees. All mutations of the scene happen under
//! one async mutex, so handler execution order is the broadcast order every
//! client observes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_cbor::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::broadcast::{BroadcastSet, BroadcastStats};
use crate::components::{Component, ComponentUpdate, Selection};
use crate::delegate::{
    ComponentDelegate, DelegateMap, ServerTableDelegate, TableChange, TableOps,
};
use crate::dispatch::MethodContext;
use crate::ids::{ComponentId, ComponentKind, MethodId, SignalId, TableId};
use crate::protocol::{
    encode_frame, update_tag, DocumentUpdate, MethodException, ProtocolError, SignalInvoke,
    TaggedMessage, TAG_DOCUMENT_UPDATE, TAG_INIT_DONE,
};
use crate::registry::{Registry, RegistryError};
use crate::session;

/// A user-supplied method implementation.
///
/// Handlers run synchronously on the core loop with exclusive access to the
/// server state; they must not retain the reference past return.
pub type MethodHandler =
    Arc<dyn Fn(&mut ServerState, MethodContext, &[Value]) -> Result<Value, MethodException> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("starting state: {0}")]
    StartingState(String),
    #[error("json dump: {0}")]
    JsonDump(#[from] serde_json::Error),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port the websocket listener binds.
    pub port: u16,
    /// Frames buffered per session before the session is torn down.
    pub outbound_queue: usize,
    /// How long shutdown waits for sessions to drain.
    pub drain_timeout: Duration,
    /// If set, the startup snapshot is also written there as JSON.
    pub json_dump_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 50000,
            outbound_queue: 256,
            drain_timeout: Duration::from_secs(1),
            json_dump_path: None,
        }
    }
}

/// One entry of the starting state: a component to create before accepting
/// connections, with the handler to bind if it is a method.
pub struct StartingComponent {
    pub component: Component,
    pub handler: Option<MethodHandler>,
}

impl StartingComponent {
    pub fn new(component: Component) -> Self {
        Self {
            component,
            handler: None,
        }
    }

    pub fn with_handler<F>(component: Component, handler: F) -> Self
    where
        F: Fn(&mut ServerState, MethodContext, &[Value]) -> Result<Value, MethodException>
            + Send
            + Sync
            + 'static,
    {
        Self {
            component,
            handler: Some(Arc::new(handler)),
        }
    }
}

/// The core state: registry, broadcast set, handler map, delegates.
///
/// This is the interface methods receive; everything a handler may do to the
/// scene goes through here.
pub struct ServerState {
    registry: Registry,
    broadcast: BroadcastSet,
    pub(crate) handlers: HashMap<MethodId, MethodHandler>,
    custom_delegates: DelegateMap,
    delegates: HashMap<ComponentId, Box<dyn ComponentDelegate>>,
}

impl ServerState {
    fn new(custom_delegates: DelegateMap) -> Self {
        Self {
            registry: Registry::new(),
            broadcast: BroadcastSet::new(),
            handlers: HashMap::new(),
            custom_delegates,
            delegates: HashMap::new(),
        }
    }

    /// Create a component, broadcast its `Create` message, and attach its
    /// delegate.
    pub fn create_component(&mut self, component: Component) -> Result<ComponentId, RegistryError> {
        let kind = component.kind();
        let (id, message) = self.registry.create(component)?;
        self.broadcast_message(&message)?;

        if let Some(factory) = self.custom_delegates.get(&kind) {
            self.delegates.insert(id, factory(id));
        } else if kind == ComponentKind::Table {
            self.delegates
                .insert(id, Box::new(ServerTableDelegate::unnamed()));
        }
        Ok(id)
    }

    /// Create a method component and bind its handler in one step.
    pub fn register_method<F>(
        &mut self,
        method: crate::components::Method,
        handler: F,
    ) -> Result<MethodId, RegistryError>
    where
        F: Fn(&mut ServerState, MethodContext, &[Value]) -> Result<Value, MethodException>
            + Send
            + Sync
            + 'static,
    {
        let id = self.create_component(Component::Method(method))?;
        let id = MethodId::try_from(id)?;
        self.handlers.insert(id, Arc::new(handler));
        Ok(id)
    }

    /// Overwrite the given fields; a no-op patch broadcasts nothing.
    pub fn update_component(
        &mut self,
        id: impl Into<ComponentId>,
        patch: &ComponentUpdate,
    ) -> Result<(), RegistryError> {
        if let Some(message) = self.registry.update(id.into(), patch)? {
            self.broadcast_message(&message)?;
        }
        Ok(())
    }

    /// Delete a component; fails with `InUse` while anything references it.
    pub fn delete_component(&mut self, id: impl Into<ComponentId>) -> Result<(), RegistryError> {
        let id = id.into();
        let message = self.registry.delete(id)?;
        self.broadcast_message(&message)?;
        self.delegates.remove(&id);
        if let Ok(method_id) = MethodId::try_from(id) {
            self.handlers.remove(&method_id);
        }
        Ok(())
    }

    /// Broadcast a signal against the given context.
    pub fn invoke_signal(
        &mut self,
        signal: SignalId,
        context: MethodContext,
        args: Vec<Value>,
    ) -> Result<(), RegistryError> {
        self.registry.get(signal.into())?;
        if let Some(target) = context.component_id() {
            self.registry.get(target)?;
        }
        let invoke = SignalInvoke {
            id: signal,
            context: context.to_invoke_context(),
            signal_data: args,
        };
        let message = TaggedMessage::new(crate::protocol::TAG_SIGNAL_INVOKE, &invoke)
            .map_err(ProtocolError::from)?;
        self.broadcast_message(&message)
    }

    pub fn get_component(&self, id: impl Into<ComponentId>) -> Result<&Component, RegistryError> {
        self.registry.get(id.into())
    }

    pub fn get_ids_by_kind(&self, kind: ComponentKind) -> Vec<ComponentId> {
        self.registry.ids_by_kind(kind)
    }

    /// Most recently created live component of `kind` named `name`.
    pub fn get_component_id(&self, kind: ComponentKind, name: &str) -> Option<ComponentId> {
        self.registry.id_by_name(kind, name)
    }

    pub fn get_delegate(
        &mut self,
        id: impl Into<ComponentId>,
    ) -> Option<&mut (dyn ComponentDelegate + 'static)> {
        self.delegates.get_mut(&id.into()).map(|d| &mut **d)
    }

    pub(crate) fn table_ops(&mut self, table: TableId) -> Option<&mut dyn TableOps> {
        self.get_delegate(table).and_then(|d| d.table_ops())
    }

    /// Broadcast the outcome of a table delegate operation as a `TableUpdate`
    /// carrying the changed rows/keys/selection.
    pub fn broadcast_table_change(
        &mut self,
        table: TableId,
        change: &TableChange,
    ) -> Result<(), RegistryError> {
        #[derive(Serialize)]
        struct TableChangePayload<'a> {
            id: TableId,
            #[serde(skip_serializing_if = "Option::is_none")]
            keys: Option<&'a Vec<i64>>,
            #[serde(skip_serializing_if = "Option::is_none")]
            rows: Option<&'a Vec<Vec<Value>>>,
            #[serde(skip_serializing_if = "Option::is_none")]
            selection: Option<&'a Selection>,
        }

        let mut payload = TableChangePayload {
            id: table,
            keys: None,
            rows: None,
            selection: None,
        };
        match change {
            TableChange::Updated { keys, rows } => {
                payload.keys = Some(keys);
                payload.rows = Some(rows);
            }
            TableChange::RowsRemoved { keys } => payload.keys = Some(keys),
            TableChange::Reset => {}
            TableChange::SelectionUpdated { selection } => payload.selection = Some(selection),
        }

        let tag = update_tag(ComponentKind::Table).expect("table has an update tag");
        let message = TaggedMessage::new(tag, &payload).map_err(ProtocolError::from)?;
        self.broadcast_message(&message)
    }

    /// Document-level listing of all methods and signals.
    pub fn document_update(&self) -> DocumentUpdate {
        DocumentUpdate {
            methods_list: self
                .registry
                .ids_by_kind(ComponentKind::Method)
                .into_iter()
                .filter_map(|id| MethodId::try_from(id).ok())
                .collect(),
            signals_list: self
                .registry
                .ids_by_kind(ComponentKind::Signal)
                .into_iter()
                .filter_map(|id| SignalId::try_from(id).ok())
                .collect(),
        }
    }

    /// The full init sequence for a new client: ordered creates, the document
    /// update, then `InitDone`, packed into one frame.
    pub fn snapshot_frame(&self) -> Result<Vec<u8>, RegistryError> {
        let messages = self.snapshot_messages()?;
        Ok(encode_frame(&messages).map_err(RegistryError::from)?)
    }

    fn snapshot_messages(&self) -> Result<Vec<TaggedMessage>, RegistryError> {
        let mut messages = self.registry.snapshot()?;
        messages.push(
            TaggedMessage::new(TAG_DOCUMENT_UPDATE, &self.document_update())
                .map_err(ProtocolError::from)?,
        );
        messages.push(TaggedMessage::empty(TAG_INIT_DONE));
        Ok(messages)
    }

    pub(crate) fn broadcast_message(&mut self, message: &TaggedMessage) -> Result<(), RegistryError> {
        let frame = encode_frame(std::slice::from_ref(message)).map_err(RegistryError::from)?;
        self.broadcast.broadcast(Arc::new(frame));
        Ok(())
    }

    pub(crate) fn send_to_session(
        &mut self,
        session: Uuid,
        message: &TaggedMessage,
    ) -> Result<(), RegistryError> {
        let frame = encode_frame(std::slice::from_ref(message)).map_err(RegistryError::from)?;
        self.broadcast.send_to(session, Arc::new(frame));
        Ok(())
    }

    pub(crate) fn register_session(
        &mut self,
        id: Uuid,
        tx: tokio::sync::mpsc::Sender<crate::broadcast::Frame>,
    ) -> Result<(), RegistryError> {
        self.broadcast.add_session(id, tx);
        let frame = self.snapshot_frame()?;
        self.broadcast.send_to(id, Arc::new(frame));
        Ok(())
    }

    pub(crate) fn unregister_session(&mut self, id: Uuid) {
        self.broadcast.remove_session(id);
    }

    pub fn stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }

    pub(crate) fn session_count(&self) -> usize {
        self.broadcast.session_count()
    }
}

/// The NOODLES websocket server.
pub struct Server {
    state: Arc<Mutex<ServerState>>,
    config: ServerConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Server {
    /// Build a server: apply the starting state in order, bind method
    /// handlers, and (optionally) dump the startup snapshot as JSON.
    pub fn new(
        config: ServerConfig,
        starting_state: Vec<StartingComponent>,
        delegates: DelegateMap,
    ) -> Result<Self, ServerError> {
        let mut state = ServerState::new(delegates);

        for entry in starting_state {
            let kind = entry.component.kind();
            let id = state.create_component(entry.component)?;
            match entry.handler {
                Some(handler) if kind == ComponentKind::Method => {
                    let method_id =
                        MethodId::try_from(id).map_err(RegistryError::from)?;
                    state.handlers.insert(method_id, handler);
                }
                Some(_) => {
                    return Err(ServerError::StartingState(format!(
                        "handler supplied for non-method component {id}"
                    )));
                }
                None => {}
            }
        }

        if let Some(path) = &config.json_dump_path {
            dump_snapshot_json(&state, path)?;
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            config,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Run the accept loop until shutdown. Call from an async runtime.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        log::info!("noodles server listening on port {}", self.config.port);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    log::info!("accept loop stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("new connection from {addr}");
                    let state = self.state.clone();
                    let shutdown = self.shutdown.subscribe();
                    let queue = self.config.outbound_queue;
                    tokio::spawn(async move {
                        if let Err(err) =
                            session::serve_connection(stream, addr, state, shutdown, queue).await
                        {
                            log::warn!("session error from {addr}: {err}");
                        }
                    });
                }
            }
        }
    }

    /// Stop accepting, close sessions, and wait (bounded) for queues to
    /// drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        loop {
            if self.state.lock().await.session_count() == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!("shutdown drain timed out with sessions still open");
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Exclusive access to the core state, for use outside of handlers
    /// (deferred tasks, tests).
    pub async fn state(&self) -> tokio::sync::MutexGuard<'_, ServerState> {
        self.state.lock().await
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn shared_state(&self) -> Arc<Mutex<ServerState>> {
        self.state.clone()
    }
}

fn dump_snapshot_json(state: &ServerState, path: &std::path::Path) -> Result<(), ServerError> {
    let messages = state.snapshot_messages()?;
    let entries: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            Ok(serde_json::json!({
                "tag": m.tag,
                "payload": serde_json::to_value(&m.payload)?,
            }))
        })
        .collect::<Result<_, serde_json::Error>>()?;
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, &entries)?;
    Ok(())
}
