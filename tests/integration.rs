//! End-to-end websocket scenarios: a real server on an ephemeral port, raw
//! client connections, full frames on the wire.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_cbor::Value;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use noodles_server::protocol::{
    decode_frame, encode_frame, exception_codes, Intro, InvokeRequest, TaggedMessage, TAG_INIT_DONE,
    TAG_INTRO, TAG_INVOKE_METHOD, TAG_METHOD_REPLY, TAG_SIGNAL_INVOKE,
};
use noodles_server::{
    BufferId, ColumnType, Component, ComponentDelegate, ComponentKind, DelegateMap, Entity,
    EntityId, InvokeContext, Method, MethodContext, MethodId, Selection, Server, ServerConfig,
    ServerTableDelegate, Signal, SignalId, StartingComponent, Table, TableColumnInfo, TableId,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port and a handle.
async fn start_test_server(
    starting: Vec<StartingComponent>,
    delegates: DelegateMap,
) -> (u16, Arc<Server>) {
    let port = free_port().await;
    let config = ServerConfig {
        port,
        ..Default::default()
    };
    let server = Arc::new(Server::new(config, starting, delegates).unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give the server time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, server)
}

struct TestClient {
    ws: Ws,
}

impl TestClient {
    /// Connect and send the intro; does not read anything yet.
    async fn connect(port: u16, name: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .expect("connect");
        let mut client = Self { ws };
        let frame = encode_frame(&[TaggedMessage::new(
            TAG_INTRO,
            &Intro {
                client_name: name.into(),
            },
        )
        .unwrap()])
        .unwrap();
        client.send_raw(frame).await;
        client
    }

    /// Connect, intro, and consume the init snapshot.
    async fn connect_and_init(port: u16, name: &str) -> (Self, Vec<(u64, Value)>) {
        let mut client = Self::connect(port, name).await;
        let snapshot = client.recv_frame().await;
        assert_eq!(
            snapshot.last().map(|(tag, _)| *tag),
            Some(TAG_INIT_DONE),
            "snapshot must end with InitDone"
        );
        (client, snapshot)
    }

    async fn send_raw(&mut self, frame: Vec<u8>) {
        self.ws
            .send(WsMessage::Binary(frame.into()))
            .await
            .expect("send");
    }

    async fn invoke(
        &mut self,
        method: MethodId,
        context: Option<InvokeContext>,
        invoke_id: Option<Value>,
        args: Vec<Value>,
    ) {
        let request = InvokeRequest {
            method,
            context,
            invoke_id,
            args,
        };
        let frame =
            encode_frame(&[TaggedMessage::new(TAG_INVOKE_METHOD, &request).unwrap()]).unwrap();
        self.send_raw(frame).await;
    }

    /// Next binary frame, decoded into (tag, payload) pairs.
    async fn recv_frame(&mut self) -> Vec<(u64, Value)> {
        loop {
            let msg = timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .expect("websocket error");
            match msg {
                WsMessage::Binary(data) => {
                    let bytes: Vec<u8> = data.into();
                    return decode_frame(&bytes)
                        .unwrap()
                        .into_iter()
                        .map(|m| (m.tag, m.payload))
                        .collect();
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Assert nothing arrives for a little while.
    async fn expect_silence(&mut self) {
        let result = timeout(Duration::from_millis(200), self.ws.next()).await;
        assert!(result.is_err(), "expected no traffic, got {result:?}");
    }
}

fn field<'a>(payload: &'a Value, name: &str) -> Option<&'a Value> {
    match payload {
        Value::Map(map) => map.get(&Value::Text(name.into())),
        _ => None,
    }
}

fn id_pair(value: &Value) -> (u32, u32) {
    let Value::Array(items) = value else {
        panic!("id is not an array: {value:?}");
    };
    let [Value::Integer(slot), Value::Integer(gen)] = items.as_slice() else {
        panic!("malformed id: {items:?}");
    };
    (*slot as u32, *gen as u32)
}

/// Locate a `Create` message by tag and component name; returns the id pair.
fn created_id(messages: &[(u64, Value)], tag: u64, name: &str) -> (u32, u32) {
    messages
        .iter()
        .find(|(t, payload)| {
            *t == tag && field(payload, "name") == Some(&Value::Text(name.into()))
        })
        .map(|(_, payload)| id_pair(field(payload, "id").expect("create carries id")))
        .unwrap_or_else(|| panic!("no create message with tag {tag} and name {name}"))
}

// --- Scenario 1: hello world ----------------------------------------------

#[tokio::test]
async fn test_hello_world() {
    let starting = vec![StartingComponent::with_handler(
        Component::Method(Method::new("ping")),
        |_, _, _| Ok(Value::Text("pong".into())),
    )];
    let (port, _server) = start_test_server(starting, DelegateMap::new()).await;

    let (mut client, snapshot) = TestClient::connect_and_init(port, "hello").await;
    let (slot, gen) = created_id(&snapshot, 0, "ping");
    assert_eq!((slot, gen), (0, 0));

    client
        .invoke(
            MethodId::new(slot, gen),
            None,
            Some(Value::Integer(7)),
            vec![],
        )
        .await;

    let reply = client.recv_frame().await;
    assert_eq!(reply.len(), 1);
    let (tag, payload) = &reply[0];
    assert_eq!(*tag, TAG_METHOD_REPLY);
    assert_eq!(field(payload, "invoke_id"), Some(&Value::Integer(7)));
    assert_eq!(field(payload, "result"), Some(&Value::Text("pong".into())));
    assert_eq!(field(payload, "method_exception"), None);
}

// --- Scenario 2: broadcast fan-out ----------------------------------------

#[tokio::test]
async fn test_entity_create_fans_out_before_reply() {
    let starting = vec![StartingComponent::with_handler(
        Component::Method(Method::new("make_entity")),
        |state, _, _| {
            state.create_component(Component::Entity(Entity {
                name: Some("E1".into()),
                ..Default::default()
            }))?;
            Ok(Value::Null)
        },
    )];
    let (port, _server) = start_test_server(starting, DelegateMap::new()).await;

    let (mut a, snapshot) = TestClient::connect_and_init(port, "A").await;
    let (mut b, _) = TestClient::connect_and_init(port, "B").await;
    let (slot, gen) = created_id(&snapshot, 0, "make_entity");

    a.invoke(
        MethodId::new(slot, gen),
        None,
        Some(Value::Integer(1)),
        vec![],
    )
    .await;

    // A sees the broadcast, then its reply.
    let create = a.recv_frame().await;
    assert_eq!(create[0].0, 4, "EntityCreate");
    assert_eq!(
        field(&create[0].1, "name"),
        Some(&Value::Text("E1".into()))
    );
    let reply = a.recv_frame().await;
    assert_eq!(reply[0].0, TAG_METHOD_REPLY);

    // B sees the broadcast exactly once and no reply.
    let create_b = b.recv_frame().await;
    assert_eq!(create_b[0].0, 4);
    b.expect_silence().await;
}

// --- Scenario 3: referential delete ---------------------------------------

fn referential_starting_state() -> Vec<StartingComponent> {
    vec![
        StartingComponent::with_handler(
            Component::Method(Method::new("setup")),
            |state, _, _| {
                let buf = state.create_component(Component::Buffer(
                    noodles_server::Buffer {
                        name: Some("B1".into()),
                        size: 3,
                        inline_bytes: Some(vec![1, 2, 3]),
                        ..Default::default()
                    },
                ))?;
                state.create_component(Component::BufferView(noodles_server::BufferView {
                    name: Some("V1".into()),
                    source_buffer: BufferId::try_from(buf).expect("buffer id"),
                    view_type: noodles_server::BufferType::Geometry,
                    offset: 0,
                    length: 3,
                }))?;
                Ok(Value::Null)
            },
        ),
        StartingComponent::with_handler(
            Component::Method(Method::new("del_buffer")),
            |state, _, _| {
                let id = state
                    .get_component_id(ComponentKind::Buffer, "B1")
                    .ok_or_else(noodles_server::MethodException::method_not_found)?;
                state.delete_component(id)?;
                Ok(Value::Null)
            },
        ),
        StartingComponent::with_handler(
            Component::Method(Method::new("del_view")),
            |state, _, _| {
                let id = state
                    .get_component_id(ComponentKind::BufferView, "V1")
                    .ok_or_else(noodles_server::MethodException::method_not_found)?;
                state.delete_component(id)?;
                Ok(Value::Null)
            },
        ),
    ]
}

#[tokio::test]
async fn test_delete_in_use_fails_then_succeeds_in_order() {
    let (port, _server) = start_test_server(referential_starting_state(), DelegateMap::new()).await;

    let (mut a, snapshot) = TestClient::connect_and_init(port, "A").await;
    let (mut b, _) = TestClient::connect_and_init(port, "B").await;
    let setup = created_id(&snapshot, 0, "setup");
    let del_buffer = created_id(&snapshot, 0, "del_buffer");
    let del_view = created_id(&snapshot, 0, "del_view");

    a.invoke(
        MethodId::new(setup.0, setup.1),
        None,
        Some(Value::Integer(1)),
        vec![],
    )
    .await;
    assert_eq!(a.recv_frame().await[0].0, 10, "BufferCreate");
    assert_eq!(a.recv_frame().await[0].0, 12, "BufferViewCreate");
    assert_eq!(a.recv_frame().await[0].0, TAG_METHOD_REPLY);

    // Deleting the referenced buffer fails with InUse and broadcasts nothing.
    a.invoke(
        MethodId::new(del_buffer.0, del_buffer.1),
        None,
        Some(Value::Integer(2)),
        vec![],
    )
    .await;
    let reply = a.recv_frame().await;
    assert_eq!(reply[0].0, TAG_METHOD_REPLY);
    let exception = field(&reply[0].1, "method_exception").expect("exception");
    assert_eq!(
        field(exception, "code"),
        Some(&Value::Integer(exception_codes::IN_USE as i128))
    );

    // View first, then buffer: both deletes broadcast, in order.
    a.invoke(
        MethodId::new(del_view.0, del_view.1),
        None,
        Some(Value::Integer(3)),
        vec![],
    )
    .await;
    assert_eq!(a.recv_frame().await[0].0, 13, "BufferViewDelete");
    assert_eq!(a.recv_frame().await[0].0, TAG_METHOD_REPLY);
    a.invoke(
        MethodId::new(del_buffer.0, del_buffer.1),
        None,
        Some(Value::Integer(4)),
        vec![],
    )
    .await;
    assert_eq!(a.recv_frame().await[0].0, 11, "BufferDelete");
    assert_eq!(a.recv_frame().await[0].0, TAG_METHOD_REPLY);

    // B observed the same mutations in the same order, without the replies.
    assert_eq!(b.recv_frame().await[0].0, 10);
    assert_eq!(b.recv_frame().await[0].0, 12);
    assert_eq!(b.recv_frame().await[0].0, 13);
    assert_eq!(b.recv_frame().await[0].0, 11);
    b.expect_silence().await;
}

// --- Scenario 4: stale ID --------------------------------------------------

#[tokio::test]
async fn test_stale_context_rejected_after_slot_reuse() {
    let starting = vec![
        StartingComponent::with_handler(
            Component::Method(Method::new("poke")),
            |_, _, _| Ok(Value::Null),
        ),
        StartingComponent::with_handler(
            Component::Method(Method::new("cycle")),
            |state, _, _| {
                // poke is the first starting component: id (0, 0).
                let e1 = state.create_component(Component::Entity(Entity {
                    methods_list: Some(vec![MethodId::new(0, 0)]),
                    ..Default::default()
                }))?;
                state.delete_component(e1)?;
                let e2 = state.create_component(Component::Entity(Entity {
                    methods_list: Some(vec![MethodId::new(0, 0)]),
                    ..Default::default()
                }))?;
                Ok(Value::Array(vec![
                    Value::Integer(EntityId::try_from(e2).unwrap().slot as i128),
                    Value::Integer(EntityId::try_from(e2).unwrap().gen as i128),
                ]))
            },
        ),
    ];
    let (port, _server) = start_test_server(starting, DelegateMap::new()).await;

    let (mut client, snapshot) = TestClient::connect_and_init(port, "C").await;
    let cycle = created_id(&snapshot, 0, "cycle");
    client
        .invoke(
            MethodId::new(cycle.0, cycle.1),
            None,
            Some(Value::Integer(1)),
            vec![],
        )
        .await;

    assert_eq!(client.recv_frame().await[0].0, 4, "EntityCreate (0,0)");
    assert_eq!(client.recv_frame().await[0].0, 6, "EntityDelete");
    let create2 = client.recv_frame().await;
    assert_eq!(create2[0].0, 4, "EntityCreate (0,1)");
    assert_eq!(
        id_pair(field(&create2[0].1, "id").unwrap()),
        (0, 1),
        "slot reused with bumped generation"
    );
    let reply = client.recv_frame().await;
    assert_eq!(
        field(&reply[0].1, "result"),
        Some(&Value::Array(vec![Value::Integer(0), Value::Integer(1)]))
    );

    // Invoking against the dead generation fails.
    client
        .invoke(
            MethodId::new(0, 0),
            Some(InvokeContext::Entity(EntityId::new(0, 0))),
            Some(Value::Integer(2)),
            vec![],
        )
        .await;
    let reply = client.recv_frame().await;
    let exception = field(&reply[0].1, "method_exception").expect("exception");
    assert_eq!(
        field(exception, "code"),
        Some(&Value::Integer(exception_codes::METHOD_NOT_FOUND as i128))
    );

    // The live generation works.
    client
        .invoke(
            MethodId::new(0, 0),
            Some(InvokeContext::Entity(EntityId::new(0, 1))),
            Some(Value::Integer(3)),
            vec![],
        )
        .await;
    let reply = client.recv_frame().await;
    assert_eq!(field(&reply[0].1, "method_exception"), None);
}

// --- Scenario 5: table delegate -------------------------------------------

#[tokio::test]
async fn test_table_insert_through_custom_delegate() {
    let mut delegates = DelegateMap::new();
    delegates.insert(
        ComponentKind::Table,
        Box::new(|_| -> Box<dyn ComponentDelegate> {
            Box::new(ServerTableDelegate::new(vec![
                TableColumnInfo {
                    name: "key".into(),
                    col_type: ColumnType::Integer,
                },
                TableColumnInfo {
                    name: "label".into(),
                    col_type: ColumnType::Text,
                },
            ]))
        }),
    );
    let starting = vec![
        StartingComponent::new(Component::Method(Method::new("noo::tbl_insert"))),
        StartingComponent::new(Component::Table(Table {
            name: Some("points".into()),
            methods_list: Some(vec![MethodId::new(0, 0)]),
            ..Default::default()
        })),
    ];
    let (port, _server) = start_test_server(starting, delegates).await;

    let (mut client, snapshot) = TestClient::connect_and_init(port, "T").await;
    let insert = created_id(&snapshot, 0, "noo::tbl_insert");
    let table = created_id(&snapshot, 28, "points");

    let rows = Value::Array(vec![
        Value::Array(vec![Value::Integer(1), Value::Text("a".into())]),
        Value::Array(vec![Value::Integer(2), Value::Text("b".into())]),
    ]);
    client
        .invoke(
            MethodId::new(insert.0, insert.1),
            Some(InvokeContext::Table(TableId::new(table.0, table.1))),
            Some(Value::Integer(5)),
            vec![rows.clone()],
        )
        .await;

    // TableUpdate broadcast carrying the inserted rows and keys...
    let update = client.recv_frame().await;
    assert_eq!(update[0].0, 29);
    assert_eq!(
        field(&update[0].1, "keys"),
        Some(&Value::Array(vec![Value::Integer(0), Value::Integer(1)]))
    );
    assert_eq!(field(&update[0].1, "rows"), Some(&rows));

    // ...then the reply with the assigned keys.
    let reply = client.recv_frame().await;
    assert_eq!(reply[0].0, TAG_METHOD_REPLY);
    assert_eq!(field(&reply[0].1, "invoke_id"), Some(&Value::Integer(5)));
    assert_eq!(
        field(&reply[0].1, "result"),
        Some(&Value::Array(vec![Value::Integer(0), Value::Integer(1)]))
    );
}

// --- Scenario 6: signal emission ------------------------------------------

#[tokio::test]
async fn test_signal_broadcast_with_entity_context() {
    let starting = vec![
        StartingComponent::new(Component::Signal(Signal::new("sig"))),
        StartingComponent::new(Component::Entity(Entity {
            name: Some("E1".into()),
            ..Default::default()
        })),
        StartingComponent::with_handler(
            Component::Method(Method::new("fire")),
            |state, _, _| {
                let signal = state
                    .get_component_id(ComponentKind::Signal, "sig")
                    .expect("signal exists");
                let entity = state
                    .get_component_id(ComponentKind::Entity, "E1")
                    .expect("entity exists");
                state.invoke_signal(
                    SignalId::try_from(signal).unwrap(),
                    MethodContext::Entity(EntityId::try_from(entity).unwrap()),
                    vec![Value::Integer(42)],
                )?;
                Ok(Value::Null)
            },
        ),
    ];
    let (port, _server) = start_test_server(starting, DelegateMap::new()).await;

    let (mut a, snapshot) = TestClient::connect_and_init(port, "A").await;
    let (mut b, _) = TestClient::connect_and_init(port, "B").await;
    let fire = created_id(&snapshot, 0, "fire");
    let sig = created_id(&snapshot, 2, "sig");
    let entity = created_id(&snapshot, 4, "E1");

    a.invoke(
        MethodId::new(fire.0, fire.1),
        None,
        Some(Value::Integer(1)),
        vec![],
    )
    .await;

    for client in [&mut a, &mut b] {
        let frame = client.recv_frame().await;
        let (tag, payload) = &frame[0];
        assert_eq!(*tag, TAG_SIGNAL_INVOKE);
        assert_eq!(id_pair(field(payload, "id").unwrap()), sig);
        let context = field(payload, "context").expect("context");
        assert_eq!(id_pair(field(context, "entity").unwrap()), entity);
        assert_eq!(
            field(payload, "signal_data"),
            Some(&Value::Array(vec![Value::Integer(42)]))
        );
    }
}

// --- Boundary behaviors ----------------------------------------------------

#[tokio::test]
async fn test_second_intro_is_ignored() {
    let starting = vec![StartingComponent::with_handler(
        Component::Method(Method::new("ping")),
        |_, _, _| Ok(Value::Text("pong".into())),
    )];
    let (port, _server) = start_test_server(starting, DelegateMap::new()).await;

    let (mut client, _) = TestClient::connect_and_init(port, "first").await;
    let second_intro = encode_frame(&[TaggedMessage::new(
        TAG_INTRO,
        &Intro {
            client_name: "again".into(),
        },
    )
    .unwrap()])
    .unwrap();
    client.send_raw(second_intro).await;

    // No second snapshot; the session stays usable.
    client.expect_silence().await;
    client
        .invoke(MethodId::new(0, 0), None, Some(Value::Integer(9)), vec![])
        .await;
    let reply = client.recv_frame().await;
    assert_eq!(field(&reply[0].1, "result"), Some(&Value::Text("pong".into())));
}

#[tokio::test]
async fn test_reply_correlation_echoes_ids_verbatim() {
    let starting = vec![StartingComponent::with_handler(
        Component::Method(Method::new("echo")),
        |_, _, args| Ok(args.first().cloned().unwrap_or(Value::Null)),
    )];
    let (port, _server) = start_test_server(starting, DelegateMap::new()).await;
    let (mut client, _) = TestClient::connect_and_init(port, "corr").await;

    for invoke_id in [Value::Integer(1), Value::Text("req-a".into()), Value::Integer(2)] {
        client
            .invoke(
                MethodId::new(0, 0),
                None,
                Some(invoke_id.clone()),
                vec![Value::Integer(11)],
            )
            .await;
        let reply = client.recv_frame().await;
        assert_eq!(field(&reply[0].1, "invoke_id"), Some(&invoke_id));
    }
}

#[tokio::test]
async fn test_snapshot_replay_matches_live_state() {
    let (port, server) = start_test_server(referential_starting_state(), DelegateMap::new()).await;

    let (mut a, _) = TestClient::connect_and_init(port, "A").await;
    a.invoke(MethodId::new(0, 0), None, Some(Value::Integer(1)), vec![])
        .await;
    // Drain: BufferCreate, BufferViewCreate, reply.
    for _ in 0..3 {
        a.recv_frame().await;
    }

    // A fresh client's snapshot recreates exactly the live component set,
    // dependencies first.
    let (_b, snapshot) = TestClient::connect_and_init(port, "B").await;
    let create_tags: Vec<u64> = snapshot
        .iter()
        .map(|(tag, _)| *tag)
        .filter(|tag| *tag != TAG_INIT_DONE && *tag != 31)
        .collect();
    // Three methods, then buffer before its view.
    assert_eq!(create_tags, vec![0, 0, 0, 10, 12]);

    let live = server.state().await.get_ids_by_kind(ComponentKind::Buffer);
    assert_eq!(live.len(), 1);
    let buffer_msg = snapshot.iter().find(|(tag, _)| *tag == 10).unwrap();
    let (slot, gen) = id_pair(field(&buffer_msg.1, "id").unwrap());
    assert_eq!(
        BufferId::new(slot, gen),
        BufferId::try_from(live[0]).unwrap()
    );
    // The view references the buffer by the same id it was created with.
    let view_msg = snapshot.iter().find(|(tag, _)| *tag == 12).unwrap();
    assert_eq!(
        id_pair(field(&view_msg.1, "source_buffer").unwrap()),
        (slot, gen)
    );
}

#[tokio::test]
async fn test_selection_update_broadcast() {
    let starting = vec![
        StartingComponent::new(Component::Method(Method::new("noo::tbl_update_selection"))),
        StartingComponent::new(Component::Table(Table {
            name: Some("t".into()),
            methods_list: Some(vec![MethodId::new(0, 0)]),
            ..Default::default()
        })),
    ];
    let (port, _server) = start_test_server(starting, DelegateMap::new()).await;
    let (mut client, snapshot) = TestClient::connect_and_init(port, "S").await;
    let method = created_id(&snapshot, 0, "noo::tbl_update_selection");
    let table = created_id(&snapshot, 28, "t");

    let selection = Selection {
        name: "picked".into(),
        rows: Some(vec![0, 2]),
        row_ranges: None,
    };
    client
        .invoke(
            MethodId::new(method.0, method.1),
            Some(InvokeContext::Table(TableId::new(table.0, table.1))),
            Some(Value::Integer(1)),
            vec![serde_cbor::value::to_value(&selection).unwrap()],
        )
        .await;

    let update = client.recv_frame().await;
    assert_eq!(update[0].0, 29);
    let sel = field(&update[0].1, "selection").expect("selection");
    assert_eq!(field(sel, "name"), Some(&Value::Text("picked".into())));

    let reply = client.recv_frame().await;
    assert_eq!(field(&reply[0].1, "result"), Some(&Value::Null));
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let (port, server) = start_test_server(vec![], DelegateMap::new()).await;
    let (mut client, _) = TestClient::connect_and_init(port, "bye").await;

    server.shutdown().await;

    // The session ends; the client observes a close (or the stream ending).
    let outcome = timeout(Duration::from_secs(2), async {
        loop {
            match client.ws.next().await {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "session did not close on shutdown");

    // New connections are refused once the accept loop has stopped.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let retry = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await;
    assert!(retry.is_err());
}
