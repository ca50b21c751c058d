//! Per-connection session handling.
//!
//! A session moves Accepted → Introduced → Active → Closed. The only
//! acceptable first frame is an intro; it earns the client the full state
//! snapshot and `InitDone`. After that, inbound frames may only carry method
//! invocations, applied serially under the core lock. Outbound traffic
//! arrives on the session's queue and is written in FIFO order.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::Frame;
use crate::dispatch;
use crate::protocol::{decode_client_frame, ClientMessage, ProtocolError};
use crate::registry::RegistryError;
use crate::server::ServerState;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("text frames are not part of the protocol")]
    TextFrame,
}

/// Drive one client connection to completion.
pub(crate) async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    mut shutdown: watch::Receiver<bool>,
    queue_capacity: usize,
) -> Result<(), SessionError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Accepted: the first frame must be an intro, or the session closes
    // without reply.
    let (client_name, pending) = match await_intro(&mut ws_tx, &mut ws_rx, &mut shutdown).await? {
        Some(intro) => intro,
        None => return Ok(()),
    };

    // Introduced: register the outbound queue and enqueue the snapshot under
    // one lock hold, so no broadcast can slip in between.
    let session_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Frame>(queue_capacity);
    {
        let mut core = state.lock().await;
        if let Err(err) = core.register_session(session_id, tx) {
            core.unregister_session(session_id);
            return Err(err.into());
        }
        for message in pending {
            if let ClientMessage::Invoke(invoke) = message {
                dispatch::handle_invoke(&mut core, session_id, invoke);
            }
        }
    }
    log::info!("client '{client_name}' connected from {addr}");

    // Active.
    let result = active_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut rx,
        &state,
        session_id,
        &mut shutdown,
    )
    .await;

    // Closed: leave the broadcast set, then flush what was already queued.
    state.lock().await.unregister_session(session_id);
    rx.close();
    while let Ok(frame) = rx.try_recv() {
        if ws_tx
            .send(Message::Binary(frame.to_vec().into()))
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
    log::info!("client '{client_name}' disconnected");
    result
}

/// Wait for the intro. Returns the client name plus any invocations packed
/// into the same frame, or `None` if the session must close quietly.
async fn await_intro(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsSource,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<(String, Vec<ClientMessage>)>, SessionError> {
    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let mut messages = decode_client_frame(&bytes)?.into_iter();
                    match messages.next() {
                        Some(ClientMessage::Intro(intro)) => {
                            return Ok(Some((intro.client_name, messages.collect())));
                        }
                        _ => {
                            log::warn!("closing session: first frame was not an intro");
                            return Ok(None);
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    ws_tx.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Text(_))) => return Err(SessionError::TextFrame),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            },
            _ = shutdown.changed() => return Ok(None),
        }
    }
}

async fn active_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsSource,
    rx: &mut mpsc::Receiver<Frame>,
    state: &Arc<Mutex<ServerState>>,
    session_id: Uuid,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SessionError> {
    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let messages = decode_client_frame(&bytes)?;
                    let mut core = state.lock().await;
                    for message in messages {
                        match message {
                            ClientMessage::Invoke(invoke) => {
                                dispatch::handle_invoke(&mut core, session_id, invoke);
                            }
                            // A repeated intro is tolerated and ignored.
                            ClientMessage::Intro(_) => {
                                log::debug!("duplicate intro from {session_id} ignored");
                            }
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    ws_tx.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Text(_))) => return Err(SessionError::TextFrame),
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            },
            frame = rx.recv() => match frame {
                Some(frame) => {
                    ws_tx.send(Message::Binary(frame.to_vec().into())).await?;
                }
                // Dropped from the broadcast set (overflow or teardown).
                None => return Ok(()),
            },
            _ = shutdown.changed() => return Ok(()),
        }
    }
}
