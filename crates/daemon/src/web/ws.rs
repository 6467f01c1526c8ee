//! WebSocket adapter.
//!
//! One socket is one client connection in the broker's sense: it holds at
//! most one terminal attachment, fed from the same send queue and fan-out
//! path as binary-protocol clients, plus an optional board subscription.
//!
//! Board events are lossless for subscribers: a socket that cannot keep up
//! with the (low-frequency) board stream is closed rather than shown a
//! gapped board.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use protocol::Message;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::board::{BoardEvent, BoardStore, TicketPatch};
use crate::broker::Broker;
use crate::connection::ClientConnection;
use crate::session::PtySession;

use super::messages::{WsClientMessage, WsServerMessage};
use super::AppState;

/// Outbound channel capacity per socket.
const OUTBOUND_CAPACITY: usize = 256;

/// Grace period used for `agent:kill`.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// The session currently streamed to a socket.
type Attachment = Arc<StdMutex<Option<(String, Arc<PtySession>)>>>;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one WebSocket connection.
///
/// Tasks per socket: a write loop draining the outbound channel, a
/// forwarder translating broker frames into `terminal:*` envelopes, and
/// (while board-subscribed) a board event forwarder. The receive loop in
/// this function routes client envelopes into broker and board operations.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let broker = Arc::clone(&state.broker);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsServerMessage>(OUTBOUND_CAPACITY);

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize ws message");
                    continue;
                }
            };
            if ws_sender.send(WsMessage::text(json)).await.is_err() {
                break;
            }
        }
    });

    let conn = broker.register_connection();
    let conn_id = conn.id();
    let attachment: Attachment = Arc::new(StdMutex::new(None));
    let close = CancellationToken::new();

    let forward_task = spawn_terminal_forwarder(
        Arc::clone(&conn),
        Arc::clone(&attachment),
        tx.clone(),
    );

    let mut board_task: Option<JoinHandle<()>> = None;
    let mut board_subscribed = false;

    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = close.cancelled() => break,
        };
        let Some(Ok(msg)) = msg else { break };

        match msg {
            WsMessage::Text(text) => {
                let client_msg: WsClientMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        let _ = tx
                            .send(WsServerMessage::Error {
                                message: format!("invalid message: {e}"),
                            })
                            .await;
                        continue;
                    }
                };
                handle_client_message(
                    client_msg,
                    &broker,
                    &conn,
                    &attachment,
                    &tx,
                    &close,
                    &mut board_task,
                    &mut board_subscribed,
                )
                .await;
            }

            // Raw binary payloads are terminal input for the attached
            // session, saving the base64 round trip for bulk paste.
            WsMessage::Binary(data) => {
                broker
                    .handle_message(&conn, Message::Data(data.to_vec()))
                    .await;
            }

            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    if let Some(task) = board_task {
        task.abort();
    }
    broker.remove_connection(conn_id);
    let _ = forward_task.await;
    drop(tx);
    let _ = write_task.await;
    debug!(conn_id, "WebSocket connection closed");
}

/// Translate broker frames (DATA, EXIT) into terminal envelopes.
fn spawn_terminal_forwarder(
    conn: Arc<ClientConnection>,
    attachment: Attachment,
    tx: mpsc::Sender<WsServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = conn.queue().pop().await {
            let out = match msg {
                Message::Data(bytes) => {
                    let Some((session_id, _)) = attachment
                        .lock()
                        .expect("attachment lock poisoned")
                        .clone()
                    else {
                        continue;
                    };
                    WsServerMessage::TerminalOutput {
                        session_id,
                        data: BASE64.encode(&bytes),
                    }
                }
                Message::Exit => {
                    let Some((session_id, session)) = attachment
                        .lock()
                        .expect("attachment lock poisoned")
                        .take()
                    else {
                        continue;
                    };
                    WsServerMessage::TerminalExit {
                        session_id,
                        exit_code: session.exit_status(),
                    }
                }
                // Control replies are synthesized by the adapter itself.
                _ => continue,
            };
            if tx.send(out).await.is_err() {
                break;
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_message(
    msg: WsClientMessage,
    broker: &Arc<Broker>,
    conn: &Arc<ClientConnection>,
    attachment: &Attachment,
    tx: &mpsc::Sender<WsServerMessage>,
    close: &CancellationToken,
    board_task: &mut Option<JoinHandle<()>>,
    board_subscribed: &mut bool,
) {
    let board = Arc::clone(broker.board());

    match msg {
        WsClientMessage::TerminalSubscribe { session_id } => {
            match broker.attach_session(conn, &session_id) {
                Ok(session) => {
                    let buffer = session.scrollback();
                    *attachment.lock().expect("attachment lock poisoned") =
                        Some((session_id.clone(), session));
                    let _ = tx
                        .send(WsServerMessage::TerminalBuffer {
                            session_id,
                            data: BASE64.encode(&buffer),
                        })
                        .await;
                }
                Err(message) => {
                    let _ = tx.send(WsServerMessage::Error { message }).await;
                }
            }
        }

        WsClientMessage::TerminalUnsubscribe => {
            broker.detach(conn);
            attachment.lock().expect("attachment lock poisoned").take();
        }

        WsClientMessage::TerminalInput { data } => match BASE64.decode(&data) {
            Ok(bytes) => broker.handle_message(conn, Message::Data(bytes)).await,
            Err(e) => {
                let _ = tx
                    .send(WsServerMessage::Error {
                        message: format!("invalid base64: {e}"),
                    })
                    .await;
            }
        },

        WsClientMessage::TerminalResize { rows, cols } => {
            broker
                .handle_message(conn, Message::Resize { rows, cols })
                .await;
        }

        WsClientMessage::AgentSpawn {
            session_id,
            workdir,
            command,
            args,
            ticket_id,
        } => {
            let command = command.filter(|c| !c.is_empty()).unwrap_or_else(|| {
                let agent = board.settings().default_agent;
                if !agent.is_empty() {
                    agent
                } else {
                    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
                }
            });

            match broker
                .create_session(
                    conn,
                    session_id.clone(),
                    workdir.unwrap_or_default(),
                    command,
                    args,
                )
                .await
            {
                Ok(session) => {
                    if let Some(ticket_id) = ticket_id {
                        let patch = TicketPatch {
                            terminal_session_id: Some(session_id.clone()),
                            ..Default::default()
                        };
                        if let Err(e) = board.update_ticket(&ticket_id, patch) {
                            warn!(ticket_id = %ticket_id, error = %e, "Could not bind session to ticket");
                        }
                    }
                    let buffer = session.scrollback();
                    *attachment.lock().expect("attachment lock poisoned") =
                        Some((session_id.clone(), session));
                    let _ = tx
                        .send(WsServerMessage::TerminalBuffer {
                            session_id,
                            data: BASE64.encode(&buffer),
                        })
                        .await;
                }
                Err(message) => {
                    let _ = tx.send(WsServerMessage::Error { message }).await;
                }
            }
        }

        WsClientMessage::AgentKill { session_id } => {
            match broker.lookup_session(&session_id) {
                Some(session) => {
                    tokio::spawn(async move { session.stop_graceful(KILL_GRACE).await });
                }
                None => {
                    let _ = tx
                        .send(WsServerMessage::Error {
                            message: format!("session not found: {session_id}"),
                        })
                        .await;
                }
            }
        }

        WsClientMessage::BoardSubscribe => {
            if *board_subscribed {
                return;
            }
            *board_subscribed = true;
            *board_task = Some(spawn_board_forwarder(board, tx.clone(), close.clone()));
        }

        WsClientMessage::BoardUnsubscribe => {
            *board_subscribed = false;
            if let Some(task) = board_task.take() {
                task.abort();
            }
        }

        WsClientMessage::TicketCreate { ticket } => {
            if ticket.title.trim().is_empty() {
                let _ = tx
                    .send(WsServerMessage::Error {
                        message: "title must not be empty".into(),
                    })
                    .await;
                return;
            }
            let created = board.create_ticket(ticket);
            if !*board_subscribed {
                let _ = tx
                    .send(WsServerMessage::TicketCreated { ticket: created })
                    .await;
            }
        }

        WsClientMessage::TicketUpdate { id, patch } => match board.update_ticket(&id, patch) {
            Ok(updated) => {
                if !*board_subscribed {
                    let _ = tx
                        .send(WsServerMessage::TicketUpdated { ticket: updated })
                        .await;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(WsServerMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        },

        WsClientMessage::TicketDelete { id, force } => match board.delete_ticket(&id, force) {
            Ok(()) => {
                if !*board_subscribed {
                    let _ = tx.send(WsServerMessage::TicketDeleted { id }).await;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(WsServerMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        },

        WsClientMessage::TicketMove { id, status } => match board.move_ticket(&id, status) {
            Ok(moved) => {
                if !*board_subscribed {
                    let _ = tx
                        .send(WsServerMessage::TicketUpdated { ticket: moved })
                        .await;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(WsServerMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        },

        WsClientMessage::Ping => {
            let _ = tx.send(WsServerMessage::Pong).await;
        }
    }
}

/// Forward board events to the socket, starting with a full snapshot.
///
/// A lagged receiver means this subscriber missed events; the connection is
/// closed so the client reconnects and resyncs from `board:state`.
fn spawn_board_forwarder(
    board: Arc<BoardStore>,
    tx: mpsc::Sender<WsServerMessage>,
    close: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = board.subscribe();

        if tx
            .send(WsServerMessage::BoardState {
                board: board.snapshot(),
            })
            .await
            .is_err()
        {
            return;
        }

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(convert_board_event(event)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Board subscriber lagged, dropping connection");
                    let _ = tx
                        .send(WsServerMessage::Error {
                            message: "board subscription lagged, reconnect to resync".into(),
                        })
                        .await;
                    close.cancel();
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn convert_board_event(event: BoardEvent) -> WsServerMessage {
    match event {
        BoardEvent::TicketCreated(ticket) => WsServerMessage::TicketCreated { ticket },
        BoardEvent::TicketUpdated(ticket) => WsServerMessage::TicketUpdated { ticket },
        BoardEvent::TicketDeleted { id } => WsServerMessage::TicketDeleted { id },
        BoardEvent::AgentStatus { ticket_id, status } => {
            WsServerMessage::AgentStatus { ticket_id, status }
        }
        BoardEvent::SettingsUpdated(settings) => WsServerMessage::BoardPatch { settings },
    }
}
