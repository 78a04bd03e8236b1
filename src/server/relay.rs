//! WebSocket relay server.
//!
//! A broadcast hub that multiplexes editors, patchers and generic clients
//! over one port. Plain HTTP requests get a fixed identification string so
//! the endpoint can be probed; upgrade requests under `/livestyle` become
//! peer connections. Incoming envelopes are classified once for routing and
//! then rebroadcast verbatim.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{FromRequestParts, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use dashmap::{DashMap, DashSet};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{self, names, Envelope, SERVER_ID};

const OUTBOUND_QUEUE: usize = 256;

/// Declared role of a connected peer, assigned at most once by the first
/// relevant message it sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Unassigned,
    Editor(String),
    Patcher,
    Generic,
}

struct Peer {
    tx: mpsc::Sender<Message>,
    role: Role,
}

/// Connection and role tables. Mutated only by the accept/message/close
/// handlers of the relay that owns them.
#[derive(Default)]
struct RelayState {
    conns: DashMap<Uuid, Peer>,
    patchers: DashSet<Uuid>,
    editors: DashMap<String, Uuid>,
    shutting_down: AtomicBool,
}

struct RelayRuntime {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// The relay server. All broker state is owned by the instance, so tests
/// and the connector failover path can run several independent relays in
/// one process.
pub struct RelayServer {
    port: u16,
    state: Arc<RelayState>,
    runtime: Mutex<Option<RelayRuntime>>,
}

impl RelayServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            state: Arc::new(RelayState::default()),
            runtime: Mutex::new(None),
        }
    }

    /// Bind the listener and start serving. Idempotent: a second call while
    /// the server is running returns the existing bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut runtime = self.runtime.lock().await;
        if let Some(rt) = runtime.as_ref() {
            debug!("re-use running relay at {}", rt.addr);
            return Ok(rt.addr);
        }

        let addr = format!("127.0.0.1:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind relay on {addr}"))?;
        let addr = listener.local_addr()?;

        self.state.shutting_down.store(false, Ordering::SeqCst);

        let (shutdown, _) = broadcast::channel::<()>(1);
        let app = Router::new()
            .fallback(http_entry)
            .with_state(AppState {
                relay: self.state.clone(),
                shutdown: shutdown.clone(),
            });

        let mut shutdown_rx = shutdown.subscribe();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "relay server stopped with error");
            }
        });

        info!(%addr, "relay server started");
        *runtime = Some(RelayRuntime {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    /// Address the listener is bound to, when running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().await.as_ref().map(|rt| rt.addr)
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// Number of currently connected peers.
    pub fn connection_count(&self) -> usize {
        self.state.conns.len()
    }

    /// Send an envelope to every connected peer except `exclude`. Used for
    /// relayed traffic and server-originated notifications alike.
    pub fn broadcast(&self, env: &Envelope, exclude: Option<Uuid>) {
        match env.encode() {
            Ok(frame) => fan_out_all(&self.state, &frame, exclude),
            Err(e) => warn!(error = %e, "dropping unencodable envelope"),
        }
    }

    /// Terminate every connection, clear the role tables and close the
    /// listener. Safe to call when the server is not running; the instance
    /// can be started again afterward.
    pub async fn destroy(&self) {
        self.state.shutting_down.store(true, Ordering::SeqCst);

        let runtime = self.runtime.lock().await.take();
        if let Some(rt) = runtime {
            let _ = rt.shutdown.send(());
            if let Err(e) = rt.task.await {
                warn!(error = %e, "relay task ended abnormally");
            }
            info!("relay server destroyed");
        }

        self.state.conns.clear();
        self.state.patchers.clear();
        self.state.editors.clear();
    }
}

#[derive(Clone)]
struct AppState {
    relay: Arc<RelayState>,
    shutdown: broadcast::Sender<()>,
}

/// Single entry point for every HTTP request: upgrade requests under the
/// accept path become peer connections, any other plain request is answered
/// with the server identification string.
async fn http_entry(State(app): State<AppState>, req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();
    let is_upgrade = parts
        .headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    if is_upgrade {
        if !protocol::accepts_path(parts.uri.path()) {
            debug!(path = %parts.uri.path(), "rejecting upgrade outside accept path");
            return (StatusCode::NOT_FOUND, "unknown upgrade path").into_response();
        }
        return match WebSocketUpgrade::from_request_parts(&mut parts, &app).await {
            Ok(ws) => ws.on_upgrade(move |socket| handle_connection(app, socket)),
            Err(rejection) => rejection.into_response(),
        };
    }

    (StatusCode::OK, SERVER_ID).into_response()
}

async fn handle_connection(app: AppState, socket: WebSocket) {
    let state = app.relay;
    let id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let (mut ws_tx, mut ws_rx) = socket.split();

    state.conns.insert(
        id,
        Peer {
            tx: out_tx,
            role: Role::Unassigned,
        },
    );
    debug!(conn = %id, "peer connected");

    // Announce the newcomer to everyone else.
    if let Ok(frame) = Envelope::bare(names::CLIENT_CONNECT).encode() {
        fan_out_all(&state, &frame, Some(id));
    }

    // Writer task: failures here are isolated to this one connection.
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut shutdown_rx = app.shutdown.subscribe();
    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, id, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong are not part of the protocol
                    Some(Err(e)) => {
                        debug!(conn = %id, error = %e, "peer socket error");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    writer.abort();
    remove_connection(&state, id);
}

/// Routing core: classify the envelope, apply registration side-effects,
/// then rebroadcast the original frame verbatim to the receiver set.
fn handle_frame(state: &RelayState, sender: Uuid, frame: &str) {
    let env = match Envelope::decode(frame) {
        Ok(env) => env,
        Err(e) => {
            warn!(conn = %sender, error = %e, "dropping malformed frame");
            return;
        }
    };
    debug!(conn = %sender, name = %env.name, "relaying message");

    match env.name.as_str() {
        names::EDITOR_CONNECT => {
            let editor_id = env
                .data
                .as_ref()
                .and_then(|d| d.get("id"))
                .and_then(|v| v.as_str());
            match editor_id {
                Some(editor_id) => {
                    // A reconnecting editor with the same id silently
                    // replaces the stale entry.
                    state.editors.insert(editor_id.to_string(), sender);
                    assign_role(state, sender, Role::Editor(editor_id.to_string()));
                }
                None => warn!(conn = %sender, "editor-connect without an id"),
            }
        }
        names::PATCHER_CONNECT => {
            state.patchers.insert(sender);
            assign_role(state, sender, Role::Patcher);
        }
        names::IDENTIFY_CLIENT => {
            assign_role(state, sender, Role::Generic);
        }
        _ => {}
    }

    if protocol::routes_to_patchers(&env.name) {
        fan_out_patchers(state, frame, Some(sender));
    } else {
        fan_out_all(state, frame, Some(sender));
    }
}

/// Roles are assigned exactly once; later connect messages keep the first.
fn assign_role(state: &RelayState, id: Uuid, role: Role) {
    if let Some(mut peer) = state.conns.get_mut(&id) {
        if peer.role == Role::Unassigned {
            peer.role = role;
        }
    }
}

/// Prune a closed connection from every table and announce the loss of any
/// editor id that still maps to it.
fn remove_connection(state: &RelayState, id: Uuid) {
    state.conns.remove(&id);
    state.patchers.remove(&id);

    let owned: Vec<String> = state
        .editors
        .iter()
        .filter(|entry| *entry.value() == id)
        .map(|entry| entry.key().clone())
        .collect();

    for editor_id in owned {
        state.editors.remove(&editor_id);
        debug!(conn = %id, editor = %editor_id, "editor disconnected");
        if !state.shutting_down.load(Ordering::SeqCst) {
            let env = Envelope::new(
                names::EDITOR_DISCONNECT,
                serde_json::json!({ "id": editor_id }),
            );
            if let Ok(frame) = env.encode() {
                fan_out_all(state, &frame, None);
            }
        }
    }
}

fn fan_out_all(state: &RelayState, frame: &str, exclude: Option<Uuid>) {
    for entry in state.conns.iter() {
        if Some(*entry.key()) == exclude {
            continue;
        }
        deliver(*entry.key(), &entry.value().tx, frame);
    }
}

fn fan_out_patchers(state: &RelayState, frame: &str, exclude: Option<Uuid>) {
    for id in state.patchers.iter() {
        if Some(*id.key()) == exclude {
            continue;
        }
        if let Some(peer) = state.conns.get(id.key()) {
            deliver(*id.key(), &peer.tx, frame);
        }
    }
}

/// A full queue or closed writer only ever affects the one peer; the
/// broadcast loop never waits on it.
fn deliver(id: Uuid, tx: &mpsc::Sender<Message>, frame: &str) {
    if let Err(e) = tx.try_send(Message::Text(frame.to_string().into())) {
        debug!(conn = %id, error = %e, "failed to queue frame for peer");
    }
}
