//! Client-side session over one relay connection.
//!
//! A `Session` wraps the live socket behind a pair of channels: outbound
//! envelopes are queued to a writer half, decoded incoming envelopes are
//! fanned out to subscribers. The driver task silently re-establishes the
//! connection when it drops unexpectedly, unless the owner destroyed the
//! session first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::client::{establish, ConnectOptions, WsStream};
use crate::protocol::Envelope;
use crate::server::RelayServer;

const OUTBOUND_QUEUE: usize = 256;
const INCOMING_FANOUT: usize = 256;

struct SessionInner {
    url: String,
    outbound: mpsc::Sender<Message>,
    incoming: broadcast::Sender<Envelope>,
    shutdown: broadcast::Sender<()>,
    destroyed: AtomicBool,
    hosted: parking_lot::Mutex<Option<Arc<RelayServer>>>,
}

/// Handle to an established relay connection. Cheap to clone; all clones
/// share the same underlying socket and reconnect behavior.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wrap a freshly opened socket and spawn the driver task.
    pub(crate) fn spawn(
        url: String,
        options: ConnectOptions,
        ws: WsStream,
        hosted: Option<Arc<RelayServer>>,
    ) -> Self {
        let (outbound, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (incoming, _) = broadcast::channel(INCOMING_FANOUT);
        let (shutdown, _) = broadcast::channel(1);

        let inner = Arc::new(SessionInner {
            url,
            outbound,
            incoming,
            shutdown,
            destroyed: AtomicBool::new(false),
            hosted: parking_lot::Mutex::new(hosted),
        });

        tokio::spawn(drive(inner.clone(), options, ws, out_rx));
        Session { inner }
    }

    /// Encode and queue an envelope on the live socket.
    pub async fn send(&self, name: &str, data: Value) -> Result<()> {
        if self.is_destroyed() {
            bail!("session destroyed");
        }
        let frame = Envelope::new(name, data).encode()?;
        self.inner
            .outbound
            .send(Message::Text(frame.into()))
            .await
            .context("session connection closed")
    }

    /// Subscribe to decoded incoming envelopes.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.incoming.subscribe()
    }

    /// Whether this session had to self-host a relay to connect.
    pub fn is_self_hosted(&self) -> bool {
        self.inner.hosted.lock().is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Close the connection, suppress any future reconnect, and tear down
    /// the embedded relay when this session owns one.
    pub async fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(());

        let hosted = self.inner.hosted.lock().take();
        if let Some(server) = hosted {
            server.destroy().await;
        }
        info!("session destroyed");
    }
}

/// Driver task: pump the socket until it drops, then reconnect with the
/// same url/options for as long as the owner has not destroyed the session.
async fn drive(
    inner: Arc<SessionInner>,
    options: ConnectOptions,
    mut ws: WsStream,
    mut out_rx: mpsc::Receiver<Message>,
) {
    loop {
        run_socket(&inner, &mut ws, &mut out_rx).await;

        if inner.destroyed.load(Ordering::SeqCst) {
            break;
        }
        if !options.reconnect_on_close {
            debug!("connection closed, reconnect disabled");
            break;
        }

        debug!(url = %inner.url, "connection dropped, reconnecting");
        match establish(&inner.url, &options).await {
            Ok((new_ws, hosted)) => {
                // The owner may have destroyed the session while we were
                // reconnecting; tear down anything we just brought up.
                if inner.destroyed.load(Ordering::SeqCst) {
                    if let Some(server) = hosted {
                        server.destroy().await;
                    }
                    break;
                }
                if let Some(server) = hosted {
                    let old = {
                        let mut slot = inner.hosted.lock();
                        slot.replace(server)
                    };
                    if let Some(old) = old {
                        old.destroy().await;
                    }
                }
                ws = new_ws;
                info!(url = %inner.url, "session reconnected");
            }
            Err(e) => {
                error!(url = %inner.url, error = %e, "reconnect failed, giving up");
                break;
            }
        }
    }
}

/// Pump one socket until it closes or the session is shut down.
async fn run_socket(
    inner: &SessionInner,
    ws: &mut WsStream,
    out_rx: &mut mpsc::Receiver<Message>,
) {
    let mut shutdown_rx = inner.shutdown.subscribe();
    if inner.destroyed.load(Ordering::SeqCst) {
        let _ = ws.close(None).await;
        return;
    }
    loop {
        tokio::select! {
            queued = out_rx.recv() => {
                match queued {
                    Some(msg) => {
                        if let Err(e) = ws.send(msg).await {
                            warn!(error = %e, "send failed, connection lost");
                            return;
                        }
                    }
                    None => return,
                }
            }
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.to_string();
                        match Envelope::decode(&text) {
                            Ok(env) => {
                                let _ = inner.incoming.send(env);
                            }
                            Err(e) => warn!(error = %e, "dropping malformed frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "socket error");
                        return;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = ws.close(None).await;
                return;
            }
        }
    }
}
