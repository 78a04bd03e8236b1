//! Client connector.
//!
//! Establishes a session with a relay server. When nothing is listening on
//! the target port the connector self-hosts a relay and retries, so a
//! single machine can run an editor and a patcher without an external
//! always-on server. The refused-connection retry count is bounded and
//! scoped to one logical attempt chain; reconnects after an unexpected
//! close are not bounded.

use std::io;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{classify, ErrorClass};
use crate::server::RelayServer;
use crate::sync::session::Session;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector options.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Re-establish the session when the connection drops unexpectedly.
    pub reconnect_on_close: bool,
    /// Bound on refused-connection retries within one attempt chain.
    pub max_retries: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            reconnect_on_close: true,
            max_retries: 5,
        }
    }
}

/// Obtain a working session to the relay at `url`, self-hosting one when
/// none is reachable. Resolves exactly once per logical attempt chain:
/// either with an established session or with a terminal error.
pub async fn connect(url: &str, options: ConnectOptions) -> Result<Session> {
    let (ws, hosted) = establish(url, &options).await?;
    Ok(Session::spawn(url.to_string(), options, ws, hosted))
}

/// One logical connection attempt chain with its own failure counter.
pub(crate) async fn establish(
    url: &str,
    options: &ConnectOptions,
) -> Result<(WsStream, Option<Arc<RelayServer>>)> {
    let mut refused = 0u32;
    let mut hosted: Option<Arc<RelayServer>> = None;

    loop {
        match connect_async(url).await {
            Ok((ws, _response)) => {
                info!(%url, "connection opened");
                return Ok((ws, hosted));
            }
            Err(err) => match classify(&err) {
                ErrorClass::ConnectionRefused => {
                    refused += 1;
                    if refused >= options.max_retries {
                        return Err(anyhow!(err).context(format!(
                            "no relay reachable at {url} after {refused} refused attempts"
                        )));
                    }

                    let port = relay_port(url)?;
                    warn!(port, "connection refused, starting local relay");
                    if let Some(old) = hosted.take() {
                        old.destroy().await;
                    }
                    let server = Arc::new(RelayServer::new(port));
                    match server.start().await {
                        Ok(_) => hosted = Some(server),
                        Err(e) if is_addr_in_use(&e) => {
                            // Another local process won the port between our
                            // refused connect and the bind; it should accept
                            // us on the next pass.
                            debug!(port, "port already taken, retrying connect");
                        }
                        Err(e) => return Err(e.context("failed to self-host relay")),
                    }
                }
                ErrorClass::Transport => {
                    return Err(anyhow!(err).context(format!("connection to {url} failed")));
                }
            },
        }
    }
}

/// Port to bind a fallback relay on, parsed from the target url.
fn relay_port(url: &str) -> Result<u16> {
    let parsed = Url::parse(url).with_context(|| format!("invalid relay url: {url}"))?;
    parsed
        .port()
        .with_context(|| format!("relay url must carry an explicit port: {url}"))
}

fn is_addr_in_use(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::AddrInUse)
    })
}
