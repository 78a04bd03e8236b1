pub mod relay;

pub use relay::{RelayServer, Role};

use std::sync::Arc;

use anyhow::Result;

/// Start a standalone relay on the given port and return a handle to it.
pub async fn start(port: u16) -> Result<Arc<RelayServer>> {
    let server = Arc::new(RelayServer::new(port));
    server.start().await?;
    Ok(server)
}
