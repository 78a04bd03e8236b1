//! Diff request scheduling.
//!
//! Patchers are expensive: every `calculate-diff` request triggers a full
//! stylesheet diff on the other side of the wire. The scheduler serializes
//! those requests per process: one in flight at a time, the rest queued,
//! with a wait timeout so a crashed or silent patcher never wedges the
//! queue.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::protocol::{names, Envelope};
use crate::sync::Session;

/// How long a sent `calculate-diff` may wait for its reply before the lock
/// is considered abandoned.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outgoing payload for a `calculate-diff` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffPayload {
    pub uri: String,
    pub syntax: String,
    pub content: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_dependencies: Option<Vec<String>>,
}

impl DiffPayload {
    pub fn new(
        uri: impl Into<String>,
        syntax: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let hash = content_hash(&content);
        Self {
            uri: uri.into(),
            syntax: syntax.into(),
            content,
            hash,
            global_dependencies: None,
        }
    }

    pub fn with_global_dependencies(mut self, deps: Vec<String>) -> Self {
        self.global_dependencies = Some(deps);
        self
    }
}

/// Content fingerprint carried with diff payloads so replies can be
/// matched against the buffer state they were computed for.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Editor-integration seam: resolves a URI to the payload for an outgoing
/// diff request, or `None` when no live view remains for it.
pub trait DocumentSource: Send + Sync + 'static {
    fn payload(&self, uri: &str) -> Option<DiffPayload>;
}

struct LockState {
    locked_by: Option<String>,
    locked_at: Instant,
    pending: VecDeque<String>,
}

/// Serializes `calculate-diff` requests over one session.
pub struct DiffScheduler {
    session: Session,
    documents: Arc<dyn DocumentSource>,
    state: Mutex<LockState>,
    wait_timeout: Duration,
}

impl DiffScheduler {
    /// Create a scheduler bound to `session` and start listening for
    /// `diff`/`error` replies.
    pub fn spawn(session: Session, documents: Arc<dyn DocumentSource>) -> Arc<Self> {
        Self::spawn_with_timeout(session, documents, WAIT_TIMEOUT)
    }

    /// Same as [`DiffScheduler::spawn`] with a custom wait timeout.
    pub fn spawn_with_timeout(
        session: Session,
        documents: Arc<dyn DocumentSource>,
        wait_timeout: Duration,
    ) -> Arc<Self> {
        let replies = session.subscribe();
        let scheduler = Arc::new(Self {
            session,
            documents,
            state: Mutex::new(LockState {
                locked_by: None,
                locked_at: Instant::now(),
                pending: VecDeque::new(),
            }),
            wait_timeout,
        });

        tokio::spawn(listen(Arc::downgrade(&scheduler), replies));
        scheduler
    }

    /// Note that the resource at `uri` changed and needs a diff. Repeated
    /// requests for a queued uri are coalesced; a request for the uri
    /// currently in flight waits for that result instead of pre-empting it.
    pub fn request(&self, uri: &str) {
        {
            let mut state = self.state.lock();
            if !state.pending.iter().any(|queued| queued == uri) {
                debug!(uri, "pending diff request");
                state.pending.push_back(uri.to_string());
            }
        }
        self.next_queued();
    }

    /// Number of queued (not in-flight) requests.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Release the lock if it is held for `uri`, then advance the queue.
    fn release_if(&self, uri: &str) {
        {
            let mut state = self.state.lock();
            if state.locked_by.as_deref() != Some(uri) {
                return;
            }
            debug!(uri, "releasing diff lock");
            state.locked_by = None;
        }
        self.next_queued();
    }

    /// Dequeue the next uri unless a still-valid lock is held. A lock older
    /// than the wait timeout is abandoned and force-cleared first.
    fn next_queued(&self) {
        let outgoing = {
            let mut state = self.state.lock();

            if state.locked_by.is_some() && state.locked_at.elapsed() > self.wait_timeout {
                debug!("waiting reply is obsolete, resetting lock");
                state.locked_by = None;
            }
            if state.locked_by.is_some() {
                None
            } else {
                let mut outgoing = None;
                while let Some(uri) = state.pending.pop_front() {
                    match self.documents.payload(&uri) {
                        Some(payload) => {
                            state.locked_by = Some(uri);
                            state.locked_at = Instant::now();
                            outgoing = Some(payload);
                            break;
                        }
                        // View already closed, move on to the next entry.
                        None => debug!(uri, "no live document for queued diff"),
                    }
                }
                outgoing
            }
        };

        if let Some(payload) = outgoing {
            let session = self.session.clone();
            tokio::spawn(async move {
                let data = match serde_json::to_value(&payload) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize diff payload");
                        return;
                    }
                };
                debug!(uri = %payload.uri, "sending calculate-diff");
                if let Err(e) = session.send(names::CALCULATE_DIFF, data).await {
                    // The lock self-heals via the wait timeout.
                    warn!(error = %e, "failed to send calculate-diff");
                }
            });
        }
    }

    fn handle_reply(&self, env: &Envelope) {
        match env.name.as_str() {
            names::DIFF => {
                let uri = env
                    .data
                    .as_ref()
                    .and_then(|d| d.get("uri"))
                    .and_then(|v| v.as_str());
                if let Some(uri) = uri {
                    debug!(uri, "got diff reply");
                    self.release_if(uri);
                }
            }
            names::ERROR => {
                let origin = env.data.as_ref().and_then(|d| d.get("origin"));
                let origin_name = origin.and_then(|o| o.get("name")).and_then(|v| v.as_str());
                let origin_uri = origin.and_then(|o| o.get("uri")).and_then(|v| v.as_str());
                if origin_name == Some(names::CALCULATE_DIFF) {
                    if let Some(uri) = origin_uri {
                        debug!(uri, "diff request failed remotely");
                        self.release_if(uri);
                    }
                }
            }
            _ => {}
        }
    }
}

async fn listen(scheduler: Weak<DiffScheduler>, mut replies: broadcast::Receiver<Envelope>) {
    loop {
        match replies.recv().await {
            Ok(env) => {
                let Some(scheduler) = scheduler.upgrade() else {
                    return;
                };
                scheduler.handle_reply(&env);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "scheduler lagged behind session traffic");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_hash_is_stable() {
        let a = DiffPayload::new("file.css", "css", "a { color: red }");
        let b = DiffPayload::new("file.css", "css", "a { color: red }");
        assert_eq!(a.hash, b.hash);
        let c = DiffPayload::new("file.css", "css", "a { color: blue }");
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn payload_serializes_camel_case() {
        let payload = DiffPayload::new("file.scss", "scss", "$x: 1;")
            .with_global_dependencies(vec!["vars.scss".to_string()]);
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("globalDependencies").is_some());
        assert!(value.get("global_dependencies").is_none());
    }

    #[test]
    fn payload_omits_missing_dependencies() {
        let value = serde_json::to_value(DiffPayload::new("f.css", "css", "")).unwrap();
        assert!(value.get("globalDependencies").is_none());
    }
}
