//! Output session machine (backend → agent)
//!
//! A poll reads at most one frame from the handle's backend connection,
//! base64-encodes it and caches it under the agent's session id. The agent
//! then fetches the cached text chunk by chunk; reading the last chunk
//! drops the session.

use crate::backend::{ConnectionRegistry, Received};
use crate::fragment::{chunk, chunk_count, encode_base64, DEFAULT_CHUNK_LEN};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Poll answer when the backend had nothing within the timeout
pub const NO_DATA: &str = "None";

/// Poll answer when the handle has no backend connection
pub const NO_HANDLE: &str = "NH";

/// Fetch answer for a session with nothing (left) to read
pub const EOF_MARKER: &str = "EOFEOFEOFEOF";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    /// A poll is reading a frame for this session
    Priming,
    Ready(String),
}

pub struct OutputSessions {
    registry: Arc<ConnectionRegistry>,
    cache: Mutex<HashMap<String, Slot>>,
    recv_timeout: Duration,
    chunk_size: usize,
    max_records: usize,
}

impl OutputSessions {
    pub fn new(registry: Arc<ConnectionRegistry>, recv_timeout: Duration) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
            recv_timeout,
            chunk_size: DEFAULT_CHUNK_LEN,
            max_records: 1,
        }
    }

    /// Override the TXT chunk length and the answers returned per fetch
    pub fn with_chunking(mut self, chunk_size: usize, max_records: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.max_records = max_records.max(1);
        self
    }

    /// Handle one output-domain query, `labels` being the name with the
    /// suffix stripped
    pub async fn handle(&self, labels: &[&str]) -> Vec<String> {
        match labels {
            [handle, session] => self.poll(handle, session).await,
            [handle, position, session] => match position.parse::<usize>() {
                Ok(position) => self.fetch(handle, position, session).await,
                Err(_) => {
                    log::warn!(
                        "Ignoring fetch for session '{}' with bad position '{}'",
                        session,
                        position
                    );
                    Vec::new()
                }
            },
            _ => {
                log::debug!("Ignoring output query with {} labels", labels.len());
                Vec::new()
            }
        }
    }

    /// Answer the number of chunks waiting for `session_id`, reading a new
    /// frame from the backend if nothing is cached yet
    pub async fn poll(&self, handle: &str, session_id: &str) -> Vec<String> {
        {
            let mut cache = self.cache.lock().await;
            match cache.get(session_id) {
                Some(Slot::Ready(payload)) => {
                    return vec![chunk_count(payload, self.chunk_size).to_string()];
                }
                // A concurrent poll owns this session; the agent polls again
                Some(Slot::Priming) => return vec![NO_DATA.to_string()],
                None => {}
            }
            cache.insert(session_id.to_string(), Slot::Priming);
        }

        let frame = match self.registry.get(handle).await {
            Some(connection) => connection.recv_frame(self.recv_timeout).await,
            None => {
                self.cache.lock().await.remove(session_id);
                log::debug!("Poll for unknown handle '{}'", handle);
                return vec![NO_HANDLE.to_string()];
            }
        };

        let mut cache = self.cache.lock().await;
        match frame {
            Ok(Received::Payload(frame)) => {
                let encoded = encode_base64(&frame);
                let count = chunk_count(&encoded, self.chunk_size);
                log::info!(
                    "Session '{}' primed with {} bytes ({} chunks) from handle '{}'",
                    session_id,
                    frame.len(),
                    count,
                    handle
                );
                cache.insert(session_id.to_string(), Slot::Ready(encoded));
                vec![count.to_string()]
            }
            Ok(Received::Empty) => {
                cache.remove(session_id);
                vec![NO_DATA.to_string()]
            }
            Err(e) => {
                cache.remove(session_id);
                log::debug!("No data for handle '{}': {}", handle, e);
                vec![NO_DATA.to_string()]
            }
        }
    }

    /// Return up to `max_records` chunks starting at `position`.
    ///
    /// The session is dropped once the read reaches its last chunk.
    pub async fn fetch(&self, handle: &str, position: usize, session_id: &str) -> Vec<String> {
        let mut cache = self.cache.lock().await;

        let payload = match cache.get(session_id) {
            Some(Slot::Ready(payload)) => payload.as_str(),
            _ => "",
        };
        let chunks = chunk(payload, self.chunk_size);
        let total = chunks.len();
        let answers: Vec<String> = chunks
            .into_iter()
            .skip(position)
            .take(self.max_records)
            .map(str::to_string)
            .collect();

        if total == 0 {
            log::debug!(
                "Fetch for empty session '{}' from handle '{}'",
                session_id,
                handle
            );
            return vec![EOF_MARKER.to_string()];
        }

        if position.saturating_add(answers.len()) >= total {
            cache.remove(session_id);
            log::debug!("Session '{}' fully read", session_id);
        }

        answers
    }

    /// Number of sessions currently cached or being primed
    pub async fn pending(&self) -> usize {
        self.cache.lock().await.len()
    }
}
