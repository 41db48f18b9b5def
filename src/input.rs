//! Input session machine (agent → backend)
//!
//! The agent announces a transfer, then sends its base32 payload as
//! numbered fragments. Once every position of a session is present the
//! fragments are joined in position order, decoded and forwarded to the
//! backend as a single frame.
//!
//! Every query is acknowledged with `ACK`; retrying lost queries is up to
//! the agent.

use crate::backend::ConnectionRegistry;
use crate::fragment::decode_base32_fixed;
use crate::store::{ChunkStore, StoreError};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const ACK: &str = "ACK";

pub struct InputSessions {
    // Guards persist → check → claim; never held across backend I/O
    store: Mutex<Box<dyn ChunkStore>>,
    registry: Arc<ConnectionRegistry>,
}

/// A complete session removed from the store, ready to forward
struct ClaimedSession {
    session_id: String,
    handle: String,
    assembled: String,
}

impl InputSessions {
    pub fn new(store: Box<dyn ChunkStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            store: Mutex::new(store),
            registry,
        }
    }

    /// Handle one input-domain query, `labels` being the name with the
    /// suffix stripped. Always answers a single `ACK`.
    pub async fn handle(&self, labels: &[&str]) -> Vec<String> {
        match labels {
            [handle] => self.open_handle(handle).await,
            [handle, expected, session] => match expected.parse::<u32>() {
                Ok(expected) => self.begin(handle, expected, session).await,
                Err(_) => log::warn!(
                    "Ignoring announcement for session '{}' with bad count '{}'",
                    session,
                    expected
                ),
            },
            [handle, position, session, first, rest @ ..] => match position.parse::<u32>() {
                Ok(position) => {
                    let mut data = String::with_capacity(first.len() * (rest.len() + 1));
                    data.push_str(first);
                    for label in rest {
                        data.push_str(label);
                    }
                    self.receive_fragment(handle, position, session, &data).await
                }
                Err(_) => log::warn!(
                    "Ignoring fragment for session '{}' with bad position '{}'",
                    session,
                    position
                ),
            },
            _ => log::debug!("Ignoring input query with {} labels", labels.len()),
        }

        vec![ACK.to_string()]
    }

    /// Make sure `handle` has a backend connection
    pub async fn open_handle(&self, handle: &str) {
        if let Err(e) = self.registry.open(handle).await {
            log::warn!("Backend unavailable for handle '{}': {}", handle, e);
        }
    }

    /// Record a new session announcement
    pub async fn begin(&self, handle: &str, expected: u32, session_id: &str) {
        let claimed = {
            let mut store = self.store.lock().await;
            try_begin(&mut **store, handle, expected, session_id)
        };

        match claimed {
            Ok(Some(session)) => self.deliver(session).await,
            Ok(None) => {}
            Err(e) => log::error!("Failed to begin session '{}': {}", session_id, e),
        }
    }

    /// Persist one fragment and forward the session if it is now complete
    pub async fn receive_fragment(&self, handle: &str, position: u32, session_id: &str, data: &str) {
        let claimed = {
            let mut store = self.store.lock().await;
            try_receive(&mut **store, handle, position, session_id, data)
        };

        match claimed {
            Ok(Some(session)) => self.deliver(session).await,
            Ok(None) => {}
            Err(e) => log::error!(
                "Failed to store fragment {} of session '{}': {}",
                position,
                session_id,
                e
            ),
        }
    }

    /// Decode a claimed session and forward it to its handle's connection
    async fn deliver(&self, session: ClaimedSession) {
        let payload = decode_base32_fixed(&session.assembled).unwrap_or_else(|e| {
            log::warn!("Session '{}' did not decode: {}", session.session_id, e);
            Vec::new()
        });

        let Some(connection) = self.registry.get(&session.handle).await else {
            log::warn!(
                "No backend connection for handle '{}'; dropped {} bytes",
                session.handle,
                payload.len()
            );
            return;
        };

        match connection.send_frame(&payload).await {
            Ok(()) => log::info!(
                "Session '{}' complete: {} bytes for handle '{}'",
                session.session_id,
                payload.len(),
                session.handle
            ),
            Err(e) => log::warn!(
                "Dropped {} bytes for handle '{}': {}",
                payload.len(),
                session.handle,
                e
            ),
        }
    }
}

fn try_begin(
    store: &mut dyn ChunkStore,
    handle: &str,
    expected: u32,
    session_id: &str,
) -> Result<Option<ClaimedSession>, StoreError> {
    store.begin_input_session(session_id, handle, expected)?;
    log::info!(
        "Created session '{}' length '{}' handle '{}'",
        session_id,
        expected,
        handle
    );
    // Fragments may have overtaken the announcement
    claim_if_complete(store, session_id)
}

fn try_receive(
    store: &mut dyn ChunkStore,
    handle: &str,
    position: u32,
    session_id: &str,
    data: &str,
) -> Result<Option<ClaimedSession>, StoreError> {
    store.put_fragment(session_id, position, data)?;
    log::debug!(
        "Chunk received for session '{}' pos '{}' from handle '{}'",
        session_id,
        position,
        handle
    );
    claim_if_complete(store, session_id)
}

/// Take a session out of the store once all its positions are present.
///
/// Deleting under the caller's lock makes exactly one caller the owner.
fn claim_if_complete(
    store: &mut dyn ChunkStore,
    session_id: &str,
) -> Result<Option<ClaimedSession>, StoreError> {
    let Some(session) = store.session(session_id)? else {
        return Ok(None);
    };

    let found = store.count_distinct_positions(session_id)?;
    log::debug!(
        "We have {} of {} for session '{}'",
        found,
        session.expected_fragments,
        session_id
    );
    if found == 0 || found != session.expected_fragments {
        return Ok(None);
    }

    let assembled = store.assemble_ordered(session_id)?.concat();
    store.delete_session(session_id)?;

    Ok(Some(ClaimedSession {
        session_id: session.session_id,
        handle: session.handle,
        assembled,
    }))
}
