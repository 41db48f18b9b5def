//! Query router
//!
//! Picks the session machine from the query name's suffix and splits the
//! remaining labels.

use crate::backend::ConnectionRegistry;
use crate::config::{normalize_domain, BridgeConfig};
use crate::dns::DnsQuery;
use crate::input::InputSessions;
use crate::output::OutputSessions;
use crate::BridgeError;
use std::sync::Arc;

/// Where a query name points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    Input(Vec<&'a str>),
    Output(Vec<&'a str>),
    Unrouted,
}

pub struct Router {
    input_domain: String,
    output_domain: String,
    registry: Arc<ConnectionRegistry>,
    input: InputSessions,
    output: OutputSessions,
}

impl Router {
    pub fn new(
        input_domain: &str,
        output_domain: &str,
        registry: Arc<ConnectionRegistry>,
        input: InputSessions,
        output: OutputSessions,
    ) -> Self {
        Self {
            input_domain: normalize_domain(input_domain),
            output_domain: normalize_domain(output_domain),
            registry,
            input,
            output,
        }
    }

    /// Wire the whole pipeline from a validated configuration
    pub fn from_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let transform = config.transform.build()?;
        log::info!("Outbound frame transform: {}", transform.name());

        let registry = Arc::new(
            ConnectionRegistry::new(
                config.backend.addr,
                config.backend.connect_timeout,
                transform,
            )
            .with_send_timeout(config.backend.send_timeout),
        );
        let store = config.store.open()?;
        let input = InputSessions::new(store, registry.clone());
        let output = OutputSessions::new(registry.clone(), config.backend.recv_timeout)
            .with_chunking(config.output.chunk_size, config.output.max_records);

        Ok(Self::new(
            &config.domains.input,
            &config.domains.output,
            registry,
            input,
            output,
        ))
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Classify a query name. The output domain is checked first; matching
    /// ignores ASCII case.
    pub fn classify<'a>(&self, name: &'a str) -> Route<'a> {
        let name = name.trim_end_matches('.');
        if let Some(prefix) = strip_domain(name, &self.output_domain) {
            Route::Output(split_labels(prefix))
        } else if let Some(prefix) = strip_domain(name, &self.input_domain) {
            Route::Input(split_labels(prefix))
        } else {
            Route::Unrouted
        }
    }

    /// TXT answers for one query
    pub async fn answer(&self, query: &DnsQuery) -> Vec<String> {
        match self.classify(&query.name) {
            Route::Output(labels) => self.output.handle(&labels).await,
            Route::Input(labels) => self.input.handle(&labels).await,
            Route::Unrouted => {
                log::debug!("Query '{}' is outside both tunnel domains", query.name);
                Vec::new()
            }
        }
    }
}

/// Labels in front of `.domain`, or `""` for the bare domain
fn strip_domain<'a>(name: &'a str, domain: &str) -> Option<&'a str> {
    if name.eq_ignore_ascii_case(domain) {
        return Some("");
    }

    let split = name.len().checked_sub(domain.len() + 1)?;
    if !name.is_char_boundary(split) || !name.is_char_boundary(split + 1) {
        return None;
    }
    let (prefix, rest) = name.split_at(split);
    let suffix = rest.strip_prefix('.')?;
    suffix.eq_ignore_ascii_case(domain).then_some(prefix)
}

fn split_labels(prefix: &str) -> Vec<&str> {
    if prefix.is_empty() {
        Vec::new()
    } else {
        prefix.split('.').collect()
    }
}
