//! dnsbridge configuration

use crate::store::{ChunkStore, MemoryChunkStore, SqliteChunkStore};
use crate::transform::{AesCbc, CbcPadding, Passthrough, SharedTransform};
use crate::BridgeError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Example key material; replace it for anything but local testing
const EXAMPLE_AES_KEY: &str = "hRUuLu7B61rgSWd/kQEGFjK7367/9gn+Mucl6eHCnHw=";
const EXAMPLE_AES_IV: &str = "LpriMy1kPv1G1HYkO0kmHQ==";

/// Main dnsbridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// UDP address of the DNS responder
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Reserved suffix domains
    #[serde(default)]
    pub domains: DomainConfig,

    /// Backend service the agents are bridged to
    #[serde(default)]
    pub backend: BackendConfig,

    /// Inbound fragment persistence
    #[serde(default)]
    pub store: StoreConfig,

    /// Outbound chunking
    #[serde(default)]
    pub output: OutputConfig,

    /// Transform applied to frames read from the backend
    #[serde(default)]
    pub transform: TransformConfig,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            domains: DomainConfig::default(),
            backend: BackendConfig::default(),
            store: StoreConfig::default(),
            output: OutputConfig::default(),
            transform: TransformConfig::default(),
        }
    }
}

/// The two suffix domains that select the transfer direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Agent → backend
    #[serde(default = "default_input_domain")]
    pub input: String,

    /// Backend → agent
    #[serde(default = "default_output_domain")]
    pub output: String,
}

fn default_input_domain() -> String {
    "send.example.org".to_string()
}

fn default_output_domain() -> String {
    "receive.example.org".to_string()
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            input: default_input_domain(),
            output: default_output_domain(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Address of the framed TCP service
    #[serde(default = "default_backend_addr")]
    pub addr: SocketAddr,

    /// How long an output poll waits for a frame
    #[serde(default = "default_recv_timeout", with = "humantime_serde")]
    pub recv_timeout: Duration,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long a frame write may block before the connection is dropped
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,
}

fn default_backend_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 2222))
}

fn default_recv_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_send_timeout() -> Duration {
    crate::backend::DEFAULT_SEND_TIMEOUT
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            addr: default_backend_addr(),
            recv_timeout: default_recv_timeout(),
            connect_timeout: default_connect_timeout(),
            send_timeout: default_send_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_kind")]
    pub kind: StoreKind,

    /// SQLite database file (sqlite kind only)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_kind() -> StoreKind {
    StoreKind::Sqlite
}

fn default_store_path() -> PathBuf {
    PathBuf::from("dns.sqlite")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// Open the configured store
    pub fn open(&self) -> Result<Box<dyn ChunkStore>, BridgeError> {
        Ok(match self.kind {
            StoreKind::Sqlite => Box::new(SqliteChunkStore::open(&self.path)?),
            StoreKind::Memory => Box::new(MemoryChunkStore::new()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Characters per TXT answer (1..=255)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// TXT answers returned per fetch query
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_chunk_size() -> usize {
    crate::fragment::DEFAULT_CHUNK_LEN
}

fn default_max_records() -> usize {
    1
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_records: default_max_records(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformKind {
    None,
    AesCbc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_transform_kind")]
    pub kind: TransformKind,

    /// Base64 AES-256 key
    #[serde(default = "default_aes_key")]
    pub key: String,

    /// Base64 16-byte IV
    #[serde(default = "default_aes_iv")]
    pub iv: String,

    #[serde(default)]
    pub padding: CbcPadding,
}

fn default_transform_kind() -> TransformKind {
    TransformKind::AesCbc
}

fn default_aes_key() -> String {
    EXAMPLE_AES_KEY.to_string()
}

fn default_aes_iv() -> String {
    EXAMPLE_AES_IV.to_string()
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            kind: default_transform_kind(),
            key: default_aes_key(),
            iv: default_aes_iv(),
            padding: CbcPadding::None,
        }
    }
}

impl TransformConfig {
    /// Instantiate the configured transform
    pub fn build(&self) -> Result<SharedTransform, BridgeError> {
        match self.kind {
            TransformKind::None => Ok(Arc::new(Passthrough)),
            TransformKind::AesCbc => {
                if self.key == EXAMPLE_AES_KEY {
                    log::warn!("Using the example AES key; outbound frames are not confidential");
                }
                Ok(Arc::new(AesCbc::from_base64(&self.key, &self.iv, self.padding)?))
            }
        }
    }
}

impl BridgeConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), BridgeError> {
        let input = normalize_domain(&self.domains.input);
        let output = normalize_domain(&self.domains.output);

        for (which, domain) in [("input", &input), ("output", &output)] {
            if !is_valid_domain(domain) {
                return Err(BridgeError::InvalidConfig(format!(
                    "{} domain '{}' is not a valid DNS name",
                    which, domain
                )));
            }
        }

        if input == output
            || input.ends_with(&format!(".{}", output))
            || output.ends_with(&format!(".{}", input))
        {
            return Err(BridgeError::InvalidConfig(format!(
                "input domain '{}' and output domain '{}' must not overlap",
                input, output
            )));
        }

        if self.output.chunk_size == 0 || self.output.chunk_size > crate::dns::MAX_TXT_LEN {
            return Err(BridgeError::InvalidConfig(format!(
                "output chunk_size must be between 1 and {}",
                crate::dns::MAX_TXT_LEN
            )));
        }

        if self.output.max_records == 0 {
            return Err(BridgeError::InvalidConfig(
                "output max_records must be at least 1".to_string(),
            ));
        }

        if self.backend.recv_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "backend recv_timeout must be non-zero".to_string(),
            ));
        }

        if self.backend.send_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "backend send_timeout must be non-zero".to_string(),
            ));
        }

        if self.store.kind == StoreKind::Sqlite && self.store.path.as_os_str().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "sqlite store requires a path".to_string(),
            ));
        }

        self.transform.build()?;
        Ok(())
    }
}

/// Lowercase and strip the trailing root dot
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        })
}
