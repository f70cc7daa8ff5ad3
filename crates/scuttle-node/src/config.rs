//! Node configuration loaded from environment variables.
//!
//! Every setting has a default so the node can start with zero
//! configuration. Invalid values are logged and replaced by the default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use scuttle_net::discovery::MultiserverAddress;
use scuttle_net::{PeerManagerConfig, PreferredPub};
use scuttle_shared::constants::{DEFAULT_HOPS, DEFAULT_LISTEN_ADDRESS, DEFAULT_MAX_BLOB_SIZE};
use scuttle_shared::{MessageHmac, NetworkKey, PublicIdentity};
use scuttle_store::{Database, Hops};

use crate::buffer::BufferConfig;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root of the database, the blob files and the secret file.
    /// Env: `DATA_DIRECTORY`
    /// Default: platform data directory, or `./scuttle-data`
    pub data_directory: PathBuf,

    /// TCP address to accept peers on. An empty host means every interface.
    /// Env: `LISTEN_ADDRESS`
    /// Default: `:8008`
    pub listen_address: String,

    /// Env: `NETWORK_KEY` (hex or base64)
    /// Default: the main Scuttlebutt network
    pub network_key: NetworkKey,

    /// Env: `MESSAGE_HMAC` (hex or base64)
    /// Default: none
    pub message_hmac: MessageHmac,

    /// Env: `PREFERRED_PUBS`, `MAX_INBOUND_PEERS`, `MAX_OUTBOUND_PEERS`
    pub peer_manager: PeerManagerConfig,

    /// How far into the follow graph feeds are replicated.
    /// Env: `HOPS`
    /// Default: `2`
    pub hops: Hops,

    /// Env: `PERSIST_THRESHOLD`, `PERSIST_EVERY_SECS`,
    /// `LEAVE_UNPERSISTED_FOR_SECS`
    pub buffer: BufferConfig,

    /// Largest blob accepted from peers or the application.
    /// Env: `BLOB_MAX_SIZE`
    /// Default: 5 MiB
    pub blob_max_size: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_directory: Database::default_data_dir()
                .unwrap_or_else(|_| PathBuf::from("./scuttle-data")),
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            network_key: NetworkKey::default(),
            message_hmac: MessageHmac::none(),
            peer_manager: PeerManagerConfig::default(),
            hops: DEFAULT_HOPS,
            buffer: BufferConfig::default(),
            blob_max_size: DEFAULT_MAX_BLOB_SIZE,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("DATA_DIRECTORY") {
            config.data_directory = PathBuf::from(dir);
        }

        if let Some(addr) = lookup("LISTEN_ADDRESS") {
            config.listen_address = addr;
        }

        if let Some(key) = lookup("NETWORK_KEY") {
            match NetworkKey::parse(&key) {
                Some(key) => config.network_key = key,
                None => tracing::warn!("Invalid NETWORK_KEY, using the main network key"),
            }
        }

        if let Some(key) = lookup("MESSAGE_HMAC") {
            match MessageHmac::parse(&key) {
                Some(hmac) => config.message_hmac = hmac,
                None => tracing::warn!("Invalid MESSAGE_HMAC, signing without HMAC"),
            }
        }

        if let Some(pubs) = lookup("PREFERRED_PUBS") {
            config.peer_manager.preferred_pubs = parse_preferred_pubs(&pubs);
        }

        parse_var(&lookup, "MAX_INBOUND_PEERS", &mut config.peer_manager.max_inbound);
        parse_var(&lookup, "MAX_OUTBOUND_PEERS", &mut config.peer_manager.max_outbound);
        parse_var(&lookup, "HOPS", &mut config.hops);
        parse_var(&lookup, "PERSIST_THRESHOLD", &mut config.buffer.persist_threshold);
        parse_var(&lookup, "BLOB_MAX_SIZE", &mut config.blob_max_size);

        let mut secs = config.buffer.persist_every.as_secs();
        if parse_var(&lookup, "PERSIST_EVERY_SECS", &mut secs) {
            config.buffer.persist_every = Duration::from_secs(secs.max(1));
        }
        let mut secs = config.buffer.leave_unpersisted_for.as_secs();
        if parse_var(&lookup, "LEAVE_UNPERSISTED_FOR_SECS", &mut secs) {
            config.buffer.leave_unpersisted_for = Duration::from_secs(secs);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn secret_path(&self) -> PathBuf {
        self.data_directory.join("secret")
    }

    pub fn blobs_path(&self) -> PathBuf {
        self.data_directory.join("blobs")
    }
}

/// Overwrite `target` with the parsed value of `name`. Returns whether it
/// did.
fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) -> bool {
    let Some(value) = lookup(name) else {
        return false;
    };
    match value.trim().parse() {
        Ok(parsed) => {
            *target = parsed;
            true
        }
        Err(_) => {
            tracing::warn!(var = name, value = %value, "Invalid value, using default");
            false
        }
    }
}

/// Comma-separated `@key.ed25519=host:port` entries or multiserver
/// addresses. Invalid entries are skipped.
fn parse_preferred_pubs(value: &str) -> Vec<PreferredPub> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match parse_preferred_pub(entry) {
            Some(pub_) => Some(pub_),
            None => {
                tracing::warn!(entry = %entry, "Invalid PREFERRED_PUBS entry, skipping");
                None
            }
        })
        .collect()
}

fn parse_preferred_pub(entry: &str) -> Option<PreferredPub> {
    if entry.starts_with("net:") {
        let address: MultiserverAddress = entry.parse().ok()?;
        return Some(PreferredPub {
            identity: address.key,
            address: address.host_port(),
        });
    }
    let (key, address) = entry.split_once('=')?;
    let identity: PublicIdentity = key.trim().parse().ok()?;
    let address = address.trim();
    if address.is_empty() {
        return None;
    }
    Some(PreferredPub {
        identity,
        address: address.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use scuttle_shared::Identity;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::from_lookup(lookup(&[]));
        assert_eq!(config.listen_address, ":8008");
        assert_eq!(config.hops, 2);
        assert_eq!(config.peer_manager.max_inbound, 20);
        assert_eq!(config.peer_manager.max_outbound, 10);
        assert_eq!(config.buffer.persist_threshold, 1000);
        assert_eq!(config.blob_max_size, 5 * 1024 * 1024);
        assert!(config.message_hmac.is_empty());
    }

    #[test]
    fn test_overrides() {
        let pub_id = Identity::generate().public();
        let pubs = format!("{pub_id}=pub.example.org:8008, bogus");
        let config = NodeConfig::from_lookup(lookup(&[
            ("DATA_DIRECTORY", "/tmp/node"),
            ("LISTEN_ADDRESS", "127.0.0.1:9000"),
            ("HOPS", "3"),
            ("MAX_OUTBOUND_PEERS", "4"),
            ("PERSIST_EVERY_SECS", "2"),
            ("MESSAGE_HMAC", &"ab".repeat(32)),
            ("PREFERRED_PUBS", &pubs),
        ]));

        assert_eq!(config.data_directory, PathBuf::from("/tmp/node"));
        assert_eq!(config.secret_path(), PathBuf::from("/tmp/node/secret"));
        assert_eq!(config.listen_address, "127.0.0.1:9000");
        assert_eq!(config.hops, 3);
        assert_eq!(config.peer_manager.max_outbound, 4);
        assert_eq!(config.buffer.persist_every, Duration::from_secs(2));
        assert!(!config.message_hmac.is_empty());
        assert_eq!(
            config.peer_manager.preferred_pubs,
            vec![PreferredPub {
                identity: pub_id,
                address: "pub.example.org:8008".to_string(),
            }]
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("HOPS", "-1"),
            ("NETWORK_KEY", "not a key"),
            ("MAX_INBOUND_PEERS", "many"),
        ]));
        assert_eq!(config.hops, 2);
        assert_eq!(config.peer_manager.max_inbound, 20);
        assert_eq!(config.network_key.as_bytes(), NetworkKey::default().as_bytes());
    }
}
