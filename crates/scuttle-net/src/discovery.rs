//! Multiserver addresses and local discovery beacons.
//!
//! Peers on the same network broadcast beacons such as
//! `net:192.168.1.7:8008~shs:<base64 key>`; several addresses may be
//! joined with `;`. Only the text format is handled here, the UDP socket
//! lives with whoever embeds the node.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, warn};

use scuttle_shared::PublicIdentity;

use crate::error::NetError;

/// `net:<host>:<port>~shs:<base64 key>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiserverAddress {
    pub host: String,
    pub port: u16,
    pub key: PublicIdentity,
}

impl MultiserverAddress {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for MultiserverAddress {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetError::InvalidAddress(s.to_string());
        let (net, shs) = s.trim().split_once('~').ok_or_else(invalid)?;
        let host_port = net.strip_prefix("net:").ok_or_else(invalid)?;
        let (host, port) = host_port.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse().map_err(|_| invalid())?;

        let key = shs.strip_prefix("shs:").ok_or_else(invalid)?;
        // Invites append the seed as a further `:`-separated field.
        let key = key.split(':').next().unwrap_or(key);
        let bytes = STANDARD.decode(key).map_err(|_| invalid())?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
        let key = PublicIdentity::from_bytes(bytes).map_err(|_| invalid())?;

        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            host: host.to_string(),
            port,
            key,
        })
    }
}

impl fmt::Display for MultiserverAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "net:{}:{}~shs:{}",
            self.host,
            self.port,
            STANDARD.encode(self.key.as_bytes())
        )
    }
}

/// Every valid address of a beacon; malformed parts are skipped.
pub fn parse_beacon(beacon: &str) -> Vec<MultiserverAddress> {
    beacon
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| match part.parse() {
            Ok(address) => Some(address),
            Err(e) => {
                warn!(part = %part, error = %e, "skipping beacon address");
                None
            }
        })
        .collect()
}

/// Remembers recently discovered peers so repeated beacons are ignored.
#[derive(Debug)]
pub struct DiscoveryCache {
    debounce: Duration,
    expiry: Duration,
    seen: HashMap<PublicIdentity, (String, Instant)>,
}

impl DiscoveryCache {
    pub fn new(debounce: Duration, expiry: Duration) -> Self {
        Self {
            debounce,
            expiry,
            seen: HashMap::new(),
        }
    }

    /// Record a sighting at `now`. True when the caller should act on it:
    /// the peer is new, changed address or was last acted on more than the
    /// debounce interval ago.
    pub fn observe(&mut self, identity: PublicIdentity, address: &str, now: Instant) -> bool {
        match self.seen.get(&identity) {
            Some((known, at)) if known == address && now.duration_since(*at) < self.debounce => {
                debug!(peer = %identity, "discovery debounced");
                false
            }
            _ => {
                self.seen.insert(identity, (address.to_string(), now));
                true
            }
        }
    }

    /// Addresses seen within the expiry window.
    pub fn active(&mut self, now: Instant) -> Vec<(PublicIdentity, String)> {
        let expiry = self.expiry;
        self.seen
            .retain(|_, (_, at)| now.duration_since(*at) < expiry);
        let mut active: Vec<_> = self
            .seen
            .iter()
            .map(|(identity, (address, _))| (*identity, address.clone()))
            .collect();
        active.sort();
        active
    }
}
