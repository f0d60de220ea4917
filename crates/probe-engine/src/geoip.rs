//! Best-effort IP to ASN lookups.
//!
//! Archival code annotates DNS answers with the autonomous system that
//! announces each address. Lookups may fail; callers degrade to ASN `0`
//! with an empty organisation name.
//!
//! [`AsnTable`] is a prefix table loaded from a YAML file:
//!
//! ```yaml
//! - network: 8.8.8.0/24
//!   asn: 15169
//!   org: Google LLC
//! - network: 2001:4860::/32
//!   asn: 15169
//!   org: Google LLC
//! ```

use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::netx::bogon::{v4_in, v6_in};

/// Autonomous system announcing an address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsnInfo {
    pub number: u32,
    pub organization: String,
}

#[derive(Debug, Error)]
pub enum GeoIpError {
    #[error("no ASN database configured")]
    NoDatabase,

    #[error("invalid IP address: {0}")]
    InvalidIp(String),

    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    #[error("no ASN found for {0}")]
    NotFound(String),

    #[error("cannot read ASN database: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse ASN database: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Maps an IP address to the announcing autonomous system.
pub trait AsnLookup: Send + Sync {
    fn lookup_asn(&self, ip: &str) -> Result<AsnInfo, GeoIpError>;
}

/// Lookup used when no database is available. Always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAsnDatabase;

impl AsnLookup for NoAsnDatabase {
    fn lookup_asn(&self, _ip: &str) -> Result<AsnInfo, GeoIpError> {
        Err(GeoIpError::NoDatabase)
    }
}

#[derive(Debug, Deserialize)]
struct TableEntry {
    network: String,
    asn: u32,
    #[serde(default)]
    org: String,
}

#[derive(Debug, Clone)]
struct Prefix {
    network: IpAddr,
    len: u8,
    info: AsnInfo,
}

impl Prefix {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => v4_in(ip, net, self.len),
            (IpAddr::V6(net), IpAddr::V6(ip)) => v6_in(ip, net, self.len),
            _ => false,
        }
    }
}

/// In-memory longest-prefix ASN table.
#[derive(Debug, Clone, Default)]
pub struct AsnTable {
    prefixes: Vec<Prefix>,
}

impl AsnTable {
    /// Load a table from a YAML list of `{network, asn, org}` entries.
    pub fn load(path: &Path) -> Result<Self, GeoIpError> {
        let data = std::fs::read_to_string(path)?;
        let entries: Vec<TableEntry> = serde_yaml::from_str(&data)?;
        let mut table = Self::default();
        for entry in entries {
            table.insert(&entry.network, entry.asn, &entry.org)?;
        }
        debug!(path = %path.display(), prefixes = table.len(), "loaded ASN table");
        Ok(table)
    }

    /// Add `network` (CIDR or bare address) to the table.
    pub fn insert(&mut self, network: &str, asn: u32, org: &str) -> Result<(), GeoIpError> {
        let invalid = || GeoIpError::InvalidNetwork(network.to_string());
        let (addr, len) = match network.split_once('/') {
            Some((addr, len)) => (addr, Some(len.parse::<u8>().map_err(|_| invalid())?)),
            None => (network, None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let len = len.unwrap_or(max);
        if len > max {
            return Err(invalid());
        }
        self.prefixes.push(Prefix {
            network: addr,
            len,
            info: AsnInfo {
                number: asn,
                organization: org.to_string(),
            },
        });
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

impl AsnLookup for AsnTable {
    fn lookup_asn(&self, ip: &str) -> Result<AsnInfo, GeoIpError> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| GeoIpError::InvalidIp(ip.to_string()))?;
        self.prefixes
            .iter()
            .filter(|p| p.contains(addr))
            .max_by_key(|p| p.len)
            .map(|p| p.info.clone())
            .ok_or_else(|| GeoIpError::NotFound(ip.to_string()))
    }
}
