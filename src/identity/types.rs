use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

const SEPARATOR: char = ':';

/// Immutable address and epoch of one node process. Decoding goes through
/// [`NodeIdentity::new`], so a peer cannot hand us an invalid host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "IdentityFields")]
pub struct NodeIdentity {
    host: String,
    ip: Option<IpAddr>,
    port: u16,
    start_time: u64,
}

#[derive(Deserialize)]
struct IdentityFields {
    host: String,
    ip: Option<IpAddr>,
    port: u16,
    start_time: u64,
}

impl TryFrom<IdentityFields> for NodeIdentity {
    type Error = ClusterError;

    fn try_from(fields: IdentityFields) -> Result<Self> {
        NodeIdentity::new(fields.host, fields.ip, fields.port, fields.start_time)
    }
}

impl NodeIdentity {
    /// Builds an identity, validating the hostname.
    pub fn new(
        host: impl Into<String>,
        ip: Option<IpAddr>,
        port: u16,
        start_time: u64,
    ) -> Result<Self> {
        let host = host.into();
        validate_host(&host)?;

        Ok(Self {
            host,
            ip,
            port,
            start_time,
        })
    }

    /// Identity for a process starting now, with the ip resolved through the
    /// system resolver. An unresolvable host keeps `ip = None`.
    pub fn starting_now(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        validate_host(&host)?;
        let ip = resolve_ip(&host, port);

        if ip.is_none() {
            tracing::warn!("Could not resolve an address for host {}", host);
        }

        Self::new(host, ip, port, now_ms())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// `"<host>:<port>"`, the address part without the epoch.
    pub fn host_and_port(&self) -> String {
        format!("{}{}{}", self.host, SEPARATOR, self.port)
    }

    /// Canonical `"<host>:<port>:<start_time>"` form.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// True when both identities name the same host and port, whatever
    /// their start times.
    pub fn same_host_and_port(a: &NodeIdentity, b: &NodeIdentity) -> bool {
        a.host == b.host && a.port == b.port
    }

    /// Same address, different epoch.
    pub fn is_restart_of(&self, other: &NodeIdentity) -> bool {
        Self::same_host_and_port(self, other) && self.start_time != other.start_time
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.start_time == other.start_time
    }
}

impl Eq for NodeIdentity {}

impl Hash for NodeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.start_time.hash(state);
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}{}",
            self.host, SEPARATOR, self.port, SEPARATOR, self.start_time
        )
    }
}

impl FromStr for NodeIdentity {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let segments: Vec<&str> = s.split(SEPARATOR).collect();
        if segments.len() != 3 {
            return Err(ClusterError::InvalidIdentity(format!(
                "expected host:port:start_time, got {:?}",
                s
            )));
        }

        let host = segments[0];
        let port = segments[1].parse::<u16>().map_err(|e| {
            ClusterError::InvalidIdentity(format!("bad port in {:?}: {}", s, e))
        })?;
        let start_time = segments[2]
            .parse::<u64>()
            .map_err(|e| ClusterError::InvalidIdentity(format!("bad start time in {:?}: {}", s, e)))?;

        Self::new(host, None, port, start_time)
    }
}

fn validate_host(host: &str) -> Result<()> {
    let Some(first) = host.chars().next() else {
        return Err(ClusterError::InvalidIdentity(
            "hostname is empty".to_string(),
        ));
    };

    if !first.is_ascii_alphanumeric() {
        return Err(ClusterError::InvalidIdentity(format!(
            "hostname must start with a letter or digit: {:?}",
            host
        )));
    }

    if host.contains(SEPARATOR) || host.chars().any(char::is_whitespace) {
        return Err(ClusterError::InvalidIdentity(format!(
            "hostname contains a separator or whitespace: {:?}",
            host
        )));
    }

    Ok(())
}

fn resolve_ip(host: &str, port: u16) -> Option<IpAddr> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
}

/// Hostname of the machine, from `$HOSTNAME` or `/etc/hostname`.
pub fn local_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
