//! Environment-driven configuration.
//!
//! Every recognized variable follows the same policy: a missing value
//! selects the built-in default silently, a malformed value produces a
//! diagnostic and then selects the default.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::wire::{CA_ANNEX_LEN, CA_HDR_LEN, DEFAULT_SERVER_PORT, MAX_TCP_BASE};

/// Period of circuit-liveness probes, seconds.
pub const ENV_CONN_TMO: &str = "EPICS_CA_CONN_TMO";
/// Upper bound on inbound payload bytes.
pub const ENV_MAX_ARRAY_BYTES: &str = "EPICS_CA_MAX_ARRAY_BYTES";
/// Server search/TCP port.
pub const ENV_SERVER_PORT: &str = "EPICS_CA_SERVER_PORT";
/// Whitespace-separated `host[:port]` search destinations.
pub const ENV_ADDR_LIST: &str = "EPICS_CA_ADDR_LIST";

/// Default circuit-liveness probe period.
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Circuit-liveness probe period.
    pub conn_timeout: Duration,
    /// Upper bound on one inbound frame, protocol header included.
    pub max_recv_bytes: u32,
    /// Server port used for search destinations without an explicit port.
    pub server_port: u16,
    /// Search datagram destinations.
    pub search_addrs: Vec<SocketAddr>,
    /// User name announced to servers after connect.
    pub user_name: String,
    /// Host name announced to servers after connect.
    pub host_name: String,
}

impl Config {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        let conn_timeout = match std::env::var(ENV_CONN_TMO) {
            Ok(raw) => match raw.trim().parse::<f64>() {
                Ok(secs) if secs > 0.0 && secs.is_finite() => Duration::from_secs_f64(secs),
                _ => {
                    tracing::warn!(
                        var = ENV_CONN_TMO,
                        value = %raw,
                        default = ?DEFAULT_CONN_TIMEOUT,
                        "double fetch failed, using default"
                    );
                    DEFAULT_CONN_TIMEOUT
                }
            },
            Err(_) => DEFAULT_CONN_TIMEOUT,
        };

        let server_port = match std::env::var(ENV_SERVER_PORT) {
            Ok(raw) => match raw.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    tracing::warn!(
                        var = ENV_SERVER_PORT,
                        value = %raw,
                        default = DEFAULT_SERVER_PORT,
                        "not a valid port, using default"
                    );
                    DEFAULT_SERVER_PORT
                }
            },
            Err(_) => DEFAULT_SERVER_PORT,
        };

        let max_recv_bytes = match std::env::var(ENV_MAX_ARRAY_BYTES) {
            Ok(raw) => match raw.trim().parse::<i64>() {
                Ok(bytes) if bytes >= 0 => max_recv_from_array_bytes(bytes as u64),
                _ => {
                    tracing::warn!(
                        var = ENV_MAX_ARRAY_BYTES,
                        value = %raw,
                        "was not a positive integer, using default"
                    );
                    MAX_TCP_BASE
                }
            },
            Err(_) => MAX_TCP_BASE,
        };

        let search_addrs = match std::env::var(ENV_ADDR_LIST) {
            Ok(raw) => parse_addr_list(&raw, server_port),
            Err(_) => Vec::new(),
        };
        let search_addrs = if search_addrs.is_empty() {
            vec![SocketAddr::from((Ipv4Addr::BROADCAST, server_port))]
        } else {
            search_addrs
        };

        Self {
            conn_timeout,
            max_recv_bytes,
            server_port,
            search_addrs,
            user_name: user_name(),
            host_name: host_name(),
        }
    }
}

/// Allow room for the protocol header so callers get the array size they
/// asked for, and round small values up to the base frame budget.
pub(crate) fn max_recv_from_array_bytes(array_bytes: u64) -> u32 {
    const HEADER_ROOM: u64 = (CA_HDR_LEN + CA_ANNEX_LEN) as u64;
    let with_header = array_bytes.saturating_add(HEADER_ROOM).min(u32::MAX as u64) as u32;
    if with_header < MAX_TCP_BASE {
        tracing::warn!(
            var = ENV_MAX_ARRAY_BYTES,
            rounded_to = MAX_TCP_BASE,
            "value rounded up to the base frame budget"
        );
        MAX_TCP_BASE
    } else {
        with_header
    }
}

fn parse_addr_list(raw: &str, default_port: u16) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for entry in raw.split_whitespace() {
        let with_port: std::borrow::Cow<'_, str> = if entry.contains(':') {
            entry.into()
        } else {
            format!("{entry}:{default_port}").into()
        };
        match with_port.to_socket_addrs() {
            Ok(addrs) => out.extend(addrs.filter(|a| a.is_ipv4())),
            Err(e) => {
                tracing::warn!(var = ENV_ADDR_LIST, entry, error = %e, "skipping entry");
            }
        }
    }
    out
}

fn user_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_default()
}

fn host_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid writable buffer of the passed length;
    // gethostname NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len() - 1) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        String::new()
    }
}
