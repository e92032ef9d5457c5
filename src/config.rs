use std::path::PathBuf;
use std::time::Duration;

/// Tunables injected into the session constructor. Defaults mirror the
/// wire protocol's customary values.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the content set is materialized under.
    pub download_root: PathBuf,
    /// Port advertised to peers in the extended handshake.
    pub listen_port: u16,
    /// Per-peer budget of concurrently in-flight chunk requests.
    pub max_peer_requests: usize,
    /// Idle period after which a keep-alive frame is sent.
    pub keep_alive_period: Duration,
    /// Delay before re-dialing a peer that closed cleanly while we were
    /// still interested.
    pub reconnect_wait: Duration,
    /// Reconnect attempts per peer before giving up on it.
    pub max_reconnects: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from("."),
            listen_port: 6881,
            max_peer_requests: 5,
            keep_alive_period: Duration::from_secs(60),
            reconnect_wait: Duration::from_secs(5),
            max_reconnects: 3,
        }
    }
}
