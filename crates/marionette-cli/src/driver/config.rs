//! Driver configuration.
//!
//! Each setting resolves in priority order:
//! 1. Command-line flag (applied by the caller on top of this)
//! 2. Environment variable (empty values are ignored)
//! 3. Built-in default
//!
//! | Setting | Variable | Default |
//! |---------|----------|---------|
//! | Peer command | `MARIONETTE_PEER` | `marionette_mcp` |
//! | Debug endpoint | `MARIONETTE_VM_URI` | none |
//! | Call timeout | `MARIONETTE_TIMEOUT_MS` | 15000 |
//! | Post-handshake settle | `MARIONETTE_HANDSHAKE_SETTLE_MS` | 500 |
//! | Post-connect settle | `MARIONETTE_CONNECT_SETTLE_MS` | 2000 |

use std::env;
use std::time::Duration;

use marionette_core::protocol::ClientInfo;
use tracing::warn;

pub const PEER_ENV: &str = "MARIONETTE_PEER";
pub const URI_ENV: &str = "MARIONETTE_VM_URI";
pub const TIMEOUT_ENV: &str = "MARIONETTE_TIMEOUT_MS";
pub const HANDSHAKE_SETTLE_ENV: &str = "MARIONETTE_HANDSHAKE_SETTLE_MS";
pub const CONNECT_SETTLE_ENV: &str = "MARIONETTE_CONNECT_SETTLE_MS";

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_HANDSHAKE_SETTLE: Duration = Duration::from_millis(500);
const DEFAULT_CONNECT_SETTLE: Duration = Duration::from_secs(2);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Executable and arguments of the automation peer.
    pub peer_command: Vec<String>,
    /// Runtime debug endpoint of the app, e.g. `ws://127.0.0.1:52132/<token>=/ws`.
    pub endpoint_uri: Option<String>,
    /// Default per-call response timeout.
    pub call_timeout: Duration,
    /// Pause after `notifications/initialized` before further requests.
    pub handshake_settle: Duration,
    /// Pause after a successful `connect` while the peer attaches.
    pub connect_settle: Duration,
    /// How long the peer gets to exit before it is killed.
    pub shutdown_grace: Duration,
    pub client_info: ClientInfo,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            peer_command: default_peer_command(),
            endpoint_uri: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            handshake_settle: DEFAULT_HANDSHAKE_SETTLE,
            connect_settle: DEFAULT_CONNECT_SETTLE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            client_info: ClientInfo {
                name: "marionette".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

impl DriverConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let peer_command = non_empty(PEER_ENV)
            .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
            .unwrap_or(defaults.peer_command);

        Self {
            peer_command,
            endpoint_uri: non_empty(URI_ENV).map(|uri| uri.trim().to_string()),
            call_timeout: millis_or(non_empty(TIMEOUT_ENV), TIMEOUT_ENV, defaults.call_timeout),
            handshake_settle: millis_or(
                non_empty(HANDSHAKE_SETTLE_ENV),
                HANDSHAKE_SETTLE_ENV,
                defaults.handshake_settle,
            ),
            connect_settle: millis_or(
                non_empty(CONNECT_SETTLE_ENV),
                CONNECT_SETTLE_ENV,
                defaults.connect_settle,
            ),
            ..defaults
        }
    }

    /// Config with no settle pauses, for driving in-process fake peers.
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            handshake_settle: Duration::ZERO,
            connect_settle: Duration::ZERO,
            shutdown_grace: Duration::from_millis(200),
            ..Self::default()
        }
    }
}

#[cfg(windows)]
fn default_peer_command() -> Vec<String> {
    vec!["cmd".into(), "/c".into(), "marionette_mcp".into()]
}

#[cfg(not(windows))]
fn default_peer_command() -> Vec<String> {
    vec!["marionette_mcp".into()]
}

fn millis_or(value: Option<String>, name: &str, default: Duration) -> Duration {
    let Some(raw) = value else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(_) => {
            warn!(
                "Ignoring {}={:?}: expected milliseconds, using {:?}",
                name, raw, default
            );
            default
        }
    }
}
