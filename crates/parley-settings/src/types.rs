//! Settings type definitions.
//!
//! All types use camelCase JSON and `#[serde(default)]`, so a settings file
//! only needs the keys it overrides.

use std::time::Duration;

use parley_core::{AccessMode, DefaultAccess};
use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 6060 },
///   "sessions": { "pairing": false },
///   "store": { "path": "/var/lib/parley/parley.db" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    pub server: ServerSettings,
    pub sessions: SessionSettings,
    pub topics: TopicSettings,
    pub access: AccessSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

/// Listener and transport timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Largest inbound frame in bytes.
    pub max_message_size: usize,
    /// Deadline for a single outbound write.
    pub write_wait_ms: u64,
    /// Read deadline; probes go out every 9/10 of it.
    pub pong_wait_ms: u64,
    /// How long a long-poll GET waits for outbound traffic.
    pub long_poll_wait_ms: u64,
    /// Upper bound on topic shutdown during process exit.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6060,
            max_message_size: 1 << 18,
            write_wait_ms: 10_000,
            pong_wait_ms: 55_000,
            long_poll_wait_ms: 30_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ServerSettings {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    pub fn long_poll_wait(&self) -> Duration {
        Duration::from_millis(self.long_poll_wait_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub idle_timeout_ms: u64,
    /// Extra time a long-poll session survives past the idle timeout.
    pub long_poll_grace_ms: u64,
    pub outbound_capacity: usize,
    pub detach_capacity: usize,
    /// Exchange session ids between consecutive WebSocket connections.
    pub pairing: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 55_000,
            long_poll_grace_ms: 15_000,
            outbound_capacity: 256,
            detach_capacity: 64,
            pairing: true,
        }
    }
}

impl SessionSettings {
    /// Lifetime of an untouched long-poll session.
    pub fn long_poll_lifetime(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.saturating_add(self.long_poll_grace_ms))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicSettings {
    /// How long a topic with no attached sessions stays alive.
    pub idle_timeout_ms: u64,
    /// Debounce for user-agent presence on `me` topics.
    pub ua_delay_ms: u64,
    pub broadcast_capacity: usize,
    pub meta_capacity: usize,
    pub reg_capacity: usize,
    pub unreg_capacity: usize,
    pub ua_capacity: usize,
    /// Most messages returned by one history request.
    pub max_history: usize,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 5_000,
            ua_delay_ms: 5_000,
            broadcast_capacity: 256,
            meta_capacity: 32,
            reg_capacity: 32,
            unreg_capacity: 32,
            ua_capacity: 32,
            max_history: 128,
        }
    }
}

impl TopicSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn ua_delay(&self) -> Duration {
        Duration::from_millis(self.ua_delay_ms)
    }
}

/// Default modes granted to new subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessSettings {
    pub group_auth: AccessMode,
    pub group_anon: AccessMode,
    pub p2p_auth: AccessMode,
    pub p2p_anon: AccessMode,
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            group_auth: AccessMode::PUBLIC,
            group_anon: AccessMode::NONE,
            p2p_auth: AccessMode::P2P,
            p2p_anon: AccessMode::NONE,
        }
    }
}

impl AccessSettings {
    pub fn group(&self) -> DefaultAccess {
        DefaultAccess {
            auth: self.group_auth,
            anon: self.group_anon,
        }
    }

    pub fn p2p(&self) -> DefaultAccess {
        DefaultAccess {
            auth: self.p2p_auth,
            anon: self.p2p_anon,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// SQLite database file. Without one, state lives in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// One JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
