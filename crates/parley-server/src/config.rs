//! Runtime configuration derived from [`ParleySettings`].

use std::time::Duration;

use parley_core::DefaultAccess;
use parley_settings::ParleySettings;

/// Transport and session-level configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind address, e.g. `0.0.0.0:6060`.
    pub listen: String,
    /// Largest inbound frame in bytes.
    pub max_message_size: usize,
    /// Deadline for each outbound write.
    pub write_wait: Duration,
    /// Read deadline, refreshed by every inbound frame.
    pub pong_wait: Duration,
    /// Probe interval, 9/10 of `pong_wait`.
    pub ping_period: Duration,
    /// How long a long-poll GET waits for traffic.
    pub long_poll_wait: Duration,
    /// Lifetime of an untouched long-poll session.
    pub long_poll_lifetime: Duration,
    pub shutdown_timeout: Duration,
    pub pairing: bool,
    pub queues: QueueCapacities,
    pub topics: TopicConfig,
}

/// Capacities of the per-session mailboxes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueCapacities {
    pub outbound: usize,
    pub detach: usize,
}

impl QueueCapacities {
    /// The stop signal never holds more than one pending request.
    pub const STOP: usize = 1;
}

/// Configuration shared by every topic actor.
#[derive(Clone, Debug)]
pub struct TopicConfig {
    pub idle_timeout: Duration,
    pub ua_delay: Duration,
    pub broadcast_capacity: usize,
    pub meta_capacity: usize,
    pub reg_capacity: usize,
    pub unreg_capacity: usize,
    pub ua_capacity: usize,
    pub max_history: usize,
    pub group_access: DefaultAccess,
    pub p2p_access: DefaultAccess,
}

impl TopicConfig {
    /// Exit carries at most one request.
    pub const EXIT_CAPACITY: usize = 1;
}

impl From<&ParleySettings> for ServerConfig {
    fn from(s: &ParleySettings) -> Self {
        Self {
            listen: s.server.listen_addr(),
            max_message_size: s.server.max_message_size,
            write_wait: s.server.write_wait(),
            pong_wait: s.server.pong_wait(),
            ping_period: s.server.ping_period(),
            long_poll_wait: s.server.long_poll_wait(),
            long_poll_lifetime: s.sessions.long_poll_lifetime(),
            shutdown_timeout: s.server.shutdown_timeout(),
            pairing: s.sessions.pairing,
            queues: QueueCapacities {
                outbound: s.sessions.outbound_capacity,
                detach: s.sessions.detach_capacity,
            },
            topics: TopicConfig {
                idle_timeout: s.topics.idle_timeout(),
                ua_delay: s.topics.ua_delay(),
                broadcast_capacity: s.topics.broadcast_capacity,
                meta_capacity: s.topics.meta_capacity,
                reg_capacity: s.topics.reg_capacity,
                unreg_capacity: s.topics.unreg_capacity,
                ua_capacity: s.topics.ua_capacity,
                max_history: s.topics.max_history,
                group_access: s.access.group(),
                p2p_access: s.access.p2p(),
            },
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ParleySettings::default())
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        ServerConfig::default().topics
    }
}
