//! # Chat Engine Configuration
//!
//! Sectioned configuration for the routing coordinator. Each section has
//! sensible defaults and the whole configuration is validated once at engine
//! construction via [`ChatEngineConfig::validate`].
//!
//! ## Examples
//!
//! ```
//! use livedesk_chat_engine::config::ChatEngineConfig;
//! use std::time::Duration;
//!
//! let mut config = ChatEngineConfig::default();
//! config.presence.heartbeat_timeout = Duration::from_secs(30);
//! config.queues.max_queue_size = 200;
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

/// Top-level chat engine configuration
///
/// Grouped into sections so that deployments can tune one concern without
/// touching the others. All durations are wall-clock bounds enforced by the
/// engine's sweep task and lock acquisition paths.
#[derive(Debug, Clone)]
pub struct ChatEngineConfig {
    /// General engine limits
    pub general: GeneralConfig,

    /// Agent defaults
    pub agents: AgentConfig,

    /// Presence, heartbeat and debounce settings
    pub presence: PresenceConfig,

    /// Tenant queue settings
    pub queues: QueueConfig,

    /// Routing behavior
    pub routing: RoutingConfig,
}

/// General engine limits
#[derive(Debug, Clone)]
pub struct GeneralConfig {
    /// Upper bound on waiting for a tenant state lock before the caller
    /// receives a retry-safe `Timeout` error
    pub lock_timeout: Duration,

    /// Capacity of the event fan-out channel
    pub event_channel_capacity: usize,
}

/// Agent defaults
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Concurrency cap applied when a registration profile supplies zero
    pub default_max_concurrent_conversations: usize,
}

/// Presence, heartbeat and debounce settings
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Agents silent past this threshold are forced Offline and their
    /// conversations are requeued at the front of the tenant queue
    pub heartbeat_timeout: Duration,

    /// Identical status changes inside this window do not re-broadcast
    pub status_debounce: Duration,

    /// How often the background sweep checks heartbeats and queue expiry
    pub sweep_interval: Duration,
}

/// Tenant queue settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of waiting conversations per tenant
    pub max_queue_size: usize,

    /// Waiting conversations older than this are abandoned by the sweep
    pub max_wait_time: Duration,
}

/// Routing behavior
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// When true, a ticket's required skills are a hard filter on candidate
    /// agents; when false, skills only influence ranking
    pub require_skill_match: bool,
}

impl ChatEngineConfig {
    /// Validate the configuration
    ///
    /// Returns a human-readable description of the first problem found.
    /// Called by the engine constructor; a failed validation surfaces as
    /// `ChatEngineError::Configuration`.
    pub fn validate(&self) -> Result<(), String> {
        if self.general.lock_timeout.is_zero() {
            return Err("general.lock_timeout must be non-zero".to_string());
        }
        if self.general.event_channel_capacity == 0 {
            return Err("general.event_channel_capacity must be non-zero".to_string());
        }
        if self.agents.default_max_concurrent_conversations == 0 {
            return Err("agents.default_max_concurrent_conversations must be at least 1".to_string());
        }
        if self.presence.heartbeat_timeout.is_zero() {
            return Err("presence.heartbeat_timeout must be non-zero".to_string());
        }
        if self.presence.sweep_interval > self.presence.heartbeat_timeout {
            return Err(
                "presence.sweep_interval must not exceed presence.heartbeat_timeout".to_string(),
            );
        }
        if self.queues.max_queue_size == 0 {
            return Err("queues.max_queue_size must be at least 1".to_string());
        }
        if self.queues.max_wait_time.is_zero() {
            return Err("queues.max_wait_time must be non-zero".to_string());
        }
        Ok(())
    }
}

impl Default for ChatEngineConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            agents: AgentConfig::default(),
            presence: PresenceConfig::default(),
            queues: QueueConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            event_channel_capacity: 1024,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent_conversations: 3,
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            status_debounce: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 500,
            // One hour: callers abandon long before this, but the sweep
            // still needs a hard bound to reclaim forgotten tickets.
            max_wait_time: Duration::from_secs(3600),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            require_skill_match: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ChatEngineConfig::default().validate().is_ok());
    }

    #[test]
    fn validation_rejects_zero_limits() {
        let mut config = ChatEngineConfig::default();
        config.queues.max_queue_size = 0;
        assert!(config.validate().is_err());

        let mut config = ChatEngineConfig::default();
        config.presence.sweep_interval = Duration::from_secs(120);
        config.presence.heartbeat_timeout = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }
}
