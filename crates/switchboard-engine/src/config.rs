use std::time::Duration;

/// Reconnect backoff after recoverable closes.
///
/// Attempt `n` (1-based) waits `base_delay * 2^(n-1)`, capped at `max_delay`.
/// After `max_attempts` consecutive recoverable closes without a successful
/// open the instance is given up on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Pairing codes allowed before an unpaired session is force-stopped.
    pub pairing_cycle_cap: u32,
    pub reconnect: ReconnectPolicy,
    /// Attempts for a status write made from engine-event handling.
    pub persist_attempts: u32,
    pub persist_retry_delay: Duration,
    /// Capacity of the fan-out broadcast channel.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pairing_cycle_cap: 5,
            reconnect: ReconnectPolicy::default(),
            persist_attempts: 3,
            persist_retry_delay: Duration::from_millis(100),
            event_capacity: 1024,
        }
    }
}
