//! Puncher configuration

use std::time::Duration;

use crate::error::{PunchError, Result};

/// Timing and capacity settings for a [`Puncher`](crate::Puncher)
///
/// The defaults are tuned against common router NAT idle timeouts. They are
/// kept configurable so deployments (and tests) can shrink or stretch them
/// without changing the protocol.
#[derive(Debug, Clone)]
pub struct PuncherConfig {
    /// Minimum time between unforced publish passes
    pub republish_interval: Duration,

    /// Timeout for request/reply exchanges (doubled for message-only sends)
    pub transfer_timeout: Duration,

    /// Timeout for a DHT lookup of a target's rendezvous
    pub lookup_timeout: Duration,

    /// Timeout for a single fire-and-forget tunnel probe
    pub tunnel_timeout: Duration,

    /// Spacing between tunnel probe retries
    pub probe_interval: Duration,

    /// Tunnel probe retries after the first probe
    pub probe_retries: u32,

    /// How long an originator waits for a direct probe from the target
    pub tunnel_wait: Duration,

    /// Delay between launching pings to rendezvous candidates
    pub ping_stagger: Duration,

    /// Maximum peers that may bind to this node
    pub max_bindings: usize,

    /// Bindings not refreshed within this period are evicted
    pub binding_timeout: Duration,

    /// Period of the re-bind loop
    pub rebind_period: Duration,

    /// Consecutive bind failures before a rendezvous is declared failed
    pub rebind_fail_limit: u32,

    /// Attempts granted to a freshly chosen rendezvous before escalation
    pub initial_fail_budget: u32,

    /// Consecutive connect failures before a binding is quarantined
    pub connect_fail_limit: u32,

    /// Quarantine length after the most recent connect failure
    pub connect_retry_cooldown: Duration,

    /// Failed rendezvous addresses remembered
    pub failed_history: usize,

    /// Lifetime of a completed rendezvous lookup
    pub lookup_ttl: Duration,

    /// Delay after resuming before the rendezvous is rechecked
    pub resume_grace: Duration,

    /// Concurrent workers per probe timer group
    pub timer_workers: usize,

    /// Maximum punches waiting for a tunnel probe at once
    pub max_outstanding_punches: usize,
}

impl Default for PuncherConfig {
    fn default() -> Self {
        Self {
            republish_interval: Duration::from_secs(5 * 60),
            transfer_timeout: Duration::from_secs(30),
            lookup_timeout: Duration::from_secs(30),
            tunnel_timeout: Duration::from_secs(3),
            probe_interval: Duration::from_secs(3),
            probe_retries: 3,
            tunnel_wait: Duration::from_secs(10),
            ping_stagger: Duration::from_secs(1),
            max_bindings: 8,
            binding_timeout: Duration::from_secs(5 * 60),
            // Stays under typical router UDP idle timeouts
            rebind_period: Duration::from_secs(50),
            rebind_fail_limit: 4,
            initial_fail_budget: 2,
            connect_fail_limit: 8,
            connect_retry_cooldown: Duration::from_secs(30),
            failed_history: 16,
            lookup_ttl: Duration::from_secs(2 * 60),
            resume_grace: Duration::from_secs(20),
            timer_workers: 8,
            max_outstanding_punches: 64,
        }
    }
}

impl PuncherConfig {
    /// Timeout used for a punch request
    #[must_use]
    pub fn punch_timeout(&self, message_only: bool) -> Duration {
        if message_only {
            self.transfer_timeout * 2
        } else {
            self.transfer_timeout
        }
    }

    /// Interval of the server sweep (half the binding timeout)
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.binding_timeout / 2
    }

    /// Fail count a freshly chosen rendezvous starts from
    #[must_use]
    pub fn initial_fail_count(&self) -> u32 {
        self.rebind_fail_limit.saturating_sub(self.initial_fail_budget)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::InvalidConfig`] if a period is zero, a capacity is
    /// zero or the fail limit leaves no room for the initial budget.
    pub fn validate(&self) -> Result<()> {
        if self.rebind_fail_limit < 2 {
            return Err(PunchError::invalid_config("rebind_fail_limit must be at least 2"));
        }
        if self.initial_fail_budget == 0 || self.initial_fail_budget > self.rebind_fail_limit {
            return Err(PunchError::invalid_config(
                "initial_fail_budget must be between 1 and rebind_fail_limit",
            ));
        }
        if self.max_bindings == 0 {
            return Err(PunchError::invalid_config("max_bindings must be non-zero"));
        }
        if self.failed_history == 0 {
            return Err(PunchError::invalid_config("failed_history must be non-zero"));
        }
        if self.timer_workers == 0 || self.max_outstanding_punches == 0 {
            return Err(PunchError::invalid_config(
                "timer_workers and max_outstanding_punches must be non-zero",
            ));
        }
        if self.connect_fail_limit == 0 {
            return Err(PunchError::invalid_config("connect_fail_limit must be non-zero"));
        }

        let periods = [
            self.republish_interval,
            self.transfer_timeout,
            self.lookup_timeout,
            self.tunnel_timeout,
            self.probe_interval,
            self.binding_timeout,
            self.rebind_period,
            self.lookup_ttl,
        ];
        if periods.iter().any(Duration::is_zero) {
            return Err(PunchError::invalid_config("timeouts and periods must be non-zero"));
        }

        Ok(())
    }

    /// Short timings for unit tests
    #[cfg(test)]
    pub(crate) fn quick() -> Self {
        Self {
            republish_interval: Duration::from_millis(200),
            transfer_timeout: Duration::from_millis(500),
            lookup_timeout: Duration::from_millis(500),
            tunnel_timeout: Duration::from_millis(100),
            probe_interval: Duration::from_millis(30),
            tunnel_wait: Duration::from_millis(500),
            ping_stagger: Duration::from_millis(5),
            binding_timeout: Duration::from_secs(2),
            rebind_period: Duration::from_millis(50),
            resume_grace: Duration::from_millis(100),
            ..Self::default()
        }
    }
}
