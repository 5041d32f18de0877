//! Keeping the chosen rendezvous alive.
//!
//! Each identity runs one re-bind loop. A tick republishes the DHT record when
//! the (local, rendezvous) pair moved, sends a BIND to the rendezvous and feeds
//! the outcome into a [`RebindTracker`]. Reaching the fail limit hands the
//! identity back to the publisher with the rendezvous marked as failed.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::contact::Contact;
use crate::dht::{PutFlags, encode_record, publish_key};
use crate::error::FailureKind;
use crate::message::PunchMessage;
use crate::puncher::{PublishRecord, PuncherInner};

/// Where an identity stands with its rendezvous
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RendezvousPhase {
    /// No rendezvous needed or none found
    #[default]
    Idle,
    /// A rendezvous was chosen but no bind has succeeded yet
    Bound,
    /// The rendezvous accepted our bind
    Operational,
    /// The rendezvous stopped answering and a new one is being sought
    Failed,
}

impl fmt::Display for RendezvousPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Bound => "bound",
            Self::Operational => "operational",
            Self::Failed => "failed",
        })
    }
}

/// Classified reply to a BIND request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// Bind accepted
    Ok,
    /// Bind explicitly refused
    NotOk,
    /// No usable reply
    Failed,
}

/// What the tracker concluded from one bind outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebindVerdict {
    /// The rendezvous answered
    Healthy,
    /// Failing, with the current consecutive fail count
    Failing(u32),
    /// Fail limit just reached; the rendezvous must be abandoned
    Failed,
}

/// Consecutive bind failure accounting
#[derive(Debug, Clone)]
pub struct RebindTracker {
    fail_limit: u32,
    initial_fail_count: u32,
    fail_count: u32,
    last_ok: Option<Instant>,
    last_fail: Option<Instant>,
}

impl RebindTracker {
    /// Create a tracker escalating at `fail_limit`
    ///
    /// A freshly chosen rendezvous starts at `fail_limit - initial_budget`.
    #[must_use]
    pub fn new(fail_limit: u32, initial_budget: u32) -> Self {
        Self {
            fail_limit,
            initial_fail_count: fail_limit.saturating_sub(initial_budget),
            fail_count: 0,
            last_ok: None,
            last_fail: None,
        }
    }

    /// Grant a new rendezvous its initial budget
    pub fn reset_budget(&mut self) {
        self.fail_count = self.initial_fail_count;
    }

    /// Feed one bind outcome
    pub fn record(&mut self, outcome: BindOutcome, now: Instant) -> RebindVerdict {
        let was_failed = self.fail_count >= self.fail_limit;
        match outcome {
            BindOutcome::Ok => {
                self.fail_count = 0;
                self.last_ok = Some(now);
                return RebindVerdict::Healthy;
            }
            // Explicit refusal is not worth retrying
            BindOutcome::NotOk => self.fail_count = self.fail_limit,
            BindOutcome::Failed => self.fail_count += 1,
        }
        self.last_fail = Some(now);

        // Reported once per crossing; a reset or a success re-arms it
        if self.fail_count >= self.fail_limit && !was_failed {
            RebindVerdict::Failed
        } else {
            RebindVerdict::Failing(self.fail_count)
        }
    }

    /// Current consecutive fail count
    #[must_use]
    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    /// Time of the last successful bind
    #[must_use]
    pub fn last_ok(&self) -> Option<Instant> {
        self.last_ok
    }

    /// Time of the last failed bind
    #[must_use]
    pub fn last_fail(&self) -> Option<Instant> {
        self.last_fail
    }
}

/// DHT record work implied by a change of the (local, rendezvous) pair
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RecordChange {
    Unchanged,
    /// Local contact moved: drop the record under `stale`, publish `fresh`
    Replace {
        stale: Option<Contact>,
        fresh: Option<(Contact, Contact)>,
    },
    /// Same local contact, new rendezvous: overwrite in place
    Retarget { local: Contact, target: Contact },
}

/// Re-bind loop state (one guarded section)
#[derive(Debug)]
pub(crate) struct RebindState {
    pub(crate) tracker: RebindTracker,
    local: Option<Contact>,
    target: Option<Contact>,
}

impl RebindState {
    pub(crate) fn new(fail_limit: u32, initial_budget: u32) -> Self {
        Self {
            tracker: RebindTracker::new(fail_limit, initial_budget),
            local: None,
            target: None,
        }
    }

    /// Compare the pair the last tick saw with the current one
    pub(crate) fn observe(
        &mut self,
        local: Option<&Contact>,
        target: Option<&Contact>,
    ) -> RecordChange {
        let local_changed = self.local.as_ref() != local;
        let target_changed = self.target.as_ref() != target;
        if !local_changed && !target_changed {
            return RecordChange::Unchanged;
        }

        let stale = std::mem::replace(&mut self.local, local.cloned());
        self.target = target.cloned();
        self.tracker.reset_budget();

        match (local_changed, local, target) {
            (false, Some(local), Some(target)) => RecordChange::Retarget {
                local: local.clone(),
                target: target.clone(),
            },
            _ => RecordChange::Replace {
                stale,
                fresh: local.cloned().zip(target.cloned()),
            },
        }
    }
}

/// Why an identity is abandoning its rendezvous
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailoverReason {
    /// Fail limit reached
    Unresponsive,
    /// The rendezvous announced it is shutting down
    Closed,
    /// Another identity on this node uses the same rendezvous host
    Duplicate,
    /// Still unchanged after a suspend
    Stale,
}

impl fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unresponsive => "unresponsive",
            Self::Closed => "closed",
            Self::Duplicate => "duplicate",
            Self::Stale => "stale",
        })
    }
}

/// Indices of entries whose ip already appeared earlier in `ips`
pub(crate) fn duplicate_targets(ips: &[Option<IpAddr>]) -> Vec<usize> {
    let mut seen = HashSet::new();
    ips.iter()
        .enumerate()
        .filter_map(|(index, ip)| match ip {
            Some(ip) if !seen.insert(*ip) => Some(index),
            _ => None,
        })
        .collect()
}

impl PuncherInner {
    /// Start the re-bind loop
    pub(crate) fn spawn_maintainer(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let wake = Arc::clone(&self.rebind_wake);
        let period = self.config.rebind_period;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    () = wake.notified() => {}
                }

                let Some(this) = weak.upgrade() else { break };
                if this.is_destroyed() {
                    break;
                }
                if this.is_suspended() {
                    continue;
                }
                this.rebind_tick().await;
            }
        })
    }

    /// One maintenance pass; ticks never overlap
    pub(crate) async fn rebind_tick(self: &Arc<Self>) {
        let (local, target) = {
            let state = self.state.lock();
            (state.local.clone(), state.target.clone())
        };

        let change = { self.rebind.lock().observe(local.as_ref(), target.as_ref()) };
        if self.role.is_primary() {
            self.apply_record_change(change).await;
        }

        let Some(target) = target else { return };

        let outcome = self.send_bind(&target).await;
        let verdict = { self.rebind.lock().tracker.record(outcome, Instant::now()) };

        match verdict {
            RebindVerdict::Healthy => self.bind_confirmed(&target),
            RebindVerdict::Failing(count) => {
                tracing::debug!(role = %self.role, "Bind to {} failed ({} consecutive)", target, count);
            }
            RebindVerdict::Failed => self.rendezvous_failed(&target, FailoverReason::Unresponsive),
        }
    }

    async fn send_bind(&self, target: &Contact) -> BindOutcome {
        let reply = self
            .send_request(target, PunchMessage::BindRequest, self.config.transfer_timeout)
            .await;

        match reply {
            Ok(PunchMessage::BindReply { ok: true, .. }) => BindOutcome::Ok,
            Ok(_) => {
                self.counters.record_failure(FailureKind::Denied);
                BindOutcome::NotOk
            }
            Err(e) => {
                self.counters.record_failure(e.kind());
                if matches!(e.kind(), FailureKind::Decode) {
                    BindOutcome::NotOk
                } else {
                    BindOutcome::Failed
                }
            }
        }
    }

    fn bind_confirmed(&self, target: &Contact) {
        let first_ok = {
            let mut state = self.state.lock();
            let current = state.target.as_ref() == Some(target);
            if current && state.last_ok.as_ref() != Some(target) {
                state.last_ok = Some(target.clone());
                state.phase = RendezvousPhase::Operational;
                true
            } else {
                false
            }
        };

        if first_ok {
            tracing::info!(role = %self.role, "Rendezvous {} operational", target);
            self.listeners.notify(target.clone());
        } else {
            tracing::trace!("Bind to {} ok", target);
        }
    }

    async fn apply_record_change(&self, change: RecordChange) {
        match change {
            RecordChange::Unchanged => {}
            RecordChange::Replace { stale, fresh } => {
                if let Some(stale) = stale {
                    self.dht.remove(&publish_key(&stale)).await;
                    self.state.lock().record = None;
                    tracing::debug!("Removed rendezvous record for {}", stale);
                }
                if let Some((local, target)) = fresh {
                    self.write_record(&local, &target).await;
                }
            }
            RecordChange::Retarget { local, target } => self.write_record(&local, &target).await,
        }
    }

    async fn write_record(&self, local: &Contact, target: &Contact) {
        let value = match encode_record(self.transport.as_ref(), target) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Failed to encode rendezvous record for {}: {}", target, e);
                self.counters.record_failure(e.kind());
                return;
            }
        };

        let key = publish_key(local);
        let write_set = self.dht.put(&key, value, PutFlags::SINGLE_VALUE).await;
        tracing::debug!(
            "Published rendezvous {} for {} ({} replicas)",
            target,
            local,
            write_set.len()
        );
        self.state.lock().record = Some(PublishRecord { key, write_set });
    }

    /// Move secondaries off rendezvous hosts already used by another identity
    pub(crate) fn dedup_identities(self: &Arc<Self>) {
        let secondaries = { self.secondaries.lock().clone() };
        let mut identities = Vec::with_capacity(secondaries.len() + 1);
        identities.push(Arc::clone(self));
        identities.extend(secondaries);

        let targets: Vec<Option<Contact>> = identities
            .iter()
            .map(|identity| identity.state.lock().target.clone())
            .collect();
        let ips: Vec<_> = targets
            .iter()
            .map(|t| t.as_ref().map(|c| c.address().ip()))
            .collect();

        for index in duplicate_targets(&ips) {
            if let Some(target) = &targets[index] {
                tracing::info!("Identity {} shares rendezvous host {}, moving it", index, target);
                identities[index].rendezvous_failed(target, FailoverReason::Duplicate);
            }
        }
    }
}
