//! Finding a rendezvous for an unreachable node.

use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::time::Instant;

use crate::contact::Contact;
use crate::maintainer::{FailoverReason, RendezvousPhase};
use crate::puncher::PuncherInner;

/// Resets the in-progress flag however the pass ends
struct PublishGuard<'a>(&'a PuncherInner);

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().publishing = false;
    }
}

impl PuncherInner {
    /// Schedule a publish pass
    ///
    /// Unforced passes are skipped if one started within the republish
    /// interval. The pass runs on its own task so the caller never waits.
    pub(crate) fn publish(self: &Arc<Self>, force: bool) {
        if self.is_destroyed() {
            return;
        }

        let now = Instant::now();
        {
            let mut state = self.state.lock();
            let recent = state.last_publish.is_some_and(|at| {
                now.saturating_duration_since(at) < self.config.republish_interval
            });
            if recent && !force {
                return;
            }
            state.last_publish = Some(now);
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.publish_pass().await });
    }

    async fn publish_pass(self: Arc<Self>) {
        if self.is_suspended() || self.is_destroyed() {
            return;
        }

        {
            let mut state = self.state.lock();
            if state.publishing {
                tracing::trace!("Publish already in progress");
                return;
            }
            state.publishing = true;
        }
        let _guard = PublishGuard(&*self);

        let forced_active = self.force_active.load(Ordering::Acquire);
        if self.transport.is_reachable() && !forced_active {
            self.set_rendezvous_target(None, None);
            return;
        }

        let local = self.transport.local_contact();
        let explicit = {
            let state = self.state.lock();
            let target_failed = state
                .target
                .as_ref()
                .is_some_and(|t| state.failed.contains(&t.address()));
            let unchanged = state
                .local
                .as_ref()
                .is_some_and(|l| l.address() == local.address());
            if unchanged && !target_failed {
                return;
            }
            state.explicit.get(&local.address()).cloned()
        };

        let chosen = match explicit {
            Some(rendezvous) => {
                tracing::info!(role = %self.role, "Using explicit rendezvous {}", rendezvous);
                Some(rendezvous)
            }
            None => self.find_rendezvous(&local).await,
        };

        match chosen {
            Some(target) => {
                self.set_rendezvous_target(Some(local), Some(target));
                self.run_rendezvous();
            }
            None => {
                tracing::info!(role = %self.role, "No rendezvous found, operating without one");
                self.set_rendezvous_target(None, None);
            }
        }
    }

    /// Ping shuffled reachable contacts; the first to answer wins
    ///
    /// Pings are launched one stagger apart and run concurrently. Candidates
    /// that recently failed are skipped; late answers are dropped.
    async fn find_rendezvous(&self, local: &Contact) -> Option<Contact> {
        let mut candidates = self.transport.reachable_contacts();
        candidates.shuffle(&mut rand::thread_rng());
        let mut candidates = candidates
            .into_iter()
            .filter(|c| c.address() != local.address());

        let transport = self.transport.as_ref();
        let mut pings = FuturesUnordered::new();
        let mut next_launch = Instant::now();
        let mut exhausted = false;
        let (mut issued, mut skipped) = (0usize, 0usize);

        loop {
            tokio::select! {
                Some((contact, result)) = pings.next(), if !pings.is_empty() => {
                    match result {
                        Ok(()) => {
                            tracing::info!(role = %self.role, "Found rendezvous {}", contact);
                            return Some(contact);
                        }
                        Err(e) => tracing::trace!("Rendezvous candidate {} failed: {}", contact, e),
                    }
                }
                () = tokio::time::sleep_until(next_launch), if !exhausted => {
                    match candidates.find(|c| {
                        let failed = self.is_failed(c);
                        skipped += usize::from(failed);
                        !failed
                    }) {
                        Some(contact) => {
                            issued += 1;
                            pings.push(async move {
                                let result = transport.ping(&contact).await;
                                (contact, result)
                            });
                            next_launch = Instant::now() + self.config.ping_stagger;
                        }
                        None => exhausted = true,
                    }
                }
                else => break,
            }
        }

        tracing::debug!(
            "No rendezvous answered ({} pinged, {} skipped as failed)",
            issued,
            skipped
        );
        None
    }

    fn is_failed(&self, contact: &Contact) -> bool {
        self.state.lock().failed.contains(&contact.address())
    }

    /// Apply a new (local, rendezvous) pair
    pub(crate) fn set_rendezvous_target(&self, local: Option<Contact>, target: Option<Contact>) {
        let (previous, reselected) = {
            let mut state = self.state.lock();
            let previous = state.target.clone();
            // A failed rendezvous chosen again starts over as if it were new
            let reselected = previous == target
                && target.is_some()
                && state.phase == RendezvousPhase::Failed;
            if previous != target || reselected {
                state.last_ok = None;
                state.phase = if target.is_some() {
                    RendezvousPhase::Bound
                } else {
                    RendezvousPhase::Idle
                };
            }
            state.local = local;
            state.target = target.clone();
            (previous, reselected)
        };

        if let (true, Some(t)) = (reselected, &target) {
            tracing::debug!(role = %self.role, "Retrying failed rendezvous {}", t);
            self.rebind.lock().tracker.reset_budget();
        }

        if previous != target {
            match &target {
                Some(t) => tracing::debug!(role = %self.role, "Rendezvous target now {}", t),
                None => tracing::debug!(role = %self.role, "Rendezvous cleared"),
            }
            self.registry.update(
                self.serial,
                &self.self_ref,
                previous.map(|c| c.address()),
                target.map(|c| c.address()),
            );
        }
    }

    /// Start the maintainer if needed and make it bind right away
    pub(crate) fn run_rendezvous(self: &Arc<Self>) {
        let spawn = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.maintainer_running, true)
        };
        if spawn {
            let handle = self.spawn_maintainer();
            self.tasks.lock().push(handle);
        }
        self.rebind_wake.notify_one();
    }

    /// Abandon `target` and search for a replacement
    pub(crate) fn rendezvous_failed(self: &Arc<Self>, target: &Contact, reason: FailoverReason) {
        tracing::info!(role = %self.role, "Rendezvous {} failed ({})", target, reason);
        {
            let mut state = self.state.lock();
            state.failed.record(target.address());
            if state.target.as_ref() == Some(target) {
                state.phase = RendezvousPhase::Failed;
            }
        }
        self.publish(true);
    }
}
