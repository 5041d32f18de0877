//! Operational counters and the diagnostic stats snapshot.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::FailureKind;
use crate::maintainer::RendezvousPhase;
use crate::message::MessageKind;
use crate::server::BindingSummary;

/// Live counters for one identity
#[derive(Debug, Default)]
pub struct PunchCounters {
    messages: [AtomicU64; MessageKind::COUNT],
    failures: [AtomicU64; FailureKind::COUNT],
    punch_send_ok: AtomicU64,
    punch_send_fail: AtomicU64,
    punch_recv_ok: AtomicU64,
    punch_recv_fail: AtomicU64,
}

impl PunchCounters {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request sent or received
    pub fn record_message(&self, kind: MessageKind) {
        self.messages[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record an absorbed failure
    pub fn record_failure(&self, kind: FailureKind) {
        self.failures[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a punch we originated
    pub fn record_punch_sent(&self, ok: bool) {
        let counter = if ok {
            &self.punch_send_ok
        } else {
            &self.punch_send_fail
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a punch we brokered as rendezvous
    pub fn record_punch_brokered(&self, ok: bool) {
        let counter = if ok {
            &self.punch_recv_ok
        } else {
            &self.punch_recv_fail
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count for one message kind
    #[must_use]
    pub fn messages(&self, kind: MessageKind) -> u64 {
        self.messages[kind.index()].load(Ordering::Relaxed)
    }

    /// Count for one failure kind
    #[must_use]
    pub fn failures(&self, kind: FailureKind) -> u64 {
        self.failures[kind.index()].load(Ordering::Relaxed)
    }

    pub(crate) fn fill(&self, snapshot: &mut StatsSnapshot) {
        for kind in MessageKind::ALL {
            snapshot.messages[kind.index()] = self.messages(kind);
        }
        for kind in FailureKind::ALL {
            snapshot.failures[kind.index()] = self.failures(kind);
        }
        snapshot.punch_send_ok = self.punch_send_ok.load(Ordering::Relaxed);
        snapshot.punch_send_fail = self.punch_send_fail.load(Ordering::Relaxed);
        snapshot.punch_recv_ok = self.punch_recv_ok.load(Ordering::Relaxed);
        snapshot.punch_recv_fail = self.punch_recv_fail.load(Ordering::Relaxed);
    }
}

/// Point-in-time view of an identity's state and counters
///
/// The `Display` form is a single diagnostic line:
/// `ok=..,fail=..,fc=..,punch:send=ok/fail:recv=ok/fail,rendezvous=..,bindings=..,messages=..`
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Current rendezvous phase
    pub phase: RendezvousPhase,
    /// Time since the last successful bind
    pub last_ok_age: Option<Duration>,
    /// Time since the last failed bind
    pub last_fail_age: Option<Duration>,
    /// Consecutive bind failures
    pub fail_count: u32,
    /// Punches we originated that succeeded
    pub punch_send_ok: u64,
    /// Punches we originated that failed
    pub punch_send_fail: u64,
    /// Punches we brokered that succeeded
    pub punch_recv_ok: u64,
    /// Punches we brokered that failed
    pub punch_recv_fail: u64,
    /// Ip of the current rendezvous
    pub rendezvous: Option<IpAddr>,
    /// Peers bound to us
    pub bindings: Vec<BindingSummary>,
    /// Requests sent and received per message kind
    pub messages: [u64; MessageKind::COUNT],
    /// Absorbed failures per kind
    pub failures: [u64; FailureKind::COUNT],
}

impl StatsSnapshot {
    /// Count for one message kind
    #[must_use]
    pub fn message_count(&self, kind: MessageKind) -> u64 {
        self.messages[kind.index()]
    }

    /// Count for one failure kind
    #[must_use]
    pub fn failure_count(&self, kind: FailureKind) -> u64 {
        self.failures[kind.index()]
    }
}

fn write_age(f: &mut fmt::Formatter<'_>, age: Option<Duration>) -> fmt::Result {
    match age {
        Some(age) => write!(f, "{}", age.as_millis()),
        None => f.write_str("<never>"),
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ok=")?;
        write_age(f, self.last_ok_age)?;
        f.write_str(",fail=")?;
        write_age(f, self.last_fail_age)?;
        write!(
            f,
            ",fc={},punch:send={}/{}:recv={}/{},rendezvous=",
            self.fail_count,
            self.punch_send_ok,
            self.punch_send_fail,
            self.punch_recv_ok,
            self.punch_recv_fail
        )?;
        match self.rendezvous {
            Some(ip) => write!(f, "{ip}")?,
            None => f.write_str("none")?,
        }

        f.write_str(",bindings=")?;
        for (i, binding) in self.bindings.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{binding}")?;
        }

        f.write_str(",messages=")?;
        for (i, count) in self.messages.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{count}")?;
        }

        let mut first = true;
        for kind in FailureKind::ALL {
            let count = self.failures[kind.index()];
            if count == 0 {
                continue;
            }
            f.write_str(if first { ",failures=" } else { ";" })?;
            first = false;
            write!(f, "{kind}:{count}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = PunchCounters::new();
        counters.record_message(MessageKind::BindRequest);
        counters.record_message(MessageKind::BindRequest);
        counters.record_message(MessageKind::CloseRequest);
        counters.record_failure(FailureKind::Timeout);
        counters.record_punch_sent(true);
        counters.record_punch_sent(false);
        counters.record_punch_brokered(true);

        assert_eq!(counters.messages(MessageKind::BindRequest), 2);
        assert_eq!(counters.messages(MessageKind::CloseRequest), 1);
        assert_eq!(counters.messages(MessageKind::PunchRequest), 0);
        assert_eq!(counters.failures(FailureKind::Timeout), 1);

        let mut snapshot = StatsSnapshot::default();
        counters.fill(&mut snapshot);
        assert_eq!(snapshot.punch_send_ok, 1);
        assert_eq!(snapshot.punch_send_fail, 1);
        assert_eq!(snapshot.punch_recv_ok, 1);
        assert_eq!(snapshot.punch_recv_fail, 0);
        assert_eq!(snapshot.message_count(MessageKind::BindRequest), 2);
        assert_eq!(snapshot.failure_count(FailureKind::Timeout), 1);
    }

    #[test]
    fn test_display_idle() {
        let snapshot = StatsSnapshot::default();
        assert_eq!(
            snapshot.to_string(),
            "ok=<never>,fail=<never>,fc=0,punch:send=0/0:recv=0/0,rendezvous=none,bindings=,messages=0,0,0,0,0,0,0,0,0,0,0,0"
        );
    }

    #[test]
    fn test_display_active() {
        let mut snapshot = StatsSnapshot {
            last_ok_age: Some(Duration::from_millis(1500)),
            fail_count: 1,
            punch_send_ok: 3,
            rendezvous: Some("10.0.0.2".parse().unwrap()),
            ..StatsSnapshot::default()
        };
        snapshot.messages[MessageKind::BindRequest.index()] = 4;
        snapshot.failures[FailureKind::Denied.index()] = 2;

        let line = snapshot.to_string();
        assert!(line.starts_with("ok=1500,fail=<never>,fc=1,punch:send=3/0:recv=0/0"));
        assert!(line.contains("rendezvous=10.0.0.2"));
        assert!(line.contains("messages=4,0,"));
        assert!(line.ends_with(",failures=denied:2"));
    }
}
