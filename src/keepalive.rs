//! Keepalive probe for silently dead connections.
//!
//! A broker connection can die without an I/O error ever surfacing; the
//! relay would sit in its receive loop forever hearing nothing. Once the
//! configured idle interval elapses with no inbound activity, the monitor
//! probes liveness with a throwaway transaction: begin with a receipt, wait
//! briefly, abort. The abort keeps the probe free of broker-visible side
//! effects.

use std::time::Duration;

use uuid::Uuid;

use crate::session::BrokerSession;

/// Probe result for the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not idle long enough; nothing was probed.
    Skip,
    /// Receipt arrived; the connection is alive.
    Alive,
    /// No receipt past the idle threshold; tear down gracefully.
    Dead,
    /// The broker errored mid-probe; tear down abruptly, the connection is
    /// already suspect.
    Broken,
}

/// Periodic liveness prober, run once per control-loop iteration.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveMonitor {
    interval: Duration,
    receipt_wait: Duration,
}

impl KeepaliveMonitor {
    /// Creates a monitor probing after `interval` of silence, waiting up to
    /// `receipt_wait` for the probe receipt.
    #[must_use]
    pub const fn new(interval: Duration, receipt_wait: Duration) -> Self {
        Self {
            interval,
            receipt_wait,
        }
    }

    /// Checks connection liveness, probing only when idle long enough.
    pub fn check(&self, session: &mut BrokerSession) -> Verdict {
        if session.idle_for() < self.interval {
            return Verdict::Skip;
        }

        let tx_id = format!("probe-{}", Uuid::new_v4().as_simple());
        let receipt = Uuid::new_v4().as_simple().to_string();

        tracing::debug!(idle = ?session.idle_for(), "probing connection liveness");

        if let Err(e) = session.conn_mut().begin_transaction(&tx_id, Some(&receipt)) {
            tracing::warn!(error = %e, "keepalive probe could not begin transaction");
            return Verdict::Broken;
        }

        let arrived = match session.conn_mut().wait_for_receipts(self.receipt_wait) {
            Ok(arrived) => arrived,
            Err(e) => {
                tracing::warn!(error = %e, "keepalive receipt wait failed");
                return Verdict::Broken;
            }
        };

        if let Err(e) = session.conn_mut().abort_transaction(&tx_id) {
            tracing::warn!(error = %e, "keepalive probe could not abort transaction");
            return Verdict::Broken;
        }

        if arrived.iter().any(|r| *r == receipt) {
            session.note_activity();
            Verdict::Alive
        } else {
            tracing::warn!(idle = ?session.idle_for(), "no probe receipt, connection presumed dead");
            Verdict::Dead
        }
    }
}
