//! Broker session state machine.
//!
//! A session walks Disconnected, Connecting, Subscribing, Live and back.
//! Subscription setup is all-or-nothing: every active handler gets a
//! subscribe request with its own receipt token, and if any receipt fails to
//! arrive within the budget the whole session is torn down silently; a
//! partially subscribed session is never left standing. At most one live
//! session exists at a time, exclusively owned by the control loop.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::broker::{BrokerConnection, BrokerConnector, BrokerError};
use crate::error::SessionError;
use crate::message::Message;
use crate::registry::HandlerRegistry;

/// Session lifecycle states, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection.
    Disconnected,
    /// Connect attempt in progress.
    Connecting,
    /// Connected, waiting for subscription receipts.
    Subscribing,
    /// Receiving frames.
    Live,
}

/// A live broker session.
pub struct BrokerSession {
    conn: Box<dyn BrokerConnection>,
    last_alive: Instant,
    pending_receipts: BTreeSet<String>,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("idle_for", &self.idle_for())
            .field("pending_receipts", &self.pending_receipts.len())
            .finish_non_exhaustive()
    }
}

impl BrokerSession {
    /// Connects and subscribes every active handler, or tears everything
    /// down and reports why.
    ///
    /// On a connect failure the caller must wait the connect cooldown before
    /// retrying. On a subscribe failure the connection has already been
    /// closed; zero subscriptions survive the attempt.
    pub fn establish(
        connector: &dyn BrokerConnector,
        uri: &str,
        registry: &HandlerRegistry,
        connect_timeout: Duration,
        receipt_timeout: Duration,
    ) -> Result<Self, SessionError> {
        tracing::debug!(uri, state = ?SessionState::Connecting, "connecting");
        let conn = connector
            .connect(uri, connect_timeout)
            .map_err(|source| SessionError::Connect {
                uri: uri.to_string(),
                source,
            })?;

        let mut session = Self {
            conn,
            last_alive: Instant::now(),
            pending_receipts: BTreeSet::new(),
        };

        tracing::debug!(uri, state = ?SessionState::Subscribing, "subscribing handlers");
        for entry in registry.active_entries() {
            let receipt = Uuid::new_v4().as_simple().to_string();
            if let Err(e) = session.conn.subscribe(
                &entry.options.destination,
                &entry.options.headers,
                &receipt,
            ) {
                session.teardown_silently();
                return Err(SessionError::Subscribe {
                    message: format!("subscribe for '{}' failed: {e}", entry.name),
                });
            }
            session.pending_receipts.insert(receipt);
        }

        if let Err(e) = session.await_pending_receipts(receipt_timeout) {
            session.teardown_silently();
            return Err(e);
        }

        tracing::info!(uri, handlers = registry.active_entries().count(), "session live");
        session.last_alive = Instant::now();
        Ok(session)
    }

    /// Waits until every pending receipt has arrived or the budget runs out.
    fn await_pending_receipts(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;
        while !self.pending_receipts.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Subscribe {
                    message: format!(
                        "{} subscription receipt(s) missing after {timeout:?}",
                        self.pending_receipts.len()
                    ),
                });
            }
            let arrived = self
                .conn
                .wait_for_receipts(remaining)
                .map_err(|e| SessionError::Subscribe {
                    message: format!("receipt wait failed: {e}"),
                })?;
            for receipt in arrived {
                self.pending_receipts.remove(&receipt);
            }
        }
        Ok(())
    }

    fn teardown_silently(&mut self) {
        if let Err(e) = self.conn.disconnect() {
            tracing::debug!(error = %e, "silent disconnect failed");
        }
    }

    /// Waits up to `timeout` for inbound frames, refreshing the liveness
    /// clock when anything arrives.
    pub fn wait_for_frames(&mut self, timeout: Duration) -> Result<Vec<Message>, BrokerError> {
        let frames = self.conn.wait_for_frames(timeout)?;
        if !frames.is_empty() {
            self.last_alive = Instant::now();
        }
        Ok(frames)
    }

    /// Acknowledges a frame.
    pub fn ack(&mut self, message_id: &str) -> Result<(), BrokerError> {
        self.conn.ack(message_id)
    }

    /// Marks the connection as recently alive.
    pub fn note_activity(&mut self) {
        self.last_alive = Instant::now();
    }

    /// How long since the last confirmed inbound activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_alive.elapsed()
    }

    /// Best-effort unsubscribe for a deactivated handler; failure is logged,
    /// never fatal.
    pub fn unsubscribe_quietly(&mut self, id: &str) {
        if let Err(e) = self.conn.unsubscribe(id) {
            tracing::warn!(subscription = id, error = %e, "unsubscribe failed, ignoring");
        }
    }

    /// Exclusive access to the underlying connection for the engines.
    pub fn conn_mut(&mut self) -> &mut dyn BrokerConnection {
        self.conn.as_mut()
    }

    /// Graceful teardown: tell the broker goodbye, then drop.
    pub fn disconnect_graceful(mut self) {
        tracing::debug!(state = ?SessionState::Disconnected, "graceful disconnect");
        self.teardown_silently();
    }

    /// Abrupt teardown: the connection is already suspect, skip the goodbye.
    pub fn drop_abrupt(self) {
        tracing::debug!(state = ?SessionState::Disconnected, "abrupt disconnect");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::broker::loopback::BrokerOp;
    use crate::broker::LoopbackBroker;
    use crate::registry::{HandlerRegistry, LogHandler, ScoringPolicy, SubscribeOptions};

    const CONNECT: Duration = Duration::from_millis(50);
    const RECEIPTS: Duration = Duration::from_millis(50);

    fn registry(names: &[&str]) -> HandlerRegistry {
        let mut reg = HandlerRegistry::new(ScoringPolicy::default());
        for name in names {
            let mut options = SubscribeOptions::for_destination(format!("/queue/{name}"));
            options.headers.insert("id", *name);
            reg.register(*name, options, Arc::new(LogHandler)).unwrap();
        }
        reg
    }

    #[test]
    fn test_establish_subscribes_every_active_handler() {
        let broker = LoopbackBroker::new();
        let reg = registry(&["alpha", "beta"]);

        let session =
            BrokerSession::establish(&broker, "loopback://", &reg, CONNECT, RECEIPTS).unwrap();
        assert_eq!(broker.subscription_count(), 2);
        assert!(session.idle_for() < Duration::from_secs(1));

        let subs: Vec<BrokerOp> = broker
            .ops()
            .into_iter()
            .filter(|op| matches!(op, BrokerOp::Subscribe { .. }))
            .collect();
        assert_eq!(subs.len(), 2);
    }

    #[test]
    fn test_inactive_handlers_are_not_subscribed() {
        let broker = LoopbackBroker::new();
        let mut reg = registry(&["alpha", "beta"]);
        reg.deactivate("alpha");

        BrokerSession::establish(&broker, "loopback://", &reg, CONNECT, RECEIPTS).unwrap();
        assert_eq!(broker.subscription_count(), 1);
    }

    #[test]
    fn test_missing_receipts_abort_the_whole_session() {
        let broker = LoopbackBroker::new();
        broker.withhold_receipts(true);
        let reg = registry(&["alpha", "beta"]);

        let err = BrokerSession::establish(&broker, "loopback://", &reg, CONNECT, RECEIPTS)
            .unwrap_err();
        assert!(matches!(err, SessionError::Subscribe { .. }));

        // Silent disconnect ran and nothing is left subscribed.
        assert_eq!(broker.subscription_count(), 0);
        assert_eq!(broker.ops().last(), Some(&BrokerOp::Disconnect));
    }

    #[test]
    fn test_connect_failure_is_reported_as_such() {
        let broker = LoopbackBroker::new();
        broker.fail_next_connects(1);
        let reg = registry(&["alpha"]);

        let err = BrokerSession::establish(&broker, "loopback://", &reg, CONNECT, RECEIPTS)
            .unwrap_err();
        assert!(matches!(err, SessionError::Connect { .. }));
    }

    #[test]
    fn test_frames_refresh_liveness() {
        let broker = LoopbackBroker::new();
        let reg = registry(&["alpha"]);
        let mut session =
            BrokerSession::establish(&broker, "loopback://", &reg, CONNECT, RECEIPTS).unwrap();

        broker.inject_frame(Message::new(crate::message::Headers::new(), vec![]));
        let frames = session.wait_for_frames(Duration::from_millis(10)).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(session.idle_for() < Duration::from_millis(100));
    }
}
