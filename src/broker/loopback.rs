//! In-process broker implementation.
//!
//! Messages sent to a subscribed destination are delivered straight back as
//! inbound frames, which makes a single relay process fully exercisable with
//! no broker on the network. Tests use the scripting knobs (withheld receipts,
//! scheduled connect/send failures) to drive the failure paths; the demo
//! daemon runs against it unmodified.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::message::{Headers, Message, HDR_MESSAGE_ID, HDR_SUBSCRIPTION};

use super::{BrokerConnection, BrokerConnector, BrokerError};

/// One operation observed by the loopback broker, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    /// A connection was opened.
    Connect,
    /// A subscription was set up.
    Subscribe {
        /// Destination subscribed to.
        destination: String,
        /// Subscription id (from the `id` header).
        id: String,
    },
    /// A subscription was removed.
    Unsubscribe {
        /// Subscription id.
        id: String,
    },
    /// A message was sent.
    Send {
        /// Destination sent to.
        destination: String,
    },
    /// A frame was acked.
    Ack {
        /// The acked message id.
        message_id: String,
    },
    /// A transaction was begun.
    Begin {
        /// Transaction id.
        id: String,
    },
    /// A transaction was aborted.
    Abort {
        /// Transaction id.
        id: String,
    },
    /// The connection was closed gracefully.
    Disconnect,
}

#[derive(Debug, Default)]
struct State {
    connected: bool,
    subscriptions: BTreeMap<String, String>,
    inbox: VecDeque<Message>,
    receipts_ready: VecDeque<String>,
    sent: Vec<(String, Headers, Vec<u8>)>,
    ops: Vec<BrokerOp>,
    next_message_id: u64,
    // Scripting knobs.
    withhold_receipts: bool,
    fail_connects: u32,
    fail_sends: u32,
    fail_transactions: bool,
}

impl State {
    fn grant_receipt(&mut self, receipt_id: &str) {
        if !self.withhold_receipts {
            self.receipts_ready.push_back(receipt_id.to_string());
        }
    }

    fn deliver_loopback(&mut self, destination: &str, headers: &Headers, body: &[u8]) {
        let Some((sub_id, _)) = self
            .subscriptions
            .iter()
            .find(|(_, dest)| dest.as_str() == destination)
        else {
            return;
        };
        let sub_id = sub_id.clone();

        self.next_message_id += 1;
        let mut frame_headers = headers.clone();
        frame_headers.insert(HDR_SUBSCRIPTION, sub_id);
        frame_headers.insert(HDR_MESSAGE_ID, format!("loop-{}", self.next_message_id));
        self.inbox.push_back(Message::new(frame_headers, body.to_vec()));
    }
}

/// In-process broker; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<State>>,
}

impl LoopbackBroker {
    /// Creates a fresh broker with no subscriptions and an empty inbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The loopback state is only poisoned if a test panicked mid-call.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queues a frame for delivery on the next `wait_for_frames`.
    pub fn inject_frame(&self, msg: Message) {
        self.lock().inbox.push_back(msg);
    }

    /// Drains and returns everything sent through the broker so far.
    pub fn take_sent(&self) -> Vec<(String, Headers, Vec<u8>)> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Snapshot of observed operations.
    #[must_use]
    pub fn ops(&self) -> Vec<BrokerOp> {
        self.lock().ops.clone()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// When set, receipts are silently dropped instead of granted.
    pub fn withhold_receipts(&self, withhold: bool) {
        self.lock().withhold_receipts = withhold;
    }

    /// Makes the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().fail_connects = n;
    }

    /// Makes the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.lock().fail_sends = n;
    }

    /// When set, transaction begin/abort fail with an I/O error.
    pub fn fail_transactions(&self, fail: bool) {
        self.lock().fail_transactions = fail;
    }
}

impl BrokerConnector for LoopbackBroker {
    fn connect(
        &self,
        _uri: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BrokerError::Io("scripted connect failure".to_string()));
        }
        state.connected = true;
        state.ops.push(BrokerOp::Connect);
        drop(state);

        Ok(Box::new(LoopbackConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct LoopbackConnection {
    state: Arc<Mutex<State>>,
}

impl LoopbackConnection {
    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Io("poisoned loopback state".to_string()))
    }

    fn lock_connected(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        let state = self.lock()?;
        if state.connected {
            Ok(state)
        } else {
            Err(BrokerError::Closed)
        }
    }
}

impl BrokerConnection for LoopbackConnection {
    fn subscribe(
        &mut self,
        destination: &str,
        headers: &Headers,
        receipt_id: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock_connected()?;
        let id = headers.get("id").unwrap_or(receipt_id).to_string();
        state
            .subscriptions
            .insert(id.clone(), destination.to_string());
        state.ops.push(BrokerOp::Subscribe {
            destination: destination.to_string(),
            id,
        });
        state.grant_receipt(receipt_id);
        Ok(())
    }

    fn send(
        &mut self,
        destination: &str,
        headers: &Headers,
        body: &[u8],
        receipt_id: Option<&str>,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock_connected()?;
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(BrokerError::Io("scripted send failure".to_string()));
        }
        state
            .sent
            .push((destination.to_string(), headers.clone(), body.to_vec()));
        state.ops.push(BrokerOp::Send {
            destination: destination.to_string(),
        });
        if let Some(receipt) = receipt_id {
            state.grant_receipt(receipt);
        }
        state.deliver_loopback(destination, headers, body);
        Ok(())
    }

    fn ack(&mut self, message_id: &str) -> Result<(), BrokerError> {
        let mut state = self.lock_connected()?;
        state.ops.push(BrokerOp::Ack {
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    fn unsubscribe(&mut self, id: &str) -> Result<(), BrokerError> {
        let mut state = self.lock_connected()?;
        state.subscriptions.remove(id);
        state.ops.push(BrokerOp::Unsubscribe { id: id.to_string() });
        Ok(())
    }

    fn begin_transaction(
        &mut self,
        id: &str,
        receipt_id: Option<&str>,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock_connected()?;
        if state.fail_transactions {
            return Err(BrokerError::Io("scripted transaction failure".to_string()));
        }
        state.ops.push(BrokerOp::Begin { id: id.to_string() });
        if let Some(receipt) = receipt_id {
            state.grant_receipt(receipt);
        }
        Ok(())
    }

    fn abort_transaction(&mut self, id: &str) -> Result<(), BrokerError> {
        let mut state = self.lock_connected()?;
        if state.fail_transactions {
            return Err(BrokerError::Io("scripted transaction failure".to_string()));
        }
        state.ops.push(BrokerOp::Abort { id: id.to_string() });
        Ok(())
    }

    fn wait_for_receipts(&mut self, timeout: Duration) -> Result<Vec<String>, BrokerError> {
        let mut receipts: Vec<String> = self.lock_connected()?.receipts_ready.drain(..).collect();
        if receipts.is_empty() && !timeout.is_zero() {
            thread::sleep(timeout.min(Duration::from_millis(20)));
            receipts = self.lock_connected()?.receipts_ready.drain(..).collect();
        }
        Ok(receipts)
    }

    fn wait_for_frames(&mut self, timeout: Duration) -> Result<Vec<Message>, BrokerError> {
        let mut frames: Vec<Message> = self.lock_connected()?.inbox.drain(..).collect();
        if frames.is_empty() && !timeout.is_zero() {
            thread::sleep(timeout.min(Duration::from_millis(20)));
            frames = self.lock_connected()?.inbox.drain(..).collect();
        }
        Ok(frames)
    }

    fn disconnect(&mut self) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        state.connected = false;
        state.subscriptions.clear();
        state.ops.push(BrokerOp::Disconnect);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(broker: &LoopbackBroker) -> Box<dyn BrokerConnection> {
        broker
            .connect("loopback://", Duration::from_millis(10))
            .unwrap()
    }

    #[test]
    fn test_send_to_subscribed_destination_loops_back() {
        let broker = LoopbackBroker::new();
        let mut conn = connect(&broker);

        let mut sub_headers = Headers::new();
        sub_headers.insert("id", "cpu");
        conn.subscribe("/queue/cpu", &sub_headers, "r-1").unwrap();

        conn.send("/queue/cpu", &Headers::new(), b"load 0.4", None)
            .unwrap();

        let frames = conn.wait_for_frames(Duration::ZERO).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].subscription(), Some("cpu"));
        assert!(frames[0].message_id().is_some());
        assert_eq!(frames[0].body(), b"load 0.4");
    }

    #[test]
    fn test_send_to_unsubscribed_destination_is_recorded_not_delivered() {
        let broker = LoopbackBroker::new();
        let mut conn = connect(&broker);

        conn.send("/queue/elsewhere", &Headers::new(), b"x", None)
            .unwrap();

        assert!(conn.wait_for_frames(Duration::ZERO).unwrap().is_empty());
        assert_eq!(broker.take_sent().len(), 1);
    }

    #[test]
    fn test_receipts_granted_and_withheld() {
        let broker = LoopbackBroker::new();
        let mut conn = connect(&broker);

        conn.subscribe("/queue/a", &Headers::new(), "r-1").unwrap();
        let got = conn.wait_for_receipts(Duration::ZERO).unwrap();
        assert_eq!(got, vec!["r-1".to_string()]);

        broker.withhold_receipts(true);
        conn.subscribe("/queue/b", &Headers::new(), "r-2").unwrap();
        assert!(conn.wait_for_receipts(Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn test_scripted_failures() {
        let broker = LoopbackBroker::new();
        broker.fail_next_connects(1);
        assert!(broker
            .connect("loopback://", Duration::from_millis(10))
            .is_err());
        let mut conn = connect(&broker);

        broker.fail_next_sends(1);
        assert!(conn.send("/queue/a", &Headers::new(), b"", None).is_err());
        assert!(conn.send("/queue/a", &Headers::new(), b"", None).is_ok());

        broker.fail_transactions(true);
        assert!(conn.begin_transaction("t-1", Some("r-1")).is_err());
    }

    #[test]
    fn test_operations_fail_after_disconnect() {
        let broker = LoopbackBroker::new();
        let mut conn = connect(&broker);
        conn.disconnect().unwrap();

        assert!(matches!(conn.ack("m-1"), Err(BrokerError::Closed)));
        assert_eq!(broker.subscription_count(), 0);
    }
}
