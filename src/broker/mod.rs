//! Broker client adapter contract.
//!
//! The wire protocol is someone else's problem: the relay only needs the
//! operations below, each with an explicit time budget where it could block.
//! Implementations wrap a concrete pub/sub client; the crate ships
//! [`LoopbackBroker`], an in-process implementation used by the tests and the
//! demo daemon.

pub mod loopback;

pub use loopback::LoopbackBroker;

use std::time::Duration;

use thiserror::Error;

use crate::message::{Headers, Message};

/// Errors at the broker adapter boundary.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The underlying transport failed.
    #[error("broker I/O error: {0}")]
    Io(String),

    /// A bounded operation exceeded its time budget.
    #[error("broker operation '{operation}' timed out")]
    Timeout {
        /// Which operation ran out of budget.
        operation: &'static str,
    },

    /// The broker replied with something the client could not accept.
    #[error("broker protocol error: {0}")]
    Protocol(String),

    /// The connection is no longer usable.
    #[error("broker connection closed")]
    Closed,
}

/// Opens broker connections.
pub trait BrokerConnector: Send {
    /// Connects to the broker at `uri` within the time budget.
    fn connect(&self, uri: &str, timeout: Duration)
        -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// One live broker connection.
///
/// Exclusively owned by the session state machine; never shared. Every
/// potentially blocking call takes an explicit timeout and reports exceeding
/// it as a distinguishable outcome instead of blocking indefinitely.
pub trait BrokerConnection: Send {
    /// Subscribes to a destination, requesting a receipt for the setup.
    fn subscribe(
        &mut self,
        destination: &str,
        headers: &Headers,
        receipt_id: &str,
    ) -> Result<(), BrokerError>;

    /// Sends a message, optionally requesting a delivery receipt.
    fn send(
        &mut self,
        destination: &str,
        headers: &Headers,
        body: &[u8],
        receipt_id: Option<&str>,
    ) -> Result<(), BrokerError>;

    /// Acknowledges a delivered frame.
    fn ack(&mut self, message_id: &str) -> Result<(), BrokerError>;

    /// Removes a subscription.
    fn unsubscribe(&mut self, id: &str) -> Result<(), BrokerError>;

    /// Begins a transaction, optionally requesting a receipt for it.
    fn begin_transaction(&mut self, id: &str, receipt_id: Option<&str>)
        -> Result<(), BrokerError>;

    /// Aborts a transaction, discarding it broker-side.
    fn abort_transaction(&mut self, id: &str) -> Result<(), BrokerError>;

    /// Waits up to `timeout` and returns the receipt ids that arrived.
    fn wait_for_receipts(&mut self, timeout: Duration) -> Result<Vec<String>, BrokerError>;

    /// Waits up to `timeout` for inbound frames. An empty result is a normal
    /// timeout, not an error.
    fn wait_for_frames(&mut self, timeout: Duration) -> Result<Vec<Message>, BrokerError>;

    /// Closes the connection gracefully.
    fn disconnect(&mut self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time check: the adapter traits stay object-safe.
    fn _assert_connector_object_safe(_: &dyn BrokerConnector) {}
    fn _assert_connection_object_safe(_: &dyn BrokerConnection) {}

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::Timeout { operation: "send" };
        assert!(err.to_string().contains("send"));

        let err = BrokerError::Io("connection reset".to_string());
        assert!(err.to_string().contains("connection reset"));
    }
}
