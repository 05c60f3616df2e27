//! Inbound dispatch engine.
//!
//! Routes one broker frame to its handler, applies the handler's time
//! budget, updates health, and files anything unhandled to the error sink.
//! Frames are acked whatever the outcome, with one deliberate exception: a
//! frame addressed to a registered-but-inactive handler is dropped without an
//! ack and without filing, because the handler may be mid-deactivation and
//! the broker will redeliver.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError};

use crate::config::RelayConfig;
use crate::envelope::{file_envelope, Component, ErrorEnvelope, ErrorSink};
use crate::message::{Message, HDR_TIMESTAMP};
use crate::registry::{Handler, HandlerRegistry, HandlerReply, HandlerStatus, Severity};
use crate::session::BrokerSession;

/// What happened to one dispatched frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler processed it successfully.
    Handled,
    /// Nothing could process it; filed to the error sink.
    Unhandled,
    /// Addressed to an inactive handler; dropped silently.
    Dropped,
    /// Self-addressed probe; echoed to its reply-to destination.
    ProbeEchoed,
}

/// Per-frame dispatch report for the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// How the frame ended up.
    pub outcome: DispatchOutcome,
    /// Whether an ack was issued (or attempted).
    pub acked: bool,
    /// Handler that was deactivated by this frame, if any. The control loop
    /// must re-check `any_active` when this is set.
    pub deactivated: Option<String>,
}

/// How a time-budgeted handler invocation ended.
enum Invocation {
    Replied(HandlerReply),
    TimedOut,
    Crashed,
}

/// Runs the handler on its own thread with a bounded wait.
///
/// On timeout the worker is left running detached; the relay only stops
/// waiting for it. A panicking handler closes the channel and is reported as
/// a crash.
fn invoke_with_budget(
    handler: Arc<dyn Handler>,
    msg: &Message,
    budget: Duration,
) -> Invocation {
    let (tx, rx) = bounded::<HandlerReply>(1);
    let headers = msg.headers().clone();
    let body = msg.body().to_vec();

    let spawned = thread::Builder::new()
        .name("monrelay-handler".to_string())
        .spawn(move || {
            let reply = handler.handle(&headers, &body);
            let _ = tx.send(reply);
        });
    if spawned.is_err() {
        return Invocation::Crashed;
    }

    match rx.recv_timeout(budget) {
        Ok(reply) => Invocation::Replied(reply),
        Err(RecvTimeoutError::Timeout) => Invocation::TimedOut,
        Err(RecvTimeoutError::Disconnected) => Invocation::Crashed,
    }
}

/// Dispatches one frame, returning what the control loop needs to know.
pub fn dispatch(
    session: &mut BrokerSession,
    registry: &mut HandlerRegistry,
    sink: &dyn ErrorSink,
    cfg: &RelayConfig,
    msg: &Message,
) -> DispatchReport {
    let Some(sub) = msg.subscription().map(str::to_string) else {
        file_unhandled(sink, cfg, msg, "missing subscription header");
        return acked(session, msg, DispatchOutcome::Unhandled, None);
    };

    let Some(entry) = registry.lookup(&sub) else {
        file_unhandled(sink, cfg, msg, "unexpected subscription header");
        return acked(session, msg, DispatchOutcome::Unhandled, None);
    };

    if !entry.active {
        // Mid-deactivation window: no ack, no filing. The broker may
        // redeliver; that is a known limitation, not a bug to paper over.
        tracing::debug!(handler = %sub, "frame for inactive handler dropped");
        return DispatchReport {
            outcome: DispatchOutcome::Dropped,
            acked: false,
            deactivated: None,
        };
    }

    if msg.is_probe_for(&cfg.client_id) {
        echo_probe(session, msg);
        return acked(session, msg, DispatchOutcome::ProbeEchoed, None);
    }

    let handler = Arc::clone(&entry.handler);
    let invocation = invoke_with_budget(handler, msg, cfg.handler_timeout);

    let (outcome, change) = match invocation {
        Invocation::Replied(HandlerReply {
            status: HandlerStatus::Success,
            ..
        }) => {
            registry.record_success(&sub);
            (DispatchOutcome::Handled, None)
        }
        Invocation::Replied(HandlerReply {
            status: HandlerStatus::Warning,
            reason,
        }) => {
            let reason = reason.unwrap_or_else(|| "handler warning".to_string());
            file_unhandled(sink, cfg, msg, &reason);
            let change = registry.record_failure(&sub, Severity::Minor);
            (DispatchOutcome::Unhandled, Some(change))
        }
        Invocation::Replied(HandlerReply {
            status: HandlerStatus::Error,
            reason,
        }) => {
            let reason = reason.unwrap_or_else(|| "handler error".to_string());
            file_unhandled(sink, cfg, msg, &reason);
            let change = registry.record_failure(&sub, Severity::Major);
            (DispatchOutcome::Unhandled, Some(change))
        }
        Invocation::TimedOut => {
            let reason = format!("handler timed out after {:?}", cfg.handler_timeout);
            tracing::warn!(handler = %sub, %reason, "handler timeout");
            file_unhandled(sink, cfg, msg, &reason);
            let change = registry.record_failure(&sub, Severity::Minor);
            (DispatchOutcome::Unhandled, Some(change))
        }
        Invocation::Crashed => {
            let reason = "handler crashed during invocation";
            tracing::error!(handler = %sub, "handler crashed");
            file_unhandled(sink, cfg, msg, reason);
            let change = registry.record_failure(&sub, Severity::Major);
            (DispatchOutcome::Unhandled, Some(change))
        }
    };

    let deactivated = match change {
        Some(change) if change.deactivated => {
            // Best-effort: the broker can keep sending until this lands.
            session.unsubscribe_quietly(&sub);
            Some(sub)
        }
        _ => None,
    };

    acked(session, msg, outcome, deactivated)
}

/// Echoes a self-addressed probe back to its reply-to destination with a
/// fresh timestamp, bypassing the handler entirely.
fn echo_probe(session: &mut BrokerSession, msg: &Message) {
    let Some(reply_to) = msg.reply_to().map(str::to_string) else {
        tracing::warn!("probe frame has no reply-to destination");
        return;
    };

    let mut headers = msg.headers().clone();
    headers.insert(HDR_TIMESTAMP, Utc::now().timestamp().to_string());

    if let Err(e) = session
        .conn_mut()
        .send(&reply_to, &headers, msg.body(), None)
    {
        tracing::warn!(destination = %reply_to, error = %e, "probe echo failed");
    }
    session.note_activity();
}

fn file_unhandled(sink: &dyn ErrorSink, cfg: &RelayConfig, msg: &Message, reason: &str) {
    let envelope = ErrorEnvelope::new(&cfg.host, Component::Dispatch, reason, msg.clone());
    file_envelope(sink, &cfg.error_destination, &envelope);
}

fn acked(
    session: &mut BrokerSession,
    msg: &Message,
    outcome: DispatchOutcome,
    deactivated: Option<String>,
) -> DispatchReport {
    match msg.message_id() {
        Some(id) => {
            if let Err(e) = session.ack(id) {
                tracing::warn!(message_id = id, error = %e, "ack failed, continuing");
            }
        }
        None => tracing::debug!("frame has no message id, nothing to ack"),
    }
    DispatchReport {
        outcome,
        acked: true,
        deactivated,
    }
}
