//! The relay control loop.
//!
//! Single-threaded and cooperative: one iteration waits briefly for inbound
//! frames, dispatches them, runs the keepalive check, drains the outbound
//! queue, and observes the abort flag and quit file at the loop boundaries.
//! All state travels in an explicit [`RelayContext`]; there are no
//! process-wide globals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::broker::BrokerConnector;
use crate::config::{BrokerTargets, RelayConfig};
use crate::dispatch::dispatch;
use crate::envelope::ErrorSink;
use crate::error::{RelayError, RelayResult};
use crate::keepalive::{KeepaliveMonitor, Verdict};
use crate::outbound::drain_once;
use crate::queue::DurableQueue;
use crate::registry::HandlerRegistry;
use crate::session::BrokerSession;

/// Everything the control loop and engines need, threaded explicitly.
pub struct RelayContext {
    /// Named handlers with health state.
    pub registry: HandlerRegistry,
    /// The durable outbound queue.
    pub queue: Box<dyn DurableQueue>,
    /// The durable error sink.
    pub sink: Box<dyn ErrorSink>,
    /// Opens broker connections.
    pub connector: Box<dyn BrokerConnector>,
    /// Broker URIs to rotate through on reconnect.
    pub targets: BrokerTargets,
    /// Runtime configuration.
    pub config: RelayConfig,
    /// Cooperative abort flag, set from the signal handler.
    pub abort: Arc<AtomicBool>,
}

impl std::fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayContext")
            .field("handlers", &self.registry.len())
            .field("targets", &self.targets.len())
            .finish_non_exhaustive()
    }
}

/// Why the live loop handed control back.
enum LoopExit {
    /// Session ended; reconnect after the cooldown.
    Reconnect,
    /// Graceful quit was requested.
    Quit,
    /// Every handler is deactivated.
    Exhausted,
}

/// Runs the relay until a graceful quit, an abort, or a fatal error.
///
/// Reconnects indefinitely with the fixed cooldown while any handler is
/// still active; returns [`RelayError::FatalExhaustion`] once none are.
pub fn run(ctx: &mut RelayContext) -> RelayResult<()> {
    ctx.config.validate()?;
    let keepalive = KeepaliveMonitor::new(ctx.config.ping_interval, ctx.config.receipt_wait);

    loop {
        if ctx.abort.load(Ordering::Relaxed) {
            tracing::info!("abort requested before connect, exiting");
            return Ok(());
        }
        if quit_requested(&ctx.config) {
            tracing::info!("quit requested, exiting");
            return Ok(());
        }
        if !ctx.registry.any_active() {
            return Err(RelayError::FatalExhaustion);
        }

        let uri = ctx.targets.next().to_string();
        let session = match BrokerSession::establish(
            ctx.connector.as_ref(),
            &uri,
            &ctx.registry,
            ctx.config.connect_timeout,
            ctx.config.io_timeout,
        ) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(uri = %uri, error = %e, "session setup failed, cooling down");
                sleep_with_abort(ctx.config.connect_cooldown, &ctx.abort);
                continue;
            }
        };

        match live_loop(ctx, session, &keepalive) {
            LoopExit::Quit => return Ok(()),
            LoopExit::Exhausted => return Err(RelayError::FatalExhaustion),
            LoopExit::Reconnect => {
                sleep_with_abort(ctx.config.connect_cooldown, &ctx.abort);
            }
        }
    }
}

/// One live session: receive, dispatch, keepalive, drain, repeat.
fn live_loop(
    ctx: &mut RelayContext,
    mut session: BrokerSession,
    keepalive: &KeepaliveMonitor,
) -> LoopExit {
    loop {
        if ctx.abort.load(Ordering::Relaxed) {
            // Abort still gets best-effort cleanup.
            tracing::info!("abort requested, disconnecting");
            session.disconnect_graceful();
            return LoopExit::Quit;
        }
        if quit_requested(&ctx.config) {
            tracing::info!("quit requested, disconnecting");
            session.disconnect_graceful();
            return LoopExit::Quit;
        }
        if !ctx.registry.any_active() {
            session.disconnect_graceful();
            return LoopExit::Exhausted;
        }

        let frames = match session.wait_for_frames(ctx.config.io_timeout) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(error = %e, "frame wait failed, reconnecting");
                session.drop_abrupt();
                return LoopExit::Reconnect;
            }
        };

        for msg in &frames {
            let report = dispatch(
                &mut session,
                &mut ctx.registry,
                ctx.sink.as_ref(),
                &ctx.config,
                msg,
            );
            if let Some(name) = report.deactivated {
                tracing::warn!(handler = %name, "handler deactivated during dispatch");
            }
        }

        match keepalive.check(&mut session) {
            Verdict::Skip | Verdict::Alive => {}
            Verdict::Dead => {
                session.disconnect_graceful();
                return LoopExit::Reconnect;
            }
            Verdict::Broken => {
                session.drop_abrupt();
                return LoopExit::Reconnect;
            }
        }

        let stats = drain_once(
            ctx.queue.as_ref(),
            session.conn_mut(),
            ctx.sink.as_ref(),
            &ctx.config,
            ctx.config.drain_budget,
        );
        if stats.sent + stats.requeued + stats.dead_lettered > 0 {
            tracing::debug!(?stats, "outbound drain pass");
        }
    }
}

/// Checks the external quit trigger, once per loop iteration.
fn quit_requested(cfg: &RelayConfig) -> bool {
    cfg.quit_file.as_ref().is_some_and(|p| p.exists())
}

/// Sleeps out the cooldown in slices so an abort cuts it short.
fn sleep_with_abort(cooldown: Duration, abort: &AtomicBool) {
    let deadline = Instant::now() + cooldown;
    while Instant::now() < deadline {
        if abort.load(Ordering::Relaxed) {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(remaining.min(Duration::from_millis(100)));
    }
}
