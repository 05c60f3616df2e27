//! Outbound delivery engine.
//!
//! Drains the durable queue toward the broker with bounded retries. Each
//! entry is locked for the duration of its attempt (one in-flight send per
//! entry, ever), skipped while inside the failure cooldown, and dead-lettered
//! to the error sink once it has failed the maximum number of times. Locks
//! are released on every exit path, including the skips.

use chrono::Utc;
use uuid::Uuid;

use crate::broker::BrokerConnection;
use crate::config::RelayConfig;
use crate::envelope::{file_envelope, Component, ErrorEnvelope, ErrorSink};
use crate::message::{Message, HDR_DESTINATION};
use crate::queue::DurableQueue;

/// Counters from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Entries examined (locked and read).
    pub examined: usize,
    /// Entries delivered and removed.
    pub sent: usize,
    /// Entries that failed and were re-queued for a later pass.
    pub requeued: usize,
    /// Entries that exhausted their retries and were dead-lettered.
    pub dead_lettered: usize,
    /// Entries skipped because another consumer held the lock.
    pub skipped_locked: usize,
    /// Entries skipped inside the failure cooldown window.
    pub skipped_cooldown: usize,
}

/// Drains up to `budget` entries from the queue to the broker.
pub fn drain_once(
    queue: &dyn DurableQueue,
    conn: &mut dyn BrokerConnection,
    sink: &dyn ErrorSink,
    cfg: &RelayConfig,
    budget: usize,
) -> DrainStats {
    let mut stats = DrainStats::default();

    let ids = match queue.list() {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(error = %e, "queue list failed, skipping drain pass");
            return stats;
        }
    };

    for id in ids.into_iter().take(budget) {
        if !queue.lock(&id) {
            stats.skipped_locked += 1;
            continue;
        }

        let entry = match queue.read(&id) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(entry = %id, error = %e, "queue read failed");
                queue.unlock(&id);
                continue;
            }
        };
        stats.examined += 1;

        if let Some(last_failed) = entry.failure.last_failed {
            let since = Utc::now().signed_duration_since(last_failed);
            let cooldown = chrono::Duration::from_std(cfg.retry_cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
            if since < cooldown {
                queue.unlock(&id);
                stats.skipped_cooldown += 1;
                continue;
            }
        }

        match attempt_send(conn, &entry, cfg) {
            Ok(()) => {
                if let Err(e) = queue.remove(&id) {
                    tracing::warn!(entry = %id, error = %e, "could not remove delivered entry");
                }
                queue.unlock(&id);
                stats.sent += 1;
            }
            Err(reason) => {
                let mut updated = entry;
                updated.record_failure(reason.clone(), Utc::now());
                tracing::warn!(
                    entry = %id,
                    attempt = updated.failure.failed_count,
                    %reason,
                    "outbound delivery failed"
                );

                if updated.failure.failed_count >= cfg.max_delivery_failures {
                    let original = Message::new(updated.headers.clone(), updated.body.clone());
                    let envelope =
                        ErrorEnvelope::new(&cfg.host, Component::Delivery, reason, original);
                    file_envelope(sink, &cfg.error_destination, &envelope);
                    if let Err(e) = queue.remove(&id) {
                        tracing::warn!(entry = %id, error = %e, "could not remove dead-lettered entry");
                    }
                    stats.dead_lettered += 1;
                } else {
                    // Fresh id for the retry record, then drop the stale one.
                    let new_id = Uuid::new_v4().as_simple().to_string();
                    match queue.write(&new_id, &updated) {
                        Ok(()) => {
                            if let Err(e) = queue.remove(&id) {
                                tracing::warn!(entry = %id, error = %e, "could not remove stale entry");
                            }
                            stats.requeued += 1;
                        }
                        Err(e) => {
                            // Keep the old record rather than lose the entry.
                            tracing::warn!(entry = %id, error = %e, "could not re-queue failed entry");
                        }
                    }
                }
                queue.unlock(&id);
            }
        }
    }

    if queue.count() < cfg.purge_threshold {
        queue.purge_hint();
    }

    stats
}

/// One send attempt with a delivery receipt.
fn attempt_send(
    conn: &mut dyn BrokerConnection,
    entry: &crate::queue::QueueEntry,
    cfg: &RelayConfig,
) -> Result<(), String> {
    let Some(destination) = entry.headers.get(HDR_DESTINATION).map(str::to_string) else {
        return Err("missing destination header".to_string());
    };

    let receipt = Uuid::new_v4().as_simple().to_string();
    conn.send(&destination, &entry.headers, &entry.body, Some(&receipt))
        .map_err(|e| format!("send failed: {e}"))?;

    let arrived = conn
        .wait_for_receipts(cfg.receipt_wait)
        .map_err(|e| format!("receipt wait failed: {e}"))?;

    if arrived.iter().any(|r| *r == receipt) {
        Ok(())
    } else {
        Err(format!(
            "no delivery receipt within {:?}",
            cfg.receipt_wait
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::{BrokerConnector, LoopbackBroker};
    use crate::envelope::MemorySink;
    use crate::message::Headers;
    use crate::queue::{MemoryQueue, QueueEntry};

    fn test_config() -> RelayConfig {
        RelayConfig {
            receipt_wait: Duration::from_millis(10),
            retry_cooldown: Duration::ZERO,
            ..RelayConfig::default()
        }
    }

    fn entry(dest: &str) -> QueueEntry {
        let headers: Headers = [(HDR_DESTINATION, dest)].into_iter().collect();
        QueueEntry::new(headers, b"metric 1".to_vec())
    }

    struct Fixture {
        broker: LoopbackBroker,
        conn: Box<dyn crate::broker::BrokerConnection>,
        queue: MemoryQueue,
        sink: MemorySink,
        cfg: RelayConfig,
    }

    fn fixture() -> Fixture {
        let broker = LoopbackBroker::new();
        let conn = broker
            .connect("loopback://", Duration::from_millis(10))
            .unwrap();
        Fixture {
            broker,
            conn,
            queue: MemoryQueue::new(),
            sink: MemorySink::new(),
            cfg: test_config(),
        }
    }

    fn drain(fx: &mut Fixture, budget: usize) -> DrainStats {
        drain_once(&fx.queue, fx.conn.as_mut(), &fx.sink, &fx.cfg, budget)
    }

    #[test]
    fn test_successful_send_removes_entry() {
        let mut fx = fixture();
        let id = fx.queue.push(entry("/queue/metrics"));

        let stats = drain(&mut fx, 10);

        assert_eq!(stats.sent, 1);
        assert_eq!(fx.queue.count(), 0);
        assert!(!fx.queue.is_locked(&id));
        assert!(fx.sink.is_empty());
        assert_eq!(fx.broker.take_sent().len(), 1);
    }

    #[test]
    fn test_two_failures_then_success_never_dead_letters() {
        // An entry that recovers on its third attempt leaves cleanly.
        let mut fx = fixture();
        fx.queue.push(entry("/queue/metrics"));

        fx.broker.fail_next_sends(1);
        let stats = drain(&mut fx, 10);
        assert_eq!(stats.requeued, 1);

        fx.broker.fail_next_sends(1);
        let stats = drain(&mut fx, 10);
        assert_eq!(stats.requeued, 1);

        let id = &fx.queue.list().unwrap()[0];
        assert_eq!(fx.queue.read(id).unwrap().failure.failed_count, 2);

        let stats = drain(&mut fx, 10);
        assert_eq!(stats.sent, 1);
        assert_eq!(fx.queue.count(), 0);
        assert!(fx.sink.is_empty());
    }

    #[test]
    fn test_third_failure_dead_letters_with_final_reason() {
        let mut fx = fixture();
        fx.queue.push(entry("/queue/metrics"));

        for _ in 0..2 {
            fx.broker.fail_next_sends(1);
            drain(&mut fx, 10);
        }
        fx.broker.withhold_receipts(true);
        let stats = drain(&mut fx, 10);

        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(fx.queue.count(), 0);

        let records = fx.sink.take();
        assert_eq!(records.len(), 1);
        let env = ErrorEnvelope::from_bytes(&records[0].2).unwrap();
        assert_eq!(env.component, Component::Delivery);
        // The envelope carries the third attempt's reason, not the first's.
        assert!(env.reason.contains("no delivery receipt"));
        assert_eq!(env.original.body(), b"metric 1");
    }

    #[test]
    fn test_cooldown_window_skips_recent_failures() {
        let mut fx = fixture();
        fx.cfg.retry_cooldown = Duration::from_secs(300);

        let mut failed = entry("/queue/metrics");
        failed.record_failure("broker down", Utc::now());
        let id = fx.queue.push(failed);

        let stats = drain(&mut fx, 10);

        assert_eq!(stats.skipped_cooldown, 1);
        assert_eq!(stats.sent, 0);
        assert_eq!(fx.queue.count(), 1);
        assert!(!fx.queue.is_locked(&id));
        assert!(fx.broker.take_sent().is_empty());
    }

    #[test]
    fn test_entry_past_cooldown_is_retried() {
        let mut fx = fixture();
        fx.cfg.retry_cooldown = Duration::from_secs(300);

        let mut failed = entry("/queue/metrics");
        failed.record_failure(
            "broker down",
            Utc::now() - chrono::Duration::seconds(301),
        );
        fx.queue.push(failed);

        let stats = drain(&mut fx, 10);
        assert_eq!(stats.sent, 1);
    }

    #[test]
    fn test_locked_entry_is_skipped() {
        let mut fx = fixture();
        let id = fx.queue.push(entry("/queue/metrics"));
        assert!(fx.queue.lock(&id));

        let stats = drain(&mut fx, 10);

        assert_eq!(stats.skipped_locked, 1);
        assert_eq!(stats.examined, 0);
        assert_eq!(fx.queue.count(), 1);
    }

    #[test]
    fn test_budget_bounds_the_pass() {
        let mut fx = fixture();
        for _ in 0..3 {
            fx.queue.push(entry("/queue/metrics"));
        }

        let stats = drain(&mut fx, 2);
        assert_eq!(stats.sent, 2);
        assert_eq!(fx.queue.count(), 1);
    }

    #[test]
    fn test_missing_destination_counts_as_failure() {
        let mut fx = fixture();
        fx.queue.push(QueueEntry::new(Headers::new(), b"orphan".to_vec()));

        let stats = drain(&mut fx, 10);

        assert_eq!(stats.requeued, 1);
        let id = &fx.queue.list().unwrap()[0];
        let meta = fx.queue.read(id).unwrap().failure;
        assert_eq!(meta.failed_count, 1);
        assert!(meta.last_error.unwrap().contains("missing destination"));
    }

    #[test]
    fn test_purge_hint_below_threshold() {
        let mut fx = fixture();
        fx.queue.push(entry("/queue/metrics"));

        drain(&mut fx, 10);
        assert_eq!(fx.queue.purge_hints(), 1);

        fx.cfg.purge_threshold = 0;
        drain(&mut fx, 10);
        assert_eq!(fx.queue.purge_hints(), 1);
    }
}
