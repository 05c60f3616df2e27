//! Handler registry with per-handler health tracking.
//!
//! Each message category is served by one named handler. The registry keeps a
//! health counter per handler and deactivates entries whose score crosses the
//! threshold; a deactivated handler stays registered (entries are never
//! deleted during a run) but receives no further dispatch and no further
//! health updates.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::message::Headers;

/// Outcome status a handler reports for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// Message fully processed.
    Success,
    /// Message processed with a caveat; still filed for inspection.
    Warning,
    /// Message could not be processed.
    Error,
}

/// A handler's reply for one message.
#[derive(Debug, Clone)]
pub struct HandlerReply {
    /// How processing went.
    pub status: HandlerStatus,
    /// Handler-supplied explanation, required for warnings and errors.
    pub reason: Option<String>,
}

impl HandlerReply {
    /// A successful reply.
    #[must_use]
    pub const fn success() -> Self {
        Self {
            status: HandlerStatus::Success,
            reason: None,
        }
    }

    /// A warning reply with a reason.
    #[must_use]
    pub fn warning(reason: impl Into<String>) -> Self {
        Self {
            status: HandlerStatus::Warning,
            reason: Some(reason.into()),
        }
    }

    /// An error reply with a reason.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: HandlerStatus::Error,
            reason: Some(reason.into()),
        }
    }
}

/// A pluggable unit implementing the logic for one message category.
///
/// Handlers run on a worker thread with their own time budget, so they must
/// be shareable across threads. A handler that outlives its budget keeps
/// running detached; the relay only stops waiting for it.
pub trait Handler: Send + Sync {
    /// Processes one message.
    fn handle(&self, headers: &Headers, body: &[u8]) -> HandlerReply;
}

/// Reference handler that logs each message and succeeds.
#[derive(Debug, Default)]
pub struct LogHandler;

impl Handler for LogHandler {
    fn handle(&self, headers: &Headers, body: &[u8]) -> HandlerReply {
        tracing::info!(
            headers = headers.len(),
            body_len = body.len(),
            "message received"
        );
        HandlerReply::success()
    }
}

/// Subscription parameters for one handler.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Broker destination to subscribe to.
    pub destination: String,
    /// Extra headers passed through on the subscribe request.
    pub headers: Headers,
}

impl SubscribeOptions {
    /// Options for a destination with no extra headers.
    #[must_use]
    pub fn for_destination(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            headers: Headers::new(),
        }
    }
}

/// How a failure weighs on a handler's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Timeout during invocation.
    Minor,
    /// Any other failure, including an invalid status.
    Major,
}

/// Health scoring constants.
///
/// The magnitudes are order-of-magnitude buckets inherited as a behavioral
/// contract: ten timeouts or one hard failure deactivate a fresh handler.
#[derive(Debug, Clone, Copy)]
pub struct ScoringPolicy {
    /// Score decrement per success (floored at 0).
    pub success_reward: u32,
    /// Score increment per timeout.
    pub minor_penalty: u32,
    /// Score increment per hard failure.
    pub major_penalty: u32,
    /// Score at or above which the handler is deactivated.
    pub deactivation_threshold: u32,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            success_reward: 1,
            minor_penalty: 10,
            major_penalty: 100,
            deactivation_threshold: 100,
        }
    }
}

/// A registered handler and its health state.
pub struct HandlerEntry {
    /// Unique handler name; doubles as the subscription id.
    pub name: String,
    /// Subscription parameters.
    pub options: SubscribeOptions,
    /// The handler capability.
    pub handler: Arc<dyn Handler>,
    /// Whether the handler still receives dispatch.
    pub active: bool,
    /// Accumulated failure score.
    pub error_score: u32,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("name", &self.name)
            .field("destination", &self.options.destination)
            .field("active", &self.active)
            .field("error_score", &self.error_score)
            .finish_non_exhaustive()
    }
}

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreChange {
    /// The score after the update.
    pub score: u32,
    /// True exactly when this update crossed the deactivation threshold.
    pub deactivated: bool,
}

/// Named handlers with health counters and active flags.
///
/// Used single-threaded from the control loop; iteration order is the
/// registration name order, so subscription setup is deterministic.
pub struct HandlerRegistry {
    entries: BTreeMap<String, HandlerEntry>,
    policy: ScoringPolicy,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry with the given scoring policy.
    #[must_use]
    pub fn new(policy: ScoringPolicy) -> Self {
        Self {
            entries: BTreeMap::new(),
            policy,
        }
    }

    /// Registers a handler. Names are unique for the lifetime of the run.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        options: SubscribeOptions,
        handler: Arc<dyn Handler>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(ConfigError::DuplicateHandler { name });
        }
        self.entries.insert(
            name.clone(),
            HandlerEntry {
                name,
                options,
                handler,
                active: true,
                error_score: 0,
            },
        );
        Ok(())
    }

    /// Looks up a handler by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&HandlerEntry> {
        self.entries.get(name)
    }

    /// Deactivates a handler. Returns true if it was active.
    pub fn deactivate(&mut self, name: &str) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.active => {
                entry.active = false;
                tracing::warn!(handler = name, score = entry.error_score, "handler deactivated");
                true
            }
            _ => false,
        }
    }

    /// Records a successful dispatch: score decreases, floored at 0.
    ///
    /// No-op for unknown or inactive handlers; an inactive handler never has
    /// its health recomputed.
    pub fn record_success(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            if entry.active {
                entry.error_score = entry.error_score.saturating_sub(self.policy.success_reward);
            }
        }
    }

    /// Records a failed dispatch, deactivating the handler if the score
    /// crosses the threshold. The caller is expected to attempt a best-effort
    /// unsubscribe when `deactivated` comes back true.
    pub fn record_failure(&mut self, name: &str, severity: Severity) -> ScoreChange {
        let Some(entry) = self.entries.get_mut(name) else {
            return ScoreChange {
                score: 0,
                deactivated: false,
            };
        };
        if !entry.active {
            return ScoreChange {
                score: entry.error_score,
                deactivated: false,
            };
        }

        let penalty = match severity {
            Severity::Minor => self.policy.minor_penalty,
            Severity::Major => self.policy.major_penalty,
        };
        entry.error_score = entry.error_score.saturating_add(penalty);

        let deactivated = entry.error_score >= self.policy.deactivation_threshold;
        if deactivated {
            entry.active = false;
            tracing::warn!(
                handler = name,
                score = entry.error_score,
                "handler crossed failure threshold, deactivated"
            );
        }
        ScoreChange {
            score: entry.error_score,
            deactivated,
        }
    }

    /// Returns true while at least one handler is still active.
    ///
    /// Once this flips to false the relay has nothing left to do and the
    /// whole process is expected to exit.
    #[must_use]
    pub fn any_active(&self) -> bool {
        self.entries.values().any(|e| e.active)
    }

    /// Iterates active entries in name order.
    pub fn active_entries(&self) -> impl Iterator<Item = &HandlerEntry> {
        self.entries.values().filter(|e| e.active)
    }

    /// Total number of registered handlers, active or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(names: &[&str]) -> HandlerRegistry {
        let mut reg = HandlerRegistry::new(ScoringPolicy::default());
        for name in names {
            reg.register(
                *name,
                SubscribeOptions::for_destination(format!("/queue/{name}")),
                Arc::new(LogHandler),
            )
            .unwrap();
        }
        reg
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut reg = registry_with(&["alpha"]);
        let err = reg
            .register(
                "alpha",
                SubscribeOptions::for_destination("/queue/other"),
                Arc::new(LogHandler),
            )
            .unwrap_err();
        assert!(err.to_string().contains("alpha"));
    }

    #[test]
    fn test_success_floors_score_at_zero() {
        let mut reg = registry_with(&["h"]);
        reg.record_success("h");
        assert_eq!(reg.lookup("h").unwrap().error_score, 0);

        reg.record_failure("h", Severity::Minor);
        reg.record_success("h");
        assert_eq!(reg.lookup("h").unwrap().error_score, 9);
    }

    #[test]
    fn test_score_transition_law() {
        let mut reg = registry_with(&["h"]);

        reg.record_failure("h", Severity::Minor);
        assert_eq!(reg.lookup("h").unwrap().error_score, 10);

        reg.record_success("h");
        assert_eq!(reg.lookup("h").unwrap().error_score, 9);

        let change = reg.record_failure("h", Severity::Major);
        assert_eq!(change.score, 109);
        assert!(change.deactivated);
        assert!(!reg.lookup("h").unwrap().active);
    }

    #[test]
    fn test_deactivation_happens_exactly_once() {
        let mut reg = registry_with(&["h"]);
        let first = reg.record_failure("h", Severity::Major);
        assert!(first.deactivated);

        // Further failures are not recorded against an inactive handler.
        let second = reg.record_failure("h", Severity::Major);
        assert!(!second.deactivated);
        assert_eq!(second.score, 100);
        assert_eq!(reg.lookup("h").unwrap().error_score, 100);
    }

    #[test]
    fn test_inactive_handler_health_never_recomputed() {
        let mut reg = registry_with(&["h"]);
        reg.deactivate("h");

        reg.record_success("h");
        reg.record_failure("h", Severity::Minor);
        assert_eq!(reg.lookup("h").unwrap().error_score, 0);
    }

    #[test]
    fn test_three_timeouts_then_major_failure_deactivates() {
        // Scenario: repeated timeouts stay under threshold, one hard
        // failure tips the handler over.
        let mut reg = registry_with(&["h"]);
        for _ in 0..3 {
            let change = reg.record_failure("h", Severity::Minor);
            assert!(!change.deactivated);
        }
        assert_eq!(reg.lookup("h").unwrap().error_score, 30);
        assert!(reg.lookup("h").unwrap().active);

        let change = reg.record_failure("h", Severity::Major);
        assert_eq!(change.score, 130);
        assert!(change.deactivated);
        assert!(!reg.lookup("h").unwrap().active);
    }

    #[test]
    fn test_any_active_flips_when_all_deactivated() {
        let mut reg = registry_with(&["a", "b"]);
        assert!(reg.any_active());

        reg.deactivate("a");
        assert!(reg.any_active());

        reg.record_failure("b", Severity::Major);
        assert!(!reg.any_active());
    }

    #[test]
    fn test_active_entries_in_name_order() {
        let mut reg = registry_with(&["zeta", "alpha", "mid"]);
        reg.deactivate("mid");
        let names: Vec<&str> = reg.active_entries().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
