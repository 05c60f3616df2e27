//! Relay configuration and handler loading.
//!
//! Behavioral constants (cooldowns, retry counts, scoring penalties) are
//! configurable but default to the contract values; changing them changes
//! what operators have learned to expect from the relay, so the defaults are
//! the contract. Handler declarations come from a TOML file and are resolved
//! against a factory catalog at load time; an unknown handler kind fails
//! startup rather than failing dispatch later.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::message::Headers;
use crate::registry::{Handler, HandlerRegistry, ScoringPolicy, SubscribeOptions};

/// Relay runtime configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Host name stamped into error envelopes.
    pub host: String,
    /// Client identity used to recognize self-addressed probes.
    pub client_id: String,
    /// Destination error envelopes are filed under.
    pub error_destination: String,
    /// Idle interval before the keepalive probe runs.
    pub ping_interval: Duration,
    /// Budget for broker connect attempts.
    pub connect_timeout: Duration,
    /// Budget for broker I/O waits (frames, subscription receipts).
    pub io_timeout: Duration,
    /// Budget for one handler invocation; must stay below `io_timeout`.
    pub handler_timeout: Duration,
    /// Brief wait for delivery and probe receipts.
    pub receipt_wait: Duration,
    /// Cooldown between reconnect attempts.
    pub connect_cooldown: Duration,
    /// Cooldown before a failed outbound entry is retried.
    pub retry_cooldown: Duration,
    /// Failed attempts after which an outbound entry is dead-lettered.
    pub max_delivery_failures: u32,
    /// Maximum entries processed per outbound drain pass.
    pub drain_budget: usize,
    /// Queue size below which a purge hint is issued.
    pub purge_threshold: usize,
    /// Handler health scoring constants.
    pub scoring: ScoringPolicy,
    /// Optional control file; its existence requests a graceful quit.
    pub quit_file: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            client_id: format!("monrelay-{host}"),
            host,
            error_destination: "/queue/monitoring-errors".to_string(),
            ping_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(5),
            receipt_wait: Duration::from_secs(2),
            connect_cooldown: Duration::from_secs(30),
            retry_cooldown: Duration::from_secs(300),
            max_delivery_failures: 3,
            drain_budget: 50,
            purge_threshold: 1000,
            scoring: ScoringPolicy::default(),
            quit_file: None,
        }
    }
}

impl RelayConfig {
    /// Checks internal consistency.
    ///
    /// The handler budget must be shorter than the broker I/O budget so one
    /// stalled handler cannot eat the whole loop iteration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handler_timeout >= self.io_timeout {
            return Err(ConfigError::InvalidTimeouts {
                message: format!(
                    "handler timeout ({:?}) must be shorter than the broker I/O timeout ({:?})",
                    self.handler_timeout, self.io_timeout
                ),
            });
        }
        if self.max_delivery_failures == 0 {
            return Err(ConfigError::InvalidTimeouts {
                message: "max delivery failures must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Broker connection targets: a single URI or a rotating list.
#[derive(Debug, Clone)]
pub struct BrokerTargets {
    uris: Vec<String>,
    cursor: usize,
}

impl BrokerTargets {
    /// A single fixed broker URI.
    #[must_use]
    pub fn single(uri: impl Into<String>) -> Self {
        Self {
            uris: vec![uri.into()],
            cursor: 0,
        }
    }

    /// Loads a rotating broker list from a file: one URI per line, blank
    /// lines and `#` comments ignored.
    pub fn from_list_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let uris: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();

        if uris.is_empty() {
            return Err(ConfigError::EmptyBrokerList {
                path: path.to_path_buf(),
            });
        }
        Ok(Self { uris, cursor: 0 })
    }

    /// Returns the next candidate URI, rotating through the list.
    pub fn next(&mut self) -> &str {
        let uri = &self.uris[self.cursor % self.uris.len()];
        self.cursor = (self.cursor + 1) % self.uris.len();
        uri
    }

    /// Number of configured targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.uris.len()
    }

    /// Always false; construction guarantees at least one target.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }
}

/// One handler declaration from the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerDecl {
    /// Unique handler name.
    pub name: String,
    /// Factory kind resolved against the catalog.
    pub kind: String,
    /// Destination to subscribe to.
    pub destination: String,
    /// Extra subscribe headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Free-form parameters passed to the factory.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct HandlerFile {
    #[serde(default, rename = "handler")]
    handlers: Vec<HandlerDecl>,
}

/// Loads handler declarations from a TOML file.
pub fn load_handler_decls(path: &Path) -> Result<Vec<HandlerDecl>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let file: HandlerFile = toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(file.handlers)
}

/// Factory signature for building a handler from its declaration.
pub type HandlerFactory = Box<dyn Fn(&HandlerDecl) -> Result<Arc<dyn Handler>, ConfigError> + Send>;

/// Name-to-factory catalog, validated at load time.
///
/// Dispatch never resolves handler kinds dynamically; anything the
/// configuration names must be in the catalog before the registry is built.
#[derive(Default)]
pub struct HandlerCatalog {
    factories: BTreeMap<String, HandlerFactory>,
}

impl std::fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerCatalog")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for a handler kind.
    pub fn register_factory(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn(&HandlerDecl) -> Result<Arc<dyn Handler>, ConfigError> + Send + 'static,
    ) {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    /// Builds a registry from declarations, failing fast on unknown kinds,
    /// malformed declarations, or duplicate names.
    pub fn build_registry(
        &self,
        decls: &[HandlerDecl],
        policy: ScoringPolicy,
    ) -> Result<HandlerRegistry, ConfigError> {
        let mut registry = HandlerRegistry::new(policy);
        for decl in decls {
            if decl.name.trim().is_empty() {
                return Err(ConfigError::InvalidHandler {
                    name: decl.name.clone(),
                    message: "handler name must not be empty".to_string(),
                });
            }
            if decl.destination.trim().is_empty() {
                return Err(ConfigError::InvalidHandler {
                    name: decl.name.clone(),
                    message: "handler destination must not be empty".to_string(),
                });
            }
            let factory =
                self.factories
                    .get(&decl.kind)
                    .ok_or_else(|| ConfigError::UnknownHandlerKind {
                        name: decl.name.clone(),
                        kind: decl.kind.clone(),
                    })?;
            let handler = factory(decl)?;

            let mut headers: Headers = decl
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            headers.insert("id", decl.name.clone());

            registry.register(
                decl.name.clone(),
                SubscribeOptions {
                    destination: decl.destination.clone(),
                    headers,
                },
                handler,
            )?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LogHandler;
    use std::io::Write;

    fn catalog() -> HandlerCatalog {
        let mut catalog = HandlerCatalog::new();
        catalog.register_factory("log", |_| Ok(Arc::new(LogHandler)));
        catalog
    }

    #[test]
    fn test_default_config_matches_contract() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.connect_cooldown, Duration::from_secs(30));
        assert_eq!(cfg.retry_cooldown, Duration::from_secs(300));
        assert_eq!(cfg.max_delivery_failures, 3);
        assert_eq!(cfg.purge_threshold, 1000);
        assert_eq!(cfg.scoring.minor_penalty, 10);
        assert_eq!(cfg.scoring.major_penalty, 100);
        assert_eq!(cfg.scoring.deactivation_threshold, 100);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_handler_timeout_must_undercut_io_timeout() {
        let cfg = RelayConfig {
            handler_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(10),
            ..RelayConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidTimeouts { .. })
        ));
    }

    #[test]
    fn test_broker_list_parsing_and_rotation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# primary").unwrap();
        writeln!(file, "stomp://a:61613").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "stomp://b:61613").unwrap();

        let mut targets = BrokerTargets::from_list_file(file.path()).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets.next(), "stomp://a:61613");
        assert_eq!(targets.next(), "stomp://b:61613");
        assert_eq!(targets.next(), "stomp://a:61613");
    }

    #[test]
    fn test_empty_broker_list_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# nothing here").unwrap();
        assert!(matches!(
            BrokerTargets::from_list_file(file.path()),
            Err(ConfigError::EmptyBrokerList { .. })
        ));
    }

    #[test]
    fn test_load_handler_decls() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[handler]]
name = "cpu-load"
kind = "log"
destination = "/queue/cpu"

[[handler]]
name = "disk-usage"
kind = "log"
destination = "/queue/disk"
headers = {{ ack = "client" }}
"#
        )
        .unwrap();

        let decls = load_handler_decls(file.path()).unwrap();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[1].headers.get("ack").map(String::as_str), Some("client"));
    }

    #[test]
    fn test_build_registry_sets_subscription_id_header() {
        let decls = vec![HandlerDecl {
            name: "cpu-load".to_string(),
            kind: "log".to_string(),
            destination: "/queue/cpu".to_string(),
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
        }];
        let registry = catalog()
            .build_registry(&decls, ScoringPolicy::default())
            .unwrap();

        let entry = registry.lookup("cpu-load").unwrap();
        assert_eq!(entry.options.headers.get("id"), Some("cpu-load"));
    }

    #[test]
    fn test_unknown_handler_kind_fails_fast() {
        let decls = vec![HandlerDecl {
            name: "custom".to_string(),
            kind: "no-such-kind".to_string(),
            destination: "/queue/custom".to_string(),
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
        }];
        let err = catalog()
            .build_registry(&decls, ScoringPolicy::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownHandlerKind { .. }));
    }

    #[test]
    fn test_blank_destination_is_rejected() {
        let decls = vec![HandlerDecl {
            name: "custom".to_string(),
            kind: "log".to_string(),
            destination: "  ".to_string(),
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
        }];
        assert!(matches!(
            catalog().build_registry(&decls, ScoringPolicy::default()),
            Err(ConfigError::InvalidHandler { .. })
        ));
    }
}
