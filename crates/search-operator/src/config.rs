//! Operator configuration, resolved once at startup and handed to the
//! reconciler. Nothing below the binary reads the process environment.

use std::time::Duration;

use crate::builders::Component;

pub const DEFAULT_POSTGRES_IMAGE: &str = "quay.io/sclorg/postgresql-16-c9s:latest";
pub const DEFAULT_INDEXER_IMAGE: &str = "quay.io/stolostron/search-indexer:latest";
pub const DEFAULT_COLLECTOR_IMAGE: &str = "quay.io/stolostron/search-collector:latest";
pub const DEFAULT_API_IMAGE: &str = "quay.io/stolostron/search-v2-api:latest";

/// Per-component image references
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Images {
    pub database: String,
    pub indexer: String,
    pub collector: String,
    pub api: String,
    pub remote_collector: String,
}

impl Images {
    pub fn for_component(&self, component: Component) -> &str {
        match component {
            Component::Database => &self.database,
            Component::Indexer => &self.indexer,
            Component::Collector => &self.collector,
            Component::Api => &self.api,
            Component::RemoteCollector => &self.remote_collector,
        }
    }
}

impl Default for Images {
    fn default() -> Self {
        Self {
            database: DEFAULT_POSTGRES_IMAGE.into(),
            indexer: DEFAULT_INDEXER_IMAGE.into(),
            collector: DEFAULT_COLLECTOR_IMAGE.into(),
            api: DEFAULT_API_IMAGE.into(),
            remote_collector: DEFAULT_COLLECTOR_IMAGE.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    pub operator_namespace: String,
    pub images: Images,
    /// Deadline applied to every individual cluster call
    pub api_timeout: Duration,
    /// Requeue after a clean pass, to catch drift without events
    pub resync_interval: Duration,
    /// Requeue after conflicts and transient failures
    pub retry_backoff: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_namespace: "search-operator".into(),
            images: Images::default(),
            api_timeout: Duration::from_secs(10),
            resync_interval: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(10),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Empty and unparsable
    /// values fall back to the compiled defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: Duration| {
            get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let defaults = Self::default();

        let collector = get("COLLECTOR_IMAGE").unwrap_or(defaults.images.collector);
        let images = Images {
            database: get("POSTGRES_IMAGE").unwrap_or(defaults.images.database),
            indexer: get("INDEXER_IMAGE").unwrap_or(defaults.images.indexer),
            api: get("API_IMAGE").unwrap_or(defaults.images.api),
            remote_collector: get("REMOTE_COLLECTOR_IMAGE").unwrap_or_else(|| collector.clone()),
            collector,
        };

        Self {
            operator_namespace: get("OPERATOR_NAMESPACE").unwrap_or(defaults.operator_namespace),
            images,
            api_timeout: secs("SEARCH_API_TIMEOUT_SECS", defaults.api_timeout),
            resync_interval: secs("SEARCH_RESYNC_SECS", defaults.resync_interval),
            retry_backoff: secs("SEARCH_RETRY_SECS", defaults.retry_backoff),
        }
    }
}
