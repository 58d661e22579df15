//! Configuration for the broker.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cache::CacheConfig;
use crate::connector::{BackendKind, SimulatedConfig, SimulatedNode};
use crate::dispatcher::{BackoffPolicy, DispatcherConfig};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Queue registered at startup.
    pub queue: String,

    /// Resource-manager backend.
    pub backend: BackendKind,

    pub cache: CacheConfig,

    pub dispatcher: DispatcherConfig,

    /// Timeout for one notification delivery attempt.
    pub delivery_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            backend: BackendKind::Simulated(SimulatedConfig::default()),
            cache: CacheConfig::default(),
            dispatcher: DispatcherConfig::default(),
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let queue = std::env::var("BROKER_QUEUE").unwrap_or(defaults.queue);

        let backend = match std::env::var("BROKER_RM_BACKEND")
            .unwrap_or_else(|_| "simulated".to_string())
            .as_str()
        {
            "simulated" => {
                let nodes = match std::env::var("BROKER_SIM_NODES") {
                    Ok(list) => parse_nodes(&list)?,
                    Err(_) => SimulatedConfig::default().nodes,
                };
                BackendKind::Simulated(SimulatedConfig {
                    nodes,
                    auto_grant: true,
                })
            }
            other => bail!("unknown resource manager backend '{}'", other),
        };

        let cache = CacheConfig {
            enabled: env_or("BROKER_CACHE_ENABLED", defaults.cache.enabled)?,
            max_age: Duration::from_millis(env_or("BROKER_CACHE_MAX_AGE_MS", 30_000)?),
            capacity: env_or("BROKER_CACHE_CAPACITY", defaults.cache.capacity)?,
            eviction_interval: Duration::from_millis(env_or(
                "BROKER_CACHE_EVICTION_INTERVAL_MS",
                5_000,
            )?),
        };
        if cache.eviction_interval.is_zero() {
            bail!("BROKER_CACHE_EVICTION_INTERVAL_MS must be positive");
        }

        let dispatcher = DispatcherConfig {
            workers: env_or("BROKER_NOTIFIER_THREADS", defaults.dispatcher.workers)?,
            max_retries: env_or("BROKER_NOTIFIER_MAX_RETRIES", defaults.dispatcher.max_retries)?,
            backoff: BackoffPolicy {
                base: Duration::from_millis(env_or("BROKER_NOTIFIER_RETRY_BASE_MS", 500)?),
                max: Duration::from_millis(env_or("BROKER_NOTIFIER_RETRY_MAX_MS", 30_000)?),
                ..BackoffPolicy::default()
            },
            queue_threshold: env_or(
                "BROKER_NOTIFIER_QUEUE_THRESHOLD",
                defaults.dispatcher.queue_threshold,
            )?,
            heartbeat: Duration::from_millis(env_or("BROKER_NOTIFIER_HEARTBEAT_MS", 30_000)?),
        };
        if dispatcher.workers == 0 {
            bail!("BROKER_NOTIFIER_THREADS must be positive");
        }

        Ok(Self {
            queue,
            backend,
            cache,
            dispatcher,
            delivery_timeout: defaults.delivery_timeout,
        })
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: '{}'", name, value)),
        Err(_) => Ok(default),
    }
}

/// Parses `name:vcores:memory_mb` entries separated by commas.
pub fn parse_nodes(list: &str) -> Result<Vec<SimulatedNode>> {
    let mut nodes = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').collect();
        let [name, cpu, memory] = parts.as_slice() else {
            bail!("invalid node '{}', expected name:vcores:memory_mb", entry);
        };
        if name.is_empty() {
            bail!("invalid node '{}', name cannot be empty", entry);
        }
        let cpu_vcores: i32 = cpu
            .parse()
            .with_context(|| format!("invalid vcores in node '{}'", entry))?;
        let memory_mb: i32 = memory
            .parse()
            .with_context(|| format!("invalid memory in node '{}'", entry))?;
        if cpu_vcores < 0 || memory_mb < 0 {
            bail!("invalid node '{}', capacity cannot be negative", entry);
        }
        nodes.push(SimulatedNode::new(*name, cpu_vcores, memory_mb));
    }
    if nodes.is_empty() {
        bail!("at least one simulated node is required");
    }
    Ok(nodes)
}
