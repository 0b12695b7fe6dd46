//! Configuration module for environment variable parsing.
//!
//! Everything the gateway needs is read from environment variables once at
//! startup. Malformed values log a warning and fall back to the default.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::health::HealthSettings;
use crate::retry::RetryPolicy;
use crate::routing::{FlagSet, RoutingTable};

/// Queue broker connection settings.
#[derive(Debug, Clone)]
pub struct AmqpSettings {
    /// AMQP connection URL
    pub url: String,
    /// Exchange queue targets publish to ("" is the default exchange)
    pub exchange: String,
    /// Maximum number of channels in use at once
    pub pool_size: usize,
    /// Declare durable queues on first use
    pub declare_queues: bool,
}

/// Stream broker connection settings.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    /// Client id reported to the cluster
    pub client_id: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// `LOG_FORMAT=pretty` (or `console`) selects human-readable output.
    pub fn from_env() -> Self {
        match env::var("LOG_FORMAT").as_deref() {
            Ok("pretty") | Ok("console") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// Queue broker; `None` when `AMQP_URL` is unset
    pub amqp: Option<AmqpSettings>,

    /// Stream broker; `None` when `KAFKA_BROKERS` is unset
    pub kafka: Option<KafkaSettings>,

    /// Per-call broker acknowledgement timeout
    pub publish_timeout: Duration,

    /// Bounded wait for a pooled broker channel
    pub pool_acquire_timeout: Duration,

    /// Retry and deadline parameters
    pub retry: RetryPolicy,

    /// Event type → targets
    pub routes: RoutingTable,

    /// Flag values at startup
    pub initial_flags: FlagSet,

    /// Optional JSON file the flags are reloaded from
    pub feature_flags_file: Option<PathBuf>,

    /// How often the flags file is re-read
    pub feature_flags_refresh: Duration,

    /// Health check thresholds
    pub health: HealthSettings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let amqp = non_empty_var("AMQP_URL").map(|url| AmqpSettings {
            url,
            exchange: env::var("AMQP_EXCHANGE").unwrap_or_default(),
            pool_size: parse_var("AMQP_POOL_SIZE", 8usize).max(1),
            declare_queues: parse_bool("AMQP_DECLARE_QUEUES", true),
        });

        let kafka = non_empty_var("KAFKA_BROKERS").map(|brokers| KafkaSettings {
            brokers,
            client_id: env::var("KAFKA_CLIENT_ID")
                .unwrap_or_else(|_| "webhook-gateway".to_string()),
        });

        let retry = RetryPolicy {
            max_attempts: parse_var("RETRY_MAX_ATTEMPTS", 5u32).max(1),
            base_delay: Duration::from_millis(parse_var("RETRY_BASE_DELAY_MS", 200)),
            max_delay: Duration::from_millis(parse_var("RETRY_MAX_DELAY_MS", 5000)),
            jitter_factor: parse_var("RETRY_JITTER", 0.2f64).clamp(0.0, 1.0),
            event_deadline: Duration::from_millis(parse_var("EVENT_DEADLINE_MS", 30_000)),
        };

        let health = HealthSettings {
            window_size: parse_var("HEALTH_WINDOW_SIZE", 50usize).max(1),
            degraded_ratio: parse_var("HEALTH_DEGRADED_RATIO", 0.5f64).clamp(0.0, 1.0),
            min_samples: parse_var("HEALTH_MIN_SAMPLES", 5usize),
            unreachable_threshold: Duration::from_secs(parse_var("HEALTH_UNREACHABLE_SECS", 60)),
            probe_interval: Duration::from_secs(parse_var("HEALTH_PROBE_INTERVAL_SECS", 15).max(1)),
        };

        Config {
            port: parse_var("PORT", 8080),

            amqp,

            kafka,

            publish_timeout: Duration::from_millis(parse_var("PUBLISH_TIMEOUT_MS", 5000)),

            pool_acquire_timeout: Duration::from_millis(parse_var("POOL_ACQUIRE_TIMEOUT_MS", 2000)),

            retry,

            routes: RoutingTable::parse(&env::var("EVENT_ROUTES").unwrap_or_default()),

            initial_flags: FlagSet {
                queue_disabled: parse_bool("FEATURE_QUEUE_DISABLED", false),
                stream_disabled: parse_bool("FEATURE_STREAM_DISABLED", false),
                force_queue: parse_bool("FEATURE_FORCE_QUEUE", false),
                force_stream: parse_bool("FEATURE_FORCE_STREAM", false),
            },

            feature_flags_file: non_empty_var("FEATURE_FLAGS_FILE").map(PathBuf::from),

            feature_flags_refresh: Duration::from_secs(
                parse_var("FEATURE_FLAGS_REFRESH_SECS", 30).max(1),
            ),

            health,
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or invalid.
fn parse_var<T>(name: &str, default: T) -> T
where
    T: FromStr,
{
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(env_var = name, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a boolean flag; accepts true/false, 1/0, yes/no, on/off.
fn parse_bool(name: &str, default: bool) -> bool {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid boolean, using default");
            default
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_valid() {
        env::set_var("TEST_GATEWAY_PARSE_VAR", "42");
        assert_eq!(parse_var("TEST_GATEWAY_PARSE_VAR", 0u32), 42);
        env::remove_var("TEST_GATEWAY_PARSE_VAR");
    }

    #[test]
    fn test_parse_var_invalid_uses_default() {
        env::set_var("TEST_GATEWAY_PARSE_BAD", "forty-two");
        assert_eq!(parse_var("TEST_GATEWAY_PARSE_BAD", 7u32), 7);
        env::remove_var("TEST_GATEWAY_PARSE_BAD");
    }

    #[test]
    fn test_parse_var_default() {
        assert_eq!(parse_var("NONEXISTENT_GATEWAY_VAR", 10u64), 10);
    }

    #[test]
    fn test_parse_bool() {
        env::set_var("TEST_GATEWAY_BOOL_ON", "Yes");
        env::set_var("TEST_GATEWAY_BOOL_OFF", "0");
        env::set_var("TEST_GATEWAY_BOOL_BAD", "maybe");

        assert!(parse_bool("TEST_GATEWAY_BOOL_ON", false));
        assert!(!parse_bool("TEST_GATEWAY_BOOL_OFF", true));
        assert!(parse_bool("TEST_GATEWAY_BOOL_BAD", true));
        assert!(!parse_bool("NONEXISTENT_GATEWAY_BOOL", false));

        env::remove_var("TEST_GATEWAY_BOOL_ON");
        env::remove_var("TEST_GATEWAY_BOOL_OFF");
        env::remove_var("TEST_GATEWAY_BOOL_BAD");
    }

    #[test]
    fn test_from_env_reads_routes_and_retry() {
        env::set_var("EVENT_ROUTES", "payment.completed=queue:payments,stream:payments");
        env::set_var("RETRY_MAX_ATTEMPTS", "0");
        env::set_var("FEATURE_STREAM_DISABLED", "true");

        let config = Config::from_env();

        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.retry.max_attempts, 1, "at least one attempt is always made");
        assert!(config.initial_flags.stream_disabled);
        assert!(!config.initial_flags.force_queue);

        env::remove_var("EVENT_ROUTES");
        env::remove_var("RETRY_MAX_ATTEMPTS");
        env::remove_var("FEATURE_STREAM_DISABLED");
    }

    #[test]
    fn test_non_empty_var() {
        env::set_var("TEST_GATEWAY_BLANK", "   ");
        assert_eq!(non_empty_var("TEST_GATEWAY_BLANK"), None);
        env::remove_var("TEST_GATEWAY_BLANK");
    }
}
