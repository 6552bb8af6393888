//! Environment-variable overrides for the crate's timing defaults:
//! readiness intervals/timeouts, the Kafka topic-discovery interval, and
//! the Broadcast Tailer poll interval.
//!
//! A malformed override warns and falls back to the default rather than
//! panicking: an operator setting `SUBSTRATE_PORT_WAIT_TIMEOUT_SECS=oops`
//! should get the default, not a crashed supervisor.

use std::time::Duration;

use log::warn;

fn parse_env_var_with_warning<T: std::str::FromStr>(var_name: &str, default: T) -> T {
    match std::env::var(var_name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("invalid value for {var_name}: '{value}', using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Pre-start "port is free" probe interval (default: 1s).
pub fn port_wait_interval() -> Duration {
    Duration::from_secs(parse_env_var_with_warning("SUBSTRATE_PORT_WAIT_INTERVAL_SECS", 1))
}

/// Pre-start "port is free" probe timeout (default: 5s).
pub fn port_wait_timeout() -> Duration {
    Duration::from_secs(parse_env_var_with_warning("SUBSTRATE_PORT_WAIT_TIMEOUT_SECS", 5))
}

/// Kafka-metadata / HTTP-200 managed-dependency readiness interval (default: 1s).
pub fn managed_dependency_wait_interval() -> Duration {
    Duration::from_secs(parse_env_var_with_warning(
        "SUBSTRATE_DEPENDENCY_WAIT_INTERVAL_SECS",
        1,
    ))
}

/// Kafka-metadata / HTTP-200 managed-dependency readiness timeout (default: 10s).
pub fn managed_dependency_wait_timeout() -> Duration {
    Duration::from_secs(parse_env_var_with_warning(
        "SUBSTRATE_DEPENDENCY_WAIT_TIMEOUT_SECS",
        10,
    ))
}

/// Kafka topic-discovery poll interval (default: 1s).
pub fn kafka_topic_discovery_interval() -> Duration {
    Duration::from_secs(parse_env_var_with_warning(
        "SUBSTRATE_KAFKA_DISCOVERY_INTERVAL_SECS",
        1,
    ))
}

/// Broadcast Tailer poll interval (default: 1s).
pub fn broadcast_poll_interval() -> Duration {
    Duration::from_secs(parse_env_var_with_warning("SUBSTRATE_BROADCAST_POLL_INTERVAL_SECS", 1))
}
