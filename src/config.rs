//! Centralized runtime configuration, following the teacher's pattern of a
//! `Default` impl reading environment-variable overrides with sane
//! fallbacks. Constructed once at startup and threaded explicitly into the
//! repository, engine, and resource coordinator — no hidden module-scoped
//! state (§9).

use std::env;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database: DatabaseConfig,
    pub reservation: ReservationConfig,
    pub concurrency: ConcurrencyConfig,
    pub pagination: PaginationConfig,
    pub events: EventConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationPolicy {
    Strict,
    Warn,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub default_path: String,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ReservationConfig {
    pub policy: ReservationPolicy,
    pub oracle_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub optimistic_retry_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
}

#[derive(Debug, Clone)]
pub struct EventConfig {
    pub channel_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            reservation: ReservationConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            pagination: PaginationConfig::default(),
            events: EventConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            default_path: env::var("CRONFLOW_CORE_DB_PATH")
                .unwrap_or_else(|_| "workflow_engine.db".to_string()),
            busy_timeout_ms: env::var("CRONFLOW_CORE_DB_BUSY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
        }
    }
}

impl Default for ReservationConfig {
    fn default() -> Self {
        let policy = match env::var("CRONFLOW_CORE_RESERVATION_POLICY") {
            Ok(v) if v.eq_ignore_ascii_case("strict") => ReservationPolicy::Strict,
            _ => ReservationPolicy::Warn,
        };
        Self {
            policy,
            oracle_timeout_ms: env::var("CRONFLOW_CORE_ORACLE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            optimistic_retry_attempts: env::var("CRONFLOW_CORE_OPTIMISTIC_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
        }
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: env::var("CRONFLOW_CORE_DEFAULT_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_page_size: env::var("CRONFLOW_CORE_MAX_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: env::var("CRONFLOW_CORE_EVENT_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1024),
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.pagination.default_page_size == 0 {
            return Err("default page size must be greater than 0".to_string());
        }
        if self.pagination.max_page_size < self.pagination.default_page_size {
            return Err("max page size must be >= default page size".to_string());
        }
        if self.concurrency.optimistic_retry_attempts == 0 {
            return Err("optimistic retry attempts must be greater than 0".to_string());
        }
        if self.events.channel_capacity == 0 {
            return Err("event channel capacity must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CoreConfig::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_reservation_policy_is_warn() {
        let config = ReservationConfig::default();
        assert_eq!(config.policy, ReservationPolicy::Warn);
    }

    #[test]
    fn validate_rejects_inverted_page_sizes() {
        let mut config = CoreConfig::default();
        config.pagination.max_page_size = 1;
        config.pagination.default_page_size = 20;
        assert!(config.validate().is_err());
    }
}
