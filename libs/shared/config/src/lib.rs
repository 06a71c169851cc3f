use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_token: String,
    pub redis_url: Option<String>,
    pub sos_poll_interval_ms: u64,
    pub degraded_poll_interval_ms: u64,
    pub push_grace_period_ms: u64,
    pub sos_recency_window_secs: u64,
    pub optimistic_timeout_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_service_token: env::var("SUPABASE_SERVICE_TOKEN")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_TOKEN not set, requests use the anon key only");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            sos_poll_interval_ms: number_from_env("SOS_POLL_INTERVAL_MS", 5_000),
            degraded_poll_interval_ms: number_from_env("DEGRADED_POLL_INTERVAL_MS", 1_000),
            push_grace_period_ms: number_from_env("PUSH_GRACE_PERIOD_MS", 3_000),
            sos_recency_window_secs: number_from_env("SOS_RECENCY_WINDOW_SECS", 60),
            optimistic_timeout_ms: number_from_env("OPTIMISTIC_TIMEOUT_MS", 10_000),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        if config.redis_url.is_none() {
            warn!("REDIS_URL not set, realtime channels fall back to the in-process transport");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
    }

    pub fn is_redis_configured(&self) -> bool {
        self.redis_url.is_some()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_service_token: String::new(),
            redis_url: None,
            sos_poll_interval_ms: 5_000,
            degraded_poll_interval_ms: 1_000,
            push_grace_period_ms: 3_000,
            sos_recency_window_secs: 60,
            optimistic_timeout_ms: 10_000,
        }
    }
}

fn number_from_env<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
