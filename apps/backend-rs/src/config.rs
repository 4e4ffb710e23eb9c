use std::env;

use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub trusted_hosts: Vec<String>,
    pub dev_auth_overrides_enabled: bool,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
    pub request_timeout_seconds: u64,
    pub auth_jwt_secret: Option<String>,
    pub auth_jwt_issuer: Option<String>,
    pub database_url: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub db_pool_idle_timeout_seconds: u64,
    pub org_membership_cache_ttl_seconds: u64,
    pub org_membership_cache_max_entries: u64,
    pub default_timezone: String,
    pub resend_api_key: Option<String>,
    pub email_from_address: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_phone_number: Option<String>,
    pub storage_bucket: Option<String>,
    pub storage_endpoint_url: Option<String>,
    pub storage_region: String,
    pub storage_presign_ttl_seconds: u64,
    pub app_public_url: String,
    pub autopay_card_fee_bps: i64,
    pub autopay_card_fee_fixed_cents: i64,
    pub autopay_ach_fee_bps: i64,
    pub autopay_ach_fee_cap_cents: i64,
    pub invite_expires_in_days: i64,
    pub scheduler_enabled: bool,
    pub scheduler_daily_hour_utc: u32,
    pub message_poll_interval_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "Rentroll API"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/v1")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            trusted_hosts: parse_csv(&env_or("TRUSTED_HOSTS", "localhost,127.0.0.1")),
            dev_auth_overrides_enabled: env_parse_bool_or("DEV_AUTH_OVERRIDES_ENABLED", false),
            rate_limit_enabled: env_parse_bool_or("RATE_LIMIT_ENABLED", true),
            rate_limit_per_second: env_parse_or("RATE_LIMIT_PER_SECOND", 10),
            rate_limit_burst_size: env_parse_or("RATE_LIMIT_BURST_SIZE", 100),
            request_timeout_seconds: env_parse_or("REQUEST_TIMEOUT_SECONDS", 30),
            auth_jwt_secret: env_opt("AUTH_JWT_SECRET"),
            auth_jwt_issuer: env_opt("AUTH_JWT_ISSUER"),
            database_url: env_opt("DATABASE_URL"),
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_parse_or("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_parse_or("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            db_pool_idle_timeout_seconds: env_parse_or("DB_POOL_IDLE_TIMEOUT_SECONDS", 600),
            org_membership_cache_ttl_seconds: env_parse_or("ORG_MEMBERSHIP_CACHE_TTL_SECONDS", 30),
            org_membership_cache_max_entries: env_parse_or(
                "ORG_MEMBERSHIP_CACHE_MAX_ENTRIES",
                10000,
            ),
            default_timezone: env_or("DEFAULT_TIMEZONE", "America/New_York"),
            resend_api_key: env_opt("RESEND_API_KEY"),
            email_from_address: env_or("EMAIL_FROM_ADDRESS", "noreply@rentroll.app"),
            stripe_secret_key: env_opt("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: env_opt("STRIPE_WEBHOOK_SECRET"),
            twilio_account_sid: env_opt("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: env_opt("TWILIO_AUTH_TOKEN"),
            twilio_phone_number: env_opt("TWILIO_PHONE_NUMBER"),
            storage_bucket: env_opt("STORAGE_BUCKET"),
            storage_endpoint_url: env_opt("STORAGE_ENDPOINT_URL"),
            storage_region: env_or("STORAGE_REGION", "auto"),
            storage_presign_ttl_seconds: env_parse_or("STORAGE_PRESIGN_TTL_SECONDS", 900),
            app_public_url: env_or("APP_PUBLIC_URL", "http://localhost:3000"),
            autopay_card_fee_bps: env_parse_or("AUTOPAY_CARD_FEE_BPS", 290),
            autopay_card_fee_fixed_cents: env_parse_or("AUTOPAY_CARD_FEE_FIXED_CENTS", 30),
            autopay_ach_fee_bps: env_parse_or("AUTOPAY_ACH_FEE_BPS", 80),
            autopay_ach_fee_cap_cents: env_parse_or("AUTOPAY_ACH_FEE_CAP_CENTS", 500),
            invite_expires_in_days: env_parse_or("INVITE_EXPIRES_IN_DAYS", 7),
            scheduler_enabled: env_parse_bool_or("SCHEDULER_ENABLED", true),
            scheduler_daily_hour_utc: env_parse_or("SCHEDULER_DAILY_HOUR_UTC", 10),
            message_poll_interval_seconds: env_parse_or("MESSAGE_POLL_INTERVAL_SECONDS", 60),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    pub fn auth_dev_overrides_enabled(&self) -> bool {
        if self.is_production() {
            return false;
        }
        self.dev_auth_overrides_enabled
    }

    /// Falls back to UTC when the configured zone name is not a valid IANA id.
    pub fn default_tz(&self) -> Tz {
        parse_timezone(&self.default_timezone).unwrap_or(Tz::UTC)
    }
}

pub fn parse_timezone(raw: &str) -> Option<Tz> {
    raw.trim().parse::<Tz>().ok()
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => true,
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => false,
        Some(_) => default,
        None => default,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_string();
    if prefix.is_empty() {
        return "/v1".to_string();
    }
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.ends_with('/') && prefix.len() > 1 {
        prefix.pop();
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::{normalize_prefix, parse_csv, parse_timezone};

    #[test]
    fn normalizes_prefix() {
        assert_eq!(normalize_prefix("v1"), "/v1");
        assert_eq!(normalize_prefix("/v1/"), "/v1");
        assert_eq!(normalize_prefix(""), "/v1");
    }

    #[test]
    fn splits_csv_and_drops_blanks() {
        assert_eq!(
            parse_csv(" a.com, ,b.com,"),
            vec!["a.com".to_string(), "b.com".to_string()]
        );
    }

    #[test]
    fn parses_iana_timezones() {
        assert!(parse_timezone("America/Chicago").is_some());
        assert!(parse_timezone(" Europe/Berlin ").is_some());
        assert!(parse_timezone("Mars/Olympus").is_none());
    }
}
