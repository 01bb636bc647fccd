use std::env;
use std::path::PathBuf;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL, e.g. `sqlite://./data/watchdog.db`.
    pub database_url: String,

    /// Root directory for downloaded files.
    pub storage_path: PathBuf,

    // LLM
    pub anthropic_api_key: String,
    pub triage_model: String,
    pub case_build_model: String,
    /// Monthly LLM spend ceiling in euros. 0 = unlimited.
    pub llm_monthly_budget_eur: f64,
    pub triage_max_tokens: u32,
    pub case_build_max_tokens: u32,

    // Scheduler
    pub tick_interval_secs: u64,
    /// Wall-clock budget for draining the pipeline within one tick.
    pub tick_drain_secs: u64,

    // HTTP politeness
    pub rate_limit_rps: f64,
    /// Contact address embedded into the User-Agent string.
    pub contact_email: String,
}

const DEFAULT_TRIAGE_MODEL: &str = "claude-haiku-4-5-20251001";
const DEFAULT_CASE_BUILD_MODEL: &str = "claude-sonnet-4-20250514";

impl Config {
    /// Load configuration from environment variables, with defaults for
    /// everything except credentials.
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/watchdog.db".to_string()),
            storage_path: PathBuf::from(
                env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/files".to_string()),
            ),
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            triage_model: env::var("TRIAGE_MODEL")
                .unwrap_or_else(|_| DEFAULT_TRIAGE_MODEL.to_string()),
            case_build_model: env::var("CASE_BUILD_MODEL")
                .unwrap_or_else(|_| DEFAULT_CASE_BUILD_MODEL.to_string()),
            llm_monthly_budget_eur: parse_env("LLM_MONTHLY_BUDGET_EUR", 10.0),
            triage_max_tokens: parse_env("TRIAGE_MAX_TOKENS", 4000),
            case_build_max_tokens: parse_env("CASE_BUILD_MAX_TOKENS", 8000),
            tick_interval_secs: parse_env("TICK_INTERVAL_SECS", 900),
            tick_drain_secs: parse_env("TICK_DRAIN_SECS", 600),
            rate_limit_rps: parse_env("RATE_LIMIT_RPS", 1.0),
            contact_email: env::var("CONTACT_EMAIL")
                .unwrap_or_else(|_| "contact@example.com".to_string()),
        }
    }

    /// User-Agent string identifying the service and a contact address.
    pub fn user_agent(&self) -> String {
        format!(
            "Kuntavahti/{} (+{})",
            env!("CARGO_PKG_VERSION"),
            self.contact_email
        )
    }

    /// Log configuration without leaking credentials.
    pub fn log_redacted(&self) {
        tracing::info!(
            database_url = %self.database_url,
            storage_path = %self.storage_path.display(),
            budget_eur = self.llm_monthly_budget_eur,
            tick_interval_secs = self.tick_interval_secs,
            "Configuration loaded"
        );
        if self.anthropic_api_key.is_empty() {
            tracing::info!("ANTHROPIC_API_KEY = (empty)");
        } else {
            tracing::info!("ANTHROPIC_API_KEY = ({} chars)", self.anthropic_api_key.len());
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_names_service_and_contact() {
        let mut config = Config::from_env();
        config.contact_email = "vahti@example.fi".to_string();
        let ua = config.user_agent();
        assert!(ua.starts_with("Kuntavahti/"));
        assert!(ua.contains("vahti@example.fi"));
    }
}
