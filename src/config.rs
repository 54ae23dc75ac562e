use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::extractor::category::Category;

const ENV_PREFIX: &str = "MENU_SYNC";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_path: String,
    pub fetch_timeout_secs: u64,
    pub max_content_chars: usize,
    pub max_script_chars: usize,
    pub closure_scan_chars: usize,
    pub staleness_days: i64,
    pub batch_limit: usize,
    pub inter_item_delay_ms: u64,
    pub item_timeout_secs: u64,
    pub default_category: String,
    pub extraction_api_url: String,
    pub extraction_model: String,
    pub extraction_api_key: Option<String>,
    pub extraction_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: "data/menu_sync.sqlite".into(),
            fetch_timeout_secs: 20,
            max_content_chars: 15_000,
            max_script_chars: 50_000,
            closure_scan_chars: 5_000,
            staleness_days: 14,
            batch_limit: 10,
            inter_item_delay_ms: 2_000,
            item_timeout_secs: 120,
            default_category: "entree".into(),
            extraction_api_url: "https://api.openai.com/v1/chat/completions".into(),
            extraction_model: "gpt-4o-mini".into(),
            extraction_api_key: None,
            extraction_timeout_secs: 60,
            user_agent: "menu-sync/0.1".into(),
        }
    }
}

impl Settings {
    /// Defaults overlaid with `MENU_SYNC_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_env(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
    }

    fn from_env(env: Environment) -> Result<Self, ConfigError> {
        let d = Settings::default();
        let settings: Settings = Config::builder()
            .set_default("db_path", d.db_path)?
            .set_default("fetch_timeout_secs", d.fetch_timeout_secs)?
            .set_default("max_content_chars", d.max_content_chars as u64)?
            .set_default("max_script_chars", d.max_script_chars as u64)?
            .set_default("closure_scan_chars", d.closure_scan_chars as u64)?
            .set_default("staleness_days", d.staleness_days)?
            .set_default("batch_limit", d.batch_limit as u64)?
            .set_default("inter_item_delay_ms", d.inter_item_delay_ms)?
            .set_default("item_timeout_secs", d.item_timeout_secs)?
            .set_default("default_category", d.default_category)?
            .set_default("extraction_api_url", d.extraction_api_url)?
            .set_default("extraction_model", d.extraction_model)?
            .set_default("extraction_timeout_secs", d.extraction_timeout_secs)?
            .set_default("user_agent", d.user_agent)?
            .add_source(env)
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if Category::parse(&self.default_category).is_none() {
            return Err(ConfigError::UnknownDefaultCategory(
                self.default_category.clone(),
            ));
        }
        if self.max_content_chars == 0 {
            return Err(ConfigError::Invalid("max_content_chars must be positive".into()));
        }
        Ok(())
    }

    /// Canonical default category; `validate` guarantees it parses.
    pub fn default_category(&self) -> Category {
        Category::parse(&self.default_category).unwrap_or(Category::Entree)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::days(self.staleness_days)
    }
}
