use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "listing_phones.toml";
const ENV_PREFIX: &str = "LISTING";

/// Layered settings: built-in defaults, then the config file, then
/// `LISTING__SECTION__KEY` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub browser: BrowserSettings,
    pub timing: TimingSettings,
    pub retry: RetryPolicy,
    pub workers: WorkerSettings,
    pub search: SearchSettings,
    pub selectors: Selectors,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub db_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            db_path: PathBuf::from("data/listings.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    pub user_agent: String,
    pub page_load_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        BrowserSettings {
            webdriver_url: "http://localhost:9515".to_string(),
            headless: true,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            page_load_timeout_ms: 15_000,
            request_timeout_ms: 60_000,
        }
    }
}

impl BrowserSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Minimum waits the site's UI needs before content shows up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub page_load_ms: u64,
    pub reply_reveal_ms: u64,
    pub call_reveal_ms: u64,
    pub phone_settle_ms: u64,
    /// Pause after each detail page, per worker.
    pub listing_delay_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        TimingSettings {
            page_load_ms: 8_000,
            reply_reveal_ms: 10_000,
            call_reveal_ms: 10_000,
            phone_settle_ms: 2_000,
            listing_delay_ms: 0,
        }
    }
}

impl TimingSettings {
    pub fn page_load(&self) -> Duration {
        Duration::from_millis(self.page_load_ms)
    }

    pub fn reply_reveal(&self) -> Duration {
        Duration::from_millis(self.reply_reveal_ms)
    }

    pub fn call_reveal(&self) -> Duration {
        Duration::from_millis(self.call_reveal_ms + self.phone_settle_ms)
    }

    pub fn listing_delay(&self) -> Duration {
        Duration::from_millis(self.listing_delay_ms)
    }

    #[cfg(test)]
    pub fn none() -> Self {
        TimingSettings {
            page_load_ms: 0,
            reply_reveal_ms: 0,
            call_reveal_ms: 0,
            phone_settle_ms: 0,
            listing_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub search: usize,
    pub details: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            search: 3,
            details: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub results_per_page: usize,
    /// Used when the result counter can't be read.
    pub fallback_pages: usize,
    pub max_pages: Option<usize>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        SearchSettings {
            results_per_page: 120,
            fallback_pages: 10,
            max_pages: None,
        }
    }
}

/// Site markup hooks. `xpath:` prefixes switch the locator strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Selectors {
    pub total_count: String,
    pub reply_button: String,
    pub call_button: String,
    pub phone_link: String,
    /// Text the site shows instead of the listing when it blocks us.
    pub block_marker: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Selectors {
            total_count: ".totalcount".to_string(),
            reply_button: "button.reply-button".to_string(),
            call_button: "xpath://button[contains(., 'call')]".to_string(),
            phone_link: ".reply-content-phone a[href^='tel:']".to_string(),
            block_marker: "has been automatically blocked".to_string(),
        }
    }
}

/// Load settings. An explicit `path` must exist; the default file is optional.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let file = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
    Config::builder()
        .add_source(File::from(file).required(path.is_some()))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read settings from {:?}", file))?
        .try_deserialize()
        .context("Invalid settings")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;

    #[test]
    fn defaults_without_sources() {
        let s: Settings = Config::builder().build().unwrap().try_deserialize().unwrap();
        assert_eq!(s.workers.search, 3);
        assert_eq!(s.workers.details, 2);
        assert_eq!(s.retry.max_attempts, 3);
        assert_eq!(s.search.results_per_page, 120);
        assert_eq!(s.timing.call_reveal(), Duration::from_secs(12));
    }

    #[test]
    fn partial_override() {
        let s: Settings = Config::builder()
            .add_source(config::File::from_str(
                "[retry]\nbackoff = \"linear\"\nmax_attempts = 5\n[workers]\ndetails = 4\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(s.retry.backoff, Backoff::Linear);
        assert_eq!(s.retry.max_attempts, 5);
        assert_eq!(s.retry.base_delay_ms, 2000);
        assert_eq!(s.workers.details, 4);
        assert_eq!(s.workers.search, 3);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(load(Some(Path::new("does/not/exist.toml"))).is_err());
    }
}
