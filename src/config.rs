//! Runtime configuration, read from `HOT2RSS_*` environment variables.
//!
//! Every value is optional. Unset, empty, negative or otherwise non-numeric
//! overrides fall back to the default without complaint.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_SOURCE_URL: &str = "https://m.example.com/hot";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 8000;
pub const DEFAULT_SANDBOX_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_FEED_TITLE: &str = "热门文章";
pub const DEFAULT_FEED_DESCRIPTION: &str = "Hot articles list, generated by hot2rss";

/// Retry ceiling plus the two Backoff Policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

/// Channel-level metadata written ahead of the items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMeta {
    pub title: String,
    pub link: String,
    pub description: String,
}

impl Default for ChannelMeta {
    fn default() -> Self {
        Self {
            title: DEFAULT_FEED_TITLE.to_string(),
            link: DEFAULT_SOURCE_URL.to_string(),
            description: DEFAULT_FEED_DESCRIPTION.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source_url: String,
    pub retry: RetryPolicy,
    pub channel: ChannelMeta,
    pub sandbox_timeout: Duration,
    /// Relative output paths are resolved against this directory.
    pub root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            retry: RetryPolicy::default(),
            channel: ChannelMeta::default(),
            sandbox_timeout: Duration::from_millis(DEFAULT_SANDBOX_TIMEOUT_MS),
            root: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup so tests never touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let retry = RetryPolicy {
            max_attempts: numeric(text("HOT2RSS_MAX_ATTEMPTS"), DEFAULT_MAX_ATTEMPTS).max(1),
            base_delay_ms: numeric(text("HOT2RSS_BASE_DELAY_MS"), DEFAULT_BASE_DELAY_MS),
            max_delay_ms: numeric(text("HOT2RSS_MAX_DELAY_MS"), DEFAULT_MAX_DELAY_MS),
        };

        let source_url = text("HOT2RSS_SOURCE_URL").unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string());
        let channel = ChannelMeta {
            title: text("HOT2RSS_FEED_TITLE").unwrap_or_else(|| DEFAULT_FEED_TITLE.to_string()),
            link: text("HOT2RSS_FEED_LINK").unwrap_or_else(|| source_url.clone()),
            description: text("HOT2RSS_FEED_DESCRIPTION")
                .unwrap_or_else(|| DEFAULT_FEED_DESCRIPTION.to_string()),
        };

        Self {
            source_url,
            retry,
            channel,
            sandbox_timeout: Duration::from_millis(numeric(
                text("HOT2RSS_SANDBOX_TIMEOUT_MS"),
                DEFAULT_SANDBOX_TIMEOUT_MS,
            )),
            root: text("HOT2RSS_ROOT").map(PathBuf::from),
        }
    }

    /// Replaces the source URL; the channel link follows it unless it was set
    /// to something else explicitly.
    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        if self.channel.link == self.source_url {
            self.channel.link = url.clone();
        }
        self.source_url = url;
        self
    }

    /// Only absolute http(s) URLs are fetched.
    pub fn validated_source_url(&self) -> Result<Url> {
        let url = Url::parse(&self.source_url)
            .map_err(|e| Error::Config(format!("invalid source URL {:?}: {}", self.source_url, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::Config(format!(
                "unsupported source URL scheme {:?}",
                other
            ))),
        }
    }
}

fn numeric<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}
