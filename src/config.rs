use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::identity::OAuthProvider;

/// 后端类型：真实的 Supabase 项目，或进程内的内存平台（演示/测试）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Supabase,
    Memory,
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "supabase" => Ok(Backend::Supabase),
            "memory" => Ok(Backend::Memory),
            other => Err(anyhow::anyhow!("unknown BACKEND '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Runtime configuration
    pub environment: String,
    pub log_level: String,
    pub log_format: String,
    pub backend: Backend,

    // Supabase project
    pub supabase_url: String,
    pub supabase_anon_key: String,

    // Bookmark table and realtime channel
    pub bookmarks_schema: String,
    pub bookmarks_table: String,
    pub realtime_channel: String,

    // Authentication configuration
    pub oauth_provider: OAuthProvider,
    pub auth_redirect_url: String,
    pub session_file: Option<PathBuf>,

    // Timeouts
    pub http_timeout_secs: u64,
    pub realtime_heartbeat_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Config {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            log_level: env::var("LOG_LEVEL")
                .unwrap_or_else(|_| "smart_bookmarks=debug".to_string()),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            backend: env::var("BACKEND")
                .unwrap_or_else(|_| "supabase".to_string())
                .parse()?,

            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| "http://localhost:54321".to_string()),
            supabase_anon_key: env::var("SUPABASE_ANON_KEY").unwrap_or_default(),

            bookmarks_schema: env::var("BOOKMARKS_SCHEMA")
                .unwrap_or_else(|_| "public".to_string()),
            bookmarks_table: env::var("BOOKMARKS_TABLE")
                .unwrap_or_else(|_| "bookmarks".to_string()),
            realtime_channel: env::var("REALTIME_CHANNEL")
                .unwrap_or_else(|_| "bookmarks-realtime".to_string()),

            oauth_provider: env::var("OAUTH_PROVIDER")
                .unwrap_or_else(|_| "google".to_string())
                .parse()?,
            auth_redirect_url: env::var("AUTH_REDIRECT_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            session_file: env::var("SESSION_FILE").ok().map(PathBuf::from),

            http_timeout_secs: env::var("HTTP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            realtime_heartbeat_secs: env::var("REALTIME_HEARTBEAT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == Backend::Supabase && self.supabase_anon_key.is_empty() {
            anyhow::bail!("SUPABASE_ANON_KEY must be set when BACKEND=supabase");
        }
        url::Url::parse(&self.supabase_url)
            .map_err(|e| anyhow::anyhow!("SUPABASE_URL is not a valid URL: {}", e))?;
        url::Url::parse(&self.auth_redirect_url)
            .map_err(|e| anyhow::anyhow!("AUTH_REDIRECT_URL is not a valid URL: {}", e))?;
        if self.realtime_heartbeat_secs == 0 {
            anyhow::bail!("REALTIME_HEARTBEAT_SECS must be greater than zero");
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn realtime_heartbeat(&self) -> Duration {
        Duration::from_secs(self.realtime_heartbeat_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            log_level: "smart_bookmarks=debug".to_string(),
            log_format: "pretty".to_string(),
            backend: Backend::Memory,
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: String::new(),
            bookmarks_schema: "public".to_string(),
            bookmarks_table: "bookmarks".to_string(),
            realtime_channel: "bookmarks-realtime".to_string(),
            oauth_provider: OAuthProvider::Google,
            auth_redirect_url: "http://localhost:3000".to_string(),
            session_file: None,
            http_timeout_secs: 30,
            realtime_heartbeat_secs: 30,
        }
    }
}
