use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::connector::RelayOptions;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_PRODUCER_URL: &str = "localhost:8001";

const ENV_PRODUCER_URL: &str = "PRODUCER_URL";
const ENV_LISTEN_ADDR: &str = "CAMRELAY_LISTEN_ADDR";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Producer `host:port`; both the WebSocket and HTTP bases derive from it
    /// unless set explicitly below.
    pub producer_url: String,
    pub producer_ws_url: Option<String>,
    pub producer_http_url: Option<String>,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub probe_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub connect_camera_timeout_secs: u64,
    pub cors_origins: Vec<String>,
    pub log_file: Option<PathBuf>,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            producer_url: DEFAULT_PRODUCER_URL.to_string(),
            producer_ws_url: None,
            producer_http_url: None,
            max_attempts: 10,
            retry_delay_ms: 500,
            probe_timeout_ms: 2000,
            dial_timeout_ms: 5000,
            connect_camera_timeout_secs: 60,
            cors_origins: Vec::new(),
            log_file: None,
            config_path: None,
        }
    }
}

/// Command-line overrides; these win over both the environment and the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen_addr: Option<String>,
    pub producer_url: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = Self::load_file_only(path)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Resolve the effective config: file (if any), then environment, then CLI.
    pub fn load_with_overrides(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::load_file_only(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.apply_overrides(overrides);
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_file_only(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        Ok(cfg)
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_PRODUCER_URL).filter(|v| !v.trim().is_empty()) {
            self.set_producer_url(url);
        }
        if let Some(addr) = lookup(ENV_LISTEN_ADDR).filter(|v| !v.trim().is_empty()) {
            self.listen_addr = addr;
        }
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(addr) = overrides.listen_addr {
            self.listen_addr = addr;
        }
        if let Some(url) = overrides.producer_url {
            self.set_producer_url(url);
        }
        if overrides.log_file.is_some() {
            self.log_file = overrides.log_file;
        }
    }

    // A host:port from env/CLI replaces any explicit bases from the file.
    fn set_producer_url(&mut self, url: String) {
        self.producer_url = url;
        self.producer_ws_url = None;
        self.producer_http_url = None;
    }

    fn normalize(&mut self) {
        self.listen_addr = self.listen_addr.trim().to_string();
        self.producer_url = self
            .producer_url
            .trim()
            .trim_end_matches('/')
            .to_string();
        for base in [&mut self.producer_ws_url, &mut self.producer_http_url]
            .into_iter()
            .flatten()
        {
            *base = base.trim().trim_end_matches('/').to_string();
        }
    }

    fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("listen_addr {:?} must be a numeric ip:port", self.listen_addr))?;
        if self.producer_url.is_empty()
            && (self.producer_ws_url.is_none() || self.producer_http_url.is_none())
        {
            anyhow::bail!("producer_url is empty");
        }
        validate_url(&self.producer_ws_base(), &["ws", "wss"]).context("producer_ws_url")?;
        validate_url(&self.producer_http_base(), &["http", "https"])
            .context("producer_http_url")?;
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn producer_ws_base(&self) -> String {
        self.producer_ws_url
            .clone()
            .unwrap_or_else(|| format!("ws://{}", self.producer_url))
    }

    pub fn producer_http_base(&self) -> String {
        self.producer_http_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.producer_url))
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            producer_ws_url: self.producer_ws_base(),
            max_attempts: self.max_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
        }
    }

    pub fn connect_camera_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_camera_timeout_secs)
    }
}

pub(crate) fn validate_url(raw: &str, schemes: &[&str]) -> Result<()> {
    let url = Url::parse(raw).with_context(|| format!("parse {raw}"))?;
    if !schemes.contains(&url.scheme()) {
        anyhow::bail!("url must use one of {}: {raw}", schemes.join("/"));
    }
    if url.host_str().is_none() {
        anyhow::bail!("url has no host: {raw}");
    }
    Ok(())
}
