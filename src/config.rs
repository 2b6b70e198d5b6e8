use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::capture::CaptureBackend;
use crate::error::IdentifyError;
use crate::fingerprint::EngineFormat;
use crate::router::RouterBackend;
use crate::session::RetryPolicy;

pub const DEFAULT_PREFERRED_OUTPUT: &str = "USB Audio Device";
pub const DEFAULT_FALLBACK_OUTPUT: &str = "Built-in Output";
pub const DEFAULT_CAPTURE_ROUTE: &str = "Multi-Output Device (Built-in)";
pub const DEFAULT_LOOPBACK_INPUT: &str = "Soundflower (2ch)";
pub const DEFAULT_ENGINE_PROGRAM: &str = "./sample";

/// Configuration defaults that can be saved to a file.
///
/// Every field is optional so that a saved file, built-in defaults and
/// command-line overrides can be layered with [`Config::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_output: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_output: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_capture_route: Option<String>,

    /// Output device name → multi-output device that mirrors it to the loopback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_routes: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub loopback_input: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recordings_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_duration: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_increment: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_program: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_args: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub discogs_consumer_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub discogs_consumer_secret: Option<String>,
}

impl Config {
    /// Create a new empty config
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the config file path (`~/.config/autoid/config.toml`)
    pub fn get_config_path() -> Result<PathBuf, io::Error> {
        let dir = dirs::config_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no configuration directory for this user")
        })?;
        Ok(dir.join("autoid").join("config.toml"))
    }

    /// Load config from the default location. A missing file yields an empty config.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_from(&Self::get_config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::new());
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to the default location.
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string)?;

        Ok(())
    }

    /// Merge this config with another, preferring values from other
    pub fn merge(&mut self, other: &Config) {
        fn take<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if src.is_some() {
                *dst = src.clone();
            }
        }

        take(&mut self.router, &other.router);
        take(&mut self.capture, &other.capture);
        take(&mut self.preferred_output, &other.preferred_output);
        take(&mut self.fallback_output, &other.fallback_output);
        take(&mut self.default_capture_route, &other.default_capture_route);
        take(&mut self.capture_routes, &other.capture_routes);
        take(&mut self.loopback_input, &other.loopback_input);
        take(&mut self.recordings_dir, &other.recordings_dir);
        take(&mut self.base_duration, &other.base_duration);
        take(&mut self.duration_increment, &other.duration_increment);
        take(&mut self.max_retries, &other.max_retries);
        take(&mut self.engine_program, &other.engine_program);
        take(&mut self.engine_args, &other.engine_args);
        take(&mut self.engine_format, &other.engine_format);
        take(&mut self.discogs_consumer_key, &other.discogs_consumer_key);
        take(&mut self.discogs_consumer_secret, &other.discogs_consumer_secret);
    }

    // ── Typed accessors with built-in defaults ───────────────────────────────

    pub fn router_backend(&self) -> Result<RouterBackend, String> {
        self.router.as_deref().map_or(Ok(RouterBackend::default()), RouterBackend::from_str)
    }

    pub fn capture_backend(&self) -> Result<CaptureBackend, String> {
        self.capture.as_deref().map_or(Ok(CaptureBackend::default()), CaptureBackend::from_str)
    }

    pub fn engine_format(&self) -> Result<EngineFormat, String> {
        self.engine_format.as_deref().map_or(Ok(EngineFormat::default()), EngineFormat::from_str)
    }

    pub fn preferred_output(&self) -> &str {
        self.preferred_output.as_deref().unwrap_or(DEFAULT_PREFERRED_OUTPUT)
    }

    pub fn fallback_output(&self) -> &str {
        self.fallback_output.as_deref().unwrap_or(DEFAULT_FALLBACK_OUTPUT)
    }

    pub fn default_capture_route(&self) -> &str {
        self.default_capture_route.as_deref().unwrap_or(DEFAULT_CAPTURE_ROUTE)
    }

    pub fn capture_routes(&self) -> BTreeMap<String, String> {
        self.capture_routes.clone().unwrap_or_else(|| {
            BTreeMap::from([(
                DEFAULT_PREFERRED_OUTPUT.to_string(),
                "Multi-Output Device (USB)".to_string(),
            )])
        })
    }

    pub fn loopback_input(&self) -> &str {
        self.loopback_input.as_deref().unwrap_or(DEFAULT_LOOPBACK_INPUT)
    }

    /// Directory holding the temporary sound file (`~/Music/recordings`).
    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("Music")
                .join("recordings")
        })
    }

    /// The configured retry policy, rejected when it is unbounded.
    pub fn retry_policy(&self) -> Result<RetryPolicy, IdentifyError> {
        let defaults = RetryPolicy::default();
        let policy = RetryPolicy {
            base_secs: self.base_duration.unwrap_or(defaults.base_secs),
            increment_secs: self.duration_increment.unwrap_or(defaults.increment_secs),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn engine_program(&self) -> &str {
        self.engine_program.as_deref().unwrap_or(DEFAULT_ENGINE_PROGRAM)
    }

    pub fn engine_args(&self) -> Vec<String> {
        self.engine_args.clone().unwrap_or_else(|| vec!["{file}".to_string()])
    }

    /// Consumer key and secret, with environment variables taking precedence.
    pub fn discogs_consumer(&self) -> Option<(String, String)> {
        let key = std::env::var("DISCOGS_CONSUMER_KEY").ok().or_else(|| self.discogs_consumer_key.clone())?;
        let secret = std::env::var("DISCOGS_CONSUMER_SECRET").ok().or_else(|| self.discogs_consumer_secret.clone())?;
        Some((key, secret))
    }

    /// Print the effective config in a human-readable format
    pub fn print(&self, title: &str) {
        println!("{}:", title);
        println!("  Router backend:     {}", self.router.as_deref().unwrap_or("switchaudiosource"));
        println!("  Capture backend:    {}", self.capture.as_deref().unwrap_or("sox"));
        println!("  Preferred output:   {}", self.preferred_output());
        println!("  Fallback output:    {}", self.fallback_output());
        for (output, route) in self.capture_routes() {
            println!("  Capture route:      {} -> {}", output, route);
        }
        println!("  Default route:      {}", self.default_capture_route());
        println!("  Loopback input:     {}", self.loopback_input());
        println!("  Recordings dir:     {}", self.recordings_dir().display());
        match self.retry_policy() {
            Ok(policy) => println!("  Sample duration:    {}s (+{}s per retry, {} retries)",
                                   policy.base_secs, policy.increment_secs, policy.max_retries),
            Err(e) => println!("  Sample duration:    invalid ({})", e),
        }
        println!("  Engine:             {} {}", self.engine_program(), self.engine_args().join(" "));
        println!("  Engine format:      {}", self.engine_format.as_deref().unwrap_or("result-json"));
        println!("  Discogs consumer:   {}",
                 if self.discogs_consumer().is_some() { "configured" } else { "not configured" });
    }
}
