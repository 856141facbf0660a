use crate::errors::{PrintError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub version: String,
    pub api_addr: String,
    pub spool_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub queue: QueueConfig,
}

/// Delivery policy for the print queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Total delivery attempts before a job that keeps timing out is failed
    pub max_retries: u32,
    /// Per-attempt wait for a completion signal
    pub job_timeout_ms: u64,
    /// Stabilization delay between two deliveries
    pub inter_job_delay_ms: u64,
    /// Upper bound for a freshly created surface to finish loading
    pub surface_ready_timeout_ms: u64,
    /// Creation attempts (exponential backoff) before the surface is declared unavailable
    pub surface_create_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            job_timeout_ms: 120_000,         // 2 minutes
            inter_job_delay_ms: 1_000,       // 1 second
            surface_ready_timeout_ms: 30_000, // 30 seconds
            surface_create_attempts: 3,
        }
    }
}

impl QueueConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn inter_job_delay(&self) -> Duration {
        Duration::from_millis(self.inter_job_delay_ms)
    }

    pub fn surface_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.surface_ready_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(PrintError::Config(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.job_timeout_ms == 0 {
            return Err(PrintError::Config(
                "job_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.surface_ready_timeout_ms == 0 {
            return Err(PrintError::Config(
                "surface_ready_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.surface_create_attempts == 0 {
            return Err(PrintError::Config(
                "surface_create_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn config_dir() -> PathBuf {
        if cfg!(target_os = "macos") {
            dirs::home_dir()
                .map(|p| p.join("Library/Application Support/com.livetext.printer"))
                .unwrap_or_else(|| PathBuf::from("."))
        } else if cfg!(target_os = "windows") {
            dirs::config_dir()
                .map(|p| p.join("LiveText Printer"))
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            dirs::config_dir()
                .map(|p| p.join("livetext-printer"))
                .unwrap_or_else(|| PathBuf::from("."))
        }
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join(CONFIG_FILE)
    }

    pub fn spool_path(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("spool"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("logs"))
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let config: AppConfig = serde_json::from_str(&raw)?;
            info!("Config loaded from {:?}", path);
            config
        } else {
            info!("No config file at {:?}, using defaults", path);
            AppConfig::default()
        };

        config.apply_env_overrides()?;
        config.queue.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("LIVETEXT_PRINT_API_ADDR") {
            self.api_addr = addr;
        }
        if let Ok(dir) = std::env::var("LIVETEXT_PRINT_SPOOL_DIR") {
            self.spool_dir = Some(PathBuf::from(dir));
        }
        if let Ok(raw) = std::env::var("LIVETEXT_PRINT_JOB_TIMEOUT_MS") {
            self.queue.job_timeout_ms = raw.parse().map_err(|e| {
                PrintError::Config(format!("Invalid LIVETEXT_PRINT_JOB_TIMEOUT_MS {:?}: {}", raw, e))
            })?;
        }
        if let Ok(raw) = std::env::var("LIVETEXT_PRINT_MAX_RETRIES") {
            self.queue.max_retries = raw.parse().map_err(|e| {
                PrintError::Config(format!("Invalid LIVETEXT_PRINT_MAX_RETRIES {:?}: {}", raw, e))
            })?;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        if self.queue.validate().is_err() {
            warn!("Saved configuration contains an invalid queue policy");
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            api_addr: "127.0.0.1:8044".to_string(),
            spool_dir: None,
            log_dir: None,
            queue: QueueConfig::default(),
        }
    }
}
