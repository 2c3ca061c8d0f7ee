use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub supervisor: SupervisorConfig,
    pub fetch: FetchConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for run request/result files and checkpoint files.
    pub data_path: PathBuf,
}

impl StorageConfig {
    pub fn run_dir(&self, run_id: uuid::Uuid) -> PathBuf {
        self.data_path.join("runs").join(run_id.to_string())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_path.join("checkpoints")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Grace period after SIGTERM before escalating to SIGKILL.
    pub grace_seconds: u64,
    /// Wait after SIGKILL before finalization moves to the background.
    pub kill_wait_seconds: u64,
    /// Stdout drain / cancellation check tick.
    pub poll_interval_ms: u64,
    /// Per-run log ring buffer capacity, in lines.
    pub log_buffer_lines: usize,
    /// Deadline = base + per_page * total page limit, clamped below.
    pub base_timeout_seconds: u64,
    pub per_page_timeout_seconds: u64,
    pub min_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    /// Backoff between attempts: base + step * attempt, plus jitter.
    pub backoff_base_ms: u64,
    pub backoff_step_ms: u64,
    /// How long the rendering fallback waits for the marker element.
    pub render_wait_seconds: u64,
    pub render_nav_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Checkpoint after this many processed items (and at each page end).
    pub checkpoint_batch_size: usize,
    pub item_delay_ms: u64,
    pub page_delay_ms: u64,
    /// Item cap applied when a target does not carry its own.
    pub default_item_cap: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://./crawlherd.db".to_string(),
                max_connections: Some(10),
            },
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                data_path: PathBuf::from("./data"),
            },
            scheduler: SchedulerConfig { tick_seconds: 1 },
            supervisor: SupervisorConfig {
                grace_seconds: 10,
                kill_wait_seconds: 5,
                poll_interval_ms: 200,
                log_buffer_lines: 500,
                base_timeout_seconds: 120,
                per_page_timeout_seconds: 60,
                min_timeout_seconds: 120,
                max_timeout_seconds: 6 * 60 * 60,
            },
            fetch: FetchConfig {
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36"
                    .to_string(),
                timeout_seconds: 30,
                retry_attempts: 3,
                backoff_base_ms: 1200,
                backoff_step_ms: 800,
                render_wait_seconds: 15,
                render_nav_timeout_seconds: 60,
            },
            pipeline: PipelineConfig {
                checkpoint_batch_size: 10,
                item_delay_ms: 800,
                page_delay_ms: 1200,
                default_item_cap: 100,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::create_dir_all(default_config.storage.data_path.join("runs"))?;
            std::fs::create_dir_all(default_config.storage.data_path.join("checkpoints"))?;
            std::fs::write(&config_file, contents)?;
            Ok(default_config)
        }
    }
}
