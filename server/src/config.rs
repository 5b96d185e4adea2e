use {
    anyhow::{Context as _, Result},
    serde::{Deserialize, Serialize},
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
    tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackendConfig {
    #[default]
    Memory,
    Postgres {
        database_url: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BlockstoreConfig {
    #[default]
    Memory,
    Filesystem {
        path: PathBuf,
    },
    Raid1 {
        stores: Vec<BlockstoreConfig>,
    },
}

fn default_block_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_log_filter() -> String {
    "info".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub blockstore: BlockstoreConfig,
    /// Upper bound for a single filesystem block operation.
    #[serde(with = "humantime_serde", default = "default_block_timeout")]
    pub block_timeout: Duration,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            blockstore: BlockstoreConfig::default(),
            block_timeout: default_block_timeout(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        json5::from_str(&fs_err::read_to_string(path)?)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

pub fn init_logging(log_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_new(log_filter)?)
        .try_init()?;
    Ok(())
}
