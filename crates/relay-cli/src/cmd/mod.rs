pub mod config;
pub mod queue;

use anyhow::Context;
use relay_core::config::Config;
use std::path::PathBuf;

/// Locations given on the command line.
pub struct Paths {
    pub config: PathBuf,
    pub db: Option<PathBuf>,
}

impl Paths {
    /// The config file if present, defaults otherwise.
    pub fn load_config(&self) -> anyhow::Result<Config> {
        Config::load_or_default(&self.config)
            .with_context(|| format!("failed to load config {}", self.config.display()))
    }

    /// `--db` if given, else `storage.path` from the config.
    pub fn db_path(&self, config: &Config) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| config.storage.path.clone())
    }
}
