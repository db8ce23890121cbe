//! Command-line surface of `fs-tee`.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tee_core::{CacheConfig, ConfigError, SyncerConfig};

/// Exit status for unusable arguments (`EINVAL`).
pub const EXIT_INVALID_ARGUMENT: i32 = 22;

#[derive(Parser, Debug, Clone)]
#[command(name = "fs-tee", version)]
#[command(about = "Replicate a directory tree one way, copying each path once its changes settle")]
pub struct Args {
    /// Directory to watch
    pub source: PathBuf,

    /// Directory to replicate into
    pub destination: PathBuf,

    /// Preset of tuning flags; overrides them when given
    #[arg(long, value_enum)]
    pub profile: Option<Profile>,

    /// Do not re-sync everything on start
    #[arg(long)]
    pub skip_initial_sync: bool,

    /// Minimal time to wait for more events on a file
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub aggregation_time_min: Duration,

    /// Maximal time to wait for more events on a file
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub aggregation_time_max: Duration,

    /// Skip copying files whose content already matches the destination
    #[arg(long)]
    pub checksum: bool,

    /// Destination content digests to cache (0 disables). The destination
    /// must not be changed bypassing fs-tee.
    #[arg(long, value_name = "FILES", default_value_t = 0)]
    pub cache_data_dst: usize,

    /// Destination metadata entries to cache (0 disables). The destination
    /// must not be changed bypassing fs-tee.
    #[arg(long, value_name = "FILES", default_value_t = 0)]
    pub cache_metadata_dst: usize,

    /// Destination files to keep open (0 keeps all). The destination must
    /// not be changed bypassing fs-tee.
    #[arg(long, value_name = "FILES", default_value_t = 0)]
    pub keep_open_dst: usize,

    /// Remove destination entries whose source was deleted
    #[arg(long)]
    pub delete: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Same as `--checksum --cache-data-dst 1000000 --cache-metadata-dst 1000000 --keep-open-dst 1000`
    HugeLatencyOnDst,
}

impl Args {
    /// Apply the selected profile on top of the individual flags.
    pub fn resolved(mut self) -> Self {
        match self.profile {
            None => {}
            Some(Profile::HugeLatencyOnDst) => {
                self.checksum = true;
                self.cache_data_dst = 1_000_000;
                self.cache_metadata_dst = 1_000_000;
                self.keep_open_dst = 1000;
            }
        }
        self
    }

    pub fn syncer_config(&self) -> Result<SyncerConfig, ConfigError> {
        let config = SyncerConfig {
            aggregation_min: self.aggregation_time_min,
            aggregation_max: self.aggregation_time_max,
            enable_checksums: self.checksum,
            mirror_deletions: self.delete,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            keep_open: self.keep_open_dst,
            cache_data: self.cache_data_dst,
            cache_metadata: self.cache_metadata_dst,
        }
    }

    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "debug,tee_core=debug,tee_daemon=debug"
        } else {
            "info,tee_core=info,tee_daemon=info"
        }
    }
}
