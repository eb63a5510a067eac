//! YAML configuration parsing and validation.
//!
//! Defines the configuration model for maglev-lb and validates it at load
//! time, before any table is built or socket opened.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use anyhow::{bail, Context, Result};
use maglev_lb_core::{CacheConfig, LookupTableBuilder, TableConfig};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-Level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Network interface the dataplane captures and re-emits frames on.
    pub interface: String,

    /// Ordered backend addresses.
    ///
    /// Order is significant: it fixes the backend indices inside the lookup
    /// table, so keep it stable across reloads where possible. Appending and
    /// removing entries disturbs far fewer flows than reordering.
    pub backends: Vec<Ipv4Addr>,

    /// Lookup table and flow cache tuning.
    #[serde(default)]
    pub router: RouterSettings,

    /// Worker and socket tuning.
    #[serde(default)]
    pub dataplane: DataplaneSettings,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

// ---------------------------------------------------------------------------
// Router Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RouterSettings {
    /// Lookup table slot count. Must be prime.
    #[serde(default = "default_table_size")]
    pub table_size: u32,

    /// Seed for the table and fingerprint hashes. Changing it rebalances
    /// every flow, so only change it together with a planned drain.
    #[serde(default)]
    pub hash_seed: u64,

    /// Flow cache entries per worker. Must be a multiple of
    /// `cache_entries_per_bucket`.
    #[serde(default = "default_cache_total_entries")]
    pub cache_total_entries: usize,

    /// Flow cache bucket depth.
    #[serde(default = "default_cache_entries_per_bucket")]
    pub cache_entries_per_bucket: usize,
}

impl RouterSettings {
    pub fn table_config(&self) -> TableConfig {
        TableConfig {
            table_size: self.table_size,
            hash_seed: self.hash_seed,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            total_entries: self.cache_total_entries,
            entries_per_bucket: self.cache_entries_per_bucket,
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            table_size: default_table_size(),
            hash_seed: 0,
            cache_total_entries: default_cache_total_entries(),
            cache_entries_per_bucket: default_cache_entries_per_bucket(),
        }
    }
}

fn default_table_size() -> u32 {
    maglev_lb_core::table::DEFAULT_TABLE_SIZE
}
fn default_cache_total_entries() -> usize {
    1024
}
fn default_cache_entries_per_bucket() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Dataplane Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DataplaneSettings {
    /// Number of worker threads. 0 = one per CPU core.
    #[serde(default)]
    pub workers: usize,

    /// Pin worker threads to CPU cores.
    #[serde(default = "default_true")]
    pub pin_cpus: bool,

    /// Batch size for recvmmsg.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum frame size.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Socket receive buffer size. 0 = system default.
    #[serde(default)]
    pub recv_buf_size: usize,
}

impl Default for DataplaneSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            pin_cpus: true,
            batch_size: default_batch_size(),
            max_frame_size: default_max_frame_size(),
            recv_buf_size: 0,
        }
    }
}

fn default_batch_size() -> usize {
    32
}
fn default_max_frame_size() -> usize {
    9018 // Jumbo frame plus Ethernet header
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Telemetry Config
// ---------------------------------------------------------------------------

/// Prometheus scrape endpoint. Stays off unless a bind address is given.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Address to serve scrapes on, e.g. "0.0.0.0:9090".
    #[serde(default)]
    pub scrape_bind: Option<SocketAddr>,

    /// HTTP path of the scrape endpoint.
    #[serde(default = "default_scrape_path")]
    pub scrape_path: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            scrape_bind: None,
            scrape_path: default_scrape_path(),
        }
    }
}

fn default_scrape_path() -> String {
    "/metrics".to_owned()
}

// ---------------------------------------------------------------------------
// Loading & Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load config from a YAML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw).context("parsing YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            bail!("'interface' must not be empty");
        }

        if self.backends.is_empty() {
            bail!("at least one backend is required");
        }
        if self.backends.len() > 65534 {
            bail!(
                "{} backends exceeds the maximum of 65534",
                self.backends.len()
            );
        }
        if self.backends.len() > self.router.table_size as usize {
            bail!(
                "{} backends cannot share a table of {} slots",
                self.backends.len(),
                self.router.table_size
            );
        }

        // Surfaces NonPrimeTableSize with the same wording the core uses.
        LookupTableBuilder::new(self.router.table_config()).context("router.table_size")?;

        if self.router.cache_entries_per_bucket == 0 {
            bail!("router.cache_entries_per_bucket must be at least 1");
        }
        if self.router.cache_total_entries == 0
            || self.router.cache_total_entries % self.router.cache_entries_per_bucket != 0
        {
            bail!(
                "router.cache_total_entries ({}) must be a positive multiple of cache_entries_per_bucket ({})",
                self.router.cache_total_entries,
                self.router.cache_entries_per_bucket
            );
        }

        if self.dataplane.batch_size == 0 || self.dataplane.batch_size > 1024 {
            bail!(
                "dataplane.batch_size must be 1..1024, got {}",
                self.dataplane.batch_size
            );
        }
        if self.dataplane.max_frame_size < 64 || self.dataplane.max_frame_size > 65535 {
            bail!(
                "dataplane.max_frame_size must be 64..65535, got {}",
                self.dataplane.max_frame_size
            );
        }

        Ok(())
    }
}
