//! Engine configuration.

use std::path::PathBuf;

use crate::error::{KnnError, Result};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub node_id: String,
    /// Ceiling for native memory held by the graph cache and training jobs.
    pub cache_capacity_bytes: u64,
    pub training_threads: usize,
    /// Byte budget of one batch read from the training corpus.
    pub training_batch_bytes: u64,
    pub quantization_sample_size: usize,
    pub sampler_seed: u64,
    /// Where model metadata and blobs are persisted. In-memory only when unset.
    pub model_dir: Option<PathBuf>,
    /// Root of the `<index>/<segment>.knn` graph files.
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            cache_capacity_bytes: 512 * MIB,
            training_threads: 1,
            training_batch_bytes: 100 * MIB,
            quantization_sample_size: knn_core::quantization::DEFAULT_SAMPLE_SIZE,
            sampler_seed: 42,
            model_dir: None,
            data_dir: PathBuf::from("./knn_data"),
        }
    }
}

impl EngineConfig {
    pub fn from_data_dir(data_dir: PathBuf) -> Self {
        Self {
            model_dir: Some(data_dir.join("models")),
            data_dir,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `KNN_*` environment variables.
    ///
    /// A percentage capacity (`KNN_CACHE_CAPACITY=50%`) is taken relative to
    /// physical memory, or to `KNN_MEMORY_TOTAL` when set.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(node_id) = var("KNN_NODE_ID") {
            config.node_id = node_id;
        }
        if let Some(capacity) = var("KNN_CACHE_CAPACITY") {
            let total = match var("KNN_MEMORY_TOTAL") {
                Some(total) => parse_capacity(&total, 0)?,
                None => total_memory_bytes(),
            };
            config.cache_capacity_bytes = parse_capacity(&capacity, total)?;
        }
        if let Some(threads) = var("KNN_TRAINING_THREADS") {
            config.training_threads = parse_number("KNN_TRAINING_THREADS", &threads)?;
            if config.training_threads == 0 {
                return Err(KnnError::InvalidArgument(
                    "KNN_TRAINING_THREADS must be at least 1".into(),
                ));
            }
        }
        if let Some(batch) = var("KNN_TRAINING_BATCH_BYTES") {
            config.training_batch_bytes = parse_capacity(&batch, config.training_batch_bytes)?;
        }
        if let Some(dir) = var("KNN_MODEL_DIR") {
            config.model_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| KnnError::InvalidArgument(format!("{name}: not a number: {value:?}")))
}

/// Physical memory of this host, or the default cache capacity when it can't
/// be read.
pub fn total_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok();
        if let Some(total) = meminfo.as_deref().and_then(parse_mem_total) {
            return total;
        }
    }
    EngineConfig::default().cache_capacity_bytes
}

/// `MemTotal` of a `/proc/meminfo` dump, in bytes.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    kb.checked_mul(1024)
}

/// Parses `"512mb"`, `"2gb"`, `"1048576"`, or `"50%"` of `total`.
pub fn parse_capacity(value: &str, total: u64) -> Result<u64> {
    let v = value.trim().to_ascii_lowercase();
    let invalid = || KnnError::InvalidArgument(format!("invalid capacity: {value:?}"));

    if let Some(pct) = v.strip_suffix('%') {
        let pct: f64 = pct.trim().parse().map_err(|_| invalid())?;
        if !(0.0..=100.0).contains(&pct) {
            return Err(invalid());
        }
        return Ok((total as f64 * pct / 100.0) as u64);
    }

    let units: [(&str, u64); 5] = [
        ("kb", 1024),
        ("mb", MIB),
        ("gb", 1024 * MIB),
        ("tb", 1024 * 1024 * MIB),
        ("b", 1),
    ];
    let (digits, multiplier) = units
        .iter()
        .find_map(|(suffix, mult)| v.strip_suffix(suffix).map(|d| (d, *mult)))
        .unwrap_or((v.as_str(), 1));
    let n: u64 = digits.trim().parse().map_err(|_| invalid())?;
    n.checked_mul(multiplier).ok_or_else(invalid)
}
