//! Compressed-cache (zswap) kernel interface.
//!
//! zswap sits transparently in front of backing swap, keeping compressed
//! pages in a RAM pool and writing them back to disk under pressure. All
//! control goes through `/sys/module/zswap/parameters`; counters come
//! from debugfs when mounted.
//!
//! Parameters set through the boot command line are unreliable for
//! compressors whose module is not bundled into the initramfs (zstd in
//! particular), so the engine always writes the parameter files at
//! runtime and persists them through a late-boot oneshot unit instead.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::helpers::{read_sys_u64, read_trimmed, write_sysfs};

const PARAM_DIR: &str = "/sys/module/zswap/parameters";
const DEBUG_DIR: &str = "/sys/kernel/debug/zswap";

fn param(name: &str) -> String {
    format!("{}/{}", PARAM_DIR, name)
}

fn counter(name: &str) -> String {
    format!("{}/{}", DEBUG_DIR, name)
}

/// Whether the zswap parameter surface exists.
pub fn is_available() -> bool {
    Path::new(PARAM_DIR).is_dir()
}

/// Whether debugfs counters are readable.
pub fn debugfs_available() -> bool {
    Path::new(DEBUG_DIR).is_dir()
}

/// Whether zswap is currently enabled.
pub fn is_enabled() -> bool {
    matches!(read_trimmed(param("enabled")).as_deref(), Some("Y") | Some("1"))
}

/// Currently configured compressor name, if the module is present.
pub fn active_compressor() -> Option<String> {
    read_trimmed(param("compressor"))
}

/// Currently configured pool allocator name, if the module is present.
pub fn active_zpool() -> Option<String> {
    read_trimmed(param("zpool"))
}

/// Try to set a parameter, reporting whether the kernel accepted it.
///
/// Used to narrow the assumed capability superset: writing a compressor
/// or zpool name the kernel cannot service fails with EINVAL.
pub fn try_set_param(name: &str, value: &str) -> bool {
    match write_sysfs(param(name), value) {
        Ok(()) => true,
        Err(e) => {
            debug!("zswap {} <- {} rejected: {}", name, value, e);
            false
        }
    }
}

/// Snapshot of zswap configuration and counters.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ZswapStatus {
    /// Module enabled flag
    pub enabled: bool,
    /// Active compressor
    pub compressor: String,
    /// Active pool allocator
    pub zpool: String,
    /// Pool ceiling as percent of RAM
    pub max_pool_percent: u64,
    /// Pages currently stored compressed
    pub stored_pages: u64,
    /// Compressed pool size in bytes
    pub pool_total_size: u64,
    /// Pages evicted to backing swap since boot
    pub written_back_pages: u64,
    /// Times the pool ceiling was hit
    pub pool_limit_hit: u64,
}

impl ZswapStatus {
    /// Read the current status. Returns `None` when the module is absent.
    pub fn read() -> Option<Self> {
        if !is_available() {
            return None;
        }
        Some(Self {
            enabled: is_enabled(),
            compressor: active_compressor().unwrap_or_default(),
            zpool: active_zpool().unwrap_or_default(),
            max_pool_percent: read_sys_u64(param("max_pool_percent")).unwrap_or(0),
            stored_pages: read_sys_u64(counter("stored_pages")).unwrap_or(0),
            pool_total_size: read_sys_u64(counter("pool_total_size")).unwrap_or(0),
            written_back_pages: read_sys_u64(counter("written_back_pages")).unwrap_or(0),
            pool_limit_hit: read_sys_u64(counter("pool_limit_hit")).unwrap_or(0),
        })
    }

    /// Compression ratio of the current pool contents.
    ///
    /// Ratio >= 1.0 means compressed occupies less than the original.
    pub fn compression_ratio(&self, page_size: u64) -> Option<f64> {
        if self.pool_total_size == 0 || self.stored_pages == 0 {
            return None;
        }
        Some((self.stored_pages * page_size) as f64 / self.pool_total_size as f64)
    }
}

/// Saved parameter values for restoration after a benchmark sweep.
#[derive(Clone, Debug)]
pub struct ZswapBackup {
    /// (parameter path, saved value) pairs
    pub parameters: Vec<(String, String)>,
}

impl ZswapBackup {
    /// Capture the current parameter values.
    pub fn capture() -> Self {
        let mut parameters = Vec::new();
        for name in ["enabled", "compressor", "zpool", "max_pool_percent"] {
            let path = param(name);
            if let Some(value) = read_trimmed(&path) {
                parameters.push((path, value));
            }
        }
        Self { parameters }
    }

    /// Write the saved values back.
    pub fn restore(&self) {
        for (path, value) in &self.parameters {
            if let Err(e) = write_sysfs(path, value) {
                warn!("failed to restore {}: {}", path, e);
            }
        }
    }
}

/// Enable zswap with the given compressor, allocator, and pool ceiling.
///
/// Parameters are only written after the enable flag is confirmed; the
/// kernel silently ignores compressor changes on some versions when the
/// module is disabled mid-write.
pub fn enable(compressor: &str, zpool: &str, max_pool_percent: u64) -> Result<()> {
    if !is_available() {
        return Err(EngineError::Bench(
            "zswap module parameters not present; is the module built?".into(),
        ));
    }

    write_sysfs(param("enabled"), "Y")
        .map_err(|e| EngineError::Bench(format!("cannot enable zswap: {}", e)))?;
    if !is_enabled() {
        return Err(EngineError::Bench("zswap did not report enabled".into()));
    }

    if !try_set_param("compressor", compressor) {
        return Err(EngineError::Bench(format!(
            "kernel rejected zswap compressor {:?}",
            compressor
        )));
    }
    if !try_set_param("zpool", zpool) {
        return Err(EngineError::Bench(format!(
            "kernel rejected zswap zpool {:?}",
            zpool
        )));
    }
    write_sysfs(param("max_pool_percent"), &max_pool_percent.to_string())
        .map_err(|e| EngineError::Bench(format!("cannot set pool ceiling: {}", e)))?;

    info!(
        "zswap enabled: compressor={} zpool={} max_pool_percent={}",
        compressor, zpool, max_pool_percent
    );
    Ok(())
}

/// Disable zswap and wait briefly for the pool to drain.
///
/// Benchmark sweeps must start from an empty pool so the counters
/// reflect only the workload under test.
pub fn quiesce() -> Result<()> {
    if !is_available() {
        return Ok(());
    }
    write_sysfs(param("enabled"), "N")
        .map_err(|e| EngineError::Bench(format!("cannot disable zswap: {}", e)))?;

    for _ in 0..50 {
        match ZswapStatus::read() {
            Some(status) if status.stored_pages > 0 => {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            _ => break,
        }
    }
    debug!("zswap quiesced");
    Ok(())
}
