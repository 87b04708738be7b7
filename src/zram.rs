//! Compressed block device (zram) kernel interface.
//!
//! A zram device keeps its contents compressed in RAM and can be used as
//! a swap device directly. The engine uses it two ways: to enumerate the
//! kernel's compressor list (zram advertises every built-in algorithm,
//! zswap does not), and as the RAM tier on machines too small for a
//! disk-backed compressed cache.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::helpers::{read_trimmed, run_command, write_sysfs};

const DEVICE: &str = "zram0";

fn attr(name: &str) -> String {
    format!("/sys/block/{}/{}", DEVICE, name)
}

/// Whether a zram device node exists in sysfs.
pub fn device_present() -> bool {
    Path::new(&attr("disksize")).exists()
}

/// Load the zram module if no device is present yet.
pub fn ensure_device() -> Result<()> {
    if device_present() {
        return Ok(());
    }
    let out = run_command("modprobe", &["zram", "num_devices=1"])?;
    if !out.success {
        return Err(EngineError::Bench(format!(
            "modprobe zram failed: {}",
            out.stderr.trim()
        )));
    }
    if !device_present() {
        return Err(EngineError::Bench("zram module loaded but no device appeared".into()));
    }
    Ok(())
}

/// Parse the advertised compressor list.
///
/// The kernel formats it as `lzo lzo-rle lz4 [zstd]` with the active
/// algorithm bracketed.
pub fn available_algorithms() -> Vec<String> {
    let Some(raw) = read_trimmed(attr("comp_algorithm")) else {
        return Vec::new();
    };
    raw.split_whitespace()
        .map(|tok| tok.trim_matches(['[', ']']).to_string())
        .filter(|tok| !tok.is_empty())
        .collect()
}

/// Reset the device and configure it with an algorithm and size.
///
/// zram requires the algorithm to be set before disksize; setting
/// disksize finalizes the device until the next reset.
pub fn configure(algorithm: &str, disksize_bytes: u64) -> Result<()> {
    ensure_device()?;
    reset()?;

    write_sysfs(attr("comp_algorithm"), algorithm).map_err(|e| {
        EngineError::Bench(format!("kernel rejected zram algorithm {:?}: {}", algorithm, e))
    })?;
    write_sysfs(attr("disksize"), &disksize_bytes.to_string())
        .map_err(|e| EngineError::Bench(format!("cannot set zram disksize: {}", e)))?;

    info!(
        "zram0 configured: {} {}",
        algorithm,
        crate::helpers::format_size(disksize_bytes)
    );
    Ok(())
}

/// Reset the device, discarding all stored data.
///
/// Fails while the device is an active swap target; callers must
/// swapoff first.
pub fn reset() -> Result<()> {
    if read_trimmed(attr("disksize")).as_deref().unwrap_or("0") != "0" {
        write_sysfs(attr("reset"), "1")
            .map_err(|e| EngineError::Bench(format!("zram reset failed: {}", e)))?;
    }
    debug!("zram0 reset");
    Ok(())
}

/// The device node path.
pub fn device_node() -> String {
    format!("/dev/{}", DEVICE)
}

/// Memory statistics parsed from `mm_stat`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
pub struct ZramStats {
    /// Uncompressed bytes stored
    pub orig_data_size: u64,
    /// Compressed bytes
    pub compr_data_size: u64,
    /// Total RAM consumed including metadata
    pub mem_used_total: u64,
}

impl ZramStats {
    /// Read `mm_stat`; columns are space-separated counters.
    pub fn read() -> Option<Self> {
        let raw = read_trimmed(attr("mm_stat"))?;
        let fields: Vec<u64> = raw
            .split_whitespace()
            .map(|f| f.parse().unwrap_or(0))
            .collect();
        if fields.len() < 3 {
            return None;
        }
        Some(Self {
            orig_data_size: fields[0],
            compr_data_size: fields[1],
            mem_used_total: fields[2],
        })
    }

    /// Compression ratio of stored data.
    pub fn compression_ratio(&self) -> Option<f64> {
        if self.compr_data_size == 0 || self.orig_data_size == 0 {
            return None;
        }
        Some(self.orig_data_size as f64 / self.compr_data_size as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_list_strips_active_brackets() {
        // exercised indirectly: the parser itself
        let raw = "lzo lzo-rle lz4 [zstd]";
        let parsed: Vec<String> = raw
            .split_whitespace()
            .map(|tok| tok.trim_matches(['[', ']']).to_string())
            .collect();
        assert_eq!(parsed, ["lzo", "lzo-rle", "lz4", "zstd"]);
    }

    #[test]
    fn zram_stats_ratio() {
        let stats = ZramStats {
            orig_data_size: 4096 * 1000,
            compr_data_size: 4096 * 250,
            mem_used_total: 4096 * 260,
        };
        assert_eq!(stats.compression_ratio(), Some(4.0));

        let empty = ZramStats::default();
        assert_eq!(empty.compression_ratio(), None);
    }
}
