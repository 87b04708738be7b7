//! Command-line configuration for swaptune.
//!
//! This module defines all CLI arguments using `clap` for parsing.
//! The flags form the operator override layer: every value the plan
//! calculator would otherwise derive from measurement or rules can be
//! forced from the command line.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::helpers::{GIB, MIB};

/// Adaptive swap topology engine.
///
/// swaptune observes the machine it runs on, benchmarks its memory
/// compression and disk I/O behavior, then deterministically reshapes
/// the system's swap topology: repartitioning the root disk, bringing
/// up striped swap devices, and configuring the kernel's compressed
/// swap cache.
///
/// # Examples
///
/// ```bash
/// # Full run: probe, benchmark, plan, repartition, activate
/// swaptune run
///
/// # Dry run: compute and print the plan without touching the system
/// swaptune plan
///
/// # Force a topology instead of deriving it
/// swaptune run --ram-solution compressed-cache --stripe-width 4
/// ```
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Benchmark, plan, and reshape the system's swap topology"
)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Action>,

    /// Directory for run documents, benchmark results, and the instance lock.
    #[arg(long, global = true, default_value = "/var/log/swaptune")]
    pub log_root: PathBuf,

    #[command(flatten)]
    pub overrides: Overrides,
}

/// Engine subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Action {
    /// Run the full pipeline: probe, benchmark, plan, partition, activate
    Run,
    /// Dry run: probe and plan, write the report, change nothing
    Plan,
    /// Run only the benchmark suite and persist the result record
    Bench,
    /// Post-reboot finalizer: format and persist swap from the saved run document
    Finalize,
    /// Show the current swap topology and compression counters
    Status,
}

/// RAM-tier solution selection.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamSolutionArg {
    /// Derive from RAM size and benchmark results
    Auto,
    /// Transparent compressed cache in front of backing swap (zswap)
    CompressedCache,
    /// RAM-resident compressed block device used as swap (zram)
    CompressedBlockDevice,
    /// No RAM compression tier
    None,
}

/// Disk backing selection.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskBackingArg {
    /// Derive from disk type and free space
    Auto,
    /// Swap files inside the root filesystem
    FilesInRoot,
    /// Dedicated GPT swap partitions, striped at equal priority
    NativeSwapPartitions,
    /// Volume-backed partitions for copy-on-write roots
    ZvolPartitions,
    /// Swap files on a dedicated partition
    FilesOnDedicatedPartition,
    /// No disk tier
    None,
}

/// Operator override layer.
///
/// Every field is optional; unset values are computed from the inventory
/// and benchmark record. Sizes are accepted in operator-friendly units
/// (MiB for the RAM pool, GiB for disk swap) and converted to bytes.
#[derive(Args, Debug, Clone)]
pub struct Overrides {
    /// Force the RAM-tier solution.
    #[arg(long, global = true, value_enum)]
    pub ram_solution: Option<RamSolutionArg>,

    /// Force the RAM pool size in MiB; computed from RAM size otherwise.
    #[arg(long, global = true)]
    pub ram_pool_mib: Option<u64>,

    /// Force the compressor (e.g. lz4, zstd, lzo-rle).
    #[arg(long, global = true)]
    pub compressor: Option<String>,

    /// Force the pool allocator (e.g. zsmalloc, z3fold, zbud).
    #[arg(long, global = true)]
    pub allocator: Option<String>,

    /// Force the disk backing kind.
    #[arg(long, global = true, value_enum)]
    pub disk_backing: Option<DiskBackingArg>,

    /// Force total disk swap in GiB; 2x RAM clamped to [4, 64] otherwise.
    #[arg(long, global = true)]
    pub disk_total_gib: Option<u64>,

    /// Force the number of striped swap devices; from the matrix test otherwise.
    #[arg(long, global = true)]
    pub stripe_width: Option<u32>,

    /// Floor on the root filesystem size (GiB) when shrinking.
    #[arg(long, global = true, default_value_t = 10)]
    pub preserve_root_gib: u64,

    /// Refuse to shrink the root filesystem; error out instead.
    #[arg(long, global = true, default_value_t = true, action = clap::ArgAction::Set)]
    pub allow_root_shrink: bool,

    /// Per-cell duration in seconds for the matrix benchmark.
    #[arg(long, global = true, default_value_t = 5)]
    pub bench_duration_s: u64,

    /// Skip the compressor sweep.
    #[arg(long, global = true)]
    pub skip_compressor_sweep: bool,

    /// Skip the allocator sweep.
    #[arg(long, global = true)]
    pub skip_allocator_sweep: bool,

    /// Skip the block-size x concurrency matrix test.
    #[arg(long, global = true)]
    pub skip_matrix: bool,

    /// Skip the latency probe.
    #[arg(long, global = true)]
    pub skip_latency: bool,

    /// Skip the cache-with-backing probe even when swap partitions exist.
    #[arg(long, global = true)]
    pub skip_backing_probe: bool,
}

impl Default for Overrides {
    /// Matches the CLI defaults, so code paths that construct overrides
    /// directly behave like a bare invocation.
    fn default() -> Self {
        Self {
            ram_solution: None,
            ram_pool_mib: None,
            compressor: None,
            allocator: None,
            disk_backing: None,
            disk_total_gib: None,
            stripe_width: None,
            preserve_root_gib: 10,
            allow_root_shrink: true,
            bench_duration_s: 5,
            skip_compressor_sweep: false,
            skip_allocator_sweep: false,
            skip_matrix: false,
            skip_latency: false,
            skip_backing_probe: false,
        }
    }
}

impl Overrides {
    /// Forced RAM pool size in bytes, if set.
    pub fn ram_pool_bytes(&self) -> Option<u64> {
        self.ram_pool_mib.map(|m| m * MIB)
    }

    /// Forced total disk swap in bytes, if set.
    pub fn disk_total_bytes(&self) -> Option<u64> {
        self.disk_total_gib.map(|g| g * GIB)
    }

    /// Floor on the root filesystem size in bytes.
    pub fn preserve_root_bytes(&self) -> u64 {
        self.preserve_root_gib * GIB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::parse_from(["swaptune", "run"]);
        assert_eq!(config.overrides.preserve_root_gib, 10);
        assert!(config.overrides.allow_root_shrink);
        assert_eq!(config.overrides.bench_duration_s, 5);
        assert_eq!(config.log_root, PathBuf::from("/var/log/swaptune"));
    }

    #[test]
    fn size_overrides_convert_to_bytes() {
        let config = Config::parse_from([
            "swaptune",
            "run",
            "--ram-pool-mib",
            "2048",
            "--disk-total-gib",
            "32",
        ]);
        assert_eq!(config.overrides.ram_pool_bytes(), Some(2 * GIB));
        assert_eq!(config.overrides.disk_total_bytes(), Some(32 * GIB));
    }

    #[test]
    fn shrink_can_be_refused() {
        let config = Config::parse_from(["swaptune", "run", "--allow-root-shrink", "false"]);
        assert!(!config.overrides.allow_root_shrink);
    }
}
