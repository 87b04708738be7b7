//! Swap topology planner.
//!
//! A pure function from `(Inventory, BenchResult, Overrides)` to a
//! concrete `Plan`: no I/O happens here, which keeps the calculator
//! deterministic and directly testable. Operator overrides always win;
//! measured data fills in next; rule-based defaults cover whatever the
//! benchmark could not produce.

use serde::{Deserialize, Serialize};

use crate::bench::BenchResult;
use crate::config::{DiskBackingArg, Overrides, RamSolutionArg};
use crate::error::{EngineError, Result};
use crate::helpers::{align_down, GIB, MIB};
use crate::inventory::Inventory;

/// Priority given to the RAM tier's swap device.
pub const RAM_PRIORITY: i32 = 100;
/// Priority given to every disk-tier swap device (equal across the
/// stripe so the kernel round-robins them).
pub const DISK_PRIORITY: i32 = 10;

/// Floor and ceiling of the disk swap sizing rule.
const DISK_SWAP_MIN: u64 = 4 * GIB;
const DISK_SWAP_MAX: u64 = 64 * GIB;

/// RAM threshold separating the two RAM-tier solutions.
const SMALL_RAM_THRESHOLD: u64 = 4 * GIB;

/// Selected RAM-tier mechanism.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RamSolution {
    /// Transparent compressed cache (zswap) in front of backing swap
    CompressedCache,
    /// RAM-resident compressed block device (zram) used as swap
    CompressedBlockDevice,
    /// No RAM compression tier
    None,
}

/// Selected disk-tier mechanism.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiskBacking {
    FilesInRoot,
    NativeSwapPartitions,
    ZvolPartitions,
    FilesOnDedicatedPartition,
    None,
}

impl DiskBacking {
    /// Whether this backing is realized as GPT partitions at the disk
    /// tail.
    ///
    /// Volume-backed and dedicated-partition kinds use the same
    /// partition mechanics; only the reported kind differs.
    pub fn uses_partitions(&self) -> bool {
        matches!(
            self,
            DiskBacking::NativeSwapPartitions
                | DiskBacking::ZvolPartitions
                | DiskBacking::FilesOnDedicatedPartition
        )
    }
}

/// Kernel tunables derived from the plan.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tunables {
    /// vm.swappiness
    pub swappiness: u32,
    /// vm.page-cluster (log2 pages per swap I/O)
    pub page_cluster: u32,
    /// vm.vfs_cache_pressure
    pub cache_pressure: u32,
    /// vm.watermark_scale_factor
    pub watermark_scale: u32,
}

/// The concrete swap topology the rest of the engine realizes.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Plan {
    pub ram_solution: RamSolution,
    /// RAM budget for the compressed tier, in bytes
    pub ram_pool_bytes: u64,
    /// Pool ceiling as percent of RAM (what zswap's parameter takes)
    pub ram_pool_pct: u64,
    pub compressor: String,
    pub allocator: String,
    pub disk_backing: DiskBacking,
    /// Total disk swap in bytes (0 when disk_backing is none)
    pub disk_total_bytes: u64,
    /// Number of equal-priority swap devices
    pub stripe_width: u32,
    /// Size of each striped device, 1 MiB aligned
    pub per_device_bytes: u64,
    pub disk_priority: i32,
    pub ram_priority: i32,
    pub tunables: Tunables,
}

impl Plan {
    /// Check the plan's internal invariants.
    pub fn validate(&self) -> Result<()> {
        if self.per_device_bytes * self.stripe_width as u64 > self.disk_total_bytes
            && self.disk_backing != DiskBacking::None
        {
            return Err(EngineError::Plan(
                "striped devices exceed the disk swap budget".into(),
            ));
        }
        if self.ram_priority <= self.disk_priority {
            return Err(EngineError::Plan(
                "RAM tier must outrank the disk tier".into(),
            ));
        }
        if self.tunables.swappiness > 100 {
            return Err(EngineError::Plan("swappiness out of range".into()));
        }
        if self.tunables.page_cluster > 5 {
            return Err(EngineError::Plan("page_cluster out of range".into()));
        }
        if self.ram_solution == RamSolution::CompressedCache && self.tunables.page_cluster != 0 {
            return Err(EngineError::Plan(
                "compressed cache requires page_cluster = 0".into(),
            ));
        }
        Ok(())
    }
}

/// Derive the swap topology.
///
/// # Errors
///
/// Returns a plan error when an operator override is inconsistent with
/// the inventory (oversized disk swap, unknown compressor, zero stripe).
pub fn compute_plan(
    inventory: &Inventory,
    bench: &BenchResult,
    overrides: &Overrides,
) -> Result<Plan> {
    let ram = inventory.ram_bytes;

    let ram_solution = select_ram_solution(ram, overrides.ram_solution);
    let disk_total_bytes = disk_swap_size(inventory, overrides, &ram_solution)?;
    let disk_backing = select_disk_backing(inventory, overrides, disk_total_bytes);
    let disk_total_bytes = if disk_backing == DiskBacking::None {
        0
    } else {
        disk_total_bytes
    };

    let ram_pool_pct = pool_percent(ram);
    let ram_pool_bytes = match overrides.ram_pool_bytes() {
        Some(forced) => forced,
        None if ram_solution == RamSolution::None => 0,
        None => ram * ram_pool_pct / 100,
    };

    let compressor = select_compressor(inventory, bench, overrides)?;
    let allocator = select_allocator(&ram_solution, overrides)?;

    let stripe_width = match overrides.stripe_width {
        Some(forced) if (1..=16).contains(&forced) => forced,
        Some(forced) => {
            return Err(EngineError::Plan(format!(
                "stripe width {} outside [1, 16]",
                forced
            )));
        }
        None => bench
            .stripe_width()
            .unwrap_or_else(|| default_stripe_width(inventory)),
    };

    let per_device_bytes = if disk_total_bytes == 0 {
        0
    } else {
        align_down(disk_total_bytes / stripe_width as u64, MIB)
    };

    let tunables = derive_tunables(ram, &ram_solution, bench);

    let plan = Plan {
        ram_solution,
        ram_pool_bytes,
        ram_pool_pct,
        compressor,
        allocator,
        disk_backing,
        disk_total_bytes,
        stripe_width,
        per_device_bytes,
        disk_priority: DISK_PRIORITY,
        ram_priority: RAM_PRIORITY,
        tunables,
    };
    plan.validate()?;
    Ok(plan)
}

/// Uniform 2x multiplier, clamped.
///
/// Deliberately predictable for operators; the older piecewise formula
/// under-provisioned mid-range systems.
fn disk_swap_size(
    inventory: &Inventory,
    overrides: &Overrides,
    _ram_solution: &RamSolution,
) -> Result<u64> {
    let computed = (2 * inventory.ram_bytes).clamp(DISK_SWAP_MIN, DISK_SWAP_MAX);
    let requested = overrides.disk_total_bytes().unwrap_or(computed);

    // An override may not ask for more than the disk can yield once the
    // root floor is honored. The partition planner re-checks precisely;
    // this catches the inconsistency before anything runs.
    let min_root = overrides
        .preserve_root_bytes()
        .max(inventory.root_fs_used_bytes + 2 * GIB);
    let capacity = inventory.disk_bytes().saturating_sub(min_root);
    if overrides.disk_total_bytes().is_some() && requested > capacity {
        return Err(EngineError::Plan(format!(
            "requested {} of disk swap but only {} is available after the root floor",
            crate::helpers::format_size(requested),
            crate::helpers::format_size(capacity)
        )));
    }

    Ok(requested)
}

/// Linear pool percentage: small systems compress aggressively, large
/// systems keep the pool small for latency.
fn pool_percent(ram_bytes: u64) -> u64 {
    let ram_gib = ram_bytes as f64 / GIB as f64;
    let pct = 50.0 - 1.786 * (ram_gib - 2.0);
    pct.clamp(25.0, 50.0).round() as u64
}

fn select_ram_solution(ram_bytes: u64, forced: Option<RamSolutionArg>) -> RamSolution {
    match forced {
        Some(RamSolutionArg::CompressedCache) => RamSolution::CompressedCache,
        Some(RamSolutionArg::CompressedBlockDevice) => RamSolution::CompressedBlockDevice,
        Some(RamSolutionArg::None) => RamSolution::None,
        Some(RamSolutionArg::Auto) | None => {
            if ram_bytes >= SMALL_RAM_THRESHOLD {
                // disk-backed compressed caching: writeback of already
                // compressed pages is efficient
                RamSolution::CompressedCache
            } else {
                // no slack for a disk tier on small machines
                RamSolution::CompressedBlockDevice
            }
        }
    }
}

/// Backing-type ladder, with a feasibility escalation: files in the
/// root filesystem only work when the filesystem can actually hold
/// them, otherwise dedicated partitions are carved from the disk.
fn select_disk_backing(
    inventory: &Inventory,
    overrides: &Overrides,
    disk_total_bytes: u64,
) -> DiskBacking {
    match overrides.disk_backing {
        Some(DiskBackingArg::FilesInRoot) => return DiskBacking::FilesInRoot,
        Some(DiskBackingArg::NativeSwapPartitions) => return DiskBacking::NativeSwapPartitions,
        Some(DiskBackingArg::ZvolPartitions) => return DiskBacking::ZvolPartitions,
        Some(DiskBackingArg::FilesOnDedicatedPartition) => {
            return DiskBacking::FilesOnDedicatedPartition;
        }
        Some(DiskBackingArg::None) => return DiskBacking::None,
        Some(DiskBackingArg::Auto) | None => {}
    }

    let free = free_for_swap(inventory);
    let chosen = if free < 20 * GIB {
        DiskBacking::None
    } else if inventory.filesystem_kind.is_cow() {
        // swap files on copy-on-write roots fragment badly
        DiskBacking::ZvolPartitions
    } else if !inventory.is_rotational && free >= 50 * GIB {
        DiskBacking::FilesInRoot
    } else if inventory.is_rotational && free >= 100 * GIB {
        DiskBacking::NativeSwapPartitions
    } else {
        DiskBacking::FilesInRoot
    };

    // Escalate when the root filesystem cannot hold the files.
    if chosen == DiskBacking::FilesInRoot
        && inventory.root_fs_free_bytes < disk_total_bytes + 2 * GIB
    {
        return DiskBacking::NativeSwapPartitions;
    }
    chosen
}

/// Space the disk can yield for swap: the unpartitioned tail plus
/// whatever the root filesystem has free.
fn free_for_swap(inventory: &Inventory) -> u64 {
    let partitioned_end = (inventory.root_partition_start_sector
        + inventory.root_partition_size_sectors)
        * inventory.sector_size;
    let tail = inventory.disk_bytes().saturating_sub(partitioned_end);
    tail + inventory.root_fs_free_bytes
}

/// Compressor rule: small systems trade speed for ratio.
fn select_compressor(
    inventory: &Inventory,
    bench: &BenchResult,
    overrides: &Overrides,
) -> Result<String> {
    if let Some(forced) = &overrides.compressor {
        if !inventory.available_compressors.contains(forced) {
            return Err(EngineError::Plan(format!(
                "compressor {:?} is not available on this kernel",
                forced
            )));
        }
        return Ok(forced.clone());
    }

    let preferred = if inventory.ram_bytes < SMALL_RAM_THRESHOLD {
        "zstd"
    } else {
        "lz4"
    };
    if inventory.available_compressors.contains(preferred) {
        return Ok(preferred.to_string());
    }

    // Rule choice missing from this kernel: fall back to the best
    // measured compressor, then to anything advertised.
    if let Some(best) = bench.best_compressor() {
        return Ok(best.to_string());
    }
    inventory
        .available_compressors
        .iter()
        .next()
        .cloned()
        .ok_or_else(|| EngineError::Plan("no compressor available at all".into()))
}

/// Allocator rule: reliability over density for the transparent cache,
/// density for the block device.
///
/// zswap has historically failed silently when newer allocators were
/// not fully wired on older kernels, so the cache gets zbud (working
/// shrinker everywhere) even though zsmalloc packs tighter.
fn select_allocator(ram_solution: &RamSolution, overrides: &Overrides) -> Result<String> {
    if let Some(forced) = &overrides.allocator {
        return Ok(forced.clone());
    }
    Ok(match ram_solution {
        RamSolution::CompressedCache => "zbud".to_string(),
        _ => "zsmalloc".to_string(),
    })
}

/// Fallback stripe width when the matrix never ran: one device per two
/// cores, at least one, at most eight.
fn default_stripe_width(inventory: &Inventory) -> u32 {
    ((inventory.cpu_cores as u32).div_ceil(2)).clamp(1, 8)
}

fn derive_tunables(ram_bytes: u64, ram_solution: &RamSolution, bench: &BenchResult) -> Tunables {
    let compressed_cache = *ram_solution == RamSolution::CompressedCache;

    let swappiness = if compressed_cache {
        80
    } else if ram_bytes >= 16 * GIB && *ram_solution == RamSolution::None {
        10
    } else {
        60
    };

    // The matrix optimum speaks to disk I/O only. The compressed cache
    // operates at single-page granularity in RAM, where readahead is
    // counterproductive, so page_cluster is pinned to 0 regardless of
    // what the matrix measured.
    let page_cluster = if compressed_cache {
        0
    } else {
        bench
            .best_cell()
            .map(|cell| page_cluster_for_block_size(cell.block_size_kb))
            .unwrap_or(3)
    };

    Tunables {
        swappiness,
        page_cluster,
        cache_pressure: if compressed_cache { 50 } else { 100 },
        watermark_scale: if compressed_cache { 125 } else { 10 },
    }
}

/// Map a block size to log2 pages per swap operation.
fn page_cluster_for_block_size(block_size_kb: u32) -> u32 {
    match block_size_kb {
        4 => 0,
        8 => 1,
        16 => 2,
        32 => 3,
        64 => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::{MatrixCell, OptimalCells};
    use crate::inventory::{FilesystemKind, PartitionScheme};
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn inventory(ram_gib: u64) -> Inventory {
        let sector_size = 512;
        let disk_bytes = 40 * GIB;
        let root_bytes = 9 * GIB;
        Inventory {
            ram_bytes: ram_gib * GIB,
            available_ram_bytes: ram_gib * GIB * 3 / 4,
            cpu_cores: 4,
            page_size: 4096,
            disk_path: PathBuf::from("/dev/sda"),
            root_partition_path: PathBuf::from("/dev/sda1"),
            root_partition_number: 1,
            root_partition_start_sector: 2048,
            root_partition_size_sectors: root_bytes / sector_size,
            disk_size_sectors: disk_bytes / sector_size,
            sector_size,
            filesystem_kind: FilesystemKind::Ext4,
            root_fs_used_bytes: 6 * GIB,
            root_fs_free_bytes: 2 * GIB,
            is_rotational: false,
            partition_scheme: PartitionScheme::Gpt,
            available_compressors: ["lz4", "zstd", "lzo-rle"]
                .iter()
                .map(|s| s.to_string())
                .collect::<BTreeSet<_>>(),
            available_allocators: ["zsmalloc", "z3fold", "zbud"]
                .iter()
                .map(|s| s.to_string())
                .collect::<BTreeSet<_>>(),
        }
    }

    fn bench_with_optimum(block_size_kb: u32, concurrency: u32) -> BenchResult {
        let cell = MatrixCell {
            block_size_kb,
            concurrency,
            read_mb_per_s: 400.0,
            write_mb_per_s: 400.0,
            combined_mb_per_s: 800.0,
        };
        BenchResult {
            matrix: vec![cell],
            optimal: Some(OptimalCells {
                best_read: 0,
                best_write: 0,
                best_combined: 0,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn disk_sizing_floor_at_one_gib_ram() {
        let plan = compute_plan(&inventory(1), &BenchResult::default(), &Overrides::default())
            .unwrap();
        assert_eq!(plan.disk_total_bytes, 4 * GIB);
        assert_eq!(plan.ram_solution, RamSolution::CompressedBlockDevice);
    }

    #[test]
    fn disk_sizing_floor_at_two_gib_ram() {
        let plan = compute_plan(&inventory(2), &BenchResult::default(), &Overrides::default())
            .unwrap();
        assert_eq!(plan.disk_total_bytes, 4 * GIB);
        assert_eq!(plan.ram_pool_pct, 50);
    }

    #[test]
    fn sixteen_gib_ram_sizing() {
        let mut inv = inventory(16);
        inv.disk_size_sectors = 200 * GIB / 512;
        let plan = compute_plan(&inv, &BenchResult::default(), &Overrides::default()).unwrap();
        assert_eq!(plan.disk_total_bytes, 32 * GIB);
        assert_eq!(plan.ram_pool_pct, 25);
    }

    #[test]
    fn disk_sizing_ceiling_at_sixty_four_gib_ram() {
        let mut inv = inventory(64);
        inv.disk_size_sectors = 500 * GIB / 512;
        let plan = compute_plan(&inv, &BenchResult::default(), &Overrides::default()).unwrap();
        assert_eq!(plan.disk_total_bytes, 64 * GIB);
    }

    #[test]
    fn small_free_disk_means_no_backing() {
        let mut inv = inventory(8);
        // 19 GiB of reclaimable space in total
        inv.disk_size_sectors = inv.root_partition_start_sector
            + inv.root_partition_size_sectors
            + 17 * GIB / inv.sector_size;
        inv.root_fs_free_bytes = 2 * GIB;
        let plan = compute_plan(&inv, &BenchResult::default(), &Overrides::default()).unwrap();
        assert_eq!(plan.disk_backing, DiskBacking::None);
        assert_eq!(plan.disk_total_bytes, 0);
    }

    #[test]
    fn cow_root_selects_volume_partitions() {
        let mut inv = inventory(8);
        inv.filesystem_kind = FilesystemKind::Btrfs;
        let plan = compute_plan(&inv, &BenchResult::default(), &Overrides::default()).unwrap();
        assert_eq!(plan.disk_backing, DiskBacking::ZvolPartitions);
        assert!(plan.disk_backing.uses_partitions());
    }

    #[test]
    fn tight_root_escalates_files_to_partitions() {
        // ladder says files-in-root, but the 9 GiB root cannot hold
        // 14 GiB of swap files
        let inv = inventory(7);
        let plan = compute_plan(
            &inv,
            &bench_with_optimum(64, 8),
            &Overrides::default(),
        )
        .unwrap();
        assert_eq!(plan.disk_total_bytes, 14 * GIB);
        assert_eq!(plan.disk_backing, DiskBacking::NativeSwapPartitions);
    }

    #[test]
    fn greenfield_scenario_plan() {
        // RAM 7 GiB, 40 GiB SSD, root ext4 at 9 GiB, matrix optimum at
        // concurrency 8
        let inv = inventory(7);
        let plan = compute_plan(&inv, &bench_with_optimum(64, 8), &Overrides::default()).unwrap();

        assert_eq!(plan.ram_solution, RamSolution::CompressedCache);
        assert_eq!(plan.ram_pool_pct, 41);
        assert_eq!(plan.compressor, "lz4");
        assert_eq!(plan.allocator, "zbud");
        assert_eq!(plan.disk_total_bytes, 14 * GIB);
        assert_eq!(plan.stripe_width, 8);
        assert_eq!(plan.per_device_bytes, align_down(14 * GIB / 8, MIB));
        assert_eq!(plan.tunables.page_cluster, 0);
        assert_eq!(plan.tunables.swappiness, 80);
    }

    #[test]
    fn oversized_override_is_a_plan_error() {
        // RAM 8 GiB, 40 GiB disk: forcing 40 GiB of swap cannot fit
        let inv = inventory(8);
        let overrides = Overrides {
            disk_total_gib: Some(40),
            ..Default::default()
        };
        let err = compute_plan(&inv, &BenchResult::default(), &overrides).unwrap_err();
        assert!(matches!(err, EngineError::Plan(_)));
    }

    #[test]
    fn contradictory_matrix_optimum_still_pins_page_cluster() {
        // best combined at concurrency 16 but block size 4 KiB
        let inv = inventory(8);
        let plan = compute_plan(&inv, &bench_with_optimum(4, 16), &Overrides::default()).unwrap();
        assert_eq!(plan.stripe_width, 16);
        assert_eq!(plan.tunables.page_cluster, 0);
    }

    #[test]
    fn page_cluster_follows_block_size_without_cache() {
        let inv = inventory(8);
        let overrides = Overrides {
            ram_solution: Some(crate::config::RamSolutionArg::None),
            ..Default::default()
        };
        let plan = compute_plan(&inv, &bench_with_optimum(32, 4), &overrides).unwrap();
        assert_eq!(plan.ram_solution, RamSolution::None);
        assert_eq!(plan.tunables.page_cluster, 3);
        assert_eq!(plan.tunables.swappiness, 60);
    }

    #[test]
    fn high_ram_no_compression_swappiness() {
        let mut inv = inventory(32);
        inv.disk_size_sectors = 300 * GIB / 512;
        let overrides = Overrides {
            ram_solution: Some(crate::config::RamSolutionArg::None),
            ..Default::default()
        };
        let plan = compute_plan(&inv, &BenchResult::default(), &overrides).unwrap();
        assert_eq!(plan.tunables.swappiness, 10);
    }

    #[test]
    fn unknown_compressor_override_rejected() {
        let inv = inventory(8);
        let overrides = Overrides {
            compressor: Some("842".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            compute_plan(&inv, &BenchResult::default(), &overrides),
            Err(EngineError::Plan(_))
        ));
    }

    #[test]
    fn plan_is_deterministic() {
        let inv = inventory(7);
        let bench = bench_with_optimum(64, 8);
        let first = compute_plan(&inv, &bench, &Overrides::default()).unwrap();
        let second = compute_plan(&inv, &bench, &Overrides::default()).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn stripe_budget_invariant_holds() {
        for ram in [1, 2, 4, 7, 8, 16, 64] {
            let mut inv = inventory(ram);
            inv.disk_size_sectors = 500 * GIB / 512;
            for width in [1, 3, 5, 7, 16] {
                let overrides = Overrides {
                    stripe_width: Some(width),
                    ..Default::default()
                };
                let plan = compute_plan(&inv, &BenchResult::default(), &overrides).unwrap();
                assert!(plan.per_device_bytes * plan.stripe_width as u64 <= plan.disk_total_bytes.max(1));
            }
        }
    }
}
