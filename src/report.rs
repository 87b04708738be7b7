//! Run reporting: the JSON contract between stages and the
//! human-readable summary.
//!
//! The JSON document is what the post-reboot finalizer reads to know
//! what to do and how to verify success, so every stage's artifact
//! lands in it. The human summary is a short block suitable for a
//! provisioning log or a notification transport.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::activate::ActiveDevice;
use crate::bench::BenchResult;
use crate::error::{EngineError, Result};
use crate::gpt::PartitionPlan;
use crate::helpers::format_size;
use crate::inventory::{Inventory, ToolAvailability};
use crate::plan::{Plan, RamSolution};

/// Version of the persisted document layout.
const SCHEMA_VERSION: u32 = 1;

/// Where a run ended up. Every failure path still produces a document
/// with one of these, so the system state is never undocumented.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    /// Dry run: plan computed, nothing written
    PlanComplete,
    /// Partitions exist, swap active, tunables applied
    SwapActive,
    /// Partitions were created but activation did not finish
    PartialActivation,
    /// Offline shrink staged; a reboot must happen next
    RebootRequired,
    /// Rerun found nothing to do
    NoChange,
}

/// The run document: the engine's complete record of one invocation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunDocument {
    pub schema_version: u32,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub inventory: Inventory,
    pub availability: ToolAvailability,
    pub bench: Option<BenchResult>,
    pub plan: Option<Plan>,
    pub partition_plan: Option<PartitionPlan>,
    pub active_devices: Vec<ActiveDevice>,
    pub final_state: FinalState,
    pub warnings: Vec<String>,
}

impl RunDocument {
    pub fn new(inventory: Inventory, availability: ToolAvailability) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
            inventory,
            availability,
            bench: None,
            plan: None,
            partition_plan: None,
            active_devices: Vec::new(),
            final_state: FinalState::PlanComplete,
            warnings: Vec::new(),
        }
    }

    /// Persist the document, timestamped plus at the stable
    /// `run-latest.json` path the finalizer reads after a reboot.
    pub fn persist(&mut self, log_root: &Path) -> Result<PathBuf> {
        self.finished_at = Some(chrono::Utc::now().to_rfc3339());
        std::fs::create_dir_all(log_root)?;

        let content = serde_json::to_string_pretty(self)?;
        let stamped = log_root.join(format!(
            "run-{}.json",
            crate::helpers::artifact_timestamp()
        ));
        std::fs::write(&stamped, &content)?;
        crate::helpers::write_atomic(&log_root.join("run-latest.json"), &content)?;
        info!("run document persisted to {}", stamped.display());
        Ok(stamped)
    }

    /// Load the most recent run document.
    pub fn load_latest(log_root: &Path) -> Result<Self> {
        let path = log_root.join("run-latest.json");
        let content = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::Environment(format!(
                "no run document at {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Build the human-readable summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str("=== swaptune summary ===\n");
        out.push_str(&format!(
            "RAM:            {} ({} cores)\n",
            format_size(self.inventory.ram_bytes),
            self.inventory.cpu_cores
        ));
        out.push_str(&format!(
            "Root disk:      {} ({}, {})\n",
            self.inventory.disk_path.display(),
            format_size(self.inventory.disk_bytes()),
            if self.inventory.is_rotational {
                "rotational"
            } else {
                "solid-state"
            }
        ));

        if let Some(plan) = &self.plan {
            out.push_str(&format!("RAM solution:   {:?}\n", plan.ram_solution));
            if plan.ram_solution != RamSolution::None {
                out.push_str(&format!(
                    "RAM pool:       {} ({}% of RAM)\n",
                    format_size(plan.ram_pool_bytes),
                    plan.ram_pool_pct
                ));
                out.push_str(&format!(
                    "Compressor:     {} / {}\n",
                    plan.compressor, plan.allocator
                ));
            }
            out.push_str(&format!("Disk backing:   {:?}\n", plan.disk_backing));
            if plan.disk_total_bytes > 0 {
                out.push_str(&format!(
                    "Disk swap:      {} across {} devices of {}\n",
                    format_size(plan.disk_total_bytes),
                    plan.stripe_width,
                    format_size(plan.per_device_bytes)
                ));
            }
            out.push_str(&format!(
                "Tunables:       swappiness={} page_cluster={} cache_pressure={} watermark_scale={}\n",
                plan.tunables.swappiness,
                plan.tunables.page_cluster,
                plan.tunables.cache_pressure,
                plan.tunables.watermark_scale
            ));
        }

        if let Some(bench) = &self.bench {
            if let Some((name, stats)) = bench
                .best_compressor()
                .and_then(|n| bench.compressor_sweep.get(n).map(|s| (n, s)))
            {
                out.push_str(&format!(
                    "Measured ratio: {:.2}x with {} at {:.0} MB/s\n",
                    stats.compression_ratio, name, stats.bandwidth_mb_per_s
                ));
            }
            if let Some(cell) = bench.best_cell() {
                // both values so an operator can audit the forced
                // page-cluster against the disk optimum
                let forced = self
                    .plan
                    .as_ref()
                    .map(|p| p.tunables.page_cluster.to_string())
                    .unwrap_or_else(|| "-".into());
                out.push_str(&format!(
                    "Disk optimum:   {} KiB blocks x{} jobs ({:.0} MB/s); page_cluster applied: {}\n",
                    cell.block_size_kb, cell.concurrency, cell.combined_mb_per_s, forced
                ));
                if matrix_optimum_unusual(cell.block_size_kb, cell.concurrency) {
                    out.push_str(
                        "Note:           matrix optimum pairs small blocks with high concurrency; unusual, audit the raw sweep\n",
                    );
                }
            }
            if bench.allocator_ordering_inconclusive {
                out.push_str(
                    "Note:           allocator sweep inconclusive; rule-based allocator defaults were used\n",
                );
            }
            if bench.locker_soft {
                out.push_str(
                    "Note:           memory pinning was not permitted; sweep numbers may be skewed\n",
                );
            }
        }

        out.push_str(&format!("Final state:    {:?}\n", self.final_state));
        for warning in &self.warnings {
            out.push_str(&format!("Warning:        {}\n", warning));
        }
        out
    }
}

/// A best-combined cell that pairs the smallest blocks with near-peak
/// concurrency contradicts the usual throughput curve and deserves an
/// operator's eye.
fn matrix_optimum_unusual(block_size_kb: u32, concurrency: u32) -> bool {
    block_size_kb <= 8 && concurrency >= 12
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::{CompressorStats, MatrixCell, OptimalCells};
    use crate::helpers::GIB;
    use crate::inventory::{FilesystemKind, PartitionScheme};
    use crate::plan::{DiskBacking, Tunables};
    use std::collections::BTreeSet;

    fn document() -> RunDocument {
        let inventory = Inventory {
            ram_bytes: 7 * GIB,
            available_ram_bytes: 5 * GIB,
            cpu_cores: 4,
            page_size: 4096,
            disk_path: PathBuf::from("/dev/sda"),
            root_partition_path: PathBuf::from("/dev/sda1"),
            root_partition_number: 1,
            root_partition_start_sector: 2048,
            root_partition_size_sectors: 18_874_368,
            disk_size_sectors: 83_886_080,
            sector_size: 512,
            filesystem_kind: FilesystemKind::Ext4,
            root_fs_used_bytes: 6 * GIB,
            root_fs_free_bytes: 2 * GIB,
            is_rotational: false,
            partition_scheme: PartitionScheme::Gpt,
            available_compressors: BTreeSet::new(),
            available_allocators: BTreeSet::new(),
        };
        let mut doc = RunDocument::new(inventory, ToolAvailability::default());
        doc.plan = Some(Plan {
            ram_solution: RamSolution::CompressedCache,
            ram_pool_bytes: 2 * GIB + 894 * 1024 * 1024,
            ram_pool_pct: 41,
            compressor: "lz4".into(),
            allocator: "zbud".into(),
            disk_backing: DiskBacking::NativeSwapPartitions,
            disk_total_bytes: 14 * GIB,
            stripe_width: 8,
            per_device_bytes: 14 * GIB / 8,
            disk_priority: 10,
            ram_priority: 100,
            tunables: Tunables {
                swappiness: 80,
                page_cluster: 0,
                cache_pressure: 50,
                watermark_scale: 125,
            },
        });
        doc
    }

    fn bench_with(block_size_kb: u32, concurrency: u32) -> BenchResult {
        let cell = MatrixCell {
            block_size_kb,
            concurrency,
            read_mb_per_s: 300.0,
            write_mb_per_s: 300.0,
            combined_mb_per_s: 600.0,
        };
        let mut bench = BenchResult {
            matrix: vec![cell],
            optimal: Some(OptimalCells {
                best_read: 0,
                best_write: 0,
                best_combined: 0,
            }),
            ..Default::default()
        };
        bench.compressor_sweep.insert(
            "lz4".into(),
            CompressorStats {
                compression_ratio: 2.8,
                bandwidth_mb_per_s: 850.0,
                effective_capacity_pct: 280.0,
            },
        );
        bench
    }

    #[test]
    fn summary_covers_the_required_fields() {
        let mut doc = document();
        doc.bench = Some(bench_with(64, 8));
        let summary = doc.summary();
        for needle in [
            "7.0 GiB",
            "CompressedCache",
            "lz4 / zbud",
            "14.0 GiB across 8 devices",
            "swappiness=80",
            "2.80x",
            "page_cluster applied: 0",
        ] {
            assert!(summary.contains(needle), "summary missing {:?}:\n{}", needle, summary);
        }
    }

    #[test]
    fn unusual_matrix_optimum_is_flagged() {
        let mut doc = document();
        doc.bench = Some(bench_with(4, 16));
        assert!(doc.summary().contains("unusual"));

        let mut normal = document();
        normal.bench = Some(bench_with(64, 8));
        assert!(!normal.summary().contains("unusual"));
    }

    #[test]
    fn document_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document();
        doc.final_state = FinalState::RebootRequired;
        doc.persist(dir.path()).unwrap();

        let loaded = RunDocument::load_latest(dir.path()).unwrap();
        assert_eq!(loaded.final_state, FinalState::RebootRequired);
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
        assert_eq!(
            loaded.plan.as_ref().unwrap().stripe_width,
            doc.plan.as_ref().unwrap().stripe_width
        );
    }
}
