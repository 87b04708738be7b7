//! Pipeline orchestration for swaptune.
//!
//! The engine is one long-lived, single-threaded process driving
//! external helpers and the kernel through control files. Stages run in
//! a strict sequence - inventory, benchmark, plan, partition, activate,
//! tunables - with every stage's artifacts persisted before the next
//! begins, and a re-entry point after partition creation for the
//! backed-by-real-disk benchmark phase.
//!
//! Exit codes: 0 success, 42 offline shrink scheduled (reboot
//! required), other non-zero values per error kind.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::activate;
use crate::bench::{BenchEngine, BenchResult};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::gpt::PartitionPlan;
use crate::helpers::{format_size, is_root, InstanceLock};
use crate::initramfs::{self, ShrinkConfig};
use crate::inventory::{self, Inventory, ToolAvailability};
use crate::partition::{PartitionTransformer, TransformOutcome};
use crate::plan::{self, Plan, RamSolution};
use crate::report::{FinalState, RunDocument};
use crate::sysctl;
use crate::{zram, zswap};

/// Exit code signalling that a reboot must happen before the topology
/// is complete.
pub const EXIT_REBOOT_REQUIRED: i32 = 42;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Called from the signal handler: request an ordered stop at the next
/// stage boundary. Child helpers are killed by their drop guards.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn check_interrupted() -> Result<()> {
    if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        return Err(EngineError::Environment(
            "interrupted; partial artifacts are recorded in the run document".into(),
        ));
    }
    Ok(())
}

/// Main application: holds the configuration and the single-instance
/// lock for the process lifetime.
pub struct App {
    config: Config,
    _lock: InstanceLock,
}

impl App {
    /// Create the application, acquiring the instance lock.
    ///
    /// Kernel swap state is process-wide; two engines running at once
    /// would race on zswap parameters and the partition table.
    pub fn new(config: Config) -> Result<Self> {
        if !is_root() {
            return Err(EngineError::Environment(
                "swaptune must run as root to reshape swap topology".into(),
            ));
        }
        let lock = InstanceLock::acquire(&config.log_root)?;
        Ok(Self {
            config,
            _lock: lock,
        })
    }

    /// Full pipeline. Returns the process exit code.
    pub fn run(&self) -> Result<i32> {
        let availability = ToolAvailability::probe();
        let inv = inventory::probe_system()?;
        let mut doc = RunDocument::new(inv.clone(), availability.clone());

        let outcome = self.pipeline(&inv, &availability, &mut doc);

        if let Err(e) = &outcome {
            doc.warnings.push(e.to_string());
            if doc.final_state == FinalState::SwapActive {
                doc.final_state = FinalState::PartialActivation;
            }
        }
        // Best effort: a persistence failure must not mask the pipeline
        // outcome. Every failure path still leaves a documented state.
        if let Err(e) = doc.persist(&self.config.log_root) {
            warn!("could not persist run document: {}", e);
        }
        print!("{}", doc.summary());

        outcome
    }

    fn pipeline(
        &self,
        inv: &Inventory,
        availability: &ToolAvailability,
        doc: &mut RunDocument,
    ) -> Result<i32> {
        let overrides = &self.config.overrides;

        // Benchmark phase 1
        check_interrupted()?;
        let engine = BenchEngine::new(inv, overrides, &self.config.log_root);
        let mut bench = engine.run()?;
        doc.bench = Some(bench.clone());

        // Plan
        check_interrupted()?;
        let plan = plan::compute_plan(inv, &bench, overrides)?;
        doc.plan = Some(plan.clone());
        info!(
            "plan: {:?} + {:?}, {} disk swap across {} devices",
            plan.ram_solution,
            plan.disk_backing,
            format_size(plan.disk_total_bytes),
            plan.stripe_width
        );

        let mut anything_changed = false;

        // Partition
        check_interrupted()?;
        let partition_outcome = if plan.disk_backing.uses_partitions() {
            availability.check_partitioning()?;
            let transformer = PartitionTransformer::new(inv, overrides);
            let outcome = transformer.transform(&plan)?;
            doc.partition_plan = Some(outcome.partition_plan().clone());

            if let TransformOutcome::RebootRequired(_) = outcome {
                doc.final_state = FinalState::RebootRequired;
                info!("offline shrink scheduled; reboot to continue");
                return Ok(EXIT_REBOOT_REQUIRED);
            }
            anything_changed |= matches!(outcome, TransformOutcome::Applied(_));
            Some(outcome)
        } else {
            None
        };

        // Activate the disk tier
        check_interrupted()?;
        if let Some(outcome) = &partition_outcome {
            doc.final_state = FinalState::PartialActivation;
            let devices =
                activate::activate_partitions(outcome.partition_plan(), &plan, Path::new(activate::FSTAB_PATH))?;
            doc.active_devices = devices;
        } else if plan.disk_backing == crate::plan::DiskBacking::FilesInRoot
            && plan.disk_total_bytes > 0
        {
            doc.final_state = FinalState::PartialActivation;
            let files = activate::activate_swap_files(
                &plan,
                Path::new("/var/swap"),
                Path::new(activate::FSTAB_PATH),
            )?;
            info!("{} swap files active", files.len());
            anything_changed = true;
        }

        // RAM tier + tunables
        check_interrupted()?;
        activate::setup_ram_tier(&plan)?;
        anything_changed |= sysctl::apply(&plan.tunables, Path::new(sysctl::DROPIN_PATH))?;

        // Re-entry: benchmark phase 2 against the real backing devices
        if let Some(outcome) = &partition_outcome {
            if plan.ram_solution == RamSolution::CompressedCache
                && !overrides.skip_backing_probe
                && matches!(outcome, TransformOutcome::Applied(_))
            {
                match engine.backing_probe(
                    &plan.compressor,
                    &plan.allocator,
                    plan.ram_pool_pct,
                    plan.ram_pool_bytes,
                    &outcome.partition_plan().swap_nodes(),
                ) {
                    Ok(probe) => {
                        bench.cache_with_backing = Some(probe);
                        bench.persist(&self.config.log_root)?;
                        doc.bench = Some(bench.clone());
                    }
                    Err(e) => {
                        warn!("backing probe failed: {}", e);
                        doc.warnings.push(format!("backing probe: {}", e));
                    }
                }
            }
        }

        doc.final_state = if anything_changed {
            FinalState::SwapActive
        } else {
            FinalState::NoChange
        };
        Ok(0)
    }

    /// Dry run: probe and plan against the persisted benchmark record
    /// (or rule defaults), write the report, mutate nothing.
    pub fn plan_only(&self) -> Result<i32> {
        let availability = ToolAvailability::probe();
        let inv = inventory::probe_system()?;
        let mut doc = RunDocument::new(inv.clone(), availability);

        let bench = BenchResult::load_latest(&self.config.log_root).unwrap_or_else(|_| {
            info!("no persisted benchmark; planning from rule defaults");
            BenchResult::default()
        });
        doc.bench = Some(bench.clone());

        let plan = plan::compute_plan(&inv, &bench, &self.config.overrides)?;
        doc.plan = Some(plan);
        doc.final_state = FinalState::PlanComplete;

        doc.persist(&self.config.log_root)?;
        print!("{}", doc.summary());
        Ok(0)
    }

    /// Benchmark only: run the suite and persist the record.
    pub fn bench_only(&self) -> Result<i32> {
        let inv = inventory::probe_system()?;
        let engine = BenchEngine::new(&inv, &self.config.overrides, &self.config.log_root);
        let bench = engine.run()?;

        if let Some(best) = bench.best_compressor() {
            let stats = &bench.compressor_sweep[best];
            println!(
                "best compressor: {} ({:.2}x at {:.0} MB/s)",
                best, stats.compression_ratio, stats.bandwidth_mb_per_s
            );
        }
        if let Some(cell) = bench.best_cell() {
            println!(
                "disk optimum: {} KiB blocks x{} jobs, {:.0} MB/s combined",
                cell.block_size_kb, cell.concurrency, cell.combined_mb_per_s
            );
        }
        Ok(0)
    }

    /// Post-reboot finalizer: the initramfs stage has already resized
    /// the root and written the table; format and persist the swap
    /// partitions, bring back the RAM tier, and clear the staging.
    pub fn finalize(&self) -> Result<i32> {
        let staged = ShrinkConfig::load()?;
        let mut doc = RunDocument::load_latest(&self.config.log_root)?;

        let plan: Plan = doc
            .plan
            .clone()
            .ok_or_else(|| EngineError::Activation("run document has no plan".into()))?;
        let partition_plan: PartitionPlan = doc.partition_plan.clone().ok_or_else(|| {
            EngineError::Activation("run document has no partition plan".into())
        })?;

        if let Some(config) = &staged {
            info!(
                "finalizing after offline shrink of {} (partitions {}..{})",
                config.disk, config.swap_first_num, config.swap_last_num
            );
        }

        let devices = activate::activate_partitions(
            &partition_plan,
            &plan,
            Path::new(activate::FSTAB_PATH),
        )?;
        doc.active_devices = devices;

        activate::setup_ram_tier(&plan)?;
        sysctl::apply(&plan.tunables, Path::new(sysctl::DROPIN_PATH))?;

        initramfs::clear_scheduled();
        doc.final_state = FinalState::SwapActive;
        doc.persist(&self.config.log_root)?;
        print!("{}", doc.summary());
        Ok(0)
    }
}

/// Show the current swap topology and compression counters. Read-only;
/// needs neither root nor the instance lock.
pub fn status() -> Result<i32> {
    if let Some(status) = zswap::ZswapStatus::read() {
        if status.enabled {
            println!("Compressed cache ({}):", status.compressor);
            println!("  Allocator:     {}", status.zpool);
            println!("  Pool ceiling:  {}% of RAM", status.max_pool_percent);
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
            if let Some(ratio) = status.compression_ratio(page_size) {
                println!(
                    "  Stored:        {} compressed to {} ({:.1}x)",
                    format_size(status.stored_pages * page_size),
                    format_size(status.pool_total_size),
                    ratio
                );
            } else {
                println!("  Pool:          empty");
            }
            if status.written_back_pages > 0 {
                println!("  Written back:  {} pages", status.written_back_pages);
            }
        }
    }

    if let Some(stats) = zram::ZramStats::read() {
        if stats.orig_data_size > 0 {
            println!("Compressed block device:");
            println!(
                "  Stored:        {} compressed to {} ({:.1}x)",
                format_size(stats.orig_data_size),
                format_size(stats.mem_used_total),
                stats.compression_ratio().unwrap_or(0.0)
            );
        }
    }

    println!("Active swap:");
    match std::fs::read_to_string("/proc/swaps") {
        Ok(content) if content.lines().count() > 1 => {
            println!("  {:<32} {:>12} {:>12} {:>6}", "Device", "Size", "Used", "Prio");
            for line in content.lines().skip(1) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() >= 5 {
                    let size_kib: u64 = fields[2].parse().unwrap_or(0);
                    let used_kib: u64 = fields[3].parse().unwrap_or(0);
                    println!(
                        "  {:<32} {:>12} {:>12} {:>6}",
                        fields[0],
                        format_size(size_kib * 1024),
                        format_size(used_kib * 1024),
                        fields[4]
                    );
                }
            }
        }
        _ => println!("  none"),
    }

    Ok(0)
}
