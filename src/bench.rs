//! Benchmark engine for swaptune.
//!
//! Active measurement of the machine's compression and I/O behavior, as
//! opposed to the passive inventory probe. Five sub-tests run in fixed
//! order, each skippable by operator override and each bounded by a hard
//! wall-clock ceiling:
//!
//! 1. Compressor sweep - compression ratio and bandwidth per compressor
//! 2. Allocator sweep - pool density per allocator
//! 3. Matrix test - disk throughput over block size x concurrency
//! 4. Latency probe - RAM vs compressed-cache vs disk access time
//! 5. Cache-with-backing probe - writeback behavior with real swap
//!    partitions (runs in the second phase, after partitioning)
//!
//! A failed sub-test downgrades to a warning; the plan calculator falls
//! back to rule-based defaults for whatever is missing.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Overrides;
use crate::error::{EngineError, Result};
use crate::helpers::{read_trimmed, run_command, MIB};
use crate::inventory::Inventory;
use crate::pressure::{FillPattern, Locker, Pressurizer, SUBTEST_CEILING};
use crate::zswap::{self, ZswapBackup, ZswapStatus};

/// Block sizes (KiB) swept by the matrix test.
pub const BLOCK_SIZES_KB: [u32; 6] = [4, 8, 16, 32, 64, 128];
/// Concurrency levels swept by the matrix test.
pub const CONCURRENCY_LEVELS: [u32; 7] = [1, 2, 4, 6, 8, 12, 16];

/// Compressors the sweep considers, in preference order.
const SWEEP_COMPRESSORS: [&str; 3] = ["lz4", "zstd", "lzo-rle"];
/// Expected allocator efficiency ordering, densest first.
const ALLOCATOR_ORDER: [&str; 3] = ["zsmalloc", "z3fold", "zbud"];

/// Fraction of available RAM the Locker pins during sweeps.
const LOCK_PCT: u64 = 60;
/// Fraction of the remaining free RAM the Pressurizer fills.
const FILL_PCT: u64 = 50;

/// Per-compressor (or per-allocator) sweep measurement.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct CompressorStats {
    /// original bytes / compressed bytes; >= 1.0 means compression won
    pub compression_ratio: f64,
    /// Fill throughput through the compressed tier
    pub bandwidth_mb_per_s: f64,
    /// How much original data a RAM pool holds, as percent of pool size
    pub effective_capacity_pct: f64,
}

/// One cell of the block-size x concurrency matrix.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct MatrixCell {
    pub block_size_kb: u32,
    pub concurrency: u32,
    pub read_mb_per_s: f64,
    pub write_mb_per_s: f64,
    pub combined_mb_per_s: f64,
}

/// Indices into the matrix for the best rows by each criterion.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct OptimalCells {
    pub best_read: usize,
    pub best_write: usize,
    pub best_combined: usize,
}

/// Latency reference points. Informational; not consumed by the planner.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
pub struct LatencyProbe {
    /// Native RAM access over a resident buffer
    pub ram_ns: f64,
    /// Access to a page evicted to the compressed tier
    pub compressed_cache_us: Option<f64>,
    /// Direct 4 KiB disk read after dropping caches
    pub disk_us: Option<f64>,
}

/// Writeback behavior of the compressed cache with real backing swap.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct CacheBackingProbe {
    /// Analytic estimate for a pool hit with the chosen compressor
    pub hot_hit_us: f64,
    /// Measured average latency of reads that went to backing storage
    pub cold_read_us: f64,
    /// Eviction throughput to backing storage
    pub writeback_mb_per_s: f64,
    /// Total bytes written to backing devices during the probe
    pub bytes_written_to_backing: u64,
}

/// Immutable benchmark record: the contract between the measurement
/// phase and the plan calculator, persisted so it survives a reboot
/// when an offline shrink is scheduled.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct BenchResult {
    /// Creation timestamp (UTC, RFC 3339)
    pub created_at: String,
    /// Compressor name -> sweep measurement
    pub compressor_sweep: BTreeMap<String, CompressorStats>,
    /// Allocator name -> sweep measurement
    pub allocator_sweep: BTreeMap<String, CompressorStats>,
    /// Matrix test rows
    pub matrix: Vec<MatrixCell>,
    /// Best matrix rows, present when the matrix ran
    pub optimal: Option<OptimalCells>,
    /// Latency reference points
    pub latency: Option<LatencyProbe>,
    /// Backing-store probe, present only in the second phase
    pub cache_with_backing: Option<CacheBackingProbe>,
    /// The allocator sweep contradicted the expected ordering
    pub allocator_ordering_inconclusive: bool,
    /// The Locker could not pin memory; sweep numbers may be skewed
    pub locker_soft: bool,
    /// Cells or sub-tests that failed, in human-readable form
    pub warnings: Vec<String>,
}

impl BenchResult {
    /// Check the record's internal invariants.
    pub fn validate(&self) -> Result<()> {
        for (name, stats) in self.compressor_sweep.iter().chain(&self.allocator_sweep) {
            if stats.compression_ratio < 1.0 {
                return Err(EngineError::Bench(format!(
                    "{}: compression ratio {} below 1.0",
                    name, stats.compression_ratio
                )));
            }
            if stats.bandwidth_mb_per_s < 0.0 {
                return Err(EngineError::Bench(format!("{}: negative bandwidth", name)));
            }
        }
        for cell in &self.matrix {
            if cell.read_mb_per_s < 0.0 || cell.write_mb_per_s < 0.0 {
                return Err(EngineError::Bench("negative matrix bandwidth".into()));
            }
        }
        if let Some(optimal) = &self.optimal {
            for index in [optimal.best_read, optimal.best_write, optimal.best_combined] {
                if index >= self.matrix.len() {
                    return Err(EngineError::Bench(format!(
                        "optimal index {} outside matrix of {} rows",
                        index,
                        self.matrix.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// The best-compressing compressor, with ratios within 5% of the
    /// leader tie-broken by bandwidth.
    pub fn best_compressor(&self) -> Option<&str> {
        let leader = self
            .compressor_sweep
            .values()
            .map(|s| s.compression_ratio)
            .fold(f64::NEG_INFINITY, f64::max);
        if leader.is_infinite() {
            return None;
        }
        self.compressor_sweep
            .iter()
            .filter(|(_, s)| s.compression_ratio >= leader * 0.95)
            .max_by(|a, b| {
                a.1.bandwidth_mb_per_s
                    .partial_cmp(&b.1.bandwidth_mb_per_s)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(name, _)| name.as_str())
    }

    /// The matrix row with the highest combined throughput.
    pub fn best_cell(&self) -> Option<&MatrixCell> {
        self.optimal.map(|o| &self.matrix[o.best_combined])
    }

    /// Stripe-width recommendation: the optimal row's concurrency,
    /// clamped to `[1, 16]`.
    pub fn stripe_width(&self) -> Option<u32> {
        self.best_cell().map(|cell| cell.concurrency.clamp(1, 16))
    }

    /// Persist the record as JSON, both timestamped and at the stable
    /// `bench-latest.json` path the post-reboot finalizer reads.
    pub fn persist(&self, log_root: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(log_root)?;
        let content = serde_json::to_string_pretty(self)?;
        let stamped = log_root.join(format!(
            "bench-{}.json",
            crate::helpers::artifact_timestamp()
        ));
        std::fs::write(&stamped, &content)?;
        crate::helpers::write_atomic(&log_root.join("bench-latest.json"), &content)?;
        info!("benchmark record persisted to {}", stamped.display());
        Ok(stamped)
    }

    /// Load the most recently persisted record.
    pub fn load_latest(log_root: &Path) -> Result<Self> {
        let path = log_root.join("bench-latest.json");
        let content = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::Bench(format!("no persisted benchmark at {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Drives the benchmark suite against one machine.
pub struct BenchEngine<'a> {
    inventory: &'a Inventory,
    overrides: &'a Overrides,
    log_root: &'a Path,
}

impl<'a> BenchEngine<'a> {
    pub fn new(inventory: &'a Inventory, overrides: &'a Overrides, log_root: &'a Path) -> Self {
        Self {
            inventory,
            overrides,
            log_root,
        }
    }

    /// Run the first benchmark phase (everything except the
    /// backing-store probe) and persist the record.
    pub fn run(&self) -> Result<BenchResult> {
        let mut result = BenchResult {
            created_at: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        };

        if self.overrides.skip_compressor_sweep {
            info!("compressor sweep skipped by override");
        } else {
            self.compressor_sweep(&mut result);
        }

        if self.overrides.skip_allocator_sweep {
            info!("allocator sweep skipped by override");
        } else {
            self.allocator_sweep(&mut result);
        }

        if self.overrides.skip_matrix {
            info!("matrix test skipped by override");
        } else {
            self.matrix_test(&mut result);
        }

        if self.overrides.skip_latency {
            info!("latency probe skipped by override");
        } else {
            result.latency = Some(self.latency_probe(&mut result.warnings));
        }

        result.validate()?;
        result.persist(self.log_root)?;
        Ok(result)
    }

    /// Bytes the Locker pins and the Pressurizer fills during sweeps.
    fn sweep_sizes(&self) -> (u64, u64) {
        let available = self.inventory.available_ram_bytes;
        let lock = available * LOCK_PCT / 100;
        let fill = (available - lock) * FILL_PCT / 100;
        (lock, fill)
    }

    /// Measure one (compressor, allocator) operating point through the
    /// compressed cache.
    fn measure_compression(
        &self,
        compressor: &str,
        allocator: &str,
    ) -> Result<(CompressorStats, bool)> {
        zswap::quiesce()?;
        let backup = ZswapBackup::capture();
        zswap::enable(compressor, allocator, 50)?;

        let (lock_bytes, fill_bytes) = self.sweep_sizes();
        let locker = Locker::spawn(lock_bytes)?;
        let soft = locker.soft;

        let outcome = (|| -> Result<CompressorStats> {
            let mut pressurizer = Pressurizer::spawn(fill_bytes, FillPattern::Mixed, 120)?;
            let fill_elapsed = pressurizer.wait_filled(SUBTEST_CEILING)?;

            // Counters must be sampled while the allocation is alive;
            // the pool drains as soon as the helper exits.
            let status = ZswapStatus::read().ok_or_else(|| {
                EngineError::Bench("zswap counters unreadable during sweep".into())
            })?;
            pressurizer.finish();

            let ratio = status
                .compression_ratio(self.inventory.page_size)
                .ok_or_else(|| {
                    EngineError::Bench(format!(
                        "{}/{}: nothing reached the compressed pool",
                        compressor, allocator
                    ))
                })?;

            let secs = fill_elapsed.as_secs_f64().max(0.001);
            Ok(CompressorStats {
                compression_ratio: ratio.max(1.0),
                bandwidth_mb_per_s: (fill_bytes as f64 / secs) / MIB as f64,
                effective_capacity_pct: ratio.max(1.0) * 100.0,
            })
        })();

        // The Locker is always terminated after the Pressurizer and
        // before swap configuration changes.
        locker.release();
        let _ = zswap::quiesce();
        backup.restore();

        outcome.map(|stats| (stats, soft))
    }

    fn compressor_sweep(&self, result: &mut BenchResult) {
        let candidates: Vec<&str> = SWEEP_COMPRESSORS
            .iter()
            .copied()
            .filter(|name| self.inventory.available_compressors.contains(*name))
            .collect();
        info!("compressor sweep over {:?}", candidates);

        for compressor in candidates {
            match self.measure_compression(compressor, "z3fold") {
                Ok((stats, soft)) => {
                    info!(
                        "{}: ratio {:.2} bandwidth {:.0} MB/s",
                        compressor, stats.compression_ratio, stats.bandwidth_mb_per_s
                    );
                    result.locker_soft |= soft;
                    result.compressor_sweep.insert(compressor.to_string(), stats);
                }
                Err(e) => {
                    warn!("compressor {} failed: {}", compressor, e);
                    result.warnings.push(format!("compressor {}: {}", compressor, e));
                }
            }
        }
    }

    fn allocator_sweep(&self, result: &mut BenchResult) {
        let candidates: Vec<&str> = ALLOCATOR_ORDER
            .iter()
            .copied()
            .filter(|name| self.inventory.available_allocators.contains(*name))
            .collect();
        info!("allocator sweep over {:?}", candidates);

        for allocator in candidates {
            match self.measure_compression("lz4", allocator) {
                Ok((stats, soft)) => {
                    result.locker_soft |= soft;
                    result.allocator_sweep.insert(allocator.to_string(), stats);
                }
                Err(e) => {
                    warn!("allocator {} failed: {}", allocator, e);
                    result.warnings.push(format!("allocator {}: {}", allocator, e));
                }
            }
        }

        result.allocator_ordering_inconclusive =
            allocator_ordering_inconclusive(&result.allocator_sweep);
        if result.allocator_ordering_inconclusive {
            warn!("allocator sweep contradicts expected density ordering; falling back to defaults");
        }
    }

    fn matrix_test(&self, result: &mut BenchResult) {
        let bench_dir = PathBuf::from("/var/tmp/swaptune-bench");
        if let Err(e) = std::fs::create_dir_all(&bench_dir) {
            result.warnings.push(format!("matrix: cannot create {}: {}", bench_dir.display(), e));
            return;
        }

        let duration = self.overrides.bench_duration_s;
        for block_size in BLOCK_SIZES_KB {
            for concurrency in CONCURRENCY_LEVELS {
                match run_fio_cell(&bench_dir, block_size, concurrency, duration) {
                    Ok(cell) => result.matrix.push(cell),
                    Err(e) => {
                        warn!("matrix cell {}k x{} failed: {}", block_size, concurrency, e);
                        result
                            .warnings
                            .push(format!("matrix {}k x{}: {}", block_size, concurrency, e));
                    }
                }
            }
        }
        let _ = std::fs::remove_dir_all(&bench_dir);

        result.optimal = find_optimal(&result.matrix);
        if let Some(cell) = result.best_cell() {
            info!(
                "matrix optimum: {} KiB blocks x{} jobs, {:.0} MB/s combined",
                cell.block_size_kb, cell.concurrency, cell.combined_mb_per_s
            );
        }

        if let Err(e) = self.log_matrix_csv(&result.matrix) {
            warn!("matrix CSV log failed: {}", e);
        }
    }

    /// Append matrix cells to a CSV log for offline plotting.
    fn log_matrix_csv(&self, cells: &[MatrixCell]) -> Result<()> {
        let path = self
            .log_root
            .join(format!("matrix-{}.csv", crate::helpers::artifact_timestamp()));
        let mut writer = csv::Writer::from_path(&path)
            .map_err(|e| EngineError::Bench(format!("csv open: {}", e)))?;
        for cell in cells {
            writer
                .serialize(cell)
                .map_err(|e| EngineError::Bench(format!("csv write: {}", e)))?;
        }
        writer
            .flush()
            .map_err(|e| EngineError::Bench(format!("csv flush: {}", e)))?;
        Ok(())
    }

    fn latency_probe(&self, warnings: &mut Vec<String>) -> LatencyProbe {
        let ram_ns = measure_ram_ns();

        let compressed_cache_us = match measure_evicted_access_us() {
            Ok(us) => us,
            Err(e) => {
                warnings.push(format!("latency: compressed-cache point failed: {}", e));
                None
            }
        };

        let disk_us = match measure_disk_us() {
            Ok(us) => Some(us),
            Err(e) => {
                warnings.push(format!("latency: disk point failed: {}", e));
                None
            }
        };

        info!(
            "latency: ram {:.1} ns, cache {:?} us, disk {:?} us",
            ram_ns, compressed_cache_us, disk_us
        );
        LatencyProbe {
            ram_ns,
            compressed_cache_us,
            disk_us,
        }
    }

    /// Second-phase probe: measure cache writeback against the real swap
    /// partitions created by the partition transformer.
    pub fn backing_probe(
        &self,
        compressor: &str,
        allocator: &str,
        pool_pct: u64,
        pool_bytes: u64,
        devices: &[PathBuf],
    ) -> Result<CacheBackingProbe> {
        if devices.is_empty() {
            return Err(EngineError::Bench("no backing devices to probe".into()));
        }

        let before = DeviceCounters::read_many(devices);

        zswap::quiesce()?;
        let backup = ZswapBackup::capture();
        zswap::enable(compressor, allocator, pool_pct)?;

        let lock_bytes = self.inventory.available_ram_bytes * LOCK_PCT / 100;
        let locker = Locker::spawn(lock_bytes)?;

        // Overshoot the pool so eviction to backing storage must happen.
        let fill_bytes = pool_bytes + pool_bytes / 2;
        let outcome = (|| -> Result<(std::time::Duration, DeviceCounters)> {
            let mut pressurizer = Pressurizer::spawn(fill_bytes, FillPattern::Mixed, 120)?;
            let fill_elapsed = pressurizer.wait_filled(SUBTEST_CEILING)?;
            let after = DeviceCounters::read_many(devices);
            pressurizer.finish();
            Ok((fill_elapsed, after))
        })();

        locker.release();
        let _ = zswap::quiesce();
        backup.restore();

        let (fill_elapsed, after) = outcome?;
        let secs = fill_elapsed.as_secs_f64().max(0.001);
        let bytes_written = after.sectors_written.saturating_sub(before.sectors_written) * 512;
        let reads = after.reads_completed.saturating_sub(before.reads_completed);

        Ok(CacheBackingProbe {
            hot_hit_us: analytic_hot_hit_us(compressor),
            cold_read_us: fill_elapsed.as_micros() as f64 / reads.max(1) as f64,
            writeback_mb_per_s: (bytes_written as f64 / secs) / MIB as f64,
            bytes_written_to_backing: bytes_written,
        })
    }
}

/// Analytic pool-hit latency per compressor; decompression of a single
/// page dominates.
fn analytic_hot_hit_us(compressor: &str) -> f64 {
    match compressor {
        "zstd" => 12.5,
        "lzo-rle" => 6.0,
        _ => 7.5,
    }
}

/// True when the measured allocator densities contradict the expected
/// `zsmalloc > z3fold > zbud` ordering (within a 1% margin), which
/// happens when the synthetic data is compressible enough to make every
/// allocator look equal.
fn allocator_ordering_inconclusive(sweep: &BTreeMap<String, CompressorStats>) -> bool {
    let measured: Vec<f64> = ALLOCATOR_ORDER
        .iter()
        .filter_map(|name| sweep.get(*name))
        .map(|s| s.effective_capacity_pct)
        .collect();
    if measured.len() < 2 {
        return false;
    }
    measured
        .windows(2)
        .any(|pair| pair[0] <= pair[1] * 1.01)
}

/// Indices of the best rows by read, write, and combined throughput.
fn find_optimal(matrix: &[MatrixCell]) -> Option<OptimalCells> {
    if matrix.is_empty() {
        return None;
    }
    let index_of_max = |key: fn(&MatrixCell) -> f64| {
        matrix
            .iter()
            .enumerate()
            .max_by(|a, b| {
                key(a.1)
                    .partial_cmp(&key(b.1))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0)
    };
    Some(OptimalCells {
        best_read: index_of_max(|c| c.read_mb_per_s),
        best_write: index_of_max(|c| c.write_mb_per_s),
        best_combined: index_of_max(|c| c.combined_mb_per_s),
    })
}

/// Run one matrix cell through fio.
///
/// fio spawns `concurrency` workers inside one child process; that is
/// the kernel-level concurrency being measured. Queue depth 4 matches
/// the kernel's swap cluster maximum.
fn run_fio_cell(dir: &Path, block_size_kb: u32, concurrency: u32, duration_s: u64) -> Result<MatrixCell> {
    let dir_arg = dir.to_string_lossy().into_owned();
    let bs_arg = format!("{}k", block_size_kb);
    let jobs_arg = concurrency.to_string();
    let runtime_arg = duration_s.to_string();

    let out = run_command(
        "fio",
        &[
            "--name=swaptune",
            &format!("--directory={}", dir_arg),
            "--size=128m",
            "--rw=randrw",
            "--rwmixread=50",
            &format!("--bs={}", bs_arg),
            &format!("--numjobs={}", jobs_arg),
            "--iodepth=4",
            "--ioengine=libaio",
            "--direct=1",
            "--time_based",
            &format!("--runtime={}", runtime_arg),
            "--group_reporting=1",
            "--output-format=json",
        ],
    )?;
    if !out.success {
        return Err(EngineError::Bench(format!(
            "fio exited {:?}: {}",
            out.code,
            out.stderr.lines().next().unwrap_or("")
        )));
    }

    parse_fio_cell(&out.stdout, block_size_kb, concurrency)
}

/// Extract aggregated read/write bandwidth from fio's JSON report.
fn parse_fio_cell(json: &str, block_size_kb: u32, concurrency: u32) -> Result<MatrixCell> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| EngineError::Bench(format!("fio JSON unparseable: {}", e)))?;
    let job = value
        .get("jobs")
        .and_then(|jobs| jobs.get(0))
        .ok_or_else(|| EngineError::Bench("fio JSON has no jobs".into()))?;

    let bw_mb = |direction: &str| -> f64 {
        job.get(direction)
            .and_then(|d| d.get("bw_bytes"))
            .and_then(|b| b.as_f64())
            .unwrap_or(0.0)
            / MIB as f64
    };

    let read = bw_mb("read");
    let write = bw_mb("write");
    Ok(MatrixCell {
        block_size_kb,
        concurrency,
        read_mb_per_s: read,
        write_mb_per_s: write,
        combined_mb_per_s: read + write,
    })
}

/// Average RAM access time over a resident buffer, in nanoseconds.
fn measure_ram_ns() -> f64 {
    const WORDS: usize = 8 * MIB as usize / 8;
    const ACCESSES: usize = 4_000_000;

    let mut buffer: Vec<u64> = vec![1; WORDS];
    for (i, word) in buffer.iter_mut().enumerate() {
        *word = i as u64;
    }

    // Pseudo-random walk defeats the prefetcher.
    let mut index: usize = 0;
    let mut sink: u64 = 0;
    let start = Instant::now();
    for _ in 0..ACCESSES {
        index = (index.wrapping_mul(2654435761).wrapping_add(12345)) % WORDS;
        sink = sink.wrapping_add(buffer[index]);
    }
    let elapsed = start.elapsed();
    std::hint::black_box(sink);

    elapsed.as_nanos() as f64 / ACCESSES as f64
}

/// Time re-access of pages evicted via `madvise(MADV_PAGEOUT)`.
///
/// When a compressed tier is active the faults resolve from the pool;
/// returns `None` when the kernel refuses the madvise or nothing was
/// evicted (no swap tier at all).
fn measure_evicted_access_us() -> Result<Option<f64>> {
    const BYTES: usize = 64 * MIB as usize;
    let page = 4096;
    let mut buffer: Vec<u8> = vec![0; BYTES];
    for i in (0..BYTES).step_by(page) {
        buffer[i] = (i & 0xFF) as u8 | 0x01;
    }

    let rc = unsafe {
        libc::madvise(
            buffer.as_mut_ptr() as *mut libc::c_void,
            BYTES,
            libc::MADV_PAGEOUT,
        )
    };
    if rc != 0 {
        return Ok(None);
    }
    std::thread::sleep(std::time::Duration::from_millis(200));

    let pages = BYTES / page;
    let mut sink: u64 = 0;
    let start = Instant::now();
    for i in (0..BYTES).step_by(page) {
        sink = sink.wrapping_add(buffer[i] as u64);
    }
    let elapsed = start.elapsed();
    std::hint::black_box(sink);

    Ok(Some(elapsed.as_micros() as f64 / pages as f64))
}

/// Direct 4 KiB random reads after dropping caches, in microseconds.
fn measure_disk_us() -> Result<f64> {
    const FILE_MIB: u64 = 64;
    const READS: u64 = 256;

    let path = PathBuf::from("/var/tmp/swaptune-latency.bin");
    create_test_file(&path, FILE_MIB)?;

    // Dropping caches needs root; best effort, same as any cold-cache
    // measurement.
    let _ = std::fs::write("/proc/sys/vm/drop_caches", b"3");

    let mut file = std::fs::File::open(&path)?;
    let mut buf = [0u8; 4096];
    let file_bytes = FILE_MIB * MIB;

    let mut offset_state: u64 = 0x9E3779B97F4A7C15;
    let start = Instant::now();
    for _ in 0..READS {
        offset_state = offset_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let offset = (offset_state % (file_bytes / 4096)) * 4096;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
    }
    let elapsed = start.elapsed();

    let _ = std::fs::remove_file(&path);
    Ok(elapsed.as_micros() as f64 / READS as f64)
}

/// Create a patterned test file for the disk latency point.
fn create_test_file(path: &Path, size_mib: u64) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    let chunk = vec![0xABu8; MIB as usize];
    for _ in 0..size_mib {
        file.write_all(&chunk)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Aggregated I/O counters over a set of block devices, from
/// `/sys/class/block/<dev>/stat`.
#[derive(Clone, Copy, Debug, Default)]
struct DeviceCounters {
    reads_completed: u64,
    sectors_written: u64,
}

impl DeviceCounters {
    fn read_many(devices: &[PathBuf]) -> Self {
        let mut total = Self::default();
        for device in devices {
            let Some(name) = device.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            let Some(raw) = read_trimmed(format!("/sys/class/block/{}/stat", name)) else {
                continue;
            };
            let fields: Vec<u64> = raw
                .split_whitespace()
                .map(|f| f.parse().unwrap_or(0))
                .collect();
            if fields.len() >= 7 {
                total.reads_completed += fields[0];
                total.sectors_written += fields[6];
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(ratio: f64, bandwidth: f64) -> CompressorStats {
        CompressorStats {
            compression_ratio: ratio,
            bandwidth_mb_per_s: bandwidth,
            effective_capacity_pct: ratio * 100.0,
        }
    }

    fn cell(bs: u32, jobs: u32, read: f64, write: f64) -> MatrixCell {
        MatrixCell {
            block_size_kb: bs,
            concurrency: jobs,
            read_mb_per_s: read,
            write_mb_per_s: write,
            combined_mb_per_s: read + write,
        }
    }

    #[test]
    fn best_compressor_prefers_ratio() {
        let mut result = BenchResult::default();
        result.compressor_sweep.insert("lz4".into(), stats(2.0, 900.0));
        result.compressor_sweep.insert("zstd".into(), stats(3.0, 400.0));
        assert_eq!(result.best_compressor(), Some("zstd"));
    }

    #[test]
    fn best_compressor_ties_break_on_bandwidth() {
        // ratios within 5% of each other: faster one wins
        let mut result = BenchResult::default();
        result.compressor_sweep.insert("lz4".into(), stats(2.92, 900.0));
        result.compressor_sweep.insert("zstd".into(), stats(3.0, 400.0));
        assert_eq!(result.best_compressor(), Some("lz4"));
    }

    #[test]
    fn best_compressor_empty_sweep() {
        assert_eq!(BenchResult::default().best_compressor(), None);
    }

    #[test]
    fn optimal_points_at_max_combined() {
        let matrix = vec![
            cell(4, 1, 100.0, 100.0),
            cell(64, 8, 400.0, 380.0),
            cell(128, 16, 350.0, 300.0),
        ];
        let optimal = find_optimal(&matrix).unwrap();
        assert_eq!(optimal.best_combined, 1);
        assert_eq!(optimal.best_read, 1);
    }

    #[test]
    fn stripe_width_comes_from_best_cell_clamped() {
        let mut result = BenchResult {
            matrix: vec![cell(4, 16, 500.0, 500.0), cell(8, 2, 10.0, 10.0)],
            ..Default::default()
        };
        result.optimal = find_optimal(&result.matrix);
        assert_eq!(result.stripe_width(), Some(16));
    }

    #[test]
    fn validate_rejects_dangling_optimal_index() {
        let result = BenchResult {
            matrix: vec![cell(4, 1, 1.0, 1.0)],
            optimal: Some(OptimalCells {
                best_read: 0,
                best_write: 0,
                best_combined: 3,
            }),
            ..Default::default()
        };
        assert!(result.validate().is_err());
    }

    #[test]
    fn validate_rejects_ratio_below_one() {
        let mut result = BenchResult::default();
        result.compressor_sweep.insert("lz4".into(), stats(0.8, 100.0));
        assert!(result.validate().is_err());
    }

    #[test]
    fn allocator_ordering_detection() {
        let mut sweep = BTreeMap::new();
        sweep.insert("zsmalloc".to_string(), stats(3.0, 100.0));
        sweep.insert("z3fold".to_string(), stats(2.5, 100.0));
        sweep.insert("zbud".to_string(), stats(1.8, 100.0));
        assert!(!allocator_ordering_inconclusive(&sweep));

        // highly compressible data flattens the densities
        let mut flat = BTreeMap::new();
        flat.insert("zsmalloc".to_string(), stats(2.0, 100.0));
        flat.insert("z3fold".to_string(), stats(2.0, 100.0));
        assert!(allocator_ordering_inconclusive(&flat));
    }

    #[test]
    fn fio_json_parses_aggregated_bandwidth() {
        let json = r#"{
            "jobs": [{
                "read":  { "bw_bytes": 104857600 },
                "write": { "bw_bytes": 52428800 }
            }]
        }"#;
        let cell = parse_fio_cell(json, 64, 8).unwrap();
        assert_eq!(cell.block_size_kb, 64);
        assert_eq!(cell.concurrency, 8);
        assert!((cell.read_mb_per_s - 100.0).abs() < 0.01);
        assert!((cell.write_mb_per_s - 50.0).abs() < 0.01);
        assert!((cell.combined_mb_per_s - 150.0).abs() < 0.01);
    }

    #[test]
    fn analytic_hot_hit_table() {
        assert!(analytic_hot_hit_us("lz4") < analytic_hot_hit_us("zstd"));
    }

    #[test]
    fn persist_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = BenchResult {
            created_at: "2026-01-01T00:00:00Z".into(),
            ..Default::default()
        };
        result.compressor_sweep.insert("lz4".into(), stats(2.5, 800.0));
        result.persist(dir.path()).unwrap();

        let loaded = BenchResult::load_latest(dir.path()).unwrap();
        assert_eq!(loaded.created_at, result.created_at);
        assert_eq!(
            loaded.compressor_sweep["lz4"].compression_ratio,
            result.compressor_sweep["lz4"].compression_ratio
        );
    }
}
