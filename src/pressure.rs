//! Child-process drivers for the memory pressure helpers.
//!
//! The Locker and Pressurizer are separate binaries shipped alongside
//! the engine (`swaptune-memlock`, `swaptune-mempress`). This module
//! spawns them, parses their stdout protocol, enforces wall-clock
//! ceilings, and guarantees they are reaped no matter how a benchmark
//! ends.
//!
//! Ordering contract upheld by callers: the Locker starts before the
//! Pressurizer whenever backing-store behavior is measured, and the
//! Locker is terminated after the Pressurizer exits and before any swap
//! configuration is modified.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Hard wall-clock ceiling for one compression sub-test.
pub const SUBTEST_CEILING: Duration = Duration::from_secs(300);

/// Fill pattern for the Pressurizer.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FillPattern {
    /// Alternating compressible and incompressible pages
    Mixed,
    /// Deterministic incompressible data
    Random,
    /// All zero pages
    Zeros,
    /// Repeating byte ramp
    Sequential,
}

impl FillPattern {
    /// The helper's command-line name for this pattern.
    pub fn as_str(&self) -> &'static str {
        match self {
            FillPattern::Mixed => "mixed",
            FillPattern::Random => "random",
            FillPattern::Zeros => "zeros",
            FillPattern::Sequential => "sequential",
        }
    }
}

/// Resolve a helper binary next to the running executable, falling back
/// to PATH lookup.
fn helper_command(name: &str) -> Command {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Command::new(candidate);
            }
        }
    }
    Command::new(name)
}

/// Handle to a running RAM Locker.
///
/// The child is killed and reaped on drop; benchmarks that panic do not
/// leave pinned memory behind.
pub struct Locker {
    child: Child,
    /// Whether the helper could only hold the allocation without pinning
    pub soft: bool,
    bytes: u64,
}

impl Locker {
    /// Spawn the Locker and wait for it to confirm the pin.
    pub fn spawn(bytes: u64) -> Result<Self> {
        let mut child = helper_command("swaptune-memlock")
            .arg(bytes.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Bench(format!("cannot spawn memlock helper: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Bench("memlock helper has no stdout".into()))?;

        let mut line = String::new();
        BufReader::new(stdout).read_line(&mut line)?;

        let soft = match line.trim() {
            "LOCKED" => false,
            "LOCKED-SOFT" => {
                warn!("memlock could not pin {} bytes; region may be evicted", bytes);
                true
            }
            other => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::Bench(format!(
                    "memlock helper failed to lock ({:?})",
                    other
                )));
            }
        };

        debug!("locker holding {} bytes (soft={})", bytes, soft);
        Ok(Self { child, soft, bytes })
    }

    /// Signal the Locker to release its pin and exit.
    pub fn release(mut self) {
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        debug!("locker released {} bytes", self.bytes);
        // skip the Drop kill path; the child is already reaped
        std::mem::forget(self);
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Handle to a running Pressurizer.
///
/// The typical sequence is `spawn` -> `wait_filled` -> read kernel
/// counters while the allocation is still held -> `finish`.
pub struct Pressurizer {
    child: Child,
    filled_rx: mpsc::Receiver<u64>,
    started: Instant,
    bytes: u64,
}

impl Pressurizer {
    /// Spawn the Pressurizer with the given fill target and hold time.
    pub fn spawn(bytes: u64, pattern: FillPattern, hold_seconds: u64) -> Result<Self> {
        let mut child = helper_command("swaptune-mempress")
            .args([
                bytes.to_string(),
                pattern.as_str().to_string(),
                hold_seconds.to_string(),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| EngineError::Bench(format!("cannot spawn mempress helper: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Bench("mempress helper has no stdout".into()))?;

        // A thread drains the protocol lines so a quiet pipe never
        // blocks the ceiling loop.
        let (tx, filled_rx) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                let mut fields = line.split_whitespace();
                match fields.next() {
                    Some("PROGRESS") => {
                        if let (Some(done), Some(total)) = (fields.next(), fields.next()) {
                            debug!("pressurizer: {} / {} MiB", done, total);
                        }
                    }
                    Some("FILLED") => {
                        if let Some(ms) = fields.next().and_then(|v| v.parse().ok()) {
                            let _ = tx.send(ms);
                        }
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            child,
            filled_rx,
            started: Instant::now(),
            bytes,
        })
    }

    /// Block until the fill completes, the helper dies, or the ceiling
    /// expires.
    ///
    /// Returns the helper-measured fill duration. A helper exit before
    /// the FILLED line means the allocation failed; a ceiling expiry
    /// kills the helper. Both are benchmark errors that downgrade the
    /// affected cell without aborting the run.
    pub fn wait_filled(&mut self, ceiling: Duration) -> Result<Duration> {
        loop {
            match self.filled_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(ms) => {
                    debug!("pressurizer filled {} bytes in {} ms", self.bytes, ms);
                    return Ok(Duration::from_millis(ms));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Ok(Some(status)) = self.child.try_wait() {
                        // drain the channel once more; the FILLED line
                        // may have raced the exit
                        if let Ok(ms) = self.filled_rx.try_recv() {
                            return Ok(Duration::from_millis(ms));
                        }
                        return Err(EngineError::Bench(format!(
                            "pressurizer exited before fill completed (status {:?})",
                            status.code()
                        )));
                    }
                    if self.started.elapsed() > ceiling {
                        warn!(
                            "pressurizer exceeded {}s ceiling, killing",
                            ceiling.as_secs()
                        );
                        let _ = self.child.kill();
                        let _ = self.child.wait();
                        return Err(EngineError::Bench("pressurizer timed out".into()));
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = self.child.wait();
                    return Err(EngineError::Bench(
                        "pressurizer closed its pipe before fill completed".into(),
                    ));
                }
            }
        }
    }

    /// Terminate the helper and reap it.
    pub fn finish(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        std::mem::forget(self);
    }
}

impl Drop for Pressurizer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_names_round_trip_helper_protocol() {
        for (pattern, name) in [
            (FillPattern::Mixed, "mixed"),
            (FillPattern::Random, "random"),
            (FillPattern::Zeros, "zeros"),
            (FillPattern::Sequential, "sequential"),
        ] {
            assert_eq!(pattern.as_str(), name);
        }
    }
}
