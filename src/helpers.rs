//! Shared helpers for swaptune.
//!
//! Small utilities used across the engine: byte-size formatting, sector
//! alignment math, a logged wrapper around external commands, and the
//! single-instance lock held on the log directory.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::error::EngineError;

/// Bytes per KiB.
pub const KIB: u64 = 1024;
/// Bytes per MiB.
pub const MIB: u64 = 1024 * KIB;
/// Bytes per GiB.
pub const GIB: u64 = 1024 * MIB;

/// Partition alignment in sectors (1 MiB at 512-byte sectors).
pub const ALIGN_SECTORS: u64 = 2048;

/// Format bytes as a human-readable size.
pub fn format_size(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.0} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Round down to a multiple of `align`.
pub fn align_down(value: u64, align: u64) -> u64 {
    (value / align) * align
}

/// Round up to a multiple of `align`.
pub fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Read a file and return its trimmed contents, or `None` on any error.
///
/// Most `/sys` and `/proc` attributes are single trimmed tokens; absent
/// files simply mean the kernel feature is not present.
pub fn read_trimmed<P: AsRef<Path>>(path: P) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

/// Read a `/sys` attribute as an integer.
pub fn read_sys_u64<P: AsRef<Path>>(path: P) -> Option<u64> {
    read_trimmed(path).and_then(|s| s.parse().ok())
}

/// Write a value to a kernel control file, logging the write.
pub fn write_sysfs<P: AsRef<Path>>(path: P, value: &str) -> std::io::Result<()> {
    debug!("write {} <- {}", path.as_ref().display(), value);
    std::fs::write(path, value)
}

/// Captured result of an external command.
#[derive(Debug)]
pub struct CommandOutput {
    /// Whether the command exited with status 0
    pub success: bool,
    /// Raw exit code, if the process exited normally
    pub code: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

/// Run an external command, capturing output.
///
/// The invocation is logged at debug level. A non-zero exit is not an
/// error here; callers decide whether the status matters, because several
/// tools (sfdisk on a busy disk, swapon on an already-active device)
/// report failure in situations the engine treats as recoverable.
pub fn run_command(program: &str, args: &[&str]) -> Result<CommandOutput, EngineError> {
    debug!("exec: {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            EngineError::Environment(format!("failed to run {}: {}", program, e))
        })?;

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run an external command, feeding `input` on stdin.
pub fn run_command_stdin(
    program: &str,
    args: &[&str],
    input: &str,
) -> Result<CommandOutput, EngineError> {
    use std::io::Write;

    debug!("exec (stdin {} bytes): {} {}", input.len(), program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            EngineError::Environment(format!("failed to run {}: {}", program, e))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes())?;
    }

    let output = child.wait_with_output()?;
    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Check if a command is available in PATH.
pub fn command_available(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Check whether the process runs with root privileges.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Exclusive lock on the log directory.
///
/// Kernel swap state (zswap parameters, sysctl values, the partition
/// table) is process-wide, so only one engine instance may run. The lock
/// file lives inside the log root and is held for the process lifetime.
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock, failing if another instance holds it.
    pub fn acquire(log_root: &Path) -> Result<Self, EngineError> {
        std::fs::create_dir_all(log_root)?;
        let path = log_root.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(EngineError::Environment(format!(
                "another swaptune instance is running (lock held on {})",
                path.display()
            )));
        }

        Ok(Self { _file: file, path })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // flock is released on close; the file itself stays behind as a marker
        debug!("released instance lock {}", self.path.display());
    }
}

/// Timestamp suitable for artifact file names.
pub fn artifact_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Atomically replace a file's contents via a temp file + rename.
pub fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("swaptune.tmp");
    std::fs::write(&tmp, content)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        warn!("atomic rename to {} failed: {}", path.display(), e);
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_size_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(4 * KIB), "4 KiB");
        assert_eq!(format_size(MIB + MIB / 2), "1.5 MiB");
        assert_eq!(format_size(14 * GIB), "14.0 GiB");
    }

    #[test]
    fn alignment_math() {
        assert_eq!(align_down(2049, ALIGN_SECTORS), 2048);
        assert_eq!(align_down(2048, ALIGN_SECTORS), 2048);
        assert_eq!(align_up(2049, ALIGN_SECTORS), 4096);
        assert_eq!(align_up(0, ALIGN_SECTORS), 0);
    }

    #[test]
    fn instance_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let first = InstanceLock::acquire(dir.path()).unwrap();
        assert!(InstanceLock::acquire(dir.path()).is_err());
        drop(first);
        assert!(InstanceLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.conf");
        write_atomic(&path, "one\n").unwrap();
        write_atomic(&path, "two\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two\n");
    }
}
