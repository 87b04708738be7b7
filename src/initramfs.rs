//! Offline shrink scheduling.
//!
//! When the root filesystem must shrink, the live system cannot do it:
//! the ext family only resizes downward while unmounted. The engine
//! stages a minimal initramfs pre-mount script that performs the resize
//! and table write before the root is mounted, plus a one-shot service
//! that finalizes swap on the first successful boot afterwards. The
//! pre-mount stage is kept to exactly two operations (filesystem resize,
//! partition write); the root is often read-only there, so every
//! userspace state change is deferred to the finalizer.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::gpt::{GptDump, PartitionPlan};
use crate::helpers::run_command;
use crate::inventory::Inventory;
use crate::plan::Plan;

/// Directory for the staged artifacts.
pub const STATE_DIR: &str = "/etc/swaptune";
/// Saved dump the pre-mount stage applies.
pub const PTABLE_PATH: &str = "/etc/swaptune/offline-ptable.dump";
/// Config consumed by both the pre-mount script and the finalizer.
pub const SHRINK_CONF_PATH: &str = "/etc/swaptune/offline-shrink.conf";
/// initramfs-tools pre-mount script location.
const PREMOUNT_SCRIPT: &str = "/etc/initramfs-tools/scripts/local-premount/swaptune-shrink";
/// initramfs-tools hook location.
const HOOK_SCRIPT: &str = "/etc/initramfs-tools/hooks/swaptune";
/// One-shot finalizer unit.
const FINALIZE_UNIT: &str = "/etc/systemd/system/swaptune-finalize.service";
const FINALIZE_WANTS: &str =
    "/etc/systemd/system/multi-user.target.wants/swaptune-finalize.service";

/// Everything the offline stage needs to know, persisted as key=value
/// lines so the initramfs shell script can source it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShrinkConfig {
    /// Target disk (e.g. /dev/sda)
    pub disk: String,
    /// Root partition number
    pub root_partition: u32,
    /// Root filesystem size after shrink, in 4 KiB filesystem blocks
    pub new_block_count: u64,
    /// Where the saved dump lives
    pub ptable_path: String,
    /// First and last swap partition numbers the finalizer formats
    pub swap_first_num: u32,
    pub swap_last_num: u32,
    /// Swap priority for the striped devices
    pub priority: i32,
}

impl ShrinkConfig {
    pub fn render(&self) -> String {
        format!(
            "disk={}\n\
             root_partition={}\n\
             new_block_count={}\n\
             ptable_path={}\n\
             swap_first_num={}\n\
             swap_last_num={}\n\
             priority={}\n",
            self.disk,
            self.root_partition,
            self.new_block_count,
            self.ptable_path,
            self.swap_first_num,
            self.swap_last_num,
            self.priority
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            text.lines()
                .find_map(|line| line.strip_prefix(&format!("{}=", key)))
                .map(|v| v.trim().to_string())
                .ok_or_else(|| {
                    EngineError::Partition(format!("shrink config missing {}", key))
                })
        };
        let parse_num = |key: &str| -> Result<u64> {
            get(key)?.parse().map_err(|_| {
                EngineError::Partition(format!("shrink config has non-numeric {}", key))
            })
        };

        Ok(Self {
            disk: get("disk")?,
            root_partition: parse_num("root_partition")? as u32,
            new_block_count: parse_num("new_block_count")?,
            ptable_path: get("ptable_path")?,
            swap_first_num: parse_num("swap_first_num")? as u32,
            swap_last_num: parse_num("swap_last_num")? as u32,
            priority: parse_num("priority")? as i32,
        })
    }

    /// Load the staged config, if an offline shrink is pending.
    pub fn load() -> Result<Option<Self>> {
        match std::fs::read_to_string(SHRINK_CONF_PATH) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Stage all offline-shrink artifacts and rebuild the initramfs.
pub fn schedule_offline_shrink(
    inventory: &Inventory,
    plan: &Plan,
    partition_plan: &PartitionPlan,
    new_dump: &GptDump,
) -> Result<()> {
    std::fs::create_dir_all(STATE_DIR)?;

    // ext4 block size is 4 KiB on any root this engine supports
    let new_block_count = partition_plan.new_root_size_sectors * inventory.sector_size / 4096;

    let swap_numbers: Vec<u32> = partition_plan
        .swap_partitions
        .iter()
        .map(|s| s.index)
        .collect();
    let (first, last) = match (swap_numbers.first(), swap_numbers.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => {
            return Err(EngineError::Partition(
                "offline shrink scheduled with no swap partitions planned".into(),
            ));
        }
    };
    let config = ShrinkConfig {
        disk: inventory.disk_path.to_string_lossy().into_owned(),
        root_partition: inventory.root_partition_number,
        new_block_count,
        ptable_path: PTABLE_PATH.to_string(),
        swap_first_num: first,
        swap_last_num: last,
        priority: plan.disk_priority,
    };

    std::fs::write(PTABLE_PATH, new_dump.render())?;
    std::fs::write(SHRINK_CONF_PATH, config.render())?;
    write_executable(Path::new(PREMOUNT_SCRIPT), &premount_script())?;
    write_executable(Path::new(HOOK_SCRIPT), &hook_script())?;
    write_finalizer_unit()?;

    // A full check before the resize catches latent corruption while
    // the window for recovery is still open.
    std::fs::write("/forcefsck", b"")?;

    rebuild_initramfs()?;

    info!(
        "offline shrink staged: root -> {} blocks, swap partitions {}..{}",
        config.new_block_count, config.swap_first_num, config.swap_last_num
    );
    Ok(())
}

/// Remove the staged config and disable the finalizer unit after a
/// successful finalize pass.
pub fn clear_scheduled() {
    for path in [SHRINK_CONF_PATH, PTABLE_PATH, FINALIZE_WANTS] {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {}: {}", path, e);
            }
        }
    }
}

fn write_executable(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

/// The pre-mount runner: resize the root filesystem, then write the
/// staged partition table. Nothing else happens here.
fn premount_script() -> String {
    r#"#!/bin/sh
PREREQ=""
prereqs() { echo "$PREREQ"; }
case "$1" in
    prereqs) prereqs; exit 0 ;;
esac

. /scripts/functions

CONF=/etc/swaptune/offline-shrink.conf
[ -r "$CONF" ] || exit 0
. "$CONF"

ROOT_DEV=$(echo "$disk" | grep -q '[0-9]$' && echo "${disk}p${root_partition}" || echo "${disk}${root_partition}")

log_begin_msg "swaptune: shrinking root filesystem"
e2fsck -fy "$ROOT_DEV"
resize2fs "$ROOT_DEV" "$new_block_count" || { log_failure_msg "resize2fs failed"; exit 1; }
log_end_msg

log_begin_msg "swaptune: writing partition table"
sfdisk --force "$disk" < "$ptable_path" || { log_failure_msg "sfdisk failed"; exit 1; }
blockdev --rereadpt "$disk" 2>/dev/null || true
log_end_msg
exit 0
"#
    .to_string()
}

/// The hook pulls the resize and partitioning tools plus the staged
/// state into the initramfs image.
fn hook_script() -> String {
    r#"#!/bin/sh
PREREQ=""
prereqs() { echo "$PREREQ"; }
case "$1" in
    prereqs) prereqs; exit 0 ;;
esac

. /usr/share/initramfs-tools/hook-functions

copy_exec /sbin/resize2fs
copy_exec /sbin/e2fsck
copy_exec /sbin/sfdisk
copy_exec /sbin/blockdev

mkdir -p "${DESTDIR}/etc/swaptune"
cp /etc/swaptune/offline-shrink.conf "${DESTDIR}/etc/swaptune/"
cp /etc/swaptune/offline-ptable.dump "${DESTDIR}/etc/swaptune/"
exit 0
"#
    .to_string()
}

/// Install and enable the one-shot finalizer.
///
/// The pre-mount stage often cannot mount the root read-write, so the
/// mount table update and swap formatting happen on the first normal
/// boot, driven by this unit.
pub fn write_finalizer_unit() -> Result<()> {
    let exe = std::env::current_exe()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "/usr/local/bin/swaptune".to_string());

    let unit = format!(
        "[Unit]\n\
         Description=Finalize swap topology after offline root shrink\n\
         ConditionPathExists={conf}\n\
         After=local-fs.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart={exe} finalize\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        conf = SHRINK_CONF_PATH,
        exe = exe
    );
    std::fs::write(FINALIZE_UNIT, unit)?;

    if let Some(parent) = Path::new(FINALIZE_WANTS).parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::os::unix::fs::symlink(FINALIZE_UNIT, FINALIZE_WANTS) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Rebuild the initramfs so the staged scripts are in the image.
fn rebuild_initramfs() -> Result<()> {
    if crate::helpers::command_available("update-initramfs") {
        let out = run_command("update-initramfs", &["-u"])?;
        if !out.success {
            return Err(EngineError::Partition(format!(
                "update-initramfs failed: {}",
                out.stderr.trim()
            )));
        }
        return Ok(());
    }
    if crate::helpers::command_available("dracut") {
        let out = run_command("dracut", &["--force"])?;
        if !out.success {
            return Err(EngineError::Partition(format!(
                "dracut failed: {}",
                out.stderr.trim()
            )));
        }
        return Ok(());
    }
    Err(EngineError::Environment(
        "no initramfs builder found (update-initramfs or dracut required)".into(),
    ))
}

/// Partition numbers the finalizer must format, reconstructed from the
/// staged config.
pub fn swap_numbers(config: &ShrinkConfig) -> Vec<u32> {
    (config.swap_first_num..=config.swap_last_num).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ShrinkConfig {
        ShrinkConfig {
            disk: "/dev/sda".into(),
            root_partition: 1,
            new_block_count: 2_621_440,
            ptable_path: PTABLE_PATH.into(),
            swap_first_num: 2,
            swap_last_num: 9,
            priority: 10,
        }
    }

    #[test]
    fn config_round_trips_through_key_value_form() {
        let config = sample();
        let parsed = ShrinkConfig::parse(&config.render()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn config_rejects_missing_keys() {
        assert!(ShrinkConfig::parse("disk=/dev/sda\n").is_err());
    }

    #[test]
    fn swap_numbers_cover_inclusive_range() {
        assert_eq!(swap_numbers(&sample()), vec![2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn premount_script_is_minimal() {
        let script = premount_script();
        // resize + table write only; no mkswap, no fstab edits
        assert!(script.contains("resize2fs"));
        assert!(script.contains("sfdisk"));
        assert!(!script.contains("mkswap"));
        assert!(!script.contains("fstab"));
    }

    #[test]
    fn hook_bundles_tools_and_state() {
        let script = hook_script();
        for needle in ["resize2fs", "e2fsck", "sfdisk", "offline-shrink.conf"] {
            assert!(script.contains(needle), "hook missing {}", needle);
        }
    }
}
