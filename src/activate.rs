//! Swap activator: formatting, enabling, and persisting the planned
//! swap topology.
//!
//! Mount-table entries are keyed by the GPT-native PARTUUID, never the
//! filesystem swap UUID: re-tagging a device with mkswap changes the
//! filesystem UUID every time, while the partition identifier survives.
//! An entry is refused outright for a device without one.
//!
//! The compressed-cache parameters are likewise never entrusted to the
//! kernel command line; compressors whose module is not bundled into
//! the initramfs (zstd notably) silently fall back there. A late-boot
//! oneshot unit re-applies the parameters after module load instead.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::gpt::PartitionPlan;
use crate::helpers::{run_command, write_atomic};
use crate::plan::{Plan, RamSolution};
use crate::{zram, zswap};

/// Mount table the persistent entries land in.
pub const FSTAB_PATH: &str = "/etc/fstab";
/// Late-boot unit that applies compressed-tier parameters.
const RAM_TIER_UNIT: &str = "/etc/systemd/system/swaptune-ramtier.service";
const RAM_TIER_WANTS: &str =
    "/etc/systemd/system/multi-user.target.wants/swaptune-ramtier.service";

/// A swap device brought up by the activator.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ActiveDevice {
    /// Device node
    pub node: PathBuf,
    /// Stable partition identifier backing the mount entry
    pub partuuid: String,
    /// Swap priority
    pub priority: i32,
}

/// Tag a device as swap. Idempotent: an existing swap signature is left
/// alone so the filesystem UUID churns as little as possible.
pub fn format_swap(device: &Path) -> Result<()> {
    let device_str = device.to_string_lossy();
    let out = run_command("blkid", &["-o", "value", "-s", "TYPE", &device_str])?;
    if out.stdout.trim() == "swap" {
        info!("{} already carries a swap signature", device_str);
        return Ok(());
    }

    let out = run_command("mkswap", &[device_str.as_ref()])?;
    if !out.success {
        return Err(EngineError::Activation(format!(
            "mkswap {} failed: {}",
            device_str,
            out.stderr.trim()
        )));
    }
    Ok(())
}

/// Enable a swap device at the given priority. Already-active devices
/// are left as they are.
pub fn enable_swap(device: &Path, priority: i32) -> Result<()> {
    let device_str = device.to_string_lossy();
    if swap_is_active(&device_str) {
        info!("{} already active", device_str);
        return Ok(());
    }

    let priority_arg = priority.to_string();
    let out = run_command("swapon", &["-p", &priority_arg, &device_str])?;
    if !out.success {
        return Err(EngineError::Activation(format!(
            "swapon {} failed: {}",
            device_str,
            out.stderr.trim()
        )));
    }
    info!("swap enabled on {} at priority {}", device_str, priority);
    Ok(())
}

/// Whether a device appears in /proc/swaps.
pub fn swap_is_active(device: &str) -> bool {
    std::fs::read_to_string("/proc/swaps")
        .map(|content| {
            content
                .lines()
                .skip(1)
                .any(|line| line.split_whitespace().next() == Some(device))
        })
        .unwrap_or(false)
}

/// The GPT partition identifier of a device.
pub fn partuuid_of(device: &Path) -> Result<String> {
    let device_str = device.to_string_lossy();
    let out = run_command("blkid", &["-o", "value", "-s", "PARTUUID", &device_str])?;
    let uuid = out.stdout.trim().to_string();
    if uuid.is_empty() {
        return Err(EngineError::Activation(format!(
            "{} has no stable partition identifier; refusing to persist a mount entry",
            device_str
        )));
    }
    Ok(uuid)
}

/// Insert or refresh the mount-table line for one partition, keyed by
/// PARTUUID. Returns whether the file changed.
pub fn persist_mount(fstab: &Path, partuuid: &str, priority: i32) -> Result<bool> {
    let current = match std::fs::read_to_string(fstab) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let (updated, changed) = upsert_swap_entry(&current, partuuid, priority);
    if changed {
        write_atomic(fstab, &updated)?;
        info!("mount entry persisted for PARTUUID={}", partuuid);
    }
    Ok(changed)
}

/// Pure fstab editing: de-duplicates on the PARTUUID key, appends when
/// missing, rewrites when the priority drifted.
fn upsert_swap_entry(content: &str, partuuid: &str, priority: i32) -> (String, bool) {
    let key = format!("PARTUUID={}", partuuid);
    let wanted = format!("{}\tnone\tswap\tsw,pri={}\t0\t0", key, priority);

    let mut lines: Vec<String> = Vec::new();
    let mut found = false;
    let mut changed = false;

    for line in content.lines() {
        let is_ours = line
            .split_whitespace()
            .next()
            .map(|first| first == key)
            .unwrap_or(false);
        if is_ours {
            if found {
                // duplicate from an older run; drop it
                changed = true;
                continue;
            }
            found = true;
            if line.trim() != wanted {
                changed = true;
                lines.push(wanted.clone());
            } else {
                lines.push(line.to_string());
            }
        } else {
            lines.push(line.to_string());
        }
    }

    if !found {
        lines.push(wanted);
        changed = true;
    }

    let mut result = lines.join("\n");
    result.push('\n');
    (result, changed)
}

/// Bring up every planned swap partition: tag, enable, persist.
pub fn activate_partitions(
    partition_plan: &PartitionPlan,
    plan: &Plan,
    fstab: &Path,
) -> Result<Vec<ActiveDevice>> {
    let mut active = Vec::new();
    for node in partition_plan.swap_nodes() {
        format_swap(&node)?;
        let partuuid = partuuid_of(&node)?;
        enable_swap(&node, plan.disk_priority)?;
        persist_mount(fstab, &partuuid, plan.disk_priority)?;
        active.push(ActiveDevice {
            node,
            partuuid,
            priority: plan.disk_priority,
        });
    }
    Ok(active)
}

/// Create, tag, and enable swap files inside the root filesystem.
///
/// Files carry no PARTUUID; their path is the stable identifier the
/// mount table uses.
pub fn activate_swap_files(plan: &Plan, dir: &Path, fstab: &Path) -> Result<Vec<PathBuf>> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dir)?;
    let mut files = Vec::new();

    for i in 0..plan.stripe_width {
        let path = dir.join(format!("swapfile{}", i));
        let path_str = path.to_string_lossy().into_owned();

        if !path.exists() {
            let size_arg = plan.per_device_bytes.to_string();
            let out = run_command("fallocate", &["-l", &size_arg, &path_str])?;
            if !out.success {
                return Err(EngineError::Activation(format!(
                    "fallocate {} failed: {}",
                    path_str,
                    out.stderr.trim()
                )));
            }
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        format_swap(&path)?;
        enable_swap(&path, plan.disk_priority)?;

        let current = std::fs::read_to_string(fstab).unwrap_or_default();
        let line = format!("{}\tnone\tswap\tsw,pri={}\t0\t0", path_str, plan.disk_priority);
        if !current.lines().any(|l| l.split_whitespace().next() == Some(path_str.as_str())) {
            let mut updated = current;
            updated.push_str(&line);
            updated.push('\n');
            write_atomic(fstab, &updated)?;
        }
        files.push(path);
    }
    Ok(files)
}

/// Configure the RAM tier and make it survive reboots.
pub fn setup_ram_tier(plan: &Plan) -> Result<()> {
    match plan.ram_solution {
        RamSolution::CompressedCache => {
            zswap::enable(&plan.compressor, &plan.allocator, plan.ram_pool_pct)?;
            install_ram_tier_unit(&ram_tier_unit_cache(plan))?;
        }
        RamSolution::CompressedBlockDevice => {
            // disksize is uncompressed capacity; at the expected 2:1
            // ratio the pool budget holds it
            let disksize = plan.ram_pool_bytes * 2;
            let node = PathBuf::from(zram::device_node());
            if swap_is_active(&node.to_string_lossy()) {
                info!("{} already swapping; leaving the live device alone", node.display());
            } else {
                zram::configure(&plan.compressor, disksize)?;
                format_swap(&node)?;
                enable_swap(&node, plan.ram_priority)?;
            }
            install_ram_tier_unit(&ram_tier_unit_blockdev(plan, disksize))?;
        }
        RamSolution::None => {
            if zswap::is_enabled() {
                warn!("no RAM tier planned but zswap is enabled; leaving foreign state alone");
            }
        }
    }
    Ok(())
}

/// Unit body for the compressed-cache solution: re-applies the module
/// parameters after every boot, once the module can be loaded.
fn ram_tier_unit_cache(plan: &Plan) -> String {
    format!(
        "[Unit]\n\
         Description=Apply swaptune compressed-cache parameters\n\
         After=systemd-modules-load.service\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart=/bin/sh -c 'echo Y > /sys/module/zswap/parameters/enabled'\n\
         ExecStart=/bin/sh -c 'echo {compressor} > /sys/module/zswap/parameters/compressor'\n\
         ExecStart=/bin/sh -c 'echo {allocator} > /sys/module/zswap/parameters/zpool'\n\
         ExecStart=/bin/sh -c 'echo {pool_pct} > /sys/module/zswap/parameters/max_pool_percent'\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        compressor = plan.compressor,
        allocator = plan.allocator,
        pool_pct = plan.ram_pool_pct
    )
}

/// Unit body for the compressed block device: zram state is volatile
/// and must be rebuilt on every boot.
fn ram_tier_unit_blockdev(plan: &Plan, disksize: u64) -> String {
    format!(
        "[Unit]\n\
         Description=Rebuild swaptune compressed block device\n\
         After=systemd-modules-load.service\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart=/sbin/modprobe zram num_devices=1\n\
         ExecStart=/bin/sh -c 'echo {compressor} > /sys/block/zram0/comp_algorithm'\n\
         ExecStart=/bin/sh -c 'echo {disksize} > /sys/block/zram0/disksize'\n\
         ExecStart=/sbin/mkswap /dev/zram0\n\
         ExecStart=/sbin/swapon -p {priority} /dev/zram0\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        compressor = plan.compressor,
        disksize = disksize,
        priority = plan.ram_priority
    )
}

fn install_ram_tier_unit(body: &str) -> Result<()> {
    std::fs::write(RAM_TIER_UNIT, body)?;
    if let Some(parent) = Path::new(RAM_TIER_WANTS).parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::os::unix::fs::symlink(RAM_TIER_UNIT, RAM_TIER_WANTS) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::GIB;
    use crate::plan::{DiskBacking, Tunables};

    fn plan() -> Plan {
        Plan {
            ram_solution: RamSolution::CompressedCache,
            ram_pool_bytes: 2 * GIB,
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
        }
    }

    #[test]
    fn upsert_appends_missing_entry() {
        let (updated, changed) = upsert_swap_entry("", "ABCD-1", 10);
        assert!(changed);
        assert!(updated.contains("PARTUUID=ABCD-1\tnone\tswap\tsw,pri=10\t0\t0"));
    }

    #[test]
    fn upsert_is_idempotent() {
        let (first, _) = upsert_swap_entry("", "ABCD-1", 10);
        let (second, changed) = upsert_swap_entry(&first, "ABCD-1", 10);
        assert!(!changed);
        assert_eq!(first, second);
    }

    #[test]
    fn upsert_rewrites_drifted_priority() {
        let (first, _) = upsert_swap_entry("", "ABCD-1", 10);
        let (second, changed) = upsert_swap_entry(&first, "ABCD-1", 20);
        assert!(changed);
        assert!(second.contains("pri=20"));
        assert!(!second.contains("pri=10"));
    }

    #[test]
    fn upsert_drops_duplicate_lines() {
        let doubled = "PARTUUID=ABCD-1\tnone\tswap\tsw,pri=10\t0\t0\n\
                       PARTUUID=ABCD-1\tnone\tswap\tsw,pri=10\t0\t0\n";
        let (updated, changed) = upsert_swap_entry(doubled, "ABCD-1", 10);
        assert!(changed);
        assert_eq!(updated.matches("ABCD-1").count(), 1);
    }

    #[test]
    fn upsert_leaves_foreign_lines_alone() {
        let existing = "UUID=root-uuid\t/\text4\tdefaults\t0\t1\n\
                        PARTUUID=OTHER\tnone\tswap\tsw,pri=5\t0\t0\n";
        let (updated, _) = upsert_swap_entry(existing, "ABCD-1", 10);
        assert!(updated.contains("UUID=root-uuid"));
        assert!(updated.contains("PARTUUID=OTHER"));
        assert!(updated.contains("PARTUUID=ABCD-1"));
    }

    #[test]
    fn persist_mount_writes_through_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        assert!(persist_mount(&fstab, "ABCD-1", 10).unwrap());
        assert!(!persist_mount(&fstab, "ABCD-1", 10).unwrap());
        let content = std::fs::read_to_string(&fstab).unwrap();
        assert_eq!(content.matches("ABCD-1").count(), 1);
    }

    #[test]
    fn cache_unit_sets_every_parameter() {
        let unit = ram_tier_unit_cache(&plan());
        for needle in [
            "parameters/enabled",
            "echo lz4 > /sys/module/zswap/parameters/compressor",
            "echo zbud > /sys/module/zswap/parameters/zpool",
            "echo 41 > /sys/module/zswap/parameters/max_pool_percent",
        ] {
            assert!(unit.contains(needle), "unit missing {}", needle);
        }
    }

    #[test]
    fn blockdev_unit_rebuilds_zram() {
        let mut p = plan();
        p.ram_solution = RamSolution::CompressedBlockDevice;
        let unit = ram_tier_unit_blockdev(&p, 4 * GIB);
        assert!(unit.contains("modprobe zram"));
        assert!(unit.contains("mkswap /dev/zram0"));
        assert!(unit.contains("swapon -p 100 /dev/zram0"));
    }
}
