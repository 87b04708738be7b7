//! Hardware and kernel inventory probe for swaptune.
//!
//! Everything the planner needs to know about the machine is gathered
//! here, once, at process start.
//!
//! # Data Sources
//!
//! - `sysinfo` - total/available RAM and CPU count
//! - `/proc/self/mountinfo` - root device and filesystem type
//! - `/sys/class/block/*` - partition geometry, parent disk
//! - `/sys/block/<disk>/queue/*` - sector size, rotational flag
//! - `statvfs("/")` - root filesystem usage
//! - `blkid` - partition table scheme
//! - `/sys/block/zram*`, `/sys/module/zswap` - compression capabilities

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::helpers::{command_available, read_sys_u64, read_trimmed, run_command};
use crate::{zram, zswap};

/// Filesystem family of the root partition.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemKind {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Other,
}

impl FilesystemKind {
    /// Parse the mountinfo filesystem type field.
    pub fn from_fstype(fstype: &str) -> Self {
        match fstype {
            "ext2" => FilesystemKind::Ext2,
            "ext3" => FilesystemKind::Ext3,
            "ext4" => FilesystemKind::Ext4,
            "xfs" => FilesystemKind::Xfs,
            "btrfs" => FilesystemKind::Btrfs,
            _ => FilesystemKind::Other,
        }
    }

    /// Whether this filesystem can be reduced in size at all.
    ///
    /// xfs can grow but never shrink, mounted or not.
    pub fn can_shrink(&self) -> bool {
        !matches!(self, FilesystemKind::Xfs | FilesystemKind::Other)
    }

    /// Whether this filesystem is copy-on-write.
    pub fn is_cow(&self) -> bool {
        matches!(self, FilesystemKind::Btrfs)
    }
}

/// Partition table scheme on the root disk.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    Gpt,
    Mbr,
}

/// Everything the engine knows about the machine, gathered once at start.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Inventory {
    /// Total physical RAM in bytes
    pub ram_bytes: u64,
    /// RAM currently available (free + reclaimable) in bytes
    pub available_ram_bytes: u64,
    /// Logical CPU count
    pub cpu_cores: usize,
    /// Kernel page size in bytes
    pub page_size: u64,
    /// The whole disk holding the root partition (e.g. /dev/sda)
    pub disk_path: PathBuf,
    /// The root partition node (e.g. /dev/sda2)
    pub root_partition_path: PathBuf,
    /// Root partition number on the disk (1-based)
    pub root_partition_number: u32,
    /// Root partition start, in logical sectors
    pub root_partition_start_sector: u64,
    /// Root partition size, in logical sectors
    pub root_partition_size_sectors: u64,
    /// Whole-disk size, in logical sectors
    pub disk_size_sectors: u64,
    /// Logical sector size in bytes (512 or 4096)
    pub sector_size: u64,
    /// Root filesystem family
    pub filesystem_kind: FilesystemKind,
    /// Bytes in use on the root filesystem
    pub root_fs_used_bytes: u64,
    /// Bytes free on the root filesystem
    pub root_fs_free_bytes: u64,
    /// Whether the disk is rotational (HDD)
    pub is_rotational: bool,
    /// Partition table scheme
    pub partition_scheme: PartitionScheme,
    /// Compressor names the kernel advertises or is assumed to support
    pub available_compressors: BTreeSet<String>,
    /// Pool allocator names the kernel advertises or is assumed to support
    pub available_allocators: BTreeSet<String>,
}

impl Inventory {
    /// Validate the internal consistency of the probed values.
    pub fn validate(&self) -> Result<()> {
        if self.sector_size != 512 && self.sector_size != 4096 {
            return Err(EngineError::Probe(format!(
                "unsupported sector size {}",
                self.sector_size
            )));
        }
        if self.root_partition_start_sector + self.root_partition_size_sectors
            > self.disk_size_sectors
        {
            return Err(EngineError::Probe(format!(
                "root partition [{} + {}] extends past disk end {}",
                self.root_partition_start_sector,
                self.root_partition_size_sectors,
                self.disk_size_sectors
            )));
        }
        Ok(())
    }

    /// Whole-disk capacity in bytes.
    pub fn disk_bytes(&self) -> u64 {
        self.disk_size_sectors * self.sector_size
    }

    /// Root partition size in bytes.
    pub fn root_partition_bytes(&self) -> u64 {
        self.root_partition_size_sectors * self.sector_size
    }
}

/// Gather the full inventory.
///
/// # Errors
///
/// Fails with an environment error when the root sits on a device-mapper
/// or logical volume: the engine refuses to rewrite virtualized partition
/// tables. Fails with a probe error when kernel metadata is unreadable.
pub fn probe_system() -> Result<Inventory> {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_list(sysinfo::CpuRefreshKind::nothing());

    let ram_bytes = sys.total_memory();
    let available_ram_bytes = sys.available_memory();
    let cpu_cores = sys.cpus().len().max(1);
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;

    let (root_source, fstype) = find_root_mount()?;
    let root_partition_path = resolve_device(&root_source)?;
    let part_name = device_name(&root_partition_path)?;

    if part_name.starts_with("dm-") {
        return Err(EngineError::Environment(format!(
            "root is on a device-mapper target ({}); refusing to rewrite a virtualized partition table",
            root_source
        )));
    }

    let disk_name = parent_disk(&part_name)?;
    let disk_path = PathBuf::from(format!("/dev/{}", disk_name));

    let sector_size = read_sys_u64(format!("/sys/block/{}/queue/hw_sector_size", disk_name))
        .unwrap_or(512);

    // /sys reports sizes in 512-byte units regardless of the logical sector size
    let to_logical = |units512: u64| units512 * 512 / sector_size;

    let root_partition_number =
        read_sys_u64(format!("/sys/class/block/{}/partition", part_name)).ok_or_else(|| {
            EngineError::Probe(format!("{} has no partition number in sysfs", part_name))
        })? as u32;
    let root_partition_start_sector = to_logical(
        read_sys_u64(format!("/sys/class/block/{}/start", part_name))
            .ok_or_else(|| EngineError::Probe(format!("no start sector for {}", part_name)))?,
    );
    let root_partition_size_sectors = to_logical(
        read_sys_u64(format!("/sys/class/block/{}/size", part_name))
            .ok_or_else(|| EngineError::Probe(format!("no size for {}", part_name)))?,
    );
    let disk_size_sectors = to_logical(
        read_sys_u64(format!("/sys/block/{}/size", disk_name))
            .ok_or_else(|| EngineError::Probe(format!("no size for disk {}", disk_name)))?,
    );

    let is_rotational = read_trimmed(format!("/sys/block/{}/queue/rotational", disk_name))
        .map(|v| v == "1")
        .unwrap_or(false);

    let (root_fs_used_bytes, root_fs_free_bytes) = root_fs_usage()?;

    let partition_scheme = probe_partition_scheme(&disk_path)?;
    let (available_compressors, available_allocators) = detect_capabilities();

    let inventory = Inventory {
        ram_bytes,
        available_ram_bytes,
        cpu_cores,
        page_size,
        disk_path,
        root_partition_path,
        root_partition_number,
        root_partition_start_sector,
        root_partition_size_sectors,
        disk_size_sectors,
        sector_size,
        filesystem_kind: FilesystemKind::from_fstype(&fstype),
        root_fs_used_bytes,
        root_fs_free_bytes,
        is_rotational,
        partition_scheme,
        available_compressors,
        available_allocators,
    };

    inventory.validate()?;
    info!(
        "inventory: {} RAM, {} cores, root {} ({}) on {}",
        crate::helpers::format_size(inventory.ram_bytes),
        inventory.cpu_cores,
        inventory.root_partition_path.display(),
        fstype,
        inventory.disk_path.display()
    );

    Ok(inventory)
}

/// Enumerate kernel-advertised compressor and allocator names.
///
/// The zram device advertises the full compressor list; zswap only shows
/// the active parameter values. When neither module is loaded, a
/// conservative hard-coded superset is assumed and later narrowed by
/// attempting to set each name.
pub fn detect_capabilities() -> (BTreeSet<String>, BTreeSet<String>) {
    let mut compressors: BTreeSet<String> = zram::available_algorithms()
        .into_iter()
        .collect();

    if compressors.is_empty() {
        if let Some(active) = zswap::active_compressor() {
            compressors.insert(active);
        }
    }
    if compressors.is_empty() {
        debug!("no compression module loaded, assuming conservative compressor set");
        for name in ["lz4", "zstd", "lzo-rle"] {
            compressors.insert(name.to_string());
        }
    }

    let mut allocators: BTreeSet<String> = BTreeSet::new();
    if let Some(active) = zswap::active_zpool() {
        allocators.insert(active);
    }
    for name in ["zsmalloc", "z3fold", "zbud"] {
        allocators.insert(name.to_string());
    }

    (compressors, allocators)
}

/// Find the device and filesystem type backing `/`.
fn find_root_mount() -> Result<(String, String)> {
    let content = std::fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| EngineError::Probe(format!("cannot read mountinfo: {}", e)))?;

    for line in content.lines() {
        // mountinfo: id parent maj:min root mountpoint opts [optional...] - fstype source superopts
        let mut halves = line.splitn(2, " - ");
        let left: Vec<&str> = halves.next().unwrap_or("").split_whitespace().collect();
        let right: Vec<&str> = halves
            .next()
            .unwrap_or("")
            .split_whitespace()
            .collect();

        if left.len() >= 5 && left[4] == "/" && right.len() >= 2 {
            return Ok((right[1].to_string(), right[0].to_string()));
        }
    }

    Err(EngineError::Environment(
        "could not determine the root device from mountinfo".into(),
    ))
}

/// Resolve a device path through symlinks (e.g. /dev/disk/by-uuid/...).
fn resolve_device(source: &str) -> Result<PathBuf> {
    if !source.starts_with("/dev/") {
        return Err(EngineError::Environment(format!(
            "root source {:?} is not a block device",
            source
        )));
    }
    std::fs::canonicalize(source)
        .map_err(|e| EngineError::Probe(format!("cannot resolve {}: {}", source, e)))
}

/// Kernel name of a device node (file name under /dev).
fn device_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| EngineError::Probe(format!("malformed device path {}", path.display())))
}

/// Find the parent disk of a partition via sysfs.
///
/// `/sys/class/block/<part>` canonicalizes to a path whose parent
/// directory is the whole-disk device.
fn parent_disk(part_name: &str) -> Result<String> {
    let sys_path = std::fs::canonicalize(format!("/sys/class/block/{}", part_name))
        .map_err(|e| EngineError::Probe(format!("no sysfs entry for {}: {}", part_name, e)))?;

    let parent = sys_path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            EngineError::Probe(format!("cannot derive parent disk of {}", part_name))
        })?;

    if parent == "block" {
        return Err(EngineError::Environment(format!(
            "{} is a whole disk, not a partition; unpartitioned roots are not supported",
            part_name
        )));
    }
    Ok(parent)
}

/// Root filesystem usage via statvfs.
fn root_fs_usage() -> Result<(u64, u64)> {
    let path = std::ffi::CString::new("/")
        .map_err(|_| EngineError::Probe("statvfs path contains NUL".into()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(EngineError::Probe("statvfs on / failed".into()));
    }
    let frsize = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * frsize;
    let free = stat.f_bavail as u64 * frsize;
    Ok((total.saturating_sub(free), free))
}

/// Determine the partition table scheme of a disk.
fn probe_partition_scheme(disk: &Path) -> Result<PartitionScheme> {
    let out = run_command(
        "blkid",
        &["-o", "value", "-s", "PTTYPE", &disk.to_string_lossy()],
    )?;
    match out.stdout.trim() {
        "gpt" => Ok(PartitionScheme::Gpt),
        "dos" => Ok(PartitionScheme::Mbr),
        other => Err(EngineError::Probe(format!(
            "unrecognized partition table {:?} on {}",
            other,
            disk.display()
        ))),
    }
}

/// Tracks which external tools and kernel interfaces are present.
///
/// Attached to the run document so a missing tool shows up in the report
/// instead of surfacing as a mid-run failure.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct ToolAvailability {
    /// sfdisk (partition table dump/apply)
    pub sfdisk: bool,
    /// blkid (PARTUUID and filesystem type queries)
    pub blkid: bool,
    /// mkswap / swapon
    pub swap_tools: bool,
    /// blockdev, partprobe, partx (kernel table notification)
    pub partition_notify_tools: bool,
    /// udevadm (settle after repartition)
    pub udevadm: bool,
    /// resize2fs (offline ext shrink)
    pub resize2fs: bool,
    /// update-initramfs or dracut
    pub initramfs_builder: bool,
    /// fio (matrix I/O generator)
    pub fio: bool,
    /// zswap module parameter surface
    pub zswap_sysfs: bool,
    /// zswap debugfs counters
    pub zswap_debugfs: bool,
    /// a zram device exists or the module can be probed
    pub zram_device: bool,
}

impl ToolAvailability {
    /// Probe all tool and interface availability at startup.
    pub fn probe() -> Self {
        Self {
            sfdisk: command_available("sfdisk"),
            blkid: command_available("blkid"),
            swap_tools: command_available("mkswap") && command_available("swapon"),
            partition_notify_tools: command_available("blockdev")
                && command_available("partprobe")
                && command_available("partx"),
            udevadm: command_available("udevadm"),
            resize2fs: command_available("resize2fs"),
            initramfs_builder: command_available("update-initramfs")
                || command_available("dracut"),
            fio: command_available("fio"),
            zswap_sysfs: zswap::is_available(),
            zswap_debugfs: zswap::debugfs_available(),
            zram_device: zram::device_present(),
        }
    }

    /// Tools required before any partition mutation may start.
    pub fn check_partitioning(&self) -> Result<()> {
        if !self.sfdisk {
            return Err(EngineError::Environment("sfdisk not found".into()));
        }
        if !self.blkid {
            return Err(EngineError::Environment("blkid not found".into()));
        }
        if !self.swap_tools {
            return Err(EngineError::Environment("mkswap/swapon not found".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inventory() -> Inventory {
        Inventory {
            ram_bytes: 8 * crate::helpers::GIB,
            available_ram_bytes: 6 * crate::helpers::GIB,
            cpu_cores: 4,
            page_size: 4096,
            disk_path: PathBuf::from("/dev/sda"),
            root_partition_path: PathBuf::from("/dev/sda2"),
            root_partition_number: 2,
            root_partition_start_sector: 2048,
            root_partition_size_sectors: 83_886_080,
            disk_size_sectors: 83_886_080 + 2048,
            sector_size: 512,
            filesystem_kind: FilesystemKind::Ext4,
            root_fs_used_bytes: 9 * crate::helpers::GIB,
            root_fs_free_bytes: 20 * crate::helpers::GIB,
            is_rotational: false,
            partition_scheme: PartitionScheme::Gpt,
            available_compressors: BTreeSet::new(),
            available_allocators: BTreeSet::new(),
        }
    }

    #[test]
    fn validate_accepts_consistent_geometry() {
        assert!(sample_inventory().validate().is_ok());
    }

    #[test]
    fn validate_rejects_partition_past_disk_end() {
        let mut inv = sample_inventory();
        inv.disk_size_sectors = inv.root_partition_start_sector;
        assert!(matches!(inv.validate(), Err(EngineError::Probe(_))));
    }

    #[test]
    fn validate_rejects_odd_sector_size() {
        let mut inv = sample_inventory();
        inv.sector_size = 520;
        assert!(inv.validate().is_err());
    }

    #[test]
    fn filesystem_kind_shrink_rules() {
        assert!(FilesystemKind::Ext4.can_shrink());
        assert!(FilesystemKind::Btrfs.can_shrink());
        assert!(!FilesystemKind::Xfs.can_shrink());
        assert!(!FilesystemKind::Other.can_shrink());
    }

    #[test]
    fn mountinfo_fstype_mapping() {
        assert_eq!(FilesystemKind::from_fstype("ext4"), FilesystemKind::Ext4);
        assert_eq!(FilesystemKind::from_fstype("zfs"), FilesystemKind::Other);
        assert!(FilesystemKind::from_fstype("btrfs").is_cow());
    }
}
