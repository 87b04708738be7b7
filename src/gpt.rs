//! GPT dump model and layout computation.
//!
//! The partition transformer never writes binary GPT structures itself;
//! it works on sfdisk's textual canonical form, the same dump format it
//! later feeds back for the write. This module parses and renders that
//! form and computes the new layout: root start never moves, swap
//! partitions are equal-sized, 1 MiB aligned, contiguous, and anchored
//! at the disk tail with a 2048-sector buffer before disk end.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::Overrides;
use crate::error::{EngineError, Result};
use crate::helpers::{align_down, align_up, ALIGN_SECTORS, GIB};
use crate::inventory::{FilesystemKind, Inventory};
use crate::plan::Plan;

/// GPT type GUID for Linux swap partitions.
pub const LINUX_SWAP_GUID: &str = "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F";
/// Sectors reserved before the disk end (backup GPT plus slack).
pub const END_BUFFER_SECTORS: u64 = 2048;

/// How the root partition is affected by the new layout.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RootAction {
    /// Root already ends where the swap group begins
    Unchanged,
    /// Root grows into the free tail; safe while mounted
    ExtendOnline,
    /// Root must shrink; deferred to the initramfs stage
    ShrinkOffline,
}

/// One partition entry from an sfdisk dump.
#[derive(Clone, Debug, PartialEq)]
pub struct GptEntry {
    /// Device node (e.g. /dev/sda2)
    pub node: String,
    /// Partition number parsed from the node name
    pub number: u32,
    /// Start sector
    pub start: u64,
    /// Size in sectors
    pub size: u64,
    /// Type GUID
    pub type_guid: String,
    /// Partition UUID, when the dump carries one
    pub uuid: Option<String>,
    /// Remaining attributes kept verbatim (name=, attrs=)
    pub extra: Vec<String>,
}

impl GptEntry {
    fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn is_swap(&self) -> bool {
        self.type_guid.eq_ignore_ascii_case(LINUX_SWAP_GUID)
    }
}

/// Parsed sfdisk dump: header lines plus partition entries.
#[derive(Clone, Debug, Default)]
pub struct GptDump {
    /// `label:` value (gpt or dos)
    pub label: String,
    /// `label-id:` value
    pub label_id: Option<String>,
    /// `device:` value
    pub device: String,
    /// First usable LBA
    pub first_lba: u64,
    /// Last usable LBA (inclusive)
    pub last_lba: u64,
    /// `sector-size:` value when present
    pub sector_size: Option<u64>,
    /// Partition entries in dump order
    pub entries: Vec<GptEntry>,
}

impl GptDump {
    /// Parse sfdisk's dump output.
    pub fn parse(text: &str) -> Result<Self> {
        let mut dump = GptDump::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(value) = line.strip_prefix("label:") {
                dump.label = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("label-id:") {
                dump.label_id = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("device:") {
                dump.device = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("first-lba:") {
                dump.first_lba = parse_u64(value, "first-lba")?;
            } else if let Some(value) = line.strip_prefix("last-lba:") {
                dump.last_lba = parse_u64(value, "last-lba")?;
            } else if let Some(value) = line.strip_prefix("sector-size:") {
                dump.sector_size = Some(parse_u64(value, "sector-size")?);
            } else if line.starts_with("unit:") || line.starts_with("grain:") {
                // canonical units are sectors; grain is advisory
            } else if line.contains(':') && line.contains("start=") {
                dump.entries.push(parse_entry(line)?);
            }
        }

        if dump.label.is_empty() {
            return Err(EngineError::Partition("dump has no label line".into()));
        }
        Ok(dump)
    }

    /// Render back into the canonical form sfdisk accepts on stdin.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("label: {}\n", self.label));
        if let Some(id) = &self.label_id {
            out.push_str(&format!("label-id: {}\n", id));
        }
        out.push_str(&format!("device: {}\n", self.device));
        out.push_str("unit: sectors\n");
        out.push_str(&format!("first-lba: {}\n", self.first_lba));
        out.push_str(&format!("last-lba: {}\n", self.last_lba));
        if let Some(size) = self.sector_size {
            out.push_str(&format!("sector-size: {}\n", size));
        }
        out.push('\n');

        for entry in &self.entries {
            let mut fields = vec![
                format!("start={:>12}", entry.start),
                format!("size={:>12}", entry.size),
                format!("type={}", entry.type_guid),
            ];
            if let Some(uuid) = &entry.uuid {
                fields.push(format!("uuid={}", uuid));
            }
            fields.extend(entry.extra.iter().cloned());
            out.push_str(&format!("{} : {}\n", entry.node, fields.join(", ")));
        }
        out
    }

    /// Entry for a given partition number.
    pub fn entry_by_number(&self, number: u32) -> Option<&GptEntry> {
        self.entries.iter().find(|e| e.number == number)
    }

    /// Entries carrying the Linux swap type GUID.
    pub fn swap_entries(&self) -> Vec<&GptEntry> {
        self.entries.iter().filter(|e| e.is_swap()).collect()
    }
}

fn parse_u64(value: &str, what: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Partition(format!("bad {} in dump: {:?}", what, value.trim())))
}

/// Parse one `node : start=, size=, type=, ...` entry line.
fn parse_entry(line: &str) -> Result<GptEntry> {
    let (node, rest) = line
        .split_once(':')
        .ok_or_else(|| EngineError::Partition(format!("malformed entry line: {:?}", line)))?;
    let node = node.trim().to_string();

    let number = node
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<String>()
        .parse()
        .map_err(|_| EngineError::Partition(format!("no partition number in {:?}", node)))?;

    let mut start = None;
    let mut size = None;
    let mut type_guid = None;
    let mut uuid = None;
    let mut extra = Vec::new();

    for field in rest.split(',') {
        let field = field.trim();
        if let Some(value) = field.strip_prefix("start=") {
            start = Some(parse_u64(value, "start")?);
        } else if let Some(value) = field.strip_prefix("size=") {
            size = Some(parse_u64(value, "size")?);
        } else if let Some(value) = field.strip_prefix("type=") {
            type_guid = Some(value.trim().to_string());
        } else if let Some(value) = field.strip_prefix("uuid=") {
            uuid = Some(value.trim().to_string());
        } else if !field.is_empty() {
            extra.push(field.to_string());
        }
    }

    Ok(GptEntry {
        number,
        start: start
            .ok_or_else(|| EngineError::Partition(format!("{} has no start", node)))?,
        size: size.ok_or_else(|| EngineError::Partition(format!("{} has no size", node)))?,
        type_guid: type_guid
            .ok_or_else(|| EngineError::Partition(format!("{} has no type", node)))?,
        uuid,
        extra,
        node,
    })
}

/// Device node for a partition number, honoring the `p` separator that
/// nvme and mmc device names require.
pub fn partition_node(disk: &str, number: u32) -> String {
    let needs_p = disk
        .chars()
        .last()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false);
    if needs_p {
        format!("{}p{}", disk, number)
    } else {
        format!("{}{}", disk, number)
    }
}

/// One swap partition in the new layout.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SwapPartitionSpec {
    /// Partition number on the disk
    pub index: u32,
    pub start_sector: u64,
    pub size_sectors: u64,
    /// Type GUID; always the Linux swap GUID for partitions we create
    pub type_guid: String,
}

/// The computed partition transformation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PartitionPlan {
    /// Target disk
    pub disk: PathBuf,
    /// Where the pre-modification dump was saved; filled by the
    /// transformer at BACKUP time
    pub backup_dump_path: Option<PathBuf>,
    /// Root partition size after the transformation, in sectors
    pub new_root_size_sectors: u64,
    /// New swap partitions, tail-anchored and contiguous
    pub swap_partitions: Vec<SwapPartitionSpec>,
    pub root_action: RootAction,
    /// The on-disk table already matches; nothing to write
    pub already_satisfied: bool,
}

impl PartitionPlan {
    /// Check alignment, disjointness, and disk-range invariants.
    pub fn validate(&self, first_usable: u64, last_usable: u64) -> Result<()> {
        let end_limit = align_down(last_usable + 1 - END_BUFFER_SECTORS, ALIGN_SECTORS);

        let mut previous_end = 0u64;
        for spec in &self.swap_partitions {
            if spec.start_sector % ALIGN_SECTORS != 0 || spec.size_sectors % ALIGN_SECTORS != 0 {
                return Err(EngineError::Partition(format!(
                    "swap partition {} not 1 MiB aligned",
                    spec.index
                )));
            }
            if spec.start_sector < first_usable
                || spec.start_sector + spec.size_sectors > end_limit
            {
                return Err(EngineError::Partition(format!(
                    "swap partition {} outside usable range",
                    spec.index
                )));
            }
            if spec.start_sector < previous_end {
                return Err(EngineError::Partition(format!(
                    "swap partition {} overlaps its predecessor",
                    spec.index
                )));
            }
            previous_end = spec.start_sector + spec.size_sectors;
        }
        Ok(())
    }

    /// Device nodes of the planned swap partitions.
    pub fn swap_nodes(&self) -> Vec<PathBuf> {
        let disk = self.disk.to_string_lossy();
        self.swap_partitions
            .iter()
            .map(|spec| PathBuf::from(partition_node(&disk, spec.index)))
            .collect()
    }
}

/// A computed layout: the plan record plus the dump to write.
#[derive(Clone, Debug)]
pub struct LayoutOutcome {
    pub partition_plan: PartitionPlan,
    pub new_dump: GptDump,
}

/// Compute the new layout from the current dump.
///
/// Root start never moves. When the free tail (after reserving the end
/// buffer) holds the swap group while leaving at least the minimum
/// root, the root is extended (or left) to run up to the swap group
/// start. Otherwise the root must shrink, which only the offline stage
/// can do for the ext family; xfs cannot shrink at all and fails here,
/// before anything is written.
pub fn compute_layout(
    dump: &GptDump,
    inventory: &Inventory,
    plan: &Plan,
    overrides: &Overrides,
) -> Result<LayoutOutcome> {
    let sector_size = dump.sector_size.unwrap_or(inventory.sector_size);

    let root = dump
        .entry_by_number(inventory.root_partition_number)
        .ok_or_else(|| {
            EngineError::Partition(format!(
                "root partition {} not present in dump of {}",
                inventory.root_partition_number, dump.device
            ))
        })?
        .clone();

    // Partitions after the root must be swap partitions from a previous
    // run; anything else means the tail is not ours to rewrite.
    for entry in &dump.entries {
        if entry.start > root.start && !entry.is_swap() {
            return Err(EngineError::Partition(format!(
                "non-swap partition {} sits between root and disk end",
                entry.node
            )));
        }
    }

    let per_device_sectors = align_down(plan.per_device_bytes / sector_size, ALIGN_SECTORS);
    if per_device_sectors == 0 {
        return Err(EngineError::Partition(
            "per-device size rounds to zero sectors".into(),
        ));
    }
    let group_sectors = per_device_sectors * plan.stripe_width as u64;

    let end_limit = align_down(dump.last_lba + 1 - END_BUFFER_SECTORS, ALIGN_SECTORS);
    let swap_start = align_down(end_limit.saturating_sub(group_sectors), ALIGN_SECTORS);

    let min_root_bytes = overrides
        .preserve_root_bytes()
        .max(inventory.root_fs_used_bytes + 2 * GIB);
    let min_root_sectors = align_up(min_root_bytes / sector_size, ALIGN_SECTORS);

    if swap_start <= root.start || swap_start - root.start < min_root_sectors {
        return Err(EngineError::Partition(format!(
            "swap group of {} sectors cannot fit while preserving a {} sector root",
            group_sectors, min_root_sectors
        )));
    }

    let new_root_size = swap_start - root.start;
    let root_action = if new_root_size == root.size {
        RootAction::Unchanged
    } else if new_root_size > root.size {
        RootAction::ExtendOnline
    } else {
        if !inventory.filesystem_kind.can_shrink() {
            return Err(EngineError::Environment(format!(
                "root filesystem {:?} cannot shrink; refusing before any write",
                inventory.filesystem_kind
            )));
        }
        if !overrides.allow_root_shrink {
            return Err(EngineError::Plan(
                "layout requires shrinking the root but --allow-root-shrink is false".into(),
            ));
        }
        RootAction::ShrinkOffline
    };

    // Rebuild the entry list: everything up to and including root stays
    // (root with its new size), old swap partitions at the tail are
    // dropped, new ones are appended.
    let mut entries: Vec<GptEntry> = dump
        .entries
        .iter()
        .filter(|e| !(e.start > root.start && e.is_swap()))
        .cloned()
        .collect();
    if let Some(root_entry) = entries.iter_mut().find(|e| e.number == root.number) {
        root_entry.size = new_root_size;
    }

    let next_number = entries.iter().map(|e| e.number).max().unwrap_or(0) + 1;
    let disk_str = dump.device.clone();

    let mut swap_partitions = Vec::with_capacity(plan.stripe_width as usize);
    for i in 0..plan.stripe_width {
        let number = next_number + i;
        let start = swap_start + i as u64 * per_device_sectors;
        swap_partitions.push(SwapPartitionSpec {
            index: number,
            start_sector: start,
            size_sectors: per_device_sectors,
            type_guid: LINUX_SWAP_GUID.to_string(),
        });
        entries.push(GptEntry {
            node: partition_node(&disk_str, number),
            number,
            start,
            size: per_device_sectors,
            type_guid: LINUX_SWAP_GUID.to_string(),
            uuid: None,
            extra: Vec::new(),
        });
    }

    // A rerun lands here with an identical tail already on disk.
    let already_satisfied = root_action == RootAction::Unchanged
        && dump.swap_entries().len() == swap_partitions.len()
        && dump
            .swap_entries()
            .iter()
            .zip(&swap_partitions)
            .all(|(existing, wanted)| {
                existing.start == wanted.start_sector && existing.size == wanted.size_sectors
            });

    let partition_plan = PartitionPlan {
        disk: PathBuf::from(&disk_str),
        backup_dump_path: None,
        new_root_size_sectors: new_root_size,
        swap_partitions,
        root_action,
        already_satisfied,
    };
    partition_plan.validate(dump.first_lba, dump.last_lba)?;

    let mut new_dump = dump.clone();
    new_dump.entries = entries;
    Ok(LayoutOutcome {
        partition_plan,
        new_dump,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::PartitionScheme;
    use crate::plan::{DiskBacking, RamSolution, Tunables};
    use std::collections::BTreeSet;

    const ROOT_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

    /// 40 GiB disk, root at 9 GiB starting at sector 2048.
    fn sample_dump(root_size: u64) -> GptDump {
        let text = format!(
            "label: gpt\n\
             label-id: 11111111-2222-3333-4444-555555555555\n\
             device: /dev/sda\n\
             unit: sectors\n\
             first-lba: 2048\n\
             last-lba: 83886046\n\
             sector-size: 512\n\
             \n\
             /dev/sda1 : start=2048, size={}, type={}, uuid=AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE\n",
            root_size, ROOT_GUID
        );
        GptDump::parse(&text).unwrap()
    }

    fn sample_inventory(root_size_sectors: u64, fs: FilesystemKind) -> Inventory {
        Inventory {
            ram_bytes: 7 * GIB,
            available_ram_bytes: 5 * GIB,
            cpu_cores: 4,
            page_size: 4096,
            disk_path: PathBuf::from("/dev/sda"),
            root_partition_path: PathBuf::from("/dev/sda1"),
            root_partition_number: 1,
            root_partition_start_sector: 2048,
            root_partition_size_sectors: root_size_sectors,
            disk_size_sectors: 83_886_080,
            sector_size: 512,
            filesystem_kind: fs,
            root_fs_used_bytes: 6 * GIB,
            root_fs_free_bytes: 2 * GIB,
            is_rotational: false,
            partition_scheme: PartitionScheme::Gpt,
            available_compressors: BTreeSet::new(),
            available_allocators: BTreeSet::new(),
        }
    }

    fn sample_plan(stripe_width: u32, per_device_bytes: u64) -> Plan {
        Plan {
            ram_solution: RamSolution::CompressedCache,
            ram_pool_bytes: 2 * GIB,
            ram_pool_pct: 41,
            compressor: "lz4".into(),
            allocator: "zbud".into(),
            disk_backing: DiskBacking::NativeSwapPartitions,
            disk_total_bytes: per_device_bytes * stripe_width as u64,
            stripe_width,
            per_device_bytes,
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
    fn parse_and_render_round_trip() {
        let dump = sample_dump(18_874_368);
        let rendered = dump.render();
        let reparsed = GptDump::parse(&rendered).unwrap();
        assert_eq!(reparsed.label, "gpt");
        assert_eq!(reparsed.first_lba, 2048);
        assert_eq!(reparsed.last_lba, 83_886_046);
        assert_eq!(reparsed.entries, dump.entries);
    }

    #[test]
    fn parse_keeps_unknown_attributes() {
        let text = "label: gpt\n\
                    device: /dev/sda\n\
                    first-lba: 2048\n\
                    last-lba: 1000000\n\
                    /dev/sda1 : start=2048, size=4096, type=X, name=\"EFI\", attrs=\"RequiredPartition\"\n";
        let dump = GptDump::parse(text).unwrap();
        assert_eq!(dump.entries[0].extra.len(), 2);
        assert!(dump.render().contains("name=\"EFI\""));
    }

    #[test]
    fn partition_node_nvme_separator() {
        assert_eq!(partition_node("/dev/sda", 3), "/dev/sda3");
        assert_eq!(partition_node("/dev/nvme0n1", 3), "/dev/nvme0n1p3");
        assert_eq!(partition_node("/dev/mmcblk0", 2), "/dev/mmcblk0p2");
    }

    #[test]
    fn greenfield_extends_root_and_appends_stripe() {
        // 9 GiB root on a 40 GiB disk; 8 x 1.75 GiB swap at the tail
        let root_size = 9 * GIB / 512;
        let dump = sample_dump(root_size);
        let inv = sample_inventory(root_size, FilesystemKind::Ext4);
        let plan = sample_plan(8, align_down(14 * GIB / 8, crate::helpers::MIB));

        let outcome = compute_layout(&dump, &inv, &plan, &Overrides::default()).unwrap();
        let pplan = &outcome.partition_plan;

        assert_eq!(pplan.root_action, RootAction::ExtendOnline);
        assert_eq!(pplan.swap_partitions.len(), 8);
        assert!(!pplan.already_satisfied);

        // root grows to roughly 26 GiB
        let new_root_bytes = pplan.new_root_size_sectors * 512;
        assert!(new_root_bytes > 25 * GIB && new_root_bytes < 27 * GIB);

        // contiguous, tail-anchored, aligned
        let specs = &pplan.swap_partitions;
        for pair in specs.windows(2) {
            assert_eq!(pair[0].start_sector + pair[0].size_sectors, pair[1].start_sector);
        }
        let last = specs.last().unwrap();
        let end_limit = align_down(dump.last_lba + 1 - END_BUFFER_SECTORS, ALIGN_SECTORS);
        assert_eq!(last.start_sector + last.size_sectors, end_limit);
        for spec in specs {
            assert_eq!(spec.start_sector % ALIGN_SECTORS, 0);
            assert_eq!(spec.size_sectors % ALIGN_SECTORS, 0);
        }

        // root runs exactly up to the swap group
        assert_eq!(
            2048 + pplan.new_root_size_sectors,
            specs[0].start_sector
        );
    }

    #[test]
    fn full_root_requires_offline_shrink() {
        // root fills the disk; ext4 can only shrink offline
        let root_size = 83_886_046 - 2048;
        let dump = sample_dump(root_size);
        let mut inv = sample_inventory(root_size, FilesystemKind::Ext4);
        inv.root_fs_used_bytes = 6 * GIB;

        let plan = sample_plan(8, GIB);
        let outcome = compute_layout(&dump, &inv, &plan, &Overrides::default()).unwrap();
        assert_eq!(outcome.partition_plan.root_action, RootAction::ShrinkOffline);
    }

    #[test]
    fn xfs_shrink_is_an_environment_error() {
        let root_size = 83_886_046 - 2048;
        let dump = sample_dump(root_size);
        let inv = sample_inventory(root_size, FilesystemKind::Xfs);
        let plan = sample_plan(8, GIB);
        assert!(matches!(
            compute_layout(&dump, &inv, &plan, &Overrides::default()),
            Err(EngineError::Environment(_))
        ));
    }

    #[test]
    fn shrink_refused_when_not_allowed() {
        let root_size = 83_886_046 - 2048;
        let dump = sample_dump(root_size);
        let inv = sample_inventory(root_size, FilesystemKind::Ext4);
        let plan = sample_plan(8, GIB);
        let overrides = Overrides {
            allow_root_shrink: false,
            ..Default::default()
        };
        assert!(matches!(
            compute_layout(&dump, &inv, &plan, &overrides),
            Err(EngineError::Plan(_))
        ));
    }

    #[test]
    fn swap_that_cannot_fit_is_rejected() {
        let root_size = 9 * GIB / 512;
        let dump = sample_dump(root_size);
        let mut inv = sample_inventory(root_size, FilesystemKind::Ext4);
        inv.root_fs_used_bytes = 30 * GIB;
        // 38 GiB of swap on a 40 GiB disk with a 32 GiB floor
        let plan = sample_plan(2, 19 * GIB);
        assert!(matches!(
            compute_layout(&dump, &inv, &plan, &Overrides::default()),
            Err(EngineError::Partition(_))
        ));
    }

    #[test]
    fn foreign_partition_after_root_is_rejected() {
        let root_size = 9 * GIB / 512;
        let mut dump = sample_dump(root_size);
        dump.entries.push(GptEntry {
            node: "/dev/sda2".into(),
            number: 2,
            start: 2048 + root_size + ALIGN_SECTORS,
            size: GIB / 512,
            type_guid: ROOT_GUID.into(),
            uuid: None,
            extra: Vec::new(),
        });
        let inv = sample_inventory(root_size, FilesystemKind::Ext4);
        let plan = sample_plan(2, GIB);
        assert!(matches!(
            compute_layout(&dump, &inv, &plan, &Overrides::default()),
            Err(EngineError::Partition(_))
        ));
    }

    #[test]
    fn rerun_with_matching_tail_is_already_satisfied() {
        let root_size = 9 * GIB / 512;
        let dump = sample_dump(root_size);
        let inv = sample_inventory(root_size, FilesystemKind::Ext4);
        let plan = sample_plan(8, align_down(14 * GIB / 8, crate::helpers::MIB));

        // first pass computes the layout; apply it to a fresh dump
        let first = compute_layout(&dump, &inv, &plan, &Overrides::default()).unwrap();
        let applied = first.new_dump.clone();

        let mut inv_after = inv.clone();
        inv_after.root_partition_size_sectors = first.partition_plan.new_root_size_sectors;

        let second = compute_layout(&applied, &inv_after, &plan, &Overrides::default()).unwrap();
        assert_eq!(second.partition_plan.root_action, RootAction::Unchanged);
        assert!(second.partition_plan.already_satisfied);
    }

    #[test]
    fn new_dump_renders_swap_entries() {
        let root_size = 9 * GIB / 512;
        let dump = sample_dump(root_size);
        let inv = sample_inventory(root_size, FilesystemKind::Ext4);
        let plan = sample_plan(4, 2 * GIB);
        let outcome = compute_layout(&dump, &inv, &plan, &Overrides::default()).unwrap();
        let rendered = outcome.new_dump.render();
        assert_eq!(rendered.matches(LINUX_SWAP_GUID).count(), 4);
        assert!(rendered.contains("/dev/sda5"));
    }
}
