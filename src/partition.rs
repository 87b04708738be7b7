//! Partition transformer: the dump -> modify -> verify -> write ->
//! readback state machine over the root disk's GPT.
//!
//! The engine holds logical ownership of the partition table for the
//! whole transformation. Nothing is mutated before the current table is
//! backed up to a timestamped dump, and no mutation starts while any
//! swap is active on the target disk. The partition editor's "device
//! busy" re-read failure is expected on a live root disk and absorbed
//! when readback proves the write landed.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::Overrides;
use crate::error::{EngineError, Result};
use crate::gpt::{self, GptDump, LayoutOutcome, PartitionPlan, RootAction};
use crate::helpers::{run_command, run_command_stdin};
use crate::initramfs;
use crate::inventory::Inventory;
use crate::plan::Plan;

/// How long to wait for the last swap node to appear after notifying
/// the kernel.
const NODE_WAIT: Duration = Duration::from_secs(20);

/// Result of the transformation stage.
#[derive(Debug)]
pub enum TransformOutcome {
    /// The table already matches the plan; nothing was written
    AlreadySatisfied(PartitionPlan),
    /// The table was rewritten and verified; swap nodes exist
    Applied(PartitionPlan),
    /// An offline shrink was scheduled; a reboot must happen next
    RebootRequired(PartitionPlan),
}

impl TransformOutcome {
    pub fn partition_plan(&self) -> &PartitionPlan {
        match self {
            TransformOutcome::AlreadySatisfied(p)
            | TransformOutcome::Applied(p)
            | TransformOutcome::RebootRequired(p) => p,
        }
    }
}

/// Drives the partition state machine for one disk.
pub struct PartitionTransformer<'a> {
    inventory: &'a Inventory,
    overrides: &'a Overrides,
}

impl<'a> PartitionTransformer<'a> {
    pub fn new(inventory: &'a Inventory, overrides: &'a Overrides) -> Self {
        Self {
            inventory,
            overrides,
        }
    }

    /// Run PROBE through ACTIVATE (or SCHEDULE_INITRAMFS).
    pub fn transform(&self, plan: &Plan) -> Result<TransformOutcome> {
        let disk = self.inventory.disk_path.to_string_lossy().into_owned();

        // PROBE
        let current_text = dump_table(&disk)?;
        let current = GptDump::parse(&current_text)?;
        if current.label != "gpt" {
            return Err(EngineError::Environment(format!(
                "disk {} carries a {:?} table; only GPT disks are repartitioned",
                disk, current.label
            )));
        }

        // PLAN
        let LayoutOutcome {
            mut partition_plan,
            new_dump,
        } = gpt::compute_layout(&current, self.inventory, plan, self.overrides)?;

        if partition_plan.already_satisfied {
            info!("partition table already matches the plan; skipping write");
            return Ok(TransformOutcome::AlreadySatisfied(partition_plan));
        }

        // BACKUP - always, before any modification
        let backup_path = write_backup(&current_text)?;
        partition_plan.backup_dump_path = Some(backup_path.clone());
        info!("partition table backed up to {}", backup_path.display());

        // No table mutation while swap is active on this disk.
        disable_swap_on_disk(&disk)?;

        match partition_plan.root_action {
            RootAction::ShrinkOffline => {
                // SCHEDULE_INITRAMFS
                initramfs::schedule_offline_shrink(
                    self.inventory,
                    plan,
                    &partition_plan,
                    &new_dump,
                )?;
                Ok(TransformOutcome::RebootRequired(partition_plan))
            }
            RootAction::ExtendOnline | RootAction::Unchanged => {
                // WRITE
                let write_result = apply_table(&disk, &new_dump.render());

                // READBACK decides; a busy re-read error from the
                // editor is expected on the live root disk.
                let after_text = dump_table(&disk)?;
                let after = GptDump::parse(&after_text)?;
                if let Err(mismatch) = verify_readback(&after, &partition_plan, self.inventory) {
                    return Err(EngineError::Partition(format!(
                        "{}; roll back with: sfdisk {} < {}",
                        mismatch,
                        disk,
                        backup_path.display()
                    )));
                }
                if let Err(e) = write_result {
                    info!("partition editor reported {}; readback verified the write", e);
                }

                // NOTIFY_KERNEL
                notify_kernel(&disk, &partition_plan)?;
                Ok(TransformOutcome::Applied(partition_plan))
            }
        }
    }
}

/// Dump the current table in sfdisk's canonical form.
fn dump_table(disk: &str) -> Result<String> {
    let out = run_command("sfdisk", &["--dump", disk])?;
    if !out.success {
        return Err(EngineError::Partition(format!(
            "sfdisk --dump {} failed: {}",
            disk,
            out.stderr.trim()
        )));
    }
    Ok(out.stdout)
}

/// Save the pre-modification dump to a timestamped path for rollback.
fn write_backup(dump_text: &str) -> Result<PathBuf> {
    let path = PathBuf::from(format!(
        "/tmp/swaptune-ptable-{}.dump",
        crate::helpers::artifact_timestamp()
    ));
    std::fs::write(&path, dump_text)?;
    Ok(path)
}

/// Apply a modified dump with flags that tolerate the busy re-read
/// error expected on a mounted root disk.
fn apply_table(disk: &str, dump_text: &str) -> Result<()> {
    let out = run_command_stdin("sfdisk", &["--force", "--no-reread", disk], dump_text)?;
    if !out.success {
        return Err(EngineError::Transient(format!(
            "sfdisk apply exited {:?}: {}",
            out.code,
            out.stderr.lines().last().unwrap_or("")
        )));
    }
    Ok(())
}

/// Assert the re-dumped table matches the intended layout.
fn verify_readback(after: &GptDump, plan: &PartitionPlan, inventory: &Inventory) -> Result<()> {
    let root = after
        .entry_by_number(inventory.root_partition_number)
        .ok_or_else(|| {
            EngineError::Partition("root partition missing after write".into())
        })?;
    if root.size != plan.new_root_size_sectors {
        return Err(EngineError::Partition(format!(
            "root size readback mismatch: expected {} sectors, found {}",
            plan.new_root_size_sectors, root.size
        )));
    }

    for spec in &plan.swap_partitions {
        let entry = after.entry_by_number(spec.index).ok_or_else(|| {
            EngineError::Partition(format!("swap partition {} missing after write", spec.index))
        })?;
        if entry.start != spec.start_sector
            || entry.size != spec.size_sectors
            || !entry.is_swap()
        {
            return Err(EngineError::Partition(format!(
                "swap partition {} readback mismatch (start {} size {} type {})",
                spec.index, entry.start, entry.size, entry.type_guid
            )));
        }
    }
    Ok(())
}

/// Turn off any swap currently active on partitions of this disk.
fn disable_swap_on_disk(disk: &str) -> Result<()> {
    let Ok(content) = std::fs::read_to_string("/proc/swaps") else {
        return Ok(());
    };

    for line in content.lines().skip(1) {
        let Some(device) = line.split_whitespace().next() else {
            continue;
        };
        if device.starts_with(disk) {
            info!("swapoff {} before table rewrite", device);
            let out = run_command("swapoff", &[device])?;
            if !out.success {
                return Err(EngineError::Partition(format!(
                    "cannot swapoff {}: {}",
                    device,
                    out.stderr.trim()
                )));
            }
        }
    }
    Ok(())
}

/// Tell the kernel about the new table and wait for the device nodes.
fn notify_kernel(disk: &str, plan: &PartitionPlan) -> Result<()> {
    // the re-read itself may report busy on the live root; the
    // follow-up partx/partprobe pass updates the kernel view anyway
    let _ = run_command("blockdev", &["--rereadpt", disk]);
    let _ = run_command("partprobe", &[disk]);
    let _ = run_command("partx", &["-u", disk]);
    let _ = run_command("udevadm", &["settle"]);

    let Some(last_node) = plan.swap_nodes().into_iter().next_back() else {
        return Ok(());
    };

    let deadline = Instant::now() + NODE_WAIT;
    while Instant::now() < deadline {
        if Path::new(&last_node).exists() {
            info!("all swap partition nodes present");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(250));
    }

    Err(EngineError::Partition(format!(
        "device node {} did not appear within {}s of the kernel notify",
        last_node.display(),
        NODE_WAIT.as_secs()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::{SwapPartitionSpec, LINUX_SWAP_GUID};
    use crate::helpers::GIB;
    use crate::inventory::{FilesystemKind, PartitionScheme};
    use std::collections::BTreeSet;

    fn inventory() -> Inventory {
        Inventory {
            ram_bytes: 8 * GIB,
            available_ram_bytes: 6 * GIB,
            cpu_cores: 4,
            page_size: 4096,
            disk_path: PathBuf::from("/dev/sda"),
            root_partition_path: PathBuf::from("/dev/sda1"),
            root_partition_number: 1,
            root_partition_start_sector: 2048,
            root_partition_size_sectors: 54_519_808,
            disk_size_sectors: 83_886_080,
            sector_size: 512,
            filesystem_kind: FilesystemKind::Ext4,
            root_fs_used_bytes: 6 * GIB,
            root_fs_free_bytes: 2 * GIB,
            is_rotational: false,
            partition_scheme: PartitionScheme::Gpt,
            available_compressors: BTreeSet::new(),
            available_allocators: BTreeSet::new(),
        }
    }

    fn dump_with_swap(root_size: u64, swap: &[(u32, u64, u64)]) -> GptDump {
        let mut text = format!(
            "label: gpt\ndevice: /dev/sda\nfirst-lba: 2048\nlast-lba: 83886046\n\
             /dev/sda1 : start=2048, size={}, type=0FC63DAF-8483-4772-8E79-3D69D8477DE4\n",
            root_size
        );
        for (number, start, size) in swap {
            text.push_str(&format!(
                "/dev/sda{} : start={}, size={}, type={}\n",
                number, start, size, LINUX_SWAP_GUID
            ));
        }
        GptDump::parse(&text).unwrap()
    }

    fn pplan(root_size: u64, swap: &[(u32, u64, u64)]) -> PartitionPlan {
        PartitionPlan {
            disk: PathBuf::from("/dev/sda"),
            backup_dump_path: None,
            new_root_size_sectors: root_size,
            swap_partitions: swap
                .iter()
                .map(|(number, start, size)| SwapPartitionSpec {
                    index: *number,
                    start_sector: *start,
                    size_sectors: *size,
                    type_guid: LINUX_SWAP_GUID.to_string(),
                })
                .collect(),
            root_action: RootAction::ExtendOnline,
            already_satisfied: false,
        }
    }

    #[test]
    fn readback_accepts_matching_table() {
        let swap = [(2u32, 54_521_856u64, 3_670_016u64)];
        let dump = dump_with_swap(54_519_808, &swap);
        let plan = pplan(54_519_808, &swap);
        assert!(verify_readback(&dump, &plan, &inventory()).is_ok());
    }

    #[test]
    fn readback_rejects_wrong_root_size() {
        let swap = [(2u32, 54_521_856u64, 3_670_016u64)];
        let dump = dump_with_swap(50_000_000, &swap);
        let plan = pplan(54_519_808, &swap);
        assert!(matches!(
            verify_readback(&dump, &plan, &inventory()),
            Err(EngineError::Partition(_))
        ));
    }

    #[test]
    fn readback_rejects_missing_swap_entry() {
        let dump = dump_with_swap(54_519_808, &[]);
        let plan = pplan(54_519_808, &[(2, 54_521_856, 3_670_016)]);
        assert!(verify_readback(&dump, &plan, &inventory()).is_err());
    }

    #[test]
    fn readback_rejects_moved_swap_entry() {
        let dump = dump_with_swap(54_519_808, &[(2, 60_000_000, 3_670_016)]);
        let plan = pplan(54_519_808, &[(2, 54_521_856, 3_670_016)]);
        assert!(verify_readback(&dump, &plan, &inventory()).is_err());
    }
}
