//! Kernel tunable manager.
//!
//! All four tunables the plan derives land in a single drop-in file
//! owned by the engine. Foreign drop-ins are never touched. The file is
//! regenerated deterministically from the plan, so a rerun with the
//! same plan rewrites identical bytes (and skips the write entirely).

use std::path::Path;

use tracing::info;

use crate::error::{EngineError, Result};
use crate::helpers::{run_command, write_atomic};
use crate::plan::Tunables;

/// The engine's sysctl drop-in.
pub const DROPIN_PATH: &str = "/etc/sysctl.d/99-swaptune.conf";

/// Render the drop-in content for a set of tunables.
pub fn render_dropin(tunables: &Tunables) -> String {
    format!(
        "# Generated by swaptune; rerunning the engine regenerates this file.\n\
         vm.swappiness = {}\n\
         vm.page-cluster = {}\n\
         vm.vfs_cache_pressure = {}\n\
         vm.watermark_scale_factor = {}\n",
        tunables.swappiness,
        tunables.page_cluster,
        tunables.cache_pressure,
        tunables.watermark_scale
    )
}

/// Write the drop-in (when its content changed) and apply it.
///
/// Returns whether the file was rewritten.
pub fn apply(tunables: &Tunables, dropin: &Path) -> Result<bool> {
    let wanted = render_dropin(tunables);
    let current = std::fs::read_to_string(dropin).unwrap_or_default();

    let changed = current != wanted;
    if changed {
        if let Some(parent) = dropin.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(dropin, &wanted)?;
        info!("sysctl drop-in written to {}", dropin.display());
    } else {
        info!("sysctl drop-in already current");
    }

    let dropin_str = dropin.to_string_lossy();
    let out = run_command("sysctl", &["-p", &dropin_str])?;
    if !out.success {
        return Err(EngineError::Activation(format!(
            "sysctl -p {} failed: {}",
            dropin_str,
            out.stderr.trim()
        )));
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunables() -> Tunables {
        Tunables {
            swappiness: 80,
            page_cluster: 0,
            cache_pressure: 50,
            watermark_scale: 125,
        }
    }

    #[test]
    fn dropin_lists_all_four_tunables() {
        let content = render_dropin(&tunables());
        assert!(content.contains("vm.swappiness = 80"));
        assert!(content.contains("vm.page-cluster = 0"));
        assert!(content.contains("vm.vfs_cache_pressure = 50"));
        assert!(content.contains("vm.watermark_scale_factor = 125"));
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(render_dropin(&tunables()), render_dropin(&tunables()));
    }
}
