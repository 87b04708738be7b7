//! # swaptune
//!
//! An adaptive swap-configuration engine for Linux hosts.
//!
//! ## Overview
//!
//! `swaptune` observes the machine it runs on, measures its memory
//! compression and disk I/O behavior under controlled RAM pressure,
//! then deterministically reshapes the system's swap topology:
//!
//! - Repartitions the root disk, extending or (offline) shrinking the
//!   root filesystem to carve equal-sized striped swap partitions
//! - Configures the kernel's compressed swap tier (transparent cache
//!   or RAM-resident block device) with a measured compressor and
//!   allocator choice
//! - Applies matching kernel tunables and persists everything across
//!   reboots with stable partition identifiers
//!
//! ## Usage
//!
//! ```bash
//! # Full run: probe, benchmark, plan, repartition, activate
//! swaptune run
//!
//! # Dry run: compute the plan, touch nothing
//! swaptune plan
//!
//! # Current topology and compression counters
//! swaptune status
//! ```
//!
//! ## Module Organization
//!
//! - [`config`]: CLI argument parsing and the operator override layer
//! - [`inventory`]: hardware and kernel capability probe
//! - [`pressure`]: child-process drivers for the memory helpers
//! - [`bench`]: the benchmark suite
//! - [`plan`]: the pure topology calculator
//! - [`gpt`] / [`partition`]: partition table model and transformer
//! - [`initramfs`]: offline shrink staging
//! - [`activate`] / [`sysctl`]: swap activation and kernel tunables
//! - [`report`]: JSON run documents and human summaries
//! - [`app`]: pipeline orchestration

mod activate;
mod app;
mod bench;
mod config;
mod error;
mod gpt;
mod helpers;
mod initramfs;
mod inventory;
mod partition;
mod plan;
mod pressure;
mod report;
mod sysctl;
mod zram;
mod zswap;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::{Action, Config};

fn main() {
    // Platform check - the engine reads /proc, /sys, and GPT disks
    #[cfg(not(target_os = "linux"))]
    {
        eprintln!("swaptune only works on Linux: every probe reads /proc and /sys.");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::parse();
    setup_signal_handler();

    let action = config.command.clone().unwrap_or(Action::Run);
    let outcome = match action {
        Action::Status => app::status(),
        Action::Run => app::App::new(config).and_then(|app| app.run()),
        Action::Plan => app::App::new(config).and_then(|app| app.plan_only()),
        Action::Bench => app::App::new(config).and_then(|app| app.bench_only()),
        Action::Finalize => app::App::new(config).and_then(|app| app.finalize()),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

/// Install SIGINT/SIGTERM handlers for an ordered shutdown: helpers are
/// killed by their drop guards and a partially transformed table stays
/// behind with its backup path recorded in the run document.
fn setup_signal_handler() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

/// Signal handler (async-signal-safe: only sets a flag).
extern "C" fn signal_handler(_: i32) {
    app::request_shutdown();
}
