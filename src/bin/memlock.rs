//! RAM Locker helper for swaptune.
//!
//! Invoked as `swaptune-memlock <bytes>`. Allocates the requested amount,
//! touches every page with a non-zero pattern (defeating same-page
//! deduplication and lazy allocation), pins the region resident with
//! mlock, then blocks until signaled. On SIGTERM/SIGINT the pin is
//! released and the process exits.
//!
//! Deliberately a separate process: memory pinning at these scales needs
//! direct system calls and a process the OS can account for separately,
//! and a crash here must not take the engine down.
//!
//! Protocol on stdout, one line:
//! - `LOCKED` - allocation held and pinned resident
//! - `LOCKED-SOFT` - allocation held but mlock was not permitted; the
//!   region may be evicted under pressure

use std::sync::atomic::{AtomicBool, Ordering};

static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_: i32) {
    SIGNAL_RECEIVED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

fn main() {
    let mut args = std::env::args().skip(1);
    let bytes: usize = match args.next().and_then(|a| a.parse().ok()) {
        Some(b) => b,
        None => {
            eprintln!("usage: swaptune-memlock <bytes>");
            std::process::exit(2);
        }
    };

    install_signal_handlers();

    let mut region: Vec<u8> = Vec::new();
    if region.try_reserve_exact(bytes).is_err() {
        eprintln!("allocation of {} bytes failed", bytes);
        std::process::exit(1);
    }
    region.resize(bytes, 0);

    // Touch every page with a non-zero value; zero pages would be
    // deduplicated or left unallocated by the kernel.
    let page = page_size();
    for i in (0..bytes).step_by(page) {
        region[i] = ((i / page) & 0xFF) as u8 | 0x01;
    }

    let locked = unsafe { libc::mlock(region.as_ptr() as *const libc::c_void, bytes) } == 0;
    if locked {
        println!("LOCKED");
    } else {
        // Not permitted (RLIMIT_MEMLOCK or capability); hold the
        // allocation anyway and let the engine surface the soft state.
        println!("LOCKED-SOFT");
    }
    // The parent reads the line before starting the pressurizer.
    use std::io::Write;
    let _ = std::io::stdout().flush();

    while !SIGNAL_RECEIVED.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    if locked {
        unsafe {
            libc::munlock(region.as_ptr() as *const libc::c_void, bytes);
        }
    }
    std::hint::black_box(&region);
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}
