//! RAM Pressurizer helper for swaptune.
//!
//! Invoked as `swaptune-mempress <bytes> <pattern> <hold_seconds>` with
//! `pattern` one of `mixed`, `random`, `zeros`, `sequential`. Allocates
//! and fills the requested amount, emitting progress lines the engine
//! parses, holds the allocation for the requested time, then exits.
//!
//! Exit codes: 0 on success, 1 on allocation failure, 2 on usage error.
//!
//! Protocol on stdout:
//! - `PROGRESS <filled_mib> <total_mib>` - periodic during fill
//! - `FILLED <elapsed_ms>` - fill complete, hold begins
//!
//! The `random` pattern chains SHA-256 blocks so the data is
//! deterministic but incompressible; `mixed` alternates compressible
//! text-like pages with incompressible ones, approximating the entropy
//! of real anonymous memory.

use std::io::Write;
use std::time::Instant;

use sha2::{Digest, Sha256};

const MIB: usize = 1024 * 1024;
const PROGRESS_EVERY_MIB: usize = 64;

#[derive(Clone, Copy, PartialEq)]
enum Pattern {
    Mixed,
    Random,
    Zeros,
    Sequential,
}

impl Pattern {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "mixed" => Some(Pattern::Mixed),
            "random" => Some(Pattern::Random),
            "zeros" => Some(Pattern::Zeros),
            "sequential" => Some(Pattern::Sequential),
            _ => None,
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (bytes, pattern, hold_seconds) = match parse_args(&args) {
        Some(parsed) => parsed,
        None => {
            eprintln!("usage: swaptune-mempress <bytes> <mixed|random|zeros|sequential> <hold_seconds>");
            std::process::exit(2);
        }
    };

    let start = Instant::now();

    let mut region: Vec<u8> = Vec::new();
    if region.try_reserve_exact(bytes).is_err() {
        eprintln!("allocation of {} bytes failed", bytes);
        std::process::exit(1);
    }
    region.resize(bytes, 0);

    let total_mib = bytes / MIB;
    let mut rng_state = [0u8; 32];

    for (chunk_index, chunk) in region.chunks_mut(MIB).enumerate() {
        fill_chunk(chunk, chunk_index, pattern, &mut rng_state);

        let filled_mib = chunk_index + 1;
        if filled_mib % PROGRESS_EVERY_MIB == 0 || filled_mib == total_mib.max(1) {
            println!("PROGRESS {} {}", filled_mib, total_mib);
            let _ = std::io::stdout().flush();
        }
    }

    println!("FILLED {}", start.elapsed().as_millis());
    let _ = std::io::stdout().flush();

    std::thread::sleep(std::time::Duration::from_secs(hold_seconds));
    std::hint::black_box(&region);
}

fn parse_args(args: &[String]) -> Option<(usize, Pattern, u64)> {
    if args.len() != 3 {
        return None;
    }
    let bytes = args[0].parse().ok()?;
    let pattern = Pattern::parse(&args[1])?;
    let hold = args[2].parse().ok()?;
    Some((bytes, pattern, hold))
}

/// Fill one 1 MiB chunk according to the pattern.
fn fill_chunk(chunk: &mut [u8], chunk_index: usize, pattern: Pattern, rng_state: &mut [u8; 32]) {
    match pattern {
        Pattern::Zeros => {
            // resize() already zeroed it; still write so the pages fault in
            chunk.fill(0);
        }
        Pattern::Sequential => {
            for (i, byte) in chunk.iter_mut().enumerate() {
                *byte = ((chunk_index + i) & 0xFF) as u8;
            }
        }
        Pattern::Random => fill_incompressible(chunk, rng_state),
        Pattern::Mixed => {
            // Alternate 4 KiB pages: even pages compressible text-like,
            // odd pages incompressible.
            for (page_index, page) in chunk.chunks_mut(4096).enumerate() {
                if page_index % 2 == 0 {
                    fill_textlike(page, chunk_index + page_index);
                } else {
                    fill_incompressible(page, rng_state);
                }
            }
        }
    }
}

/// Deterministic incompressible bytes from a SHA-256 chain.
fn fill_incompressible(buf: &mut [u8], state: &mut [u8; 32]) {
    for block in buf.chunks_mut(32) {
        let digest = Sha256::digest(&state[..]);
        state.copy_from_slice(&digest);
        block.copy_from_slice(&digest[..block.len()]);
    }
}

/// Repeating ASCII filler with a per-page seed, compressing roughly like
/// program text.
fn fill_textlike(buf: &mut [u8], seed: usize) {
    const WORDS: &[u8] = b"page cache anon heap stack slab dirty clean mapped ";
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = WORDS[(i + seed) % WORDS.len()];
    }
}
