//! Persistent allocation demo on a file-backed fixed region.
//!
//! Three single-flag modes:
//!
//! - `-i` creates the region, puts an allocator on it, builds a linked chain
//!   of records in allocated memory, and commits everything.
//! - `-r` remaps the same file at the same address, reattaches the
//!   allocator, and walks the chain to verify the previous run's writes.
//! - `-c` removes the backing file.

use fmem::{FileRegion, Fmem};
use std::path::PathBuf;
use std::process::ExitCode;

const REGION_LEN: usize = 10 * 1024 * 1024;
const RECORDS: usize = 16;

/// One node of the demo graph. `next` is the absolute in-region address of
/// the following record; 0 ends the chain. Absolute addresses work because
/// the region is always mapped at the same place.
#[repr(C)]
struct Record {
    value: u64,
    next: usize,
}

type DemoResult = Result<(), Box<dyn std::error::Error>>;

fn region_path() -> PathBuf {
    std::env::temp_dir().join("fmem-demo.region")
}

fn mode_init() -> DemoResult {
    let path = region_path();
    let region = unsafe { FileRegion::create(&path, REGION_LEN, FileRegion::default_map_addr())? };
    let fm = unsafe {
        Fmem::create_new(
            region.base(),
            region.len(),
            0,
            Some(Box::new(region.committer()?)),
        )?
    };

    // Build the chain back to front so each record can point at its
    // successor, committing each one as it lands.
    let mut next = 0usize;
    for i in (0..RECORDS).rev() {
        let mem = fm.alloc(std::mem::size_of::<Record>() as u32)?;
        let record = mem.as_ptr() as *mut Record;
        unsafe {
            record.write(Record {
                value: (i * i) as u64,
                next,
            });
            fm.commit_mem(mem, 0)?;
        }
        next = record as usize;
    }

    // Stash the chain root where the next run can find it.
    fm.set_user(0, next);
    fm.commit_user_data()?;

    println!(
        "initialized {} records on {} ({} bytes available)",
        RECORDS,
        path.display(),
        fm.total_available()
    );
    Ok(())
}

fn mode_read() -> DemoResult {
    let path = region_path();
    let region = unsafe { FileRegion::open(&path, FileRegion::default_map_addr())? };
    let fm = unsafe {
        Fmem::from_existing(region.base(), Some(Box::new(region.committer()?)))?
    };

    if fm.alloc_objects() as usize != RECORDS {
        return Err(format!(
            "expected {} live records, found {}",
            RECORDS,
            fm.alloc_objects()
        )
        .into());
    }

    let mut cursor = fm.user(0);
    let mut count = 0usize;
    while cursor != 0 {
        let record = cursor as *const Record;
        let (value, next) = unsafe { ((*record).value, (*record).next) };
        let expected = (count * count) as u64;
        if value != expected {
            return Err(format!("record {count}: expected {expected}, found {value}").into());
        }
        cursor = next;
        count += 1;
    }
    if count != RECORDS {
        return Err(format!("chain ended after {count} of {RECORDS} records").into());
    }

    println!("data is the same after a remap ({count} records verified)");
    Ok(())
}

fn mode_cleanup() -> DemoResult {
    std::fs::remove_file(region_path())?;
    println!("removed backing file");
    Ok(())
}

fn main() -> ExitCode {
    let mode = std::env::args().nth(1);
    let result = match mode.as_deref() {
        Some("-i") => mode_init(),
        Some("-r") => mode_read(),
        Some("-c") => mode_cleanup(),
        _ => {
            eprintln!("usage: fmem-demo [-irc] (select one)");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
