//! # Storage Module - Flat-File Mailbox Layer
//!
//! The bridge and the agent never share memory. Everything they agree on lives in
//! small delimited text files under the data root, and this module is the only
//! code that touches those files directly.
//!
//! ## Features
//!
//! - **Advisory Locking**: A `<file>.lock` sentinel created with `create_new`
//!   serializes every read-modify-write window across processes ([`lock`]).
//! - **Atomic Replace**: Full rewrites go to a temp file in the same directory
//!   and are renamed over the target, so readers never see a torn file.
//! - **Record Store**: Header-first CSV files read and written with the `csv`
//!   crate, with per-field escaping of backslash, CR and LF so multi-line text
//!   stays on one physical line and round-trips exactly ([`records`]).
//! - **Schema Migration**: Opening a file with a different column set rewrites
//!   its rows into the new schema, keeping values under surviving names.
//!
//! ## Layout
//!
//! ```text
//! data/
//! └── nodes/
//!     └── <node_uid>/
//!         ├── nodes.csv          ← node registry
//!         ├── sightings.csv      ← telemetry reports, one per node per day
//!         └── threads/
//!             ├── channels/      ← one log per channel
//!             └── dms/           ← one log per direct peer
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshllm::storage::{LockOptions, RecordStore, Record};
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = RecordStore::new(LockOptions::default());
//!     let path = Path::new("data/example.csv");
//!     store.ensure(path, &["id", "body"])?;
//!
//!     let mut row = Record::new();
//!     row.insert("id".into(), "1".into());
//!     row.insert("body".into(), "line one\nline two".into());
//!     store.append(path, &["id", "body"], &row)?;
//!
//!     for record in store.read(path)? {
//!         println!("{:?}", record);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! There is no in-process cache: every call re-reads the file under its lock.

pub mod errors;
pub mod lock;
pub mod records;

pub use errors::StoreError;
pub use lock::{FileLock, LockGuard, LockOptions};
pub use records::{Record, RecordStore};

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Replace `path` with `content` via a uniquely named temp file in the same
/// directory followed by a rename. The caller is expected to hold the file's
/// advisory lock.
pub(crate) fn atomic_write(path: &Path, content: impl AsRef<[u8]>) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("records.csv");

    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                let written = tmp
                    .write_all(content.as_ref())
                    .and_then(|_| tmp.flush())
                    .and_then(|_| tmp.sync_all());
                if let Err(e) = written {
                    drop(tmp);
                    let _ = fs::remove_file(&candidate);
                    return Err(e);
                }
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(e),
        }
    };

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    // Persist the rename itself (best-effort)
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}
