//! Delimited tabular record files.
//!
//! Each file is a CSV header line followed by one physical line per record,
//! read and written through the `csv` crate. Field values are escaped
//! (`\\`, `\r`, `\n`) before quoting so a record never spans lines, and
//! unescaped on read so multi-line text round-trips.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use log::{debug, info};

use super::lock::{FileLock, LockOptions};
use super::{atomic_write, StoreError};

/// One row, keyed by column name. Columns outside the schema are ignored on write.
pub type Record = BTreeMap<String, String>;

/// Column that always normalizes empty/missing to `"0"`.
pub const PROCESSED_COLUMN: &str = "processed";

/// Locked read/modify/write access to record files.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    lock: LockOptions,
}

struct Table {
    header: Vec<String>,
    rows: Vec<Record>,
}

impl RecordStore {
    pub fn new(lock: LockOptions) -> Self {
        Self { lock }
    }

    pub fn lock_options(&self) -> LockOptions {
        self.lock
    }

    fn lock_for(&self, path: &Path) -> FileLock {
        FileLock::for_target(path, self.lock)
    }

    /// Create the file with a header row if absent. An existing file whose
    /// header differs is rewritten into `schema`, preserving values under
    /// column names both schemas share.
    pub fn ensure(&self, path: &Path, schema: &[&str]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _guard = self.lock_for(path).acquire()?;
        self.ensure_locked(path, schema)
    }

    fn ensure_locked(&self, path: &Path, schema: &[&str]) -> Result<(), StoreError> {
        match read_table(path)? {
            Some(table) => {
                if table.header.iter().map(String::as_str).eq(schema.iter().copied()) {
                    return Ok(());
                }
                info!(
                    "Migrating {} from {} to {} columns",
                    path.display(),
                    table.header.len(),
                    schema.len()
                );
                atomic_write(path, render(schema, &table.rows)?)?;
                Ok(())
            }
            None => {
                atomic_write(path, render(schema, &[])?)?;
                Ok(())
            }
        }
    }

    /// All records in file order; `[]` for a nonexistent file.
    pub fn read(&self, path: &Path) -> Result<Vec<Record>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let _guard = self.lock_for(path).acquire()?;
        Ok(read_table(path)?.map(|t| t.rows).unwrap_or_default())
    }

    /// Atomically replace the file with `records` under `schema`.
    pub fn write(&self, path: &Path, schema: &[&str], records: &[Record]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _guard = self.lock_for(path).acquire()?;
        atomic_write(path, render(schema, records)?)?;
        Ok(())
    }

    /// `ensure` followed by a locked single-line append.
    pub fn append(&self, path: &Path, schema: &[&str], record: &Record) -> Result<(), StoreError> {
        self.ensure(path, schema)?;
        let _guard = self.lock_for(path).acquire()?;
        let file = OpenOptions::new().append(true).open(path)?;
        let mut out = writer(file);
        out.write_record(encode_record(schema, record)).map_err(csv_io)?;
        out.flush()?;
        Ok(())
    }

    /// Read, mutate and rewrite under a single lock scope. The closure returns
    /// `(changed, value)`; the file is only rewritten when `changed` is true.
    pub fn update<T, E, F>(&self, path: &Path, schema: &[&str], mutate: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Vec<Record>) -> Result<(bool, T), E>,
    {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::from)?;
        }
        let _guard = self.lock_for(path).acquire()?;
        self.ensure_locked(path, schema)?;
        let mut rows = read_table(path)?.map(|t| t.rows).unwrap_or_default();
        let (changed, value) = mutate(&mut rows)?;
        if changed {
            atomic_write(path, render(schema, &rows)?).map_err(StoreError::from)?;
            debug!("Rewrote {} ({} records)", path.display(), rows.len());
        }
        Ok(value)
    }
}

fn read_table(path: &Path) -> Result<Option<Table>, StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    // Guard against leading NULs left by a torn legacy write
    let text = text.trim_start_matches('\0');
    let malformed = |e: csv::Error| StoreError::MalformedRow {
        path: path.to_path_buf(),
        line: e.position().map(|p| p.line() as usize).unwrap_or(0),
        reason: e.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());
    let header: Vec<String> = reader.headers().map_err(malformed)?.iter().map(str::to_string).collect();
    if header.iter().all(|h| h.trim().is_empty()) {
        return Ok(Some(Table { header: Vec::new(), rows: Vec::new() }));
    }
    let has_processed = header.iter().any(|h| h == PROCESSED_COLUMN);

    let mut rows = Vec::new();
    for result in reader.records() {
        let fields = result.map_err(malformed)?;
        let mut record = Record::new();
        for (idx, column) in header.iter().enumerate() {
            record.insert(column.clone(), unescape_field(fields.get(idx).unwrap_or("")));
        }
        if has_processed {
            normalize_processed(&mut record);
        }
        rows.push(record);
    }
    Ok(Some(Table { header, rows }))
}

fn normalize_processed(record: &mut Record) {
    let entry = record.entry(PROCESSED_COLUMN.to_string()).or_default();
    let trimmed = entry.trim();
    *entry = if trimmed.is_empty() { "0".to_string() } else { trimmed.to_string() };
}

fn writer<W: Write>(sink: W) -> csv::Writer<W> {
    csv::WriterBuilder::new().has_headers(false).from_writer(sink)
}

fn render(schema: &[&str], records: &[Record]) -> Result<Vec<u8>, StoreError> {
    let mut out = writer(Vec::new());
    out.write_record(schema).map_err(csv_io)?;
    for record in records {
        out.write_record(encode_record(schema, record)).map_err(csv_io)?;
    }
    out.into_inner().map_err(|e| StoreError::Io(e.into_error()))
}

/// Field values in schema order, escaped for a single physical line.
fn encode_record(schema: &[&str], record: &Record) -> Vec<String> {
    schema
        .iter()
        .map(|column| {
            let value = record.get(*column).map(String::as_str).unwrap_or("");
            if *column == PROCESSED_COLUMN {
                let trimmed = value.trim();
                let processed = if trimmed.is_empty() { "0" } else { trimmed };
                processed.to_string()
            } else {
                escape_field(value)
            }
        })
        .collect()
}

fn csv_io(e: csv::Error) -> StoreError {
    StoreError::Io(e.into())
}

/// Escape backslash, CR and LF so the value fits on one physical line.
pub fn escape_field(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_field`]. Unknown escape sequences are kept verbatim.
pub fn unescape_field(text: &str) -> String {
    if !text.contains('\\') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.peek() {
                Some('n') => {
                    out.push('\n');
                    chars.next();
                    continue;
                }
                Some('r') => {
                    out.push('\r');
                    chars.next();
                    continue;
                }
                Some('\\') => {
                    out.push('\\');
                    chars.next();
                    continue;
                }
                _ => {}
            }
        }
        out.push(ch);
    }
    out
}
