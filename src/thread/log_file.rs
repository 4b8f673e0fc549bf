use std::path::Path;

use crate::storage::{RecordStore, StoreError};

use super::{Direction, MessageRecord, THREAD_SCHEMA};

/// Typed access to thread log files through the [`RecordStore`].
#[derive(Debug, Clone, Default)]
pub struct ThreadLog {
    store: RecordStore,
}

impl ThreadLog {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn ensure(&self, path: &Path) -> Result<(), StoreError> {
        self.store.ensure(path, &THREAD_SCHEMA)
    }

    pub fn read_all(&self, path: &Path) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(self
            .store
            .read(path)?
            .iter()
            .map(MessageRecord::from_record)
            .collect())
    }

    pub fn append(&self, path: &Path, record: &MessageRecord) -> Result<(), StoreError> {
        self.store.append(path, &THREAD_SCHEMA, &record.to_record())
    }

    pub fn rewrite(&self, path: &Path, records: &[MessageRecord]) -> Result<(), StoreError> {
        let rows: Vec<_> = records.iter().map(MessageRecord::to_record).collect();
        self.store.write(path, &THREAD_SCHEMA, &rows)
    }

    /// Read-mutate-rewrite under one lock. The closure reports whether it
    /// changed anything; unchanged logs are not rewritten.
    pub fn update<T, E, F>(&self, path: &Path, mutate: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Vec<MessageRecord>) -> Result<(bool, T), E>,
    {
        self.store.update(path, &THREAD_SCHEMA, |rows| {
            let mut typed: Vec<MessageRecord> = rows.iter().map(MessageRecord::from_record).collect();
            let (changed, value) = mutate(&mut typed)?;
            if changed {
                *rows = typed.iter().map(MessageRecord::to_record).collect();
            }
            Ok((changed, value))
        })
    }
}

/// True if any queued or sent record answers `message_id`. Guards against
/// generating a second reply after a restart. Inbound rows carry the radio
/// reply id of other users and never count.
pub fn has_reply(records: &[MessageRecord], message_id: &str) -> bool {
    records
        .iter()
        .any(|r| r.direction != Direction::Inbound && r.reply_to_id.as_deref() == Some(message_id))
}

/// Queued rows that have exhausted `max_attempts`.
pub fn abandoned_count(records: &[MessageRecord], max_attempts: u32) -> usize {
    records
        .iter()
        .filter(|r| r.direction == Direction::Queued && r.send_attempts >= max_attempts)
        .count()
}
