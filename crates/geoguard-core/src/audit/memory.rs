use parking_lot::Mutex;

use super::{genesis_hash, seal, AuditDraft, AuditError, AuditRecord, AuditStore};

/// In-process audit store.
#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AuditStore for MemoryAuditLog {
    fn append(&self, draft: AuditDraft) -> Result<AuditRecord, AuditError> {
        let mut records = self.records.lock();
        let previous_hash = records
            .last()
            .map(|r| r.record_hash.clone())
            .unwrap_or_else(genesis_hash);
        let record = seal(draft, records.len() as u64 + 1, previous_hash)?;
        records.push(record.clone());
        Ok(record)
    }

    fn records(&self) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self.records.lock().clone())
    }
}
