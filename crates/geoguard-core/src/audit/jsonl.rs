use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::{genesis_hash, seal, AuditDraft, AuditError, AuditRecord, AuditStore};

struct Head {
    file: File,
    /// Bytes of complete records on disk
    len: u64,
    next_sequence: u64,
    previous_hash: String,
    /// Set when a failed write could not be rolled back
    poisoned: bool,
}

impl Head {
    /// Write one full line or leave the file at its previous length.
    fn write_line(&mut self, line: &[u8]) -> Result<(), AuditError> {
        if self.poisoned {
            return Err(AuditError::Poisoned);
        }
        let written = self
            .file
            .write_all(line)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync_data());

        match written {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(error) => {
                if let Err(rollback) = self.file.set_len(self.len) {
                    tracing::error!(
                        error = %rollback,
                        "Could not roll back partial audit write; refusing further appends"
                    );
                    self.poisoned = true;
                }
                Err(error.into())
            }
        }
    }
}

/// Audit log stored as one JSON record per line.
///
/// The file is only ever opened for append. On open the last record is
/// read back so the chain continues across restarts. A final line left
/// without its newline by an interrupted write is cut off.
pub struct JsonlAuditLog {
    path: PathBuf,
    head: Mutex<Head>,
}

impl JsonlAuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let scan = scan(&path)?;
        let (next_sequence, previous_hash) = match scan.records.last() {
            Some(last) => (last.sequence + 1, last.record_hash.clone()),
            None => (1, genesis_hash()),
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if let Some(line) = scan.torn_line {
            tracing::warn!(
                path = %path.display(),
                line,
                kept_bytes = scan.valid_len,
                "Dropping incomplete trailing audit line"
            );
            file.set_len(scan.valid_len)?;
        }

        tracing::debug!(
            path = %path.display(),
            next_sequence,
            "Opened audit log"
        );

        Ok(Self {
            path,
            head: Mutex::new(Head {
                file,
                len: scan.valid_len,
                next_sequence,
                previous_hash,
                poisoned: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct Scan {
    records: Vec<AuditRecord>,
    /// Byte length up to the end of the last complete line
    valid_len: u64,
    /// Line number of an unterminated, unparseable final line
    torn_line: Option<usize>,
}

fn scan(path: &Path) -> Result<Scan, AuditError> {
    let mut scan = Scan {
        records: Vec::new(),
        valid_len: 0,
        torn_line: None,
    };
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut line_no = 0;
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        let terminated = buf.last() == Some(&b'\n');
        let text = String::from_utf8_lossy(&buf);
        if text.trim().is_empty() {
            scan.valid_len += read as u64;
            continue;
        }
        match serde_json::from_str::<AuditRecord>(text.trim_end()) {
            Ok(record) if terminated => {
                scan.records.push(record);
                scan.valid_len += read as u64;
            }
            // Complete JSON without its newline: the write stopped just short.
            Ok(_) => scan.torn_line = Some(line_no),
            Err(_) if !terminated => scan.torn_line = Some(line_no),
            Err(e) => {
                return Err(AuditError::Corrupt {
                    line: line_no,
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(scan)
}

impl AuditStore for JsonlAuditLog {
    fn append(&self, draft: AuditDraft) -> Result<AuditRecord, AuditError> {
        let mut head = self.head.lock();
        let record = seal(draft, head.next_sequence, head.previous_hash.clone())?;

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        head.write_line(&line)?;

        head.next_sequence += 1;
        head.previous_hash = record.record_hash.clone();

        tracing::debug!(
            feature_id = %record.feature_id,
            sequence = record.sequence,
            "Appended audit record"
        );
        Ok(record)
    }

    fn records(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let _head = self.head.lock();
        Ok(scan(&self.path)?.records)
    }
}
