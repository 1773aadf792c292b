//! Append-only, hash-chained audit trail.
//!
//! Every scan appends exactly one [`AuditRecord`], whatever its outcome.
//! Records are never rewritten; a correction is a new record that names
//! the record it supersedes.
//!
//! Each record commits to its predecessor:
//!
//! ```text
//! record_hash = sha256(previous_hash || "\n" || canonical_json(body))
//! ```
//!
//! where `body` is the record without `record_hash`, and the first
//! record's `previous_hash` is [`genesis_hash`].

mod jsonl;
mod memory;

pub use jsonl::JsonlAuditLog;
pub use memory::MemoryAuditLog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::feature::FeatureArtifact;
use crate::protocol::{ScanState, Stage};
use crate::router::RouterVerdict;
use crate::schema::validate_decision;
use crate::types::{Decision, RetrievalIds};

const GENESIS_SEED: &[u8] = b"geoguard-audit-genesis";

/// Errors from audit storage.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt audit log at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("Audit record {0} not found")]
    NotFound(Uuid),

    #[error("Invalid correction: {0}")]
    InvalidCorrection(String),

    #[error("Audit log refuses appends after a write that could not be rolled back")]
    Poisoned,
}

/// One oracle exchange within a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt: u32,
    /// Raw oracle output, verbatim
    pub raw: String,
    /// Schema or grounding violations; empty when accepted
    #[serde(default)]
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Accepted { output: serde_json::Value },
    SchemaExhausted,
    Unavailable { error: String },
}

/// Everything one stage call produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    /// Arbiter sample index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<usize>,
    pub attempts: Vec<Attempt>,
    pub outcome: StageOutcome,
}

/// Oracle consumption for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub oracle_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl std::ops::AddAssign for UsageTotals {
    fn add_assign(&mut self, other: Self) {
        self.oracle_calls += other.oracle_calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// How a scan got to its outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTrail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<RouterVerdict>,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<crate::calibration::VoteTally>,
    #[serde(default)]
    pub transitions: Vec<ScanState>,
    #[serde(default)]
    pub usage: UsageTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Decided { decision: Decision },
    Failed { error: String },
}

impl AuditOutcome {
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Decided { decision } => Some(decision),
            Self::Failed { .. } => None,
        }
    }
}

/// Marks a record as a correction of an earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub supersedes: Uuid,
    pub supersedes_sequence: u64,
    pub reason: String,
    pub author: String,
}

/// A record as submitted, before the store seals it into the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub feature: FeatureArtifact,
    pub retrieval: RetrievalIds,
    pub trail: StageTrail,
    pub outcome: AuditOutcome,
    pub correction: Option<Correction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub record_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub feature_id: String,
    pub feature: FeatureArtifact,
    /// Content hash of the feature snapshot
    pub input_hash: String,
    pub retrieval: RetrievalIds,
    pub trail: StageTrail,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<Correction>,
    pub previous_hash: String,
    pub record_hash: String,
}

/// The hashed portion of a record, in serialization order.
#[derive(Serialize)]
struct RecordBody<'a> {
    sequence: u64,
    record_id: &'a Uuid,
    recorded_at: &'a DateTime<Utc>,
    feature_id: &'a str,
    feature: &'a FeatureArtifact,
    input_hash: &'a str,
    retrieval: &'a RetrievalIds,
    trail: &'a StageTrail,
    outcome: &'a AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    correction: &'a Option<Correction>,
}

impl AuditRecord {
    fn body(&self) -> RecordBody<'_> {
        RecordBody {
            sequence: self.sequence,
            record_id: &self.record_id,
            recorded_at: &self.recorded_at,
            feature_id: &self.feature_id,
            feature: &self.feature,
            input_hash: &self.input_hash,
            retrieval: &self.retrieval,
            trail: &self.trail,
            outcome: &self.outcome,
            correction: &self.correction,
        }
    }

    /// Recompute this record's hash from its contents.
    pub fn compute_hash(&self) -> Result<String, AuditError> {
        let body = serde_json::to_vec(&self.body())?;
        let mut hasher = Sha256::new();
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(b"\n");
        hasher.update(&body);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.outcome.decision()
    }
}

/// `previous_hash` of the first record in every chain.
pub fn genesis_hash() -> String {
    hex::encode(Sha256::digest(GENESIS_SEED))
}

/// Turn a draft into the next record of a chain.
pub(crate) fn seal(
    draft: AuditDraft,
    sequence: u64,
    previous_hash: String,
) -> Result<AuditRecord, AuditError> {
    let mut record = AuditRecord {
        sequence,
        record_id: Uuid::new_v4(),
        recorded_at: Utc::now(),
        feature_id: draft.feature.id.clone(),
        input_hash: draft.feature.content_hash(),
        feature: draft.feature,
        retrieval: draft.retrieval,
        trail: draft.trail,
        outcome: draft.outcome,
        correction: draft.correction,
        previous_hash,
        record_hash: String::new(),
    };
    record.record_hash = record.compute_hash()?;
    Ok(record)
}

/// Where a chain stopped verifying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainBreak {
    SequenceGap { expected: u64, found: u64 },
    HashChainMismatch { sequence: u64 },
    EntryHashMismatch { sequence: u64 },
}

impl std::fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SequenceGap { expected, found } => {
                write!(f, "sequence gap: expected {expected}, found {found}")
            }
            Self::HashChainMismatch { sequence } => {
                write!(f, "hash chain mismatch at sequence {sequence}")
            }
            Self::EntryHashMismatch { sequence } => {
                write!(f, "entry hash mismatch at sequence {sequence}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub records: usize,
    pub head: String,
    pub first_break: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Walk a chain from genesis and report the first broken link.
pub fn verify_chain(records: &[AuditRecord]) -> Result<ChainReport, AuditError> {
    let mut expected_prev = genesis_hash();
    for (i, record) in records.iter().enumerate() {
        let expected_sequence = i as u64 + 1;
        let first_break = if record.sequence != expected_sequence {
            Some(ChainBreak::SequenceGap {
                expected: expected_sequence,
                found: record.sequence,
            })
        } else if record.previous_hash != expected_prev {
            Some(ChainBreak::HashChainMismatch {
                sequence: record.sequence,
            })
        } else if record.compute_hash()? != record.record_hash {
            Some(ChainBreak::EntryHashMismatch {
                sequence: record.sequence,
            })
        } else {
            None
        };
        if first_break.is_some() {
            return Ok(ChainReport {
                records: records.len(),
                head: expected_prev,
                first_break,
            });
        }
        expected_prev = record.record_hash.clone();
    }
    Ok(ChainReport {
        records: records.len(),
        head: expected_prev,
        first_break: None,
    })
}

/// Append-only audit storage.
///
/// Implementations must serialize appends so sequence numbers and hash
/// links stay contiguous under concurrent scans.
pub trait AuditStore: Send + Sync {
    /// Seal and persist a draft as the next record.
    fn append(&self, draft: AuditDraft) -> Result<AuditRecord, AuditError>;

    /// Every record in append order.
    fn records(&self) -> Result<Vec<AuditRecord>, AuditError>;

    fn by_feature(&self, feature_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.feature_id == feature_id)
            .collect())
    }

    /// Records with `from <= recorded_at < to`.
    fn in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.recorded_at >= from && r.recorded_at < to)
            .collect())
    }

    fn get(&self, record_id: Uuid) -> Result<Option<AuditRecord>, AuditError> {
        Ok(self
            .records()?
            .into_iter()
            .find(|r| r.record_id == record_id))
    }

    fn verify(&self) -> Result<ChainReport, AuditError> {
        verify_chain(&self.records()?)
    }
}

/// Append a corrected decision that supersedes an earlier record.
///
/// The original record stays untouched. The correction carries the
/// original feature snapshot and retrieval ids.
pub fn record_correction(
    store: &dyn AuditStore,
    target: Uuid,
    corrected: Decision,
    reason: impl Into<String>,
    author: impl Into<String>,
) -> Result<AuditRecord, AuditError> {
    let original = store.get(target)?.ok_or(AuditError::NotFound(target))?;

    if corrected.feature_id != original.feature_id {
        return Err(AuditError::InvalidCorrection(format!(
            "decision is for '{}' but record {} is for '{}'",
            corrected.feature_id, target, original.feature_id
        )));
    }
    corrected
        .check_invariants()
        .map_err(|e| AuditError::InvalidCorrection(e.to_string()))?;
    let value = serde_json::to_value(&corrected)?;
    validate_decision(&value).map_err(|errors| AuditError::InvalidCorrection(errors.join("; ")))?;

    let reason = reason.into();
    if reason.trim().is_empty() {
        return Err(AuditError::InvalidCorrection(
            "a correction needs a reason".to_string(),
        ));
    }

    let record = store.append(AuditDraft {
        feature: original.feature,
        retrieval: original.retrieval,
        trail: StageTrail::default(),
        outcome: AuditOutcome::Decided {
            decision: corrected,
        },
        correction: Some(Correction {
            supersedes: original.record_id,
            supersedes_sequence: original.sequence,
            reason,
            author: author.into(),
        }),
    })?;

    tracing::info!(
        feature_id = %record.feature_id,
        supersedes = %target,
        sequence = record.sequence,
        "Recorded decision correction"
    );
    Ok(record)
}


#[cfg(test)]
mod tests {
    use super::testing::{decision, draft};
    use super::*;
    use crate::types::DecisionLabel;

    #[test]
    fn test_genesis_is_stable() {
        assert_eq!(genesis_hash(), genesis_hash());
        assert_eq!(genesis_hash().len(), 64);
    }

    #[test]
    fn test_chain_links() {
        let log = MemoryAuditLog::new();
        let first = log.append(draft("F-1", DecisionLabel::Yes)).unwrap();
        let second = log.append(draft("F-2", DecisionLabel::No)).unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(first.previous_hash, genesis_hash());
        assert_eq!(second.sequence, 2);
        assert_eq!(second.previous_hash, first.record_hash);
        assert_eq!(first.input_hash, first.feature.content_hash());

        let report = log.verify().unwrap();
        assert!(report.is_intact());
        assert_eq!(report.records, 2);
        assert_eq!(report.head, second.record_hash);
    }

    #[test]
    fn test_tampered_body_detected() {
        let log = MemoryAuditLog::new();
        log.append(draft("F-1", DecisionLabel::Yes)).unwrap();
        log.append(draft("F-2", DecisionLabel::No)).unwrap();

        let mut records = log.records().unwrap();
        records[0].feature.description = "edited".to_string();
        let report = verify_chain(&records).unwrap();
        assert_eq!(
            report.first_break,
            Some(ChainBreak::EntryHashMismatch { sequence: 1 })
        );
    }

    #[test]
    fn test_removed_record_detected() {
        let log = MemoryAuditLog::new();
        for i in 0..3 {
            log.append(draft(&format!("F-{}", i), DecisionLabel::No)).unwrap();
        }
        let mut records = log.records().unwrap();
        records.remove(1);
        let report = verify_chain(&records).unwrap();
        assert_eq!(
            report.first_break,
            Some(ChainBreak::SequenceGap {
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn test_queries() {
        let log = MemoryAuditLog::new();
        let before = Utc::now() - chrono::Duration::seconds(1);
        let a = log.append(draft("F-1", DecisionLabel::Yes)).unwrap();
        log.append(draft("F-2", DecisionLabel::No)).unwrap();
        log.append(draft("F-1", DecisionLabel::Review)).unwrap();
        let after = Utc::now() + chrono::Duration::seconds(1);

        assert_eq!(log.by_feature("F-1").unwrap().len(), 2);
        assert_eq!(log.in_range(before, after).unwrap().len(), 3);
        assert!(log.in_range(after, after).unwrap().is_empty());
        assert_eq!(log.get(a.record_id).unwrap(), Some(a));
        assert_eq!(log.get(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_correction_appends_and_references_original() {
        let log = MemoryAuditLog::new();
        let original = log.append(draft("F-1", DecisionLabel::No)).unwrap();

        let corrected = decision("F-1", DecisionLabel::Yes);
        let record = record_correction(
            &log,
            original.record_id,
            corrected,
            "Utah curfew applies",
            "reviewer@example.com",
        )
        .unwrap();

        let correction = record.correction.as_ref().unwrap();
        assert_eq!(correction.supersedes, original.record_id);
        assert_eq!(correction.supersedes_sequence, 1);
        assert_eq!(record.feature, original.feature);

        let records = log.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], original);
        assert!(log.verify().unwrap().is_intact());
    }

    #[test]
    fn test_correction_rejects_wrong_feature_and_missing_record() {
        let log = MemoryAuditLog::new();
        let original = log.append(draft("F-1", DecisionLabel::No)).unwrap();

        let err = record_correction(
            &log,
            original.record_id,
            decision("F-2", DecisionLabel::No),
            "r",
            "a",
        )
        .unwrap_err();
        assert!(matches!(err, AuditError::InvalidCorrection(_)));

        let err = record_correction(
            &log,
            Uuid::new_v4(),
            decision("F-1", DecisionLabel::No),
            "r",
            "a",
        )
        .unwrap_err();
        assert!(matches!(err, AuditError::NotFound(_)));
        assert_eq!(log.records().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_outcome_round_trips_through_hash() {
        let log = MemoryAuditLog::new();
        let mut d = draft("F-9", DecisionLabel::No);
        d.outcome = AuditOutcome::Failed {
            error: "detector exhausted schema retries".to_string(),
        };
        let record = log.append(d).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let back: AuditRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.compute_hash().unwrap(), record.record_hash);
        assert!(back.decision().is_none());
    }
}
