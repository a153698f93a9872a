//! Hash-chained negotiation audit trace
//!
//! Append-only; each entry commits to its predecessor's hash so any edit to
//! a recorded entry breaks [`verify_chain`].

use crate::error::NegotiationFault;
use crate::summary::TerminationReason;
use crate::types::{CommitId, ConsensusType, Decision, ProposalId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    SessionStarted { nodes: usize },
    ProposalSubmitted { target: Option<String> },
    ProposalRejected { reason: String },
    OracleFailed { fault: NegotiationFault },
    EvaluationRecorded { decision: Decision, confidence: f64 },
    ConflictDetected { accepts: usize, rejects: usize },
    Arbitrated { decision: Decision },
    Committed { commit: CommitId, consensus: ConsensusType },
    Deferred { fault: NegotiationFault },
    CommitApplied { commit: CommitId },
    CommitApplyFailed { commit: CommitId, reason: String },
    Terminated { reason: TerminationReason },
}

/// One link of the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub seq: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub round: u32,
    pub node: Option<String>,
    pub proposal: Option<ProposalId>,
    pub event: TraceEvent,
    #[serde(with = "hex_hash")]
    pub prev_hash: [u8; 32],
    #[serde(with = "hex_hash")]
    pub hash: [u8; 32],
}

impl TraceEntry {
    /// Entry hash as hex
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Chain integrity failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("trace integrity violation at entry {seq}")]
pub struct IntegrityViolation {
    pub seq: u64,
}

/// Append-only trace owned by one session
#[derive(Debug, Default)]
pub struct NegotiationTrace {
    inner: Mutex<Vec<TraceEntry>>,
}

impl NegotiationTrace {
    /// Append an event, returning its sequence number
    pub fn record(
        &self,
        round: u32,
        node: Option<&str>,
        proposal: Option<ProposalId>,
        event: TraceEvent,
    ) -> u64 {
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map_or([0u8; 32], |e| e.hash);
        let mut entry = TraceEntry {
            seq: guard.len() as u64,
            timestamp: chrono::Utc::now().timestamp_millis(),
            round,
            node: node.map(str::to_string),
            proposal,
            event,
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry);
        let seq = entry.seq;
        guard.push(entry);
        seq
    }

    /// Entries concerning one proposal
    #[must_use]
    pub fn for_proposal(&self, proposal: ProposalId) -> Vec<TraceEntry> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.proposal == Some(proposal))
            .cloned()
            .collect()
    }

    /// Copy of every entry
    #[must_use]
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.inner.lock().clone()
    }

    /// Hex hash of the latest entry (all zeros when empty)
    #[must_use]
    pub fn head(&self) -> String {
        hex::encode(self.inner.lock().last().map_or([0u8; 32], |e| e.hash))
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing was recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Verify the whole chain
    ///
    /// # Errors
    /// `IntegrityViolation` naming the first broken entry
    pub fn verify_integrity(&self) -> Result<(), IntegrityViolation> {
        verify_chain(&self.inner.lock())
    }
}

/// Verify a complete chain, starting from the zero hash
///
/// # Errors
/// `IntegrityViolation` naming the first broken entry
pub fn verify_chain(entries: &[TraceEntry]) -> Result<(), IntegrityViolation> {
    let mut prev = [0u8; 32];
    for e in entries {
        if e.prev_hash != prev || e.hash != compute_hash(e) {
            return Err(IntegrityViolation { seq: e.seq });
        }
        prev = e.hash;
    }
    Ok(())
}

fn compute_hash(entry: &TraceEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.timestamp.to_le_bytes());
    hasher.update(entry.round.to_le_bytes());
    hasher.update(entry.node.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(entry.proposal.map_or(u64::MAX, |p| p.0).to_le_bytes());
    hasher.update(serde_json::to_vec(&entry.event).unwrap_or_default());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}

mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(hash: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(hash))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&text, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NegotiationTrace {
        let trace = NegotiationTrace::default();
        trace.record(0, None, None, TraceEvent::SessionStarted { nodes: 2 });
        trace.record(
            0,
            Some("a"),
            Some(ProposalId(0)),
            TraceEvent::ProposalSubmitted { target: None },
        );
        trace.record(
            0,
            Some("b"),
            Some(ProposalId(0)),
            TraceEvent::EvaluationRecorded {
                decision: Decision::Accept,
                confidence: 0.5,
            },
        );
        trace
    }

    #[test]
    fn chain_verifies() {
        let trace = sample();
        assert_eq!(trace.len(), 3);
        assert!(trace.verify_integrity().is_ok());
        assert_eq!(trace.head(), trace.entries()[2].hash_hex());
    }

    #[test]
    fn tampering_is_detected() {
        let mut entries = sample().entries();
        entries[1].node = Some("mallory".to_string());
        assert_eq!(verify_chain(&entries), Err(IntegrityViolation { seq: 1 }));
    }

    #[test]
    fn proposal_filter() {
        let trace = sample();
        assert_eq!(trace.for_proposal(ProposalId(0)).len(), 2);
        assert!(trace.for_proposal(ProposalId(9)).is_empty());
    }

    #[test]
    fn entries_survive_json() {
        let entries = sample().entries();
        let json = serde_json::to_string(&entries).unwrap();
        let back: Vec<TraceEntry> = serde_json::from_str(&json).unwrap();
        assert!(verify_chain(&back).is_ok());
    }
}
