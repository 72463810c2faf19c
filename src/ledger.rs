/**
 * Access Ledger
 * Append-only history of verification attempts per identity
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::types::{Identity, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Resolved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessAttempt {
    pub verified: bool,
    pub timestamp: Timestamp,
    pub confidence_score: u8,
    pub status: AttemptStatus,
}

impl AccessAttempt {
    pub fn pending(timestamp: Timestamp) -> Self {
        Self {
            verified: false,
            timestamp,
            confidence_score: 0,
            status: AttemptStatus::Pending,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == AttemptStatus::Resolved
    }
}

#[derive(Default)]
pub struct AccessLedger {
    attempts: HashMap<Identity, Vec<AccessAttempt>>,
}

impl AccessLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes `attempt` and returns its permanent index.
    pub fn append(&mut self, identity: &Identity, attempt: AccessAttempt) -> usize {
        let entries = self.attempts.entry(identity.clone()).or_default();
        entries.push(attempt);
        entries.len() - 1
    }

    pub fn length(&self, identity: &Identity) -> usize {
        self.attempts.get(identity).map_or(0, Vec::len)
    }

    pub fn get(&self, identity: &Identity, index: usize) -> Result<&AccessAttempt> {
        self.attempts
            .get(identity)
            .and_then(|entries| entries.get(index))
            .ok_or_else(|| self.out_of_range(identity, index))
    }

    pub fn entries(&self, identity: &Identity) -> &[AccessAttempt] {
        self.attempts.get(identity).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sets the outcome of a pending attempt. Only the oracle bridge calls this.
    pub(crate) fn resolve(
        &mut self,
        identity: &Identity,
        index: usize,
        verified: bool,
        confidence_score: u8,
    ) -> Result<&AccessAttempt> {
        let length = self.length(identity);
        let attempt = self
            .attempts
            .get_mut(identity)
            .and_then(|entries| entries.get_mut(index))
            .ok_or_else(|| EngineError::IndexOutOfRange {
                identity: identity.clone(),
                index,
                length,
            })?;

        if attempt.is_resolved() {
            return Err(EngineError::AlreadyResolved {
                identity: identity.clone(),
                index,
            });
        }

        attempt.verified = verified;
        attempt.confidence_score = confidence_score.min(100);
        attempt.status = AttemptStatus::Resolved;
        debug!("Resolved attempt {} of {}: verified={}", index, identity, verified);
        Ok(&*attempt)
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.values().map(Vec::len).sum()
    }

    fn out_of_range(&self, identity: &Identity, index: usize) -> EngineError {
        EngineError::IndexOutOfRange {
            identity: identity.clone(),
            index,
            length: self.length(identity),
        }
    }
}
