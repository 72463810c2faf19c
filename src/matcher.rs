/**
 * Confidential Matcher
 * Compares submitted samples against a stored template entirely on ciphertexts
 *
 * Each factor yields an encrypted equality bit. The bits are weighted and
 * summed into an encrypted score, which is compared against the threshold to
 * give the encrypted verdict. No step branches on a plaintext.
 */

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coprocessor::ConfidentialCoprocessor;
use crate::error::{EngineError, Result};
use crate::store::EncryptedFactors;
use crate::types::{CipherKind, Ciphertext};

/// Display value of a matching factor.
pub const FACTOR_MATCH_DISPLAY: u64 = 100;

/// Weights and threshold applied to the four factors.
///
/// The defaults give every factor 25 points and require 75, i.e. three of four
/// factors. Deployments can tune both through configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MatchPolicy {
    pub weights: [u8; 4],
    pub threshold: u8,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            weights: [25, 25, 25, 25],
            threshold: 75,
        }
    }
}

impl MatchPolicy {
    pub fn new(weights: [u8; 4], threshold: u8) -> Result<Self> {
        let policy = Self { weights, threshold };
        policy.validate()?;
        Ok(policy)
    }

    pub fn max_score(&self) -> u16 {
        self.weights.iter().map(|w| *w as u16).sum()
    }

    /// The score must fit the 8-bit encrypted domain and the threshold must be reachable.
    pub fn validate(&self) -> Result<()> {
        let max = self.max_score();
        if max > u8::MAX as u16 {
            return Err(EngineError::Config(format!(
                "factor weights sum to {}, above {}",
                max,
                u8::MAX
            )));
        }
        if self.threshold as u16 > max {
            return Err(EngineError::Config(format!(
                "threshold {} exceeds the maximum score {}",
                self.threshold, max
            )));
        }
        Ok(())
    }
}

/// Encrypted result of one comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutcome {
    /// Per-factor display values, 0 or 100.
    pub factor_scores: [Ciphertext; 4],
    pub overall_score: Ciphertext,
    pub is_verified: Ciphertext,
}

impl MatchOutcome {
    pub fn handles(&self) -> Vec<Ciphertext> {
        let mut handles = self.factor_scores.to_vec();
        handles.push(self.overall_score);
        handles.push(self.is_verified);
        handles
    }
}

pub struct ConfidentialMatcher {
    policy: MatchPolicy,
}

impl ConfidentialMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Every intermediate ciphertext is released before returning, on success
    /// and on failure alike. Only the outcome's handles survive.
    pub fn compare(
        &self,
        coprocessor: &dyn ConfidentialCoprocessor,
        stored: &EncryptedFactors,
        submitted: &EncryptedFactors,
    ) -> Result<MatchOutcome> {
        let mut created = Vec::new();
        let result = self.evaluate(coprocessor, stored, submitted, &mut created);
        let kept = result.as_ref().map(MatchOutcome::handles).unwrap_or_default();
        for ct in created.iter().filter(|ct| !kept.contains(*ct)) {
            coprocessor.release(ct);
        }
        result
    }

    fn evaluate(
        &self,
        coprocessor: &dyn ConfidentialCoprocessor,
        stored: &EncryptedFactors,
        submitted: &EncryptedFactors,
        created: &mut Vec<Ciphertext>,
    ) -> Result<MatchOutcome> {
        let mut track = |ct: Ciphertext| {
            created.push(ct);
            ct
        };

        let one = track(coprocessor.encrypt(1, CipherKind::U8)?);
        let zero = track(coprocessor.encrypt(0, CipherKind::U8)?);
        let display_hit = track(coprocessor.encrypt(FACTOR_MATCH_DISPLAY, CipherKind::U8)?);

        let mut overall = zero;
        let mut factor_scores = [zero; 4];
        let pairs = stored.as_array().into_iter().zip(submitted.as_array());

        for (i, (reference, sample)) in pairs.enumerate() {
            let equal = track(coprocessor.equals(&reference, &sample)?);
            let indicator = track(coprocessor.select(&equal, &one, &zero)?);
            let weight = track(coprocessor.encrypt(self.policy.weights[i] as u64, CipherKind::U8)?);
            let weighted = track(coprocessor.mul(&weight, &indicator)?);
            overall = track(coprocessor.add(&overall, &weighted)?);
            factor_scores[i] = track(coprocessor.select(&equal, &display_hit, &zero)?);
        }

        let threshold = track(coprocessor.encrypt(self.policy.threshold as u64, CipherKind::U8)?);
        let is_verified = track(coprocessor.greater_or_equal(&overall, &threshold)?);
        debug!(
            "Computed encrypted verdict: score handle={}, verdict handle={}",
            overall.handle, is_verified.handle
        );

        Ok(MatchOutcome {
            factor_scores,
            overall_score: overall,
            is_verified,
        })
    }
}
