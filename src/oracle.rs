/**
 * Decryption Oracle Bridge
 * Split-phase protocol between the engine and the decryption coprocessor
 *
 * Request phase: register a pending record and forward the ciphertext handles.
 * Completion phase: authenticate the plaintext, then resolve the ledger entry
 * captured at request time. The completion caller's identity plays no part.
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::attestation::{DecryptionProof, ProofVerifier};
use crate::error::{EngineError, Result};
use crate::ledger::AccessLedger;
use crate::types::{Ciphertext, Identity, Timestamp};

/// Outbound message to the coprocessor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionRequestMessage {
    pub request_id: u64,
    pub ciphertexts: Vec<Ciphertext>,
}

/// Inbound message from the coprocessor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionCompletion {
    pub request_id: u64,
    pub plaintext_result: bool,
    pub proof: DecryptionProof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Resolved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDecryptionRequest {
    pub request_id: u64,
    pub ciphertexts: Vec<Ciphertext>,
    pub identity: Identity,
    pub attempt_index: usize,
    pub requested_at: Timestamp,
    pub state: RequestState,
}

/// Fixed confidence values written into resolved attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ConfidencePolicy {
    pub success: u8,
    pub failure: u8,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            success: 95,
            failure: 10,
        }
    }
}

impl ConfidencePolicy {
    pub fn new(success: u8, failure: u8) -> Result<Self> {
        let policy = Self { success, failure };
        policy.validate()?;
        Ok(policy)
    }

    /// Both values are percentages.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("success", self.success), ("failure", self.failure)] {
            if value > 100 {
                return Err(EngineError::Config(format!(
                    "{} confidence {} is above 100",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn for_result(&self, verified: bool) -> u8 {
        if verified {
            self.success
        } else {
            self.failure
        }
    }
}

/// What a successful completion changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub request_id: u64,
    pub identity: Identity,
    pub attempt_index: usize,
    pub verified: bool,
    pub confidence_score: u8,
}

pub struct DecryptionOracleBridge {
    next_request_id: u64,
    requests: HashMap<u64, PendingDecryptionRequest>,
    verifier: ProofVerifier,
    confidence: ConfidencePolicy,
    outbound: Option<mpsc::UnboundedSender<DecryptionRequestMessage>>,
}

impl DecryptionOracleBridge {
    pub fn new(verifier: ProofVerifier, confidence: ConfidencePolicy) -> Self {
        Self {
            next_request_id: 0,
            requests: HashMap::new(),
            verifier,
            confidence,
            outbound: None,
        }
    }

    /// Attaches the transport used to forward requests to the coprocessor.
    pub fn connect(&mut self, outbound: mpsc::UnboundedSender<DecryptionRequestMessage>) {
        self.outbound = Some(outbound);
    }

    /// Registers a pending request and forwards it. Never blocks.
    pub fn request_decryption(
        &mut self,
        ciphertexts: Vec<Ciphertext>,
        identity: &Identity,
        attempt_index: usize,
        now: Timestamp,
    ) -> u64 {
        self.next_request_id += 1;
        let request_id = self.next_request_id;

        let message = DecryptionRequestMessage {
            request_id,
            ciphertexts: ciphertexts.clone(),
        };
        self.requests.insert(
            request_id,
            PendingDecryptionRequest {
                request_id,
                ciphertexts,
                identity: identity.clone(),
                attempt_index,
                requested_at: now,
                state: RequestState::Pending,
            },
        );

        match &self.outbound {
            Some(tx) if tx.send(message).is_ok() => {
                info!("Decryption requested: request_id={}, identity={}", request_id, identity);
            }
            _ => warn!(
                "No coprocessor listening; request {} stays pending until re-polled",
                request_id
            ),
        }
        request_id
    }

    /// Applies an authenticated decryption result.
    ///
    /// Unknown or resolved ids fail with `InvalidRequest`. A bad proof fails
    /// with `InvalidProof` and leaves the request pending for a retry.
    pub fn on_decryption_result(
        &mut self,
        ledger: &mut AccessLedger,
        completion: &DecryptionCompletion,
    ) -> Result<Resolution> {
        let request_id = completion.request_id;
        let request = self
            .requests
            .get(&request_id)
            .filter(|r| r.state == RequestState::Pending)
            .ok_or(EngineError::InvalidRequest(request_id))?;

        if !self.verifier.verify(
            request_id,
            &request.ciphertexts,
            completion.plaintext_result,
            &completion.proof,
        ) {
            warn!("Rejected decryption proof for request {}", request_id);
            return Err(EngineError::InvalidProof(request_id));
        }

        let verified = completion.plaintext_result;
        let confidence_score = self.confidence.for_result(verified);
        let identity = request.identity.clone();
        let attempt_index = request.attempt_index;
        ledger.resolve(&identity, attempt_index, verified, confidence_score)?;

        if let Some(request) = self.requests.get_mut(&request_id) {
            request.state = RequestState::Resolved;
        }
        info!(
            "Decryption resolved: request_id={}, identity={}, verified={}",
            request_id, identity, verified
        );

        Ok(Resolution {
            request_id,
            identity,
            attempt_index,
            verified,
            confidence_score,
        })
    }

    pub fn request(&self, request_id: u64) -> Option<&PendingDecryptionRequest> {
        self.requests.get(&request_id)
    }

    /// Requests still awaiting a result, oldest first.
    pub fn pending_requests(&self) -> Vec<DecryptionRequestMessage> {
        let mut pending: Vec<_> = self
            .requests
            .values()
            .filter(|r| r.state == RequestState::Pending)
            .map(|r| DecryptionRequestMessage {
                request_id: r.request_id,
                ciphertexts: r.ciphertexts.clone(),
            })
            .collect();
        pending.sort_by_key(|m| m.request_id);
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::AttestationService;
    use crate::ledger::AccessAttempt;
    use crate::types::CipherKind;

    struct Fixture {
        signer: AttestationService,
        bridge: DecryptionOracleBridge,
        ledger: AccessLedger,
        alice: Identity,
    }

    fn fixture() -> Fixture {
        let signer = AttestationService::from_seed(&[3u8; 32]).unwrap();
        let verifier = ProofVerifier::new().with_key(&signer.public_key());
        Fixture {
            signer,
            bridge: DecryptionOracleBridge::new(verifier, ConfidencePolicy::default()),
            ledger: AccessLedger::new(),
            alice: Identity::from("alice"),
        }
    }

    fn verdict() -> Vec<Ciphertext> {
        vec![Ciphertext {
            handle: 11,
            kind: CipherKind::Bool,
        }]
    }

    impl Fixture {
        fn open_request(&mut self) -> u64 {
            let index = self.ledger.append(&self.alice, AccessAttempt::pending(5));
            self.bridge.request_decryption(verdict(), &self.alice, index, 5)
        }

        fn completion(&self, request_id: u64, result: bool) -> DecryptionCompletion {
            DecryptionCompletion {
                request_id,
                plaintext_result: result,
                proof: self.signer.attest(request_id, &verdict(), result),
            }
        }
    }

    #[test]
    fn request_is_forwarded_with_fresh_id() {
        let mut f = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.bridge.connect(tx);

        let first = f.open_request();
        let second = f.open_request();
        assert_eq!((first, second), (1, 2));
        assert_eq!(rx.try_recv().unwrap().request_id, 1);
        assert_eq!(rx.try_recv().unwrap().ciphertexts, verdict());
        assert_eq!(f.bridge.pending_requests().len(), 2);
    }

    #[test]
    fn valid_completion_resolves_attempt() {
        let mut f = fixture();
        let id = f.open_request();
        let completion = f.completion(id, true);

        let resolution = f.bridge.on_decryption_result(&mut f.ledger, &completion).unwrap();
        assert_eq!(resolution.confidence_score, 95);
        assert_eq!(resolution.attempt_index, 0);

        let attempt = f.ledger.get(&f.alice, 0).unwrap();
        assert!(attempt.verified && attempt.is_resolved());
        assert_eq!(attempt.confidence_score, 95);
        assert_eq!(f.bridge.request(id).unwrap().state, RequestState::Resolved);
        assert!(f.bridge.pending_requests().is_empty());
    }

    #[test]
    fn replay_is_rejected_without_reapplying() {
        let mut f = fixture();
        let id = f.open_request();
        let first = f.completion(id, true);
        f.bridge.on_decryption_result(&mut f.ledger, &first).unwrap();

        let replay = f.completion(id, false);
        assert_eq!(
            f.bridge.on_decryption_result(&mut f.ledger, &replay).unwrap_err(),
            EngineError::InvalidRequest(id)
        );
        let attempt = f.ledger.get(&f.alice, 0).unwrap();
        assert!(attempt.verified);
        assert_eq!(attempt.confidence_score, 95);
    }

    #[test]
    fn bad_proof_leaves_request_open() {
        let mut f = fixture();
        let id = f.open_request();

        let mut tampered = f.completion(id, false);
        tampered.plaintext_result = true;
        assert_eq!(
            f.bridge.on_decryption_result(&mut f.ledger, &tampered).unwrap_err(),
            EngineError::InvalidProof(id)
        );
        assert!(!f.ledger.get(&f.alice, 0).unwrap().is_resolved());

        let genuine = f.completion(id, false);
        let resolution = f.bridge.on_decryption_result(&mut f.ledger, &genuine).unwrap();
        assert!(!resolution.verified);
        assert_eq!(resolution.confidence_score, 10);
    }

    #[test]
    fn confidence_must_be_a_percentage() {
        assert!(ConfidencePolicy::new(100, 0).is_ok());
        assert!(matches!(ConfidencePolicy::new(101, 10), Err(EngineError::Config(_))));
        assert!(matches!(ConfidencePolicy::new(95, 200), Err(EngineError::Config(_))));
    }

    #[test]
    fn unknown_request_is_invalid() {
        let mut f = fixture();
        let completion = f.completion(42, true);
        assert_eq!(
            f.bridge.on_decryption_result(&mut f.ledger, &completion).unwrap_err(),
            EngineError::InvalidRequest(42)
        );
    }

    #[test]
    fn disconnected_transport_keeps_request_pending() {
        let mut f = fixture();
        let (tx, rx) = mpsc::unbounded_channel();
        f.bridge.connect(tx);
        drop(rx);

        let id = f.open_request();
        assert_eq!(f.bridge.pending_requests()[0].request_id, id);
    }
}
