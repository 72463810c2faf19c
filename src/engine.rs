/**
 * Biometric Engine
 * Wires the template store, matcher, oracle bridge and ledger behind one writer lock
 */

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::attestation::ProofVerifier;
use crate::config::EngineConfig;
use crate::coprocessor::ConfidentialCoprocessor;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::ledger::{AccessAttempt, AccessLedger};
use crate::matcher::{ConfidentialMatcher, MatchOutcome, MatchPolicy};
use crate::oracle::{
    ConfidencePolicy, DecryptionCompletion, DecryptionOracleBridge, DecryptionRequestMessage, Resolution,
};
use crate::policy::AccessPolicy;
use crate::store::{BiometricTemplate, EncryptedFactors, TemplateStatus, TemplateStore};
use crate::types::{BiometricFactors, Ciphertext, Identity, Timestamp};

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// Last computed score for an identity. Only handles; the values stay encrypted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationScore {
    pub factor_scores: [Ciphertext; 4],
    pub overall_score: Ciphertext,
    pub computed_at: Timestamp,
}

impl VerificationScore {
    fn handles(&self) -> Vec<Ciphertext> {
        let mut handles = self.factor_scores.to_vec();
        handles.push(self.overall_score);
        handles
    }
}

/// Returned by `verify`. The outcome arrives later through the oracle bridge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationHandle {
    pub identity: Identity,
    pub request_id: u64,
    pub attempt_index: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_identities: usize,
    pub total_attempts: usize,
    pub active_identities: usize,
}

struct EngineState {
    store: TemplateStore,
    ledger: AccessLedger,
    bridge: DecryptionOracleBridge,
    scores: HashMap<Identity, VerificationScore>,
    policy: AccessPolicy,
}

pub struct BiometricEngine {
    coprocessor: Arc<dyn ConfidentialCoprocessor>,
    matcher: ConfidentialMatcher,
    engine_identity: Identity,
    clock: Arc<dyn Clock>,
    events: EventBus,
    state: Mutex<EngineState>,
}

pub struct EngineBuilder {
    owner: Identity,
    engine_identity: Identity,
    match_policy: MatchPolicy,
    confidence: ConfidencePolicy,
    verifier: ProofVerifier,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    pub fn new(owner: Identity) -> Self {
        let defaults = EngineConfig::default();
        Self {
            owner,
            engine_identity: defaults.engine_identity,
            match_policy: defaults.match_policy,
            confidence: defaults.confidence,
            verifier: ProofVerifier::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            engine_identity: config.engine_identity.clone(),
            match_policy: config.match_policy,
            confidence: config.confidence,
            ..Self::new(config.owner.clone())
        }
    }

    pub fn match_policy(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }

    pub fn confidence(mut self, confidence: ConfidencePolicy) -> Self {
        self.confidence = confidence;
        self
    }

    /// Recognized coprocessor keys for decryption proofs.
    pub fn verifier(mut self, verifier: ProofVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self, coprocessor: Arc<dyn ConfidentialCoprocessor>) -> Result<BiometricEngine> {
        self.match_policy.validate()?;
        self.confidence.validate()?;
        Ok(BiometricEngine {
            coprocessor,
            matcher: ConfidentialMatcher::new(self.match_policy),
            engine_identity: self.engine_identity.clone(),
            clock: self.clock,
            events: EventBus::new(),
            state: Mutex::new(EngineState {
                store: TemplateStore::new(self.engine_identity),
                ledger: AccessLedger::new(),
                bridge: DecryptionOracleBridge::new(self.verifier, self.confidence),
                scores: HashMap::new(),
                policy: AccessPolicy::new(self.owner),
            }),
        })
    }
}

impl BiometricEngine {
    pub fn builder(owner: Identity) -> EngineBuilder {
        EngineBuilder::new(owner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Routes outbound decryption requests to a coprocessor relay.
    pub fn connect_oracle(&self, outbound: mpsc::UnboundedSender<DecryptionRequestMessage>) {
        self.state.lock().bridge.connect(outbound);
    }

    pub fn match_policy(&self) -> &MatchPolicy {
        self.matcher.policy()
    }

    pub fn register(&self, identity: &Identity, factors: &BiometricFactors) -> Result<BiometricTemplate> {
        let now = self.clock.now();
        let template = self
            .state
            .lock()
            .store
            .register(self.coprocessor.as_ref(), identity, factors, now)?;
        self.events.emit(EngineEvent::Registered {
            identity: identity.clone(),
            at: now,
        });
        Ok(template)
    }

    pub fn update(&self, identity: &Identity, factors: &BiometricFactors) -> Result<BiometricTemplate> {
        let now = self.clock.now();
        let template = self
            .state
            .lock()
            .store
            .update(self.coprocessor.as_ref(), identity, factors, now)?;
        self.events.emit(EngineEvent::Updated {
            identity: identity.clone(),
            at: now,
        });
        Ok(template)
    }

    pub fn deactivate(&self, identity: &Identity) -> Result<()> {
        if self.state.lock().store.deactivate(identity)? {
            self.events.emit(EngineEvent::Deactivated {
                identity: identity.clone(),
            });
        }
        Ok(())
    }

    /// Starts a confidential verification and returns before the outcome is known.
    ///
    /// All coprocessor work runs before the first state change, so a failure
    /// leaves the ledger and template untouched.
    pub fn verify(&self, identity: &Identity, samples: &BiometricFactors) -> Result<VerificationHandle> {
        let now = self.clock.now();
        let coprocessor = self.coprocessor.as_ref();
        let mut guard = self.state.lock();

        let stored = guard.store.active_template(identity)?.factors;
        let outcome = self.evaluate(identity, &stored, samples)?;

        let state = &mut *guard;
        let previous = state.scores.insert(
            identity.clone(),
            VerificationScore {
                factor_scores: outcome.factor_scores,
                overall_score: outcome.overall_score,
                computed_at: now,
            },
        );
        if let Some(previous) = previous {
            for ct in previous.handles() {
                coprocessor.release(&ct);
            }
        }
        let attempt_index = state.ledger.append(identity, AccessAttempt::pending(now));
        let access_count = state.store.record_access(identity)?;

        let request_id = state
            .bridge
            .request_decryption(vec![outcome.is_verified], identity, attempt_index, now);

        // Emitted under the lock, so the resolution event cannot overtake it.
        info!(
            "Verification requested: identity={}, request_id={}, attempt={}, access_count={}",
            identity, request_id, attempt_index, access_count
        );
        self.events.emit(EngineEvent::VerificationRequested {
            identity: identity.clone(),
            request_id,
            attempt_index,
        });
        drop(guard);

        Ok(VerificationHandle {
            identity: identity.clone(),
            request_id,
            attempt_index,
        })
    }

    /// Encrypts the samples, runs the matcher and grants the outcome. Releases
    /// everything it created when any step fails.
    fn evaluate(
        &self,
        identity: &Identity,
        stored: &EncryptedFactors,
        samples: &BiometricFactors,
    ) -> Result<MatchOutcome> {
        let coprocessor = self.coprocessor.as_ref();
        let submitted = EncryptedFactors::encrypt(coprocessor, samples)?;
        let outcome = self.matcher.compare(coprocessor, stored, &submitted);
        submitted.release(coprocessor);
        let outcome = outcome?;

        let granted = outcome
            .handles()
            .iter()
            .try_for_each(|ct| coprocessor.grant(ct, &self.engine_identity))
            .and_then(|()| coprocessor.grant(&outcome.overall_score, identity));
        if let Err(e) = granted {
            for ct in outcome.handles() {
                coprocessor.release(&ct);
            }
            return Err(e);
        }
        Ok(outcome)
    }

    /// Completion phase of the oracle protocol.
    pub fn on_decryption_result(&self, completion: &DecryptionCompletion) -> Result<Resolution> {
        let resolution = {
            let mut state = self.state.lock();
            let state = &mut *state;
            let resolution = state.bridge.on_decryption_result(&mut state.ledger, completion)?;
            if let Some(request) = state.bridge.request(resolution.request_id) {
                for ct in &request.ciphertexts {
                    self.coprocessor.release(ct);
                }
            }
            resolution
        };
        self.events.emit(EngineEvent::VerificationResolved {
            identity: resolution.identity.clone(),
            request_id: resolution.request_id,
            attempt_index: resolution.attempt_index,
            verified: resolution.verified,
        });
        Ok(resolution)
    }

    pub fn pending_requests(&self) -> Vec<DecryptionRequestMessage> {
        self.state.lock().bridge.pending_requests()
    }

    pub fn status(&self, identity: &Identity) -> TemplateStatus {
        self.state.lock().store.status(identity)
    }

    pub fn ledger_length(&self, identity: &Identity) -> usize {
        self.state.lock().ledger.length(identity)
    }

    pub fn ledger_entry(&self, identity: &Identity, index: usize) -> Result<AccessAttempt> {
        self.state.lock().ledger.get(identity, index).cloned()
    }

    pub fn ledger_entries(&self, identity: &Identity) -> Vec<AccessAttempt> {
        self.state.lock().ledger.entries(identity).to_vec()
    }

    /// Last score for `identity`, readable by the identity or administrators.
    pub fn current_score(&self, caller: &Identity, identity: &Identity) -> Result<Option<VerificationScore>> {
        let state = self.state.lock();
        state
            .policy
            .require_self_or_admin(caller, identity, "read verification scores")?;
        Ok(state.scores.get(identity).copied())
    }

    pub fn registered_identities(&self, caller: &Identity) -> Result<Vec<Identity>> {
        let state = self.state.lock();
        state.policy.require_admin(caller, "list identities")?;
        Ok(state.store.identities().to_vec())
    }

    pub fn statistics(&self, caller: &Identity) -> Result<Statistics> {
        let state = self.state.lock();
        state.policy.require_admin(caller, "read statistics")?;
        Ok(Statistics {
            total_identities: state.store.identities().len(),
            total_attempts: state.ledger.total_attempts(),
            active_identities: state.store.active_count(),
        })
    }

    pub fn authorize(&self, caller: &Identity, principal: &Identity) -> Result<()> {
        if self.state.lock().policy.authorize(caller, principal.clone())? {
            self.events.emit(EngineEvent::AuthorizationChanged {
                principal: principal.clone(),
                authorized: true,
            });
        }
        Ok(())
    }

    pub fn deauthorize(&self, caller: &Identity, principal: &Identity) -> Result<()> {
        if self.state.lock().policy.deauthorize(caller, principal)? {
            self.events.emit(EngineEvent::AuthorizationChanged {
                principal: principal.clone(),
                authorized: false,
            });
        }
        Ok(())
    }

    pub fn transfer_ownership(&self, caller: &Identity, new_owner: &Identity) -> Result<()> {
        let previous = self.state.lock().policy.transfer_ownership(caller, new_owner.clone())?;
        self.events.emit(EngineEvent::OwnershipTransferred {
            previous,
            owner: new_owner.clone(),
        });
        Ok(())
    }

    /// Switches off every template in one pass over the registry.
    pub fn emergency_deactivate_all(&self, caller: &Identity) -> Result<usize> {
        let deactivated = {
            let mut state = self.state.lock();
            state.policy.require_owner(caller, "deactivate all templates")?;
            state.store.deactivate_all()
        };
        self.events.emit(EngineEvent::EmergencyDeactivation { deactivated });
        Ok(deactivated)
    }
}
