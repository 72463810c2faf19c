/*!
 * Biometric Vault
 * Confidential biometric verification over an encrypted-computation coprocessor
 *
 * Templates are stored as ciphertext handles, matching runs homomorphically,
 * and only the final pass/fail bit is ever decrypted, asynchronously, through
 * an attested oracle callback.
 */

pub mod api;
pub mod attestation;
pub mod config;
pub mod coprocessor;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod matcher;
pub mod oracle;
pub mod policy;
pub mod relay;
pub mod store;
pub mod types;

pub use attestation::{AttestationService, DecryptionProof, ProofVerifier};
pub use config::EngineConfig;
pub use coprocessor::{ConfidentialCoprocessor, DecryptionService, LocalCoprocessor};
pub use engine::{BiometricEngine, Clock, EngineBuilder, Statistics, SystemClock, VerificationHandle, VerificationScore};
pub use error::{EngineError, Result};
pub use events::EngineEvent;
pub use ledger::{AccessAttempt, AttemptStatus};
pub use matcher::MatchPolicy;
pub use oracle::{ConfidencePolicy, DecryptionCompletion, DecryptionRequestMessage, Resolution};
pub use relay::CoprocessorRelay;
pub use store::TemplateStatus;
pub use types::{BiometricFactors, CipherKind, Ciphertext, Identity};
