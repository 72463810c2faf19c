/**
 * Attestation Service
 * Signs and verifies decryption results produced by the coprocessor
 *
 * A proof binds the request id, the exact ciphertext handles registered for
 * that request and the revealed plaintext. Anything else in a completion
 * message is untrusted transport.
 */

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{EngineError, Result};
use crate::types::{CipherKind, Ciphertext, Timestamp};

const PROOF_DOMAIN: &[u8] = b"biometric-vault/decryption-result/v1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionProof {
    /// Hex-encoded Ed25519 public key of the signing coprocessor.
    pub key_id: String,
    pub issued_at: Timestamp,
    /// Base64-encoded signature over the proof digest.
    pub signature: String,
}

/// SHA-256 over the domain-separated decryption statement.
pub fn proof_digest(
    request_id: u64,
    ciphertexts: &[Ciphertext],
    plaintext: bool,
    issued_at: Timestamp,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(PROOF_DOMAIN);
    hasher.update(request_id.to_be_bytes());
    hasher.update((ciphertexts.len() as u64).to_be_bytes());
    for ct in ciphertexts {
        hasher.update(ct.handle.to_be_bytes());
        hasher.update([kind_tag(ct.kind)]);
    }
    hasher.update([plaintext as u8]);
    hasher.update(issued_at.to_be_bytes());
    hasher.finalize().into()
}

fn kind_tag(kind: CipherKind) -> u8 {
    match kind {
        CipherKind::Bool => 0,
        CipherKind::U8 => 1,
        CipherKind::U32 => 2,
        CipherKind::U64 => 3,
    }
}

/// Coprocessor-side signer.
pub struct AttestationService {
    key_pair: Ed25519KeyPair,
}

impl AttestationService {
    /// Fresh signing key from the system RNG.
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| EngineError::Config("failed to generate coprocessor key".to_string()))?;
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
            .map_err(|e| EngineError::Config(format!("rejected coprocessor key: {}", e)))?;
        Ok(Self { key_pair })
    }

    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let key_pair = Ed25519KeyPair::from_seed_unchecked(seed)
            .map_err(|e| EngineError::Config(format!("invalid coprocessor seed: {}", e)))?;
        Ok(Self { key_pair })
    }

    pub fn key_id(&self) -> String {
        hex::encode(self.key_pair.public_key().as_ref())
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.key_pair.public_key().as_ref().to_vec()
    }

    pub fn attest(&self, request_id: u64, ciphertexts: &[Ciphertext], plaintext: bool) -> DecryptionProof {
        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let digest = proof_digest(request_id, ciphertexts, plaintext, issued_at);
        let signature = self.key_pair.sign(&digest);

        DecryptionProof {
            key_id: self.key_id(),
            issued_at,
            signature: STANDARD.encode(signature.as_ref()),
        }
    }
}

/// Engine-side verifier holding the coprocessor's recognized key set.
#[derive(Clone, Default)]
pub struct ProofVerifier {
    keys: HashMap<String, Vec<u8>>,
}

impl ProofVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, public_key: &[u8]) -> Self {
        self.recognize(public_key);
        self
    }

    pub fn recognize(&mut self, public_key: &[u8]) {
        self.keys.insert(hex::encode(public_key), public_key.to_vec());
    }

    pub fn revoke(&mut self, key_id: &str) -> bool {
        self.keys.remove(key_id).is_some()
    }

    /// True when `proof` is a recognized key's signature over this statement.
    pub fn verify(
        &self,
        request_id: u64,
        ciphertexts: &[Ciphertext],
        plaintext: bool,
        proof: &DecryptionProof,
    ) -> bool {
        let Some(public_key) = self.keys.get(&proof.key_id) else {
            return false;
        };
        let Ok(signature) = STANDARD.decode(&proof.signature) else {
            return false;
        };
        let digest = proof_digest(request_id, ciphertexts, plaintext, proof.issued_at);
        UnparsedPublicKey::new(&ED25519, public_key)
            .verify(&digest, &signature)
            .is_ok()
    }
}
