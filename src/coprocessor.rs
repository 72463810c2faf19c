/**
 * Confidential Computation Coprocessor
 * Port to the ciphertext capability layer plus an in-process reference implementation
 *
 * The engine only ever holds handles. Plaintext leaves the coprocessor solely
 * through `DecryptionService`, which is driven by the oracle relay.
 */

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::types::{CipherKind, Ciphertext, Identity};

/// Homomorphic operations and capability grants on opaque ciphertexts.
pub trait ConfidentialCoprocessor: Send + Sync {
    fn encrypt(&self, value: u64, kind: CipherKind) -> Result<Ciphertext>;

    /// Encrypted `a == b`, as a `Bool` ciphertext.
    fn equals(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext>;

    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext>;

    fn mul(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext>;

    /// Encrypted `a >= b`, as a `Bool` ciphertext.
    fn greater_or_equal(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext>;

    /// Encrypted `if cond { a } else { b }`.
    fn select(&self, cond: &Ciphertext, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext>;

    fn grant(&self, ciphertext: &Ciphertext, principal: &Identity) -> Result<()>;

    fn is_granted(&self, ciphertext: &Ciphertext, principal: &Identity) -> bool;

    /// Frees a handle and its grants. Unknown handles are ignored.
    fn release(&self, ciphertext: &Ciphertext);
}

/// Decryption side of the coprocessor. Never called by the engine itself.
pub trait DecryptionService: Send + Sync {
    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<u64>;
}

#[derive(Default)]
struct Vault {
    next_handle: u64,
    values: HashMap<u64, (CipherKind, u64)>,
    grants: HashMap<u64, HashSet<Identity>>,
}

impl Vault {
    fn insert(&mut self, kind: CipherKind, value: u64) -> Ciphertext {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.values.insert(handle, (kind, kind.truncate(value)));
        Ciphertext { handle, kind }
    }

    fn load(&self, ciphertext: &Ciphertext) -> Result<u64> {
        match self.values.get(&ciphertext.handle) {
            Some((kind, value)) if *kind == ciphertext.kind => Ok(*value),
            Some(_) => Err(EngineError::Coprocessor(format!(
                "handle {} used with the wrong type",
                ciphertext.handle
            ))),
            None => Err(EngineError::Coprocessor(format!(
                "unknown handle {}",
                ciphertext.handle
            ))),
        }
    }
}

/// In-memory coprocessor. Values are kept in plaintext internally, which makes
/// outcomes deterministic and inspectable; it stands in for a real FHE backend.
#[derive(Default)]
pub struct LocalCoprocessor {
    vault: Mutex<Vault>,
}

impl LocalCoprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles currently held in the vault.
    pub fn live_handles(&self) -> usize {
        self.vault.lock().values.len()
    }

    fn binary(
        &self,
        a: &Ciphertext,
        b: &Ciphertext,
        out: CipherKind,
        op: impl Fn(u64, u64) -> u64,
    ) -> Result<Ciphertext> {
        let mut vault = self.vault.lock();
        let lhs = vault.load(a)?;
        let rhs = vault.load(b)?;
        Ok(vault.insert(out, op(lhs, rhs)))
    }

    fn arithmetic_kind(a: &Ciphertext, b: &Ciphertext) -> Result<CipherKind> {
        if a.kind != b.kind || a.kind == CipherKind::Bool {
            return Err(EngineError::Coprocessor(format!(
                "arithmetic on mismatched types {:?} and {:?}",
                a.kind, b.kind
            )));
        }
        Ok(a.kind)
    }
}

impl ConfidentialCoprocessor for LocalCoprocessor {
    fn encrypt(&self, value: u64, kind: CipherKind) -> Result<Ciphertext> {
        let ciphertext = self.vault.lock().insert(kind, value);
        debug!("encrypted value into handle {}", ciphertext.handle);
        Ok(ciphertext)
    }

    fn equals(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        self.binary(a, b, CipherKind::Bool, |x, y| (x == y) as u64)
    }

    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        let kind = Self::arithmetic_kind(a, b)?;
        self.binary(a, b, kind, u64::wrapping_add)
    }

    fn mul(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        let kind = Self::arithmetic_kind(a, b)?;
        self.binary(a, b, kind, u64::wrapping_mul)
    }

    fn greater_or_equal(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        Self::arithmetic_kind(a, b)?;
        self.binary(a, b, CipherKind::Bool, |x, y| (x >= y) as u64)
    }

    fn select(&self, cond: &Ciphertext, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        if cond.kind != CipherKind::Bool || a.kind != b.kind {
            return Err(EngineError::Coprocessor("select on mismatched types".to_string()));
        }
        let mut vault = self.vault.lock();
        let flag = vault.load(cond)?;
        let chosen = if flag != 0 { vault.load(a)? } else { vault.load(b)? };
        Ok(vault.insert(a.kind, chosen))
    }

    fn grant(&self, ciphertext: &Ciphertext, principal: &Identity) -> Result<()> {
        let mut vault = self.vault.lock();
        vault.load(ciphertext)?;
        vault
            .grants
            .entry(ciphertext.handle)
            .or_default()
            .insert(principal.clone());
        Ok(())
    }

    fn is_granted(&self, ciphertext: &Ciphertext, principal: &Identity) -> bool {
        self.vault
            .lock()
            .grants
            .get(&ciphertext.handle)
            .map_or(false, |grants| grants.contains(principal))
    }

    fn release(&self, ciphertext: &Ciphertext) {
        let mut vault = self.vault.lock();
        vault.values.remove(&ciphertext.handle);
        vault.grants.remove(&ciphertext.handle);
    }
}

impl DecryptionService for LocalCoprocessor {
    fn decrypt(&self, ciphertext: &Ciphertext) -> Result<u64> {
        self.vault.lock().load(ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_wraps_within_domain() {
        let cop = LocalCoprocessor::new();
        let a = cop.encrypt(200, CipherKind::U8).unwrap();
        let b = cop.encrypt(100, CipherKind::U8).unwrap();
        let sum = cop.add(&a, &b).unwrap();
        assert_eq!(cop.decrypt(&sum).unwrap(), 44);

        let big = cop.encrypt(u64::MAX, CipherKind::U32).unwrap();
        assert_eq!(cop.decrypt(&big).unwrap(), 0xffff_ffff);
    }

    #[test]
    fn comparisons_and_select() {
        let cop = LocalCoprocessor::new();
        let a = cop.encrypt(75, CipherKind::U8).unwrap();
        let b = cop.encrypt(75, CipherKind::U8).unwrap();
        let c = cop.encrypt(50, CipherKind::U8).unwrap();

        let same = cop.equals(&a, &b).unwrap();
        assert_eq!(same.kind, CipherKind::Bool);
        assert_eq!(cop.decrypt(&same).unwrap(), 1);
        assert_eq!(cop.decrypt(&cop.greater_or_equal(&c, &a).unwrap()).unwrap(), 0);

        let picked = cop.select(&same, &c, &a).unwrap();
        assert_eq!(cop.decrypt(&picked).unwrap(), 50);
    }

    #[test]
    fn mixed_types_are_rejected() {
        let cop = LocalCoprocessor::new();
        let a = cop.encrypt(1, CipherKind::U8).unwrap();
        let b = cop.encrypt(1, CipherKind::U32).unwrap();
        assert!(matches!(cop.add(&a, &b), Err(EngineError::Coprocessor(_))));

        let forged = Ciphertext {
            handle: a.handle,
            kind: CipherKind::U64,
        };
        assert!(cop.decrypt(&forged).is_err());
    }

    #[test]
    fn grants_are_per_handle() {
        let cop = LocalCoprocessor::new();
        let alice = Identity::from("alice");
        let ct = cop.encrypt(7, CipherKind::U64).unwrap();
        let other = cop.encrypt(7, CipherKind::U64).unwrap();

        cop.grant(&ct, &alice).unwrap();
        assert!(cop.is_granted(&ct, &alice));
        assert!(!cop.is_granted(&other, &alice));
        assert!(!cop.is_granted(&ct, &Identity::from("bob")));
    }

    #[test]
    fn release_drops_value_and_grants() {
        let cop = LocalCoprocessor::new();
        let alice = Identity::from("alice");
        let ct = cop.encrypt(7, CipherKind::U64).unwrap();
        cop.grant(&ct, &alice).unwrap();
        assert_eq!(cop.live_handles(), 1);

        cop.release(&ct);
        cop.release(&ct);
        assert_eq!(cop.live_handles(), 0);
        assert!(!cop.is_granted(&ct, &alice));
        assert!(cop.decrypt(&ct).is_err());
    }
}
