/**
 * Template Store
 * One encrypted biometric template per identity, plus lifecycle metadata
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::coprocessor::ConfidentialCoprocessor;
use crate::error::{EngineError, Result};
use crate::types::{BiometricFactors, Ciphertext, Identity, Timestamp};

/// The four factors of a template, in encrypted form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFactors {
    pub fingerprint: Ciphertext,
    pub face_template: Ciphertext,
    pub voice_print: Ciphertext,
    pub iris: Ciphertext,
}

impl EncryptedFactors {
    /// Encrypts each factor in its own domain.
    pub fn encrypt(coprocessor: &dyn ConfidentialCoprocessor, factors: &BiometricFactors) -> Result<Self> {
        let [f1, f2, f3, f4] = factors.domains();
        Ok(Self {
            fingerprint: coprocessor.encrypt(f1.0, f1.1)?,
            face_template: coprocessor.encrypt(f2.0, f2.1)?,
            voice_print: coprocessor.encrypt(f3.0, f3.1)?,
            iris: coprocessor.encrypt(f4.0, f4.1)?,
        })
    }

    pub fn as_array(&self) -> [Ciphertext; 4] {
        [self.fingerprint, self.face_template, self.voice_print, self.iris]
    }

    pub fn release(&self, coprocessor: &dyn ConfidentialCoprocessor) {
        for ct in self.as_array() {
            coprocessor.release(&ct);
        }
    }

    fn grant_all(&self, coprocessor: &dyn ConfidentialCoprocessor, principal: &Identity) -> Result<()> {
        for ct in self.as_array() {
            coprocessor.grant(&ct, principal)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiometricTemplate {
    pub factors: EncryptedFactors,
    pub active: bool,
    pub registered_at: Timestamp,
    pub access_count: u64,
}

/// Read-only view returned by `status`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateStatus {
    pub active: bool,
    pub registered_at: Timestamp,
    pub access_count: u64,
}

pub struct TemplateStore {
    engine_identity: Identity,
    templates: HashMap<Identity, BiometricTemplate>,
    registry: Vec<Identity>,
}

impl TemplateStore {
    pub fn new(engine_identity: Identity) -> Self {
        Self {
            engine_identity,
            templates: HashMap::new(),
            registry: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        coprocessor: &dyn ConfidentialCoprocessor,
        identity: &Identity,
        factors: &BiometricFactors,
        now: Timestamp,
    ) -> Result<BiometricTemplate> {
        if self.is_active(identity) {
            return Err(EngineError::AlreadyRegistered(identity.clone()));
        }

        let encrypted = self.encrypt_and_grant(coprocessor, identity, factors)?;
        let template = BiometricTemplate {
            factors: encrypted,
            active: true,
            registered_at: now,
            access_count: 0,
        };

        match self.templates.insert(identity.clone(), template.clone()) {
            Some(previous) => previous.factors.release(coprocessor),
            None => self.registry.push(identity.clone()),
        }

        info!("Registered biometric template: identity={}", identity);
        Ok(template)
    }

    pub fn update(
        &mut self,
        coprocessor: &dyn ConfidentialCoprocessor,
        identity: &Identity,
        factors: &BiometricFactors,
        now: Timestamp,
    ) -> Result<BiometricTemplate> {
        if !self.is_active(identity) {
            return Err(EngineError::NotRegistered(identity.clone()));
        }

        // Fresh ciphertexts carry no grants; re-grant before swapping them in.
        let encrypted = self.encrypt_and_grant(coprocessor, identity, factors)?;
        let template = self
            .templates
            .get_mut(identity)
            .ok_or_else(|| EngineError::NotRegistered(identity.clone()))?;
        let previous = std::mem::replace(&mut template.factors, encrypted);
        template.registered_at = now;
        previous.release(coprocessor);

        info!("Updated biometric template: identity={}", identity);
        Ok(template.clone())
    }

    /// Returns whether the call changed anything; repeated calls are no-ops.
    pub fn deactivate(&mut self, identity: &Identity) -> Result<bool> {
        let template = self
            .templates
            .get_mut(identity)
            .ok_or_else(|| EngineError::NotRegistered(identity.clone()))?;
        if !template.active {
            return Ok(false);
        }
        template.active = false;
        info!("Deactivated biometric template: identity={}", identity);
        Ok(true)
    }

    /// Switches off every active template and returns how many changed.
    pub fn deactivate_all(&mut self) -> usize {
        let mut changed = 0;
        for identity in &self.registry {
            if let Some(template) = self.templates.get_mut(identity) {
                if template.active {
                    template.active = false;
                    changed += 1;
                }
            }
        }
        changed
    }

    pub fn status(&self, identity: &Identity) -> TemplateStatus {
        self.templates
            .get(identity)
            .map(|t| TemplateStatus {
                active: t.active,
                registered_at: t.registered_at,
                access_count: t.access_count,
            })
            .unwrap_or_default()
    }

    /// The active template for `identity`, or `NotRegistered`.
    pub fn active_template(&self, identity: &Identity) -> Result<&BiometricTemplate> {
        self.templates
            .get(identity)
            .filter(|t| t.active)
            .ok_or_else(|| EngineError::NotRegistered(identity.clone()))
    }

    pub fn record_access(&mut self, identity: &Identity) -> Result<u64> {
        let template = self
            .templates
            .get_mut(identity)
            .ok_or_else(|| EngineError::NotRegistered(identity.clone()))?;
        template.access_count += 1;
        Ok(template.access_count)
    }

    pub fn is_active(&self, identity: &Identity) -> bool {
        self.templates.get(identity).map_or(false, |t| t.active)
    }

    /// Every identity that has ever registered, in first-registration order.
    pub fn identities(&self) -> &[Identity] {
        &self.registry
    }

    pub fn active_count(&self) -> usize {
        self.templates.values().filter(|t| t.active).count()
    }

    fn encrypt_and_grant(
        &self,
        coprocessor: &dyn ConfidentialCoprocessor,
        identity: &Identity,
        factors: &BiometricFactors,
    ) -> Result<EncryptedFactors> {
        let encrypted = EncryptedFactors::encrypt(coprocessor, factors)?;
        let granted = encrypted
            .grant_all(coprocessor, &self.engine_identity)
            .and_then(|()| encrypted.grant_all(coprocessor, identity));
        if let Err(e) = granted {
            encrypted.release(coprocessor);
            return Err(e);
        }
        Ok(encrypted)
    }
}
