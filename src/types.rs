/**
 * Shared domain types
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque principal reference (wallet address, key fingerprint, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Plaintext domain of an encrypted value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherKind {
    Bool,
    U8,
    U32,
    U64,
}

impl CipherKind {
    /// Reduces a plaintext into this domain.
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            CipherKind::Bool => (value != 0) as u64,
            CipherKind::U8 => value & 0xff,
            CipherKind::U32 => value & 0xffff_ffff,
            CipherKind::U64 => value,
        }
    }
}

/// Handle to a value held by the coprocessor. Carries no plaintext.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ciphertext {
    pub handle: u64,
    pub kind: CipherKind,
}

/// Plaintext biometric factors as submitted by a client, before encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiometricFactors {
    pub fingerprint: u64,
    pub face_template: u64,
    pub voice_print: u32,
    pub iris: u32,
}

impl BiometricFactors {
    pub fn new(fingerprint: u64, face_template: u64, voice_print: u32, iris: u32) -> Self {
        Self {
            fingerprint,
            face_template,
            voice_print,
            iris,
        }
    }

    /// Factors in storage order, each paired with its encrypted domain.
    pub(crate) fn domains(&self) -> [(u64, CipherKind); 4] {
        [
            (self.fingerprint, CipherKind::U64),
            (self.face_template, CipherKind::U64),
            (self.voice_print as u64, CipherKind::U32),
            (self.iris as u64, CipherKind::U32),
        ]
    }
}

/// Seconds since the unix epoch.
pub type Timestamp = u64;
