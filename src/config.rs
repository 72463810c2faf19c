/**
 * Engine configuration
 * Read from the environment, with defaults for local runs
 */

use std::net::SocketAddr;

use crate::error::{EngineError, Result};
use crate::matcher::MatchPolicy;
use crate::oracle::ConfidencePolicy;
use crate::types::Identity;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub owner: Identity,
    /// Principal the engine itself is granted capabilities under.
    pub engine_identity: Identity,
    pub match_policy: MatchPolicy,
    pub confidence: ConfidencePolicy,
    /// Seed for the in-process coprocessor's attestation key.
    pub coprocessor_seed: Option<[u8; 32]>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            owner: Identity::from("owner"),
            engine_identity: Identity::from("biometric-vault"),
            match_policy: MatchPolicy::default(),
            confidence: ConfidencePolicy::default(),
            coprocessor_seed: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let bind_addr = match lookup("VAULT_BIND_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|e| EngineError::Config(format!("VAULT_BIND_ADDR: {}", e)))?,
            None => defaults.bind_addr,
        };

        let owner = lookup("VAULT_OWNER").map(Identity::new).unwrap_or(defaults.owner);
        let engine_identity = lookup("VAULT_ENGINE_IDENTITY")
            .map(Identity::new)
            .unwrap_or(defaults.engine_identity);

        let weights = match lookup("VAULT_FACTOR_WEIGHTS") {
            Some(raw) => parse_weights(&raw)?,
            None => defaults.match_policy.weights,
        };
        let threshold = parse_u8(&lookup, "VAULT_MATCH_THRESHOLD", defaults.match_policy.threshold)?;
        let match_policy = MatchPolicy::new(weights, threshold)?;

        let confidence = ConfidencePolicy::new(
            parse_score(&lookup, "VAULT_SUCCESS_CONFIDENCE", defaults.confidence.success)?,
            parse_score(&lookup, "VAULT_FAILURE_CONFIDENCE", defaults.confidence.failure)?,
        )?;

        let coprocessor_seed = match lookup("VAULT_COPROCESSOR_SEED") {
            Some(raw) => Some(parse_seed(&raw)?),
            None => None,
        };

        Ok(Self {
            bind_addr,
            owner,
            engine_identity,
            match_policy,
            confidence,
            coprocessor_seed,
        })
    }
}

fn parse_u8(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u8) -> Result<u8> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| EngineError::Config(format!("{}: {}", key, e))),
        None => Ok(default),
    }
}

fn parse_score(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u8) -> Result<u8> {
    let value = parse_u8(lookup, key, default)?;
    if value > 100 {
        return Err(EngineError::Config(format!("{} must be within 0..=100", key)));
    }
    Ok(value)
}

fn parse_weights(raw: &str) -> Result<[u8; 4]> {
    let parsed = raw
        .split(',')
        .map(|w| w.trim().parse::<u8>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| EngineError::Config(format!("VAULT_FACTOR_WEIGHTS: {}", e)))?;
    parsed
        .try_into()
        .map_err(|_| EngineError::Config("VAULT_FACTOR_WEIGHTS needs exactly four values".to_string()))
}

fn parse_seed(raw: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(raw.trim())
        .map_err(|e| EngineError::Config(format!("VAULT_COPROCESSOR_SEED: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| EngineError::Config("VAULT_COPROCESSOR_SEED must be 32 bytes".to_string()))
}
