/**
 * Access Policy
 * Owner / authorized / self checks in one place
 */

use serde::Serialize;
use std::collections::BTreeSet;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::types::Identity;

/// Role a caller holds relative to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Authorized,
    Member,
}

pub struct AccessPolicy {
    owner: Identity,
    authorized: BTreeSet<Identity>,
}

impl AccessPolicy {
    pub fn new(owner: Identity) -> Self {
        Self {
            owner,
            authorized: BTreeSet::new(),
        }
    }

    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    pub fn role(&self, caller: &Identity) -> Role {
        if *caller == self.owner {
            Role::Owner
        } else if self.authorized.contains(caller) {
            Role::Authorized
        } else {
            Role::Member
        }
    }

    pub fn require_owner(&self, caller: &Identity, action: &str) -> Result<()> {
        match self.role(caller) {
            Role::Owner => Ok(()),
            _ => Err(unauthorized(caller, action)),
        }
    }

    /// Owner or an authorized administrator.
    pub fn require_admin(&self, caller: &Identity, action: &str) -> Result<()> {
        match self.role(caller) {
            Role::Owner | Role::Authorized => Ok(()),
            Role::Member => Err(unauthorized(caller, action)),
        }
    }

    /// The subject itself, or an administrator.
    pub fn require_self_or_admin(&self, caller: &Identity, subject: &Identity, action: &str) -> Result<()> {
        if caller == subject {
            return Ok(());
        }
        self.require_admin(caller, action)
    }

    /// Returns false when `principal` was already authorized.
    pub fn authorize(&mut self, caller: &Identity, principal: Identity) -> Result<bool> {
        self.require_owner(caller, "authorize principals")?;
        info!("Authorizing principal {}", principal);
        Ok(self.authorized.insert(principal))
    }

    pub fn deauthorize(&mut self, caller: &Identity, principal: &Identity) -> Result<bool> {
        self.require_owner(caller, "deauthorize principals")?;
        info!("Deauthorizing principal {}", principal);
        Ok(self.authorized.remove(principal))
    }

    /// Hands ownership to `new_owner` and returns the previous owner.
    pub fn transfer_ownership(&mut self, caller: &Identity, new_owner: Identity) -> Result<Identity> {
        self.require_owner(caller, "transfer ownership")?;
        self.authorized.remove(&new_owner);
        Ok(std::mem::replace(&mut self.owner, new_owner))
    }

    pub fn authorized(&self) -> impl Iterator<Item = &Identity> {
        self.authorized.iter()
    }
}

fn unauthorized(caller: &Identity, action: &str) -> EngineError {
    EngineError::Unauthorized {
        caller: caller.clone(),
        action: action.to_string(),
    }
}
