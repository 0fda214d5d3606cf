//! Authorization seam for mutating entry points.
//!
//! The engine defines no roles. It asks one question of an external
//! component, "may this actor execute merges", and asks it before any state
//! transition begins.

use crate::error::{MergeError, Result};
use std::collections::BTreeSet;

/// Caller-supplied identity and claim, passed explicitly on every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub actor: String,
    pub claim: Option<String>,
}

impl AuthToken {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            claim: None,
        }
    }

    #[must_use]
    pub fn with_claim(mut self, claim: impl Into<String>) -> Self {
        self.claim = Some(claim.into());
        self
    }
}

/// External RBAC check.
pub trait Authorizer: Send + Sync {
    /// Succeed if the token's actor may execute merges.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Unauthorized`] when the actor is not permitted.
    fn authorize_merge(&self, token: &AuthToken) -> Result<()>;
}

/// Allow-list authorizer built from `[authorization] merge_actors`.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    actors: BTreeSet<String>,
}

impl StaticAuthorizer {
    pub fn new<I, S>(actors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actors: actors.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize_merge(&self, token: &AuthToken) -> Result<()> {
        let actor = token.actor.trim();
        if !actor.is_empty() && self.actors.contains(actor) {
            return Ok(());
        }
        tracing::warn!(actor = %token.actor, "merge authorization denied");
        Err(MergeError::Unauthorized {
            actor: token.actor.clone(),
        })
    }
}
