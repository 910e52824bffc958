use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Opaque, hierarchical command identity. Root tokens are random; a child
/// token is derived from its parent by a one-way hash over the parent token
/// and the child's ordinal, so lineage can be verified by recomputation
/// without any central registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandToken(String);

impl CommandToken {
    pub fn new_root() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Deterministic token for the `index`-th child of this command.
    pub fn child(&self, index: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hasher.update(index.to_be_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// True when `candidate` is the `index`-th child token of `parent`.
    pub fn verify_child(parent: &CommandToken, index: u64, candidate: &CommandToken) -> bool {
        parent.child(index) == *candidate
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
