use serde::{Deserialize, Serialize};

/// Grant level carried on a push credential. `Push` always implies `Pull`;
/// `Pull` never implies `Push` (spec §3, §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Push,
    Pull,
}

/// Claim set carried by a signed push credential (spec §3 "Push Credential
/// Claims"). `repositories` is an exact-match allowlist: no wildcards, no
/// prefix matching — callers must list every repository they want the
/// bearer to touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub build_id: String,
    pub repositories: Vec<String>,
    pub scope: Scope,
    pub issued_at: u64,
    pub expires_at: u64,
    pub subject: String,
    pub issuer: String,
}

impl Claims {
    /// True iff `repo` appears verbatim in `repositories`. No wildcard
    /// semantics (spec §4.C).
    pub fn is_repo_allowed(&self, repo: &str) -> bool {
        self.repositories.iter().any(|r| r == repo)
    }

    /// Push access implies pull access; pull-only claims grant only pull.
    pub fn push_allowed(&self) -> bool {
        self.scope == Scope::Push
    }

    pub fn pull_allowed(&self) -> bool {
        matches!(self.scope, Scope::Push | Scope::Pull)
    }
}
