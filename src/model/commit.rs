use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{id_or_generate, require_field, Id};

/// An immutable history node.
///
/// Commits carry no linkage of their own: previous/next/child edges live in
/// the store's edge tables and reference commits by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: Id,
    pub name: String,
    pub commit_message: String,
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the identity fields, fixed at creation
    pub digest: String,
}

impl Commit {
    pub fn new(name: impl Into<String>, commit_message: impl Into<String>) -> Result<Self> {
        Self::new_with_id(None, name, commit_message)
    }

    pub fn new_with_id(
        id: Option<Id>,
        name: impl Into<String>,
        commit_message: impl Into<String>,
    ) -> Result<Self> {
        let name = require_field("name", name)?;
        let commit_message = require_field("commit_message", commit_message)?;
        let id = id_or_generate(id)?;
        // Postgres keeps microseconds; truncate so a stored commit still verifies
        let created_at = Utc::now().trunc_subsecs(6);
        let digest = Self::calculate_digest(&id, &name, &commit_message, &created_at);

        Ok(Self {
            id,
            name,
            commit_message,
            created_at,
            digest,
        })
    }

    /// Calculate SHA-256 digest over the identity fields
    fn calculate_digest(
        id: &str,
        name: &str,
        commit_message: &str,
        created_at: &DateTime<Utc>,
    ) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(format!("id:{}\n", id));
        hasher.update(format!("name:{}\n", name));
        hasher.update(format!("message:{}\n", commit_message));
        hasher.update(format!(
            "created:{}\n",
            created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
        ));

        hex::encode(hasher.finalize())
    }

    /// True if the identity fields still match the digest taken at creation.
    pub fn verify_digest(&self) -> bool {
        Self::calculate_digest(&self.id, &self.name, &self.commit_message, &self.created_at)
            == self.digest
    }
}

/// Commit creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCommit {
    #[serde(default)]
    pub id: Option<Id>,
    pub name: String,
    pub commit_message: String,
}

impl NewCommit {
    pub fn into_commit(self) -> Result<Commit> {
        Commit::new_with_id(self.id, self.name, self.commit_message)
    }
}
