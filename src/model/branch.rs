use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{id_or_generate, require_field, Id};

/// A git-style line of history under a structure.
///
/// The head pointer is not a field: it lives in the store's head edge table
/// and is only reassigned by the advance operation. `initial_commit_id` and
/// `current_commit_id` are set when the branch is seeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Id,
    pub structure_id: Id,
    pub name: String,
    pub reason_for_branch: String,
    pub created_at: DateTime<Utc>,
    pub initial_commit_id: Option<Id>,
    pub current_commit_id: Option<Id>,
}

impl Branch {
    pub fn new(
        structure_id: Id,
        name: impl Into<String>,
        reason_for_branch: impl Into<String>,
    ) -> Result<Self> {
        Self::new_with_id(None, structure_id, name, reason_for_branch)
    }

    pub fn new_with_id(
        id: Option<Id>,
        structure_id: Id,
        name: impl Into<String>,
        reason_for_branch: impl Into<String>,
    ) -> Result<Self> {
        let name = require_field("name", name)?;
        let reason_for_branch = require_field("reason_for_branch", reason_for_branch)?;
        Ok(Self {
            id: id_or_generate(id)?,
            structure_id,
            name,
            reason_for_branch,
            created_at: Utc::now(),
            initial_commit_id: None,
            current_commit_id: None,
        })
    }

    pub fn is_seeded(&self) -> bool {
        self.initial_commit_id.is_some()
    }
}

/// Input model for creating a branch under an existing structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBranch {
    #[serde(default)]
    pub id: Option<Id>,
    pub name: String,
    pub reason_for_branch: String,
}

impl NewBranch {
    pub fn into_branch(self, structure_id: Id) -> Result<Branch> {
        Branch::new_with_id(self.id, structure_id, self.name, self.reason_for_branch)
    }
}
