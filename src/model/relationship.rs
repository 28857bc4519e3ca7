use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{id_or_generate, require_field, Id};

/// Annotated HAS_CHILD edge from a commit to a specific commit of another
/// structure. Child edges take no part in head advancement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRelationship {
    pub id: Id,
    pub relationship_name: String,
    pub parent_commit_id: Id,
    pub child_commit_id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_class_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Request body for linking a child commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChildRelationship {
    #[serde(default)]
    pub id: Option<Id>,
    pub child_commit_id: Id,
    pub relationship_name: String,
    #[serde(default)]
    pub parent_class_name: Option<String>,
    #[serde(default)]
    pub child_class_name: Option<String>,
}

impl NewChildRelationship {
    pub fn into_relationship(self, parent_commit_id: Id) -> Result<ChildRelationship> {
        Ok(ChildRelationship {
            id: id_or_generate(self.id)?,
            relationship_name: require_field("relationship_name", self.relationship_name)?,
            parent_commit_id,
            child_commit_id: self.child_commit_id,
            parent_class_name: self.parent_class_name,
            child_class_name: self.child_class_name,
            created_at: Utc::now(),
        })
    }
}
