use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{id_or_generate, require_field, Id};

/// A versionable domain object. Owns one or more branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub id: Id,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Structure {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Result<Self> {
        Self::new_with_id(None, name, description)
    }

    pub fn new_with_id(
        id: Option<Id>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self> {
        let name = require_field("name", name)?;
        let description = require_field("description", description)?;
        Ok(Self {
            id: id_or_generate(id)?,
            name,
            description,
            created_at: Utc::now(),
        })
    }
}

/// Input model for creating a new structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStructure {
    #[serde(default)]
    pub id: Option<Id>,
    pub name: String,
    pub description: String,
}

impl NewStructure {
    /// Convert to a full Structure with server-generated fields
    pub fn into_structure(self) -> Result<Structure> {
        Structure::new_with_id(self.id, self.name, self.description)
    }
}
