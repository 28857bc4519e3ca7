use crate::error::Result;
use crate::logic::{HistoryService, StructureSetup};
use crate::model::{Id, NewBranch, NewCommit, NewStructure};
use crate::store::traits::Store;

pub const SEED_STRUCTURE_ID: &str = "PROJECT1";
pub const SEED_BRANCH1_ID: &str = "PROJECT1_BRANCH1";
pub const SEED_BRANCH2_ID: &str = "PROJECT1_BRANCH2";
pub const SEED_COMMIT1_ID: &str = "PROJECT1_BRANCH1_COMMIT1";
pub const SEED_COMMIT2_ID: &str = "PROJECT1_BRANCH1_COMMIT2";

/// Load the demonstration project: one structure, two branches, and a
/// two-commit history on the first branch. Skipped if already present.
pub async fn load_seed_data<S: Store>(store: &S) -> Result<()> {
    let structure_id: Id = SEED_STRUCTURE_ID.to_string();
    if store.get_structure(&structure_id).await?.is_some() {
        log::info!("Seed structure {} already present, skipping", structure_id);
        return Ok(());
    }

    let setup = HistoryService::setup_structure(
        store,
        StructureSetup {
            structure: NewStructure {
                id: Some(structure_id.clone()),
                name: "Project".to_string(),
                description: "A MD construction project".to_string(),
            },
            branch: NewBranch {
                id: Some(SEED_BRANCH1_ID.to_string()),
                name: "Branch 1".to_string(),
                reason_for_branch: "Initial Branch".to_string(),
            },
            initial_commit: NewCommit {
                id: Some(SEED_COMMIT1_ID.to_string()),
                name: "Initial Commit".to_string(),
                commit_message: "initial commit".to_string(),
            },
        },
    )
    .await?;

    // Second branch starts unseeded
    HistoryService::create_branch(
        store,
        &setup.structure.id,
        NewBranch {
            id: Some(SEED_BRANCH2_ID.to_string()),
            name: "Branch 2".to_string(),
            reason_for_branch: "Second Branch".to_string(),
        },
    )
    .await?;

    let second = HistoryService::create_commit(
        store,
        NewCommit {
            id: Some(SEED_COMMIT2_ID.to_string()),
            name: "Second Commit".to_string(),
            commit_message: "second commit".to_string(),
        },
    )
    .await?;
    HistoryService::advance_head(store, &setup.branch.id, &second.id).await?;

    log::info!("Loaded seed structure {}", structure_id);
    Ok(())
}
