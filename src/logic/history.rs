use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Result};
use crate::model::{
    Branch, ChildRelationship, Commit, Id, NewBranch, NewChildRelationship, NewCommit,
    NewStructure, Structure,
};
use crate::store::traits::Store;

/// Request to create a structure with its first branch and initial commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureSetup {
    pub structure: NewStructure,
    pub branch: NewBranch,
    pub initial_commit: NewCommit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureSetupResult {
    pub structure: Structure,
    pub branch: Branch,
    pub initial_commit: Commit,
}

/// Creation, linkage and navigation of the commit history graph.
///
/// This is the only place that moves a branch head or creates next/previous
/// edges; the stores expose those writes as single transactional primitives.
pub struct HistoryService;

impl HistoryService {
    pub async fn create_structure<S: Store>(store: &S, new: NewStructure) -> Result<Structure> {
        let structure = new.into_structure()?;
        store.insert_structure(structure.clone()).await?;
        log::info!("Created structure '{}' ({})", structure.name, structure.id);
        Ok(structure)
    }

    /// Create a structure that owns a seeded branch from the start
    pub async fn setup_structure<S: Store>(
        store: &S,
        setup: StructureSetup,
    ) -> Result<StructureSetupResult> {
        let structure = setup.structure.into_structure()?;
        let mut branch = setup.branch.into_branch(structure.id.clone())?;
        let initial_commit = setup.initial_commit.into_commit()?;

        store
            .insert_structure_setup(structure.clone(), branch.clone(), initial_commit.clone())
            .await?;

        branch.initial_commit_id = Some(initial_commit.id.clone());
        branch.current_commit_id = Some(initial_commit.id.clone());
        log::info!(
            "Set up structure '{}' with branch '{}' at commit {}",
            structure.id,
            branch.id,
            initial_commit.id
        );

        Ok(StructureSetupResult {
            structure,
            branch,
            initial_commit,
        })
    }

    /// Create a branch under a structure. The branch has no commits until seeded.
    pub async fn create_branch<S: Store>(
        store: &S,
        structure_id: &Id,
        new: NewBranch,
    ) -> Result<Branch> {
        let branch = new.into_branch(structure_id.clone())?;
        store.insert_branch(branch.clone()).await?;
        log::info!(
            "Created branch '{}' ({}) under structure {}",
            branch.name,
            branch.id,
            structure_id
        );
        Ok(branch)
    }

    /// Persist an isolated commit node
    pub async fn create_commit<S: Store>(store: &S, new: NewCommit) -> Result<Commit> {
        let commit = new.into_commit()?;
        store.insert_commit(commit.clone()).await?;
        log::debug!("Created commit '{}' ({})", commit.name, commit.id);
        Ok(commit)
    }

    /// Make `commit_id` the initial, current and head commit of a fresh branch
    pub async fn seed_branch<S: Store>(store: &S, branch_id: &Id, commit_id: &Id) -> Result<Branch> {
        store.seed_branch(branch_id, commit_id).await?;
        log::info!("Seeded branch {} with commit {}", branch_id, commit_id);
        Self::get_branch(store, branch_id).await
    }

    /// Append `commit_id` to the branch and move its head there.
    ///
    /// The head is read here and swapped by the store only if it is still the
    /// same commit, so a concurrent advance surfaces as a retryable
    /// `TransactionConflict` rather than a silent fork.
    pub async fn advance_head<S: Store>(store: &S, branch_id: &Id, commit_id: &Id) -> Result<Commit> {
        let branch = Self::get_branch(store, branch_id).await?;
        let new_commit = store
            .get_commit(commit_id)
            .await?
            .ok_or_else(|| HistoryError::UnsavedCommit(commit_id.clone()))?;
        let old_head = store
            .get_head(&branch.id)
            .await?
            .ok_or_else(|| HistoryError::MissingHead(branch.id.clone()))?;

        if let Err(e) = store.swap_head(&branch.id, &old_head, &new_commit.id).await {
            if e.is_retryable() {
                log::warn!("Advance of branch {} rejected: {}", branch.id, e);
            }
            return Err(e);
        }

        log::info!(
            "Advanced branch {} head {} -> {}",
            branch.id,
            old_head,
            new_commit.id
        );
        Ok(new_commit)
    }

    /// `advance_head` with optimistic retry on conflicts and timeouts.
    /// Concurrent callers end up chained one after another.
    pub async fn advance_head_with_retry<S: Store>(
        store: &S,
        branch_id: &Id,
        commit_id: &Id,
        max_attempts: u32,
    ) -> Result<Commit> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::advance_head(store, branch_id, commit_id).await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    log::debug!(
                        "Retrying advance of branch {} (attempt {}/{})",
                        branch_id,
                        attempt + 1,
                        max_attempts
                    );
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                result => return result,
            }
        }
    }

    /// Move the checked-out commit to any commit already on the branch
    pub async fn checkout<S: Store>(store: &S, branch_id: &Id, commit_id: &Id) -> Result<Branch> {
        store.set_current_commit(branch_id, commit_id).await?;
        log::info!("Checked out commit {} on branch {}", commit_id, branch_id);
        Self::get_branch(store, branch_id).await
    }

    /// Record a HAS_CHILD edge from `parent_commit_id` to a commit of another structure
    pub async fn link_child<S: Store>(
        store: &S,
        parent_commit_id: &Id,
        new: NewChildRelationship,
    ) -> Result<ChildRelationship> {
        let relationship = new.into_relationship(parent_commit_id.clone())?;
        store.insert_child_relationship(relationship.clone()).await?;
        log::debug!(
            "Linked child commit {} to {} as '{}'",
            relationship.child_commit_id,
            parent_commit_id,
            relationship.relationship_name
        );
        Ok(relationship)
    }

    pub async fn get_structure<S: Store>(store: &S, id: &Id) -> Result<Structure> {
        store
            .get_structure(id)
            .await?
            .ok_or_else(|| HistoryError::not_found("Structure", id.clone()))
    }

    pub async fn get_branch<S: Store>(store: &S, id: &Id) -> Result<Branch> {
        store
            .get_branch(id)
            .await?
            .ok_or_else(|| HistoryError::not_found("Branch", id.clone()))
    }

    pub async fn get_commit<S: Store>(store: &S, id: &Id) -> Result<Commit> {
        store
            .get_commit(id)
            .await?
            .ok_or_else(|| HistoryError::not_found("Commit", id.clone()))
    }

    pub async fn branches<S: Store>(store: &S, structure_id: &Id) -> Result<Vec<Branch>> {
        Self::get_structure(store, structure_id).await?;
        store.list_branches_for_structure(structure_id).await
    }

    /// Current tip of the branch
    pub async fn head<S: Store>(store: &S, branch_id: &Id) -> Result<Commit> {
        Self::get_branch(store, branch_id).await?;
        let head_id = store
            .get_head(branch_id)
            .await?
            .ok_or_else(|| HistoryError::MissingHead(branch_id.clone()))?;
        Self::get_commit(store, &head_id).await
    }

    pub async fn next<S: Store>(store: &S, commit_id: &Id) -> Result<Vec<Commit>> {
        Self::get_commit(store, commit_id).await?;
        let ids = store.list_next_commits(commit_id).await?;
        Self::resolve_commits(store, &ids).await
    }

    pub async fn previous<S: Store>(store: &S, commit_id: &Id) -> Result<Vec<Commit>> {
        Self::get_commit(store, commit_id).await?;
        let ids = store.list_previous_commits(commit_id).await?;
        Self::resolve_commits(store, &ids).await
    }

    pub async fn children<S: Store>(store: &S, commit_id: &Id) -> Result<Vec<ChildRelationship>> {
        Self::get_commit(store, commit_id).await?;
        store.list_child_relationships(commit_id).await
    }

    pub(crate) async fn resolve_commits<S: Store>(store: &S, ids: &[Id]) -> Result<Vec<Commit>> {
        let mut commits = Vec::with_capacity(ids.len());
        for id in ids {
            commits.push(Self::get_commit(store, id).await?);
        }
        Ok(commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::traits::{BranchStore, CommitStore, StructureStore};
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    fn new_commit(id: &str, name: &str) -> NewCommit {
        NewCommit {
            id: Some(id.to_string()),
            name: name.to_string(),
            commit_message: name.to_lowercase(),
        }
    }

    async fn project_setup(store: &InMemoryStore) -> StructureSetupResult {
        HistoryService::setup_structure(
            store,
            StructureSetup {
                structure: NewStructure {
                    id: Some("PROJECT1".to_string()),
                    name: "Project1".to_string(),
                    description: "A MD construction project".to_string(),
                },
                branch: NewBranch {
                    id: Some("PROJECT1_BRANCH1".to_string()),
                    name: "Branch1".to_string(),
                    reason_for_branch: "Initial Branch".to_string(),
                },
                initial_commit: new_commit("COMMIT1", "Commit1"),
            },
        )
        .await
        .unwrap()
    }

    fn ids(commits: &[Commit]) -> Vec<&str> {
        commits.iter().map(|c| c.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_advance_links_both_directions_and_moves_head() {
        let store = InMemoryStore::new();
        let setup = project_setup(&store).await;
        let branch_id = setup.branch.id.clone();

        let commit2 = HistoryService::create_commit(&store, new_commit("COMMIT2", "Commit2"))
            .await
            .unwrap();
        HistoryService::advance_head(&store, &branch_id, &commit2.id)
            .await
            .unwrap();

        let head = HistoryService::head(&store, &branch_id).await.unwrap();
        assert_eq!(head.id, "COMMIT2");

        let next = HistoryService::next(&store, &"COMMIT1".to_string()).await.unwrap();
        assert_eq!(ids(&next), vec!["COMMIT2"]);
        let previous = HistoryService::previous(&store, &"COMMIT2".to_string())
            .await
            .unwrap();
        assert_eq!(ids(&previous), vec!["COMMIT1"]);

        let branch = HistoryService::get_branch(&store, &branch_id).await.unwrap();
        assert_eq!(branch.initial_commit_id.as_deref(), Some("COMMIT1"));
        assert_eq!(branch.current_commit_id.as_deref(), Some("COMMIT2"));
    }

    #[tokio::test]
    async fn test_setup_structure_owns_a_branch() {
        let store = InMemoryStore::new();
        let setup = project_setup(&store).await;

        let branches = HistoryService::branches(&store, &setup.structure.id)
            .await
            .unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].id, setup.branch.id);
        assert_eq!(
            HistoryService::head(&store, &setup.branch.id).await.unwrap().id,
            setup.initial_commit.id
        );
    }

    #[tokio::test]
    async fn test_advance_with_unsaved_commit_leaves_head_alone() {
        let store = InMemoryStore::new();
        let setup = project_setup(&store).await;

        let unsaved = Commit::new("Commit2", "never saved").unwrap();
        let err = HistoryService::advance_head(&store, &setup.branch.id, &unsaved.id)
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::UnsavedCommit(ref id) if *id == unsaved.id));

        let head = HistoryService::head(&store, &setup.branch.id).await.unwrap();
        assert_eq!(head.id, "COMMIT1");
        assert!(HistoryService::next(&store, &"COMMIT1".to_string())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_advance_on_unseeded_branch_is_missing_head() {
        let store = InMemoryStore::new();
        let setup = project_setup(&store).await;
        let branch2 = HistoryService::create_branch(
            &store,
            &setup.structure.id,
            NewBranch {
                id: None,
                name: "Branch2".to_string(),
                reason_for_branch: "Second Branch".to_string(),
            },
        )
        .await
        .unwrap();
        let commit = HistoryService::create_commit(&store, new_commit("COMMIT2", "Commit2"))
            .await
            .unwrap();

        let err = HistoryService::advance_head(&store, &branch2.id, &commit.id)
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::MissingHead(_)));
        assert!(matches!(
            HistoryService::head(&store, &branch2.id).await,
            Err(HistoryError::MissingHead(_))
        ));
    }

    #[tokio::test]
    async fn test_creation_validation_happens_before_persistence() {
        let store = InMemoryStore::new();
        let err = HistoryService::create_structure(
            &store,
            NewStructure {
                id: Some("EMPTY".to_string()),
                name: "Project".to_string(),
                description: "".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HistoryError::Validation(_)));
        assert!(store.list_structures().await.unwrap().is_empty());

        let err = HistoryService::create_commit(
            &store,
            NewCommit {
                id: None,
                name: " ".to_string(),
                commit_message: "msg".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HistoryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_branch_requires_structure() {
        let store = InMemoryStore::new();
        let err = HistoryService::create_branch(
            &store,
            &"NOPE".to_string(),
            NewBranch {
                id: None,
                name: "Branch".to_string(),
                reason_for_branch: "reason".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HistoryError::NotFound { kind: "Structure", .. }));
    }

    #[tokio::test]
    async fn test_seed_then_reseed_is_rejected() {
        let store = InMemoryStore::new();
        let structure = HistoryService::create_structure(
            &store,
            NewStructure {
                id: None,
                name: "Project".to_string(),
                description: "desc".to_string(),
            },
        )
        .await
        .unwrap();
        let branch = HistoryService::create_branch(
            &store,
            &structure.id,
            NewBranch {
                id: None,
                name: "main".to_string(),
                reason_for_branch: "first".to_string(),
            },
        )
        .await
        .unwrap();
        let c1 = HistoryService::create_commit(&store, new_commit("C1", "C1"))
            .await
            .unwrap();
        let c2 = HistoryService::create_commit(&store, new_commit("C2", "C2"))
            .await
            .unwrap();

        let seeded = HistoryService::seed_branch(&store, &branch.id, &c1.id)
            .await
            .unwrap();
        assert_eq!(seeded.initial_commit_id.as_deref(), Some("C1"));

        let err = HistoryService::seed_branch(&store, &branch.id, &c2.id)
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::AlreadySeeded(_)));
        assert_eq!(HistoryService::head(&store, &branch.id).await.unwrap().id, "C1");
    }

    #[tokio::test]
    async fn test_re_advancing_with_a_member_commit_is_rejected() {
        let store = InMemoryStore::new();
        let setup = project_setup(&store).await;

        let err = HistoryService::advance_head(&store, &setup.branch.id, &"COMMIT1".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::CommitAlreadyInHistory { .. }));
        assert!(HistoryService::next(&store, &"COMMIT1".to_string())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_other_branch_cannot_link_back_to_an_ancestor() {
        let store = InMemoryStore::new();
        let setup = project_setup(&store).await;
        HistoryService::create_commit(&store, new_commit("COMMIT2", "Commit2"))
            .await
            .unwrap();
        HistoryService::advance_head(&store, &setup.branch.id, &"COMMIT2".to_string())
            .await
            .unwrap();

        let hotfix = HistoryService::create_branch(
            &store,
            &setup.structure.id,
            NewBranch {
                id: None,
                name: "Hotfix".to_string(),
                reason_for_branch: "Start from Commit2".to_string(),
            },
        )
        .await
        .unwrap();
        HistoryService::seed_branch(&store, &hotfix.id, &"COMMIT2".to_string())
            .await
            .unwrap();

        let err = HistoryService::advance_head(&store, &hotfix.id, &"COMMIT1".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::CycleDetected { .. }));
        assert!(!err.is_retryable());
        assert!(HistoryService::next(&store, &"COMMIT2".to_string())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            HistoryService::head(&store, &hotfix.id).await.unwrap().id,
            "COMMIT2"
        );
    }

    #[tokio::test]
    async fn test_checkout_only_accepts_branch_commits() {
        let store = InMemoryStore::new();
        let setup = project_setup(&store).await;
        let branch_id = setup.branch.id.clone();
        let c2 = HistoryService::create_commit(&store, new_commit("COMMIT2", "Commit2"))
            .await
            .unwrap();
        let stray = HistoryService::create_commit(&store, new_commit("STRAY", "Stray"))
            .await
            .unwrap();
        HistoryService::advance_head(&store, &branch_id, &c2.id)
            .await
            .unwrap();

        let branch = HistoryService::checkout(&store, &branch_id, &"COMMIT1".to_string())
            .await
            .unwrap();
        assert_eq!(branch.current_commit_id.as_deref(), Some("COMMIT1"));
        // Checkout never moves head
        assert_eq!(HistoryService::head(&store, &branch_id).await.unwrap().id, "COMMIT2");

        assert!(matches!(
            HistoryService::checkout(&store, &branch_id, &stray.id).await,
            Err(HistoryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_child_links_are_independent_of_heads() {
        let store = InMemoryStore::new();
        let setup = project_setup(&store).await;
        let other = HistoryService::setup_structure(
            &store,
            StructureSetup {
                structure: NewStructure {
                    id: None,
                    name: "Wall".to_string(),
                    description: "Exterior wall assembly".to_string(),
                },
                branch: NewBranch {
                    id: None,
                    name: "main".to_string(),
                    reason_for_branch: "Initial Branch".to_string(),
                },
                initial_commit: new_commit("WALL1", "Wall v1"),
            },
        )
        .await
        .unwrap();

        let rel = HistoryService::link_child(
            &store,
            &setup.initial_commit.id,
            NewChildRelationship {
                id: None,
                child_commit_id: other.initial_commit.id.clone(),
                relationship_name: "contains".to_string(),
                parent_class_name: Some("Project".to_string()),
                child_class_name: Some("Wall".to_string()),
            },
        )
        .await
        .unwrap();

        let children = HistoryService::children(&store, &setup.initial_commit.id)
            .await
            .unwrap();
        assert_eq!(children, vec![rel]);
        assert!(HistoryService::next(&store, &setup.initial_commit.id)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            HistoryService::head(&store, &other.branch.id).await.unwrap().id,
            "WALL1"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_concurrent_advances_never_both_win() {
        let store = Arc::new(InMemoryStore::new());
        let setup = project_setup(&store).await;
        let branch_id = setup.branch.id.clone();
        for id in ["C1", "C2"] {
            HistoryService::create_commit(&*store, new_commit(id, id))
                .await
                .unwrap();
        }

        let tasks: Vec<_> = ["C1", "C2"]
            .into_iter()
            .map(|id| {
                let store = store.clone();
                let branch_id = branch_id.clone();
                tokio::spawn(async move {
                    HistoryService::advance_head(&*store, &branch_id, &id.to_string()).await
                })
            })
            .collect();

        let mut winners = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(commit) => winners.push(commit.id),
                Err(e) => assert!(e.is_retryable(), "unexpected error: {}", e),
            }
        }
        assert!(!winners.is_empty());

        let head = HistoryService::head(&*store, &branch_id).await.unwrap();
        if winners.len() == 1 {
            assert_eq!(head.id, winners[0]);
        }

        // Either way, COMMIT1 has exactly one successor and the chain is linear
        let next = HistoryService::next(&*store, &"COMMIT1".to_string())
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        let members = store.list_branch_commits(&branch_id).await.unwrap();
        assert_eq!(members.len(), 1 + winners.len());
        assert_eq!(members.last(), Some(&head.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retrying_advances_serialize_into_a_chain() {
        let store = Arc::new(InMemoryStore::new());
        let setup = project_setup(&store).await;
        let branch_id = setup.branch.id.clone();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let branch_id = branch_id.clone();
            tasks.push(tokio::spawn(async move {
                let commit = HistoryService::create_commit(
                    &*store,
                    new_commit(&format!("C{}", i), &format!("Commit {}", i)),
                )
                .await
                .unwrap();
                HistoryService::advance_head_with_retry(&*store, &branch_id, &commit.id, 16).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let members = store.list_branch_commits(&branch_id).await.unwrap();
        assert_eq!(members.len(), 9);

        // Walk the next chain from the initial commit: every member exactly once
        let mut cursor = "COMMIT1".to_string();
        let mut steps = 0;
        loop {
            let next = store.list_next_commits(&cursor).await.unwrap();
            match next.as_slice() {
                [] => break,
                [only] => {
                    cursor = only.clone();
                    steps += 1;
                }
                forked => panic!("chain forked at {}: {:?}", cursor, forked),
            }
        }
        assert_eq!(steps, 8);
        assert_eq!(
            HistoryService::head(&*store, &branch_id).await.unwrap().id,
            cursor
        );
    }
}
