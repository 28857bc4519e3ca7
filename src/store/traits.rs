use crate::error::Result;
use crate::model::{Branch, ChildRelationship, Commit, Id, Structure};

#[async_trait::async_trait]
pub trait StructureStore: Send + Sync {
    async fn get_structure(&self, id: &Id) -> Result<Option<Structure>>;
    async fn list_structures(&self) -> Result<Vec<Structure>>;
    async fn insert_structure(&self, structure: Structure) -> Result<()>;
    /// Persist a structure, its first branch and the commit seeding that
    /// branch in a single transaction
    async fn insert_structure_setup(
        &self,
        structure: Structure,
        branch: Branch,
        initial_commit: Commit,
    ) -> Result<()>;
}

#[async_trait::async_trait]
pub trait BranchStore: Send + Sync {
    async fn get_branch(&self, id: &Id) -> Result<Option<Branch>>;
    async fn list_branches_for_structure(&self, structure_id: &Id) -> Result<Vec<Branch>>;
    /// Insert a branch together with its HAS_BRANCH edge
    async fn insert_branch(&self, branch: Branch) -> Result<()>;
    /// Resolve the head edge of a branch (None when unseeded)
    async fn get_head(&self, branch_id: &Id) -> Result<Option<Id>>;
    /// Point initial commit, current commit and head of a fresh branch at `commit_id`
    async fn seed_branch(&self, branch_id: &Id, commit_id: &Id) -> Result<()>;
    /// Compare-and-swap the head edge from `expected_head` to `new_commit_id`,
    /// linking branch-tagged next/previous edges, membership and current
    /// commit in the same transaction. The union of next edges stays acyclic.
    async fn swap_head(&self, branch_id: &Id, expected_head: &Id, new_commit_id: &Id)
        -> Result<()>;
    /// Move the checked-out commit without touching head
    async fn set_current_commit(&self, branch_id: &Id, commit_id: &Id) -> Result<()>;
    /// Commits that were seeded or advanced onto the branch, in order
    async fn list_branch_commits(&self, branch_id: &Id) -> Result<Vec<Id>>;
    /// Targets of the next edges that advances on `branch_id` created from `commit_id`
    async fn list_branch_next_commits(&self, branch_id: &Id, commit_id: &Id) -> Result<Vec<Id>>;
}

#[async_trait::async_trait]
pub trait CommitStore: Send + Sync {
    async fn get_commit(&self, id: &Id) -> Result<Option<Commit>>;
    async fn insert_commit(&self, commit: Commit) -> Result<()>;
    /// Distinct next-edge targets across all branches
    async fn list_next_commits(&self, id: &Id) -> Result<Vec<Id>>;
    /// Distinct previous-edge targets across all branches
    async fn list_previous_commits(&self, id: &Id) -> Result<Vec<Id>>;
    async fn insert_child_relationship(&self, relationship: ChildRelationship) -> Result<()>;
    async fn list_child_relationships(&self, parent_commit_id: &Id)
        -> Result<Vec<ChildRelationship>>;
}

pub trait Store: StructureStore + BranchStore + CommitStore + Send + Sync {}
