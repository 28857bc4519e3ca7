use itertools::Itertools;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::error::{HistoryError, Result};
use crate::model::{Branch, ChildRelationship, Commit, Id, Structure};
use crate::store::traits::{BranchStore, CommitStore, Store, StructureStore};

/// Next/previous edge target, tagged with the branch whose advance created it
#[derive(Debug, Clone, PartialEq, Eq)]
struct Edge {
    branch_id: Id,
    commit_id: Id,
}

/// Node tables keyed by id plus directed edge tables holding ids only
#[derive(Debug, Default)]
struct Graph {
    structures: HashMap<Id, Structure>,
    branches: HashMap<Id, Branch>,
    commits: HashMap<Id, Commit>,
    /// HAS_BRANCH, structure id -> branch ids
    structure_branches: HashMap<Id, Vec<Id>>,
    /// HEAD, exactly one entry per seeded branch
    heads: HashMap<Id, Id>,
    branch_commits: HashMap<Id, Vec<Id>>,
    next: HashMap<Id, Vec<Edge>>,
    previous: HashMap<Id, Vec<Edge>>,
    children: HashMap<Id, Vec<ChildRelationship>>,
    relationship_ids: HashSet<Id>,
}

#[derive(Debug)]
enum Mutation {
    InsertStructure(Structure),
    InsertBranch(Branch),
    InsertCommit(Commit),
    InsertChild(ChildRelationship),
    LinkNext { branch_id: Id, from: Id, to: Id },
    LinkPrevious { branch_id: Id, from: Id, to: Id },
    AddMember { branch_id: Id, commit_id: Id },
    SetInitial { branch_id: Id, commit_id: Id },
    SetCurrent { branch_id: Id, commit_id: Id },
    SetHead { branch_id: Id, commit_id: Id },
}

impl Graph {
    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::InsertStructure(structure) => {
                self.structure_branches
                    .entry(structure.id.clone())
                    .or_default();
                self.structures.insert(structure.id.clone(), structure);
            }
            Mutation::InsertBranch(branch) => {
                self.structure_branches
                    .entry(branch.structure_id.clone())
                    .or_default()
                    .push(branch.id.clone());
                self.branches.insert(branch.id.clone(), branch);
            }
            Mutation::InsertCommit(commit) => {
                self.commits.insert(commit.id.clone(), commit);
            }
            Mutation::InsertChild(relationship) => {
                self.relationship_ids.insert(relationship.id.clone());
                self.children
                    .entry(relationship.parent_commit_id.clone())
                    .or_default()
                    .push(relationship);
            }
            Mutation::LinkNext {
                branch_id,
                from,
                to,
            } => Self::link(&mut self.next, branch_id, from, to),
            Mutation::LinkPrevious {
                branch_id,
                from,
                to,
            } => Self::link(&mut self.previous, branch_id, from, to),
            Mutation::AddMember {
                branch_id,
                commit_id,
            } => self
                .branch_commits
                .entry(branch_id)
                .or_default()
                .push(commit_id),
            Mutation::SetInitial {
                branch_id,
                commit_id,
            } => {
                if let Some(branch) = self.branches.get_mut(&branch_id) {
                    branch.initial_commit_id = Some(commit_id);
                }
            }
            Mutation::SetCurrent {
                branch_id,
                commit_id,
            } => {
                if let Some(branch) = self.branches.get_mut(&branch_id) {
                    branch.current_commit_id = Some(commit_id);
                }
            }
            Mutation::SetHead {
                branch_id,
                commit_id,
            } => {
                self.heads.insert(branch_id, commit_id);
            }
        }
    }

    fn link(edges: &mut HashMap<Id, Vec<Edge>>, branch_id: Id, from: Id, to: Id) {
        let edge = Edge {
            branch_id,
            commit_id: to,
        };
        let targets = edges.entry(from).or_default();
        if !targets.contains(&edge) {
            targets.push(edge);
        }
    }

    fn targets(edges: &HashMap<Id, Vec<Edge>>, from: &Id) -> Vec<Id> {
        edges
            .get(from)
            .map(|targets| {
                targets
                    .iter()
                    .map(|edge| edge.commit_id.clone())
                    .unique()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `target` can be reached from `from` over next edges of any branch
    fn reaches(&self, from: &Id, target: &Id) -> bool {
        let mut visited = HashSet::from([from.clone()]);
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(cursor) = queue.pop_front() {
            if &cursor == target {
                return true;
            }
            for edge in self.next.get(&cursor).into_iter().flatten() {
                if visited.insert(edge.commit_id.clone()) {
                    queue.push_back(edge.commit_id.clone());
                }
            }
        }
        false
    }

    fn is_member(&self, branch_id: &Id, commit_id: &Id) -> bool {
        self.branch_commits
            .get(branch_id)
            .is_some_and(|members| members.contains(commit_id))
    }
}

/// Scoped write transaction over the graph.
///
/// Holds the write guard for its whole lifetime and only stages mutations.
/// Nothing reaches the graph until `commit`; dropping the txn discards the
/// staged work.
struct GraphTxn<'a> {
    graph: RwLockWriteGuard<'a, Graph>,
    staged: Vec<Mutation>,
}

impl<'a> GraphTxn<'a> {
    fn graph(&self) -> &Graph {
        &self.graph
    }

    fn stage(&mut self, mutation: Mutation) {
        self.staged.push(mutation);
    }

    fn commit(mut self) {
        let staged = std::mem::take(&mut self.staged);
        for mutation in staged {
            self.graph.apply(mutation);
        }
    }
}

impl Drop for GraphTxn<'_> {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            log::debug!("Rolling back {} staged graph mutations", self.staged.len());
        }
    }
}

/// In-process store backed by adjacency tables behind a `parking_lot` lock.
#[derive(Debug)]
pub struct InMemoryStore {
    graph: RwLock<Graph>,
    lock_timeout: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(5))
    }

    /// Bound how long a write transaction waits for the graph lock
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            graph: RwLock::new(Graph::default()),
            lock_timeout,
        }
    }

    /// Open a write transaction; `scope` names the entity for timeout errors
    fn begin(&self, scope: &Id) -> Result<GraphTxn<'_>> {
        let graph = self
            .graph
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| HistoryError::TransactionTimeout(scope.clone()))?;
        Ok(GraphTxn {
            graph,
            staged: Vec::new(),
        })
    }

    fn check_new_structure(graph: &Graph, structure: &Structure) -> Result<()> {
        if graph.structures.contains_key(&structure.id) {
            return Err(HistoryError::DuplicateId(structure.id.clone()));
        }
        Ok(())
    }

    fn check_new_branch(graph: &Graph, branch: &Branch) -> Result<()> {
        if graph.branches.contains_key(&branch.id) {
            return Err(HistoryError::DuplicateId(branch.id.clone()));
        }
        Ok(())
    }

    fn check_new_commit(graph: &Graph, commit: &Commit) -> Result<()> {
        if graph.commits.contains_key(&commit.id) {
            return Err(HistoryError::DuplicateId(commit.id.clone()));
        }
        Ok(())
    }

    fn stage_seed(txn: &mut GraphTxn<'_>, branch_id: &Id, commit_id: &Id) {
        txn.stage(Mutation::SetInitial {
            branch_id: branch_id.clone(),
            commit_id: commit_id.clone(),
        });
        txn.stage(Mutation::SetCurrent {
            branch_id: branch_id.clone(),
            commit_id: commit_id.clone(),
        });
        txn.stage(Mutation::SetHead {
            branch_id: branch_id.clone(),
            commit_id: commit_id.clone(),
        });
        txn.stage(Mutation::AddMember {
            branch_id: branch_id.clone(),
            commit_id: commit_id.clone(),
        });
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StructureStore for InMemoryStore {
    async fn get_structure(&self, id: &Id) -> Result<Option<Structure>> {
        Ok(self.graph.read().structures.get(id).cloned())
    }

    async fn list_structures(&self) -> Result<Vec<Structure>> {
        let graph = self.graph.read();
        let mut structures: Vec<Structure> = graph.structures.values().cloned().collect();
        structures.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(structures)
    }

    async fn insert_structure(&self, structure: Structure) -> Result<()> {
        let mut txn = self.begin(&structure.id)?;
        Self::check_new_structure(txn.graph(), &structure)?;
        txn.stage(Mutation::InsertStructure(structure));
        txn.commit();
        Ok(())
    }

    async fn insert_structure_setup(
        &self,
        structure: Structure,
        branch: Branch,
        initial_commit: Commit,
    ) -> Result<()> {
        let mut txn = self.begin(&structure.id)?;
        Self::check_new_structure(txn.graph(), &structure)?;
        Self::check_new_branch(txn.graph(), &branch)?;
        Self::check_new_commit(txn.graph(), &initial_commit)?;
        if branch.structure_id != structure.id {
            return Err(HistoryError::Validation(format!(
                "Branch '{}' does not belong to structure '{}'",
                branch.id, structure.id
            )));
        }

        let branch_id = branch.id.clone();
        let commit_id = initial_commit.id.clone();
        txn.stage(Mutation::InsertStructure(structure));
        txn.stage(Mutation::InsertCommit(initial_commit));
        txn.stage(Mutation::InsertBranch(branch));
        Self::stage_seed(&mut txn, &branch_id, &commit_id);
        txn.commit();
        Ok(())
    }
}

#[async_trait::async_trait]
impl BranchStore for InMemoryStore {
    async fn get_branch(&self, id: &Id) -> Result<Option<Branch>> {
        Ok(self.graph.read().branches.get(id).cloned())
    }

    async fn list_branches_for_structure(&self, structure_id: &Id) -> Result<Vec<Branch>> {
        let graph = self.graph.read();
        let branches = graph
            .structure_branches
            .get(structure_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| graph.branches.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(branches)
    }

    async fn insert_branch(&self, branch: Branch) -> Result<()> {
        let mut txn = self.begin(&branch.id)?;
        if !txn.graph().structures.contains_key(&branch.structure_id) {
            return Err(HistoryError::not_found("Structure", branch.structure_id));
        }
        Self::check_new_branch(txn.graph(), &branch)?;
        txn.stage(Mutation::InsertBranch(branch));
        txn.commit();
        Ok(())
    }

    async fn get_head(&self, branch_id: &Id) -> Result<Option<Id>> {
        Ok(self.graph.read().heads.get(branch_id).cloned())
    }

    async fn seed_branch(&self, branch_id: &Id, commit_id: &Id) -> Result<()> {
        let mut txn = self.begin(branch_id)?;
        let graph = txn.graph();
        let branch = graph
            .branches
            .get(branch_id)
            .ok_or_else(|| HistoryError::not_found("Branch", branch_id.clone()))?;
        if !graph.commits.contains_key(commit_id) {
            return Err(HistoryError::UnsavedCommit(commit_id.clone()));
        }
        if branch.is_seeded() || graph.heads.contains_key(branch_id) {
            return Err(HistoryError::AlreadySeeded(branch_id.clone()));
        }

        Self::stage_seed(&mut txn, branch_id, commit_id);
        txn.commit();
        Ok(())
    }

    async fn swap_head(
        &self,
        branch_id: &Id,
        expected_head: &Id,
        new_commit_id: &Id,
    ) -> Result<()> {
        let mut txn = self.begin(branch_id)?;
        let graph = txn.graph();
        if !graph.branches.contains_key(branch_id) {
            return Err(HistoryError::not_found("Branch", branch_id.clone()));
        }
        if !graph.commits.contains_key(new_commit_id) {
            return Err(HistoryError::UnsavedCommit(new_commit_id.clone()));
        }
        let current = graph
            .heads
            .get(branch_id)
            .ok_or_else(|| HistoryError::MissingHead(branch_id.clone()))?;
        if current != expected_head {
            return Err(HistoryError::TransactionConflict {
                branch_id: branch_id.clone(),
                expected: expected_head.clone(),
                found: current.clone(),
            });
        }
        if graph.is_member(branch_id, new_commit_id) {
            return Err(HistoryError::CommitAlreadyInHistory {
                branch_id: branch_id.clone(),
                commit_id: new_commit_id.clone(),
            });
        }
        if graph.reaches(new_commit_id, expected_head) {
            return Err(HistoryError::CycleDetected {
                head_id: expected_head.clone(),
                commit_id: new_commit_id.clone(),
            });
        }

        txn.stage(Mutation::LinkNext {
            branch_id: branch_id.clone(),
            from: expected_head.clone(),
            to: new_commit_id.clone(),
        });
        txn.stage(Mutation::LinkPrevious {
            branch_id: branch_id.clone(),
            from: new_commit_id.clone(),
            to: expected_head.clone(),
        });
        txn.stage(Mutation::SetHead {
            branch_id: branch_id.clone(),
            commit_id: new_commit_id.clone(),
        });
        txn.stage(Mutation::SetCurrent {
            branch_id: branch_id.clone(),
            commit_id: new_commit_id.clone(),
        });
        txn.stage(Mutation::AddMember {
            branch_id: branch_id.clone(),
            commit_id: new_commit_id.clone(),
        });
        txn.commit();
        Ok(())
    }

    async fn set_current_commit(&self, branch_id: &Id, commit_id: &Id) -> Result<()> {
        let mut txn = self.begin(branch_id)?;
        let graph = txn.graph();
        if !graph.branches.contains_key(branch_id) {
            return Err(HistoryError::not_found("Branch", branch_id.clone()));
        }
        if !graph.is_member(branch_id, commit_id) {
            return Err(HistoryError::Validation(format!(
                "Commit '{}' is not part of branch '{}'",
                commit_id, branch_id
            )));
        }
        txn.stage(Mutation::SetCurrent {
            branch_id: branch_id.clone(),
            commit_id: commit_id.clone(),
        });
        txn.commit();
        Ok(())
    }

    async fn list_branch_commits(&self, branch_id: &Id) -> Result<Vec<Id>> {
        Ok(self
            .graph
            .read()
            .branch_commits
            .get(branch_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_branch_next_commits(&self, branch_id: &Id, commit_id: &Id) -> Result<Vec<Id>> {
        let graph = self.graph.read();
        let targets: Vec<Id> = graph
            .next
            .get(commit_id)
            .into_iter()
            .flatten()
            .filter(|edge| &edge.branch_id == branch_id)
            .map(|edge| edge.commit_id.clone())
            .collect();
        Ok(targets)
    }
}

#[async_trait::async_trait]
impl CommitStore for InMemoryStore {
    async fn get_commit(&self, id: &Id) -> Result<Option<Commit>> {
        Ok(self.graph.read().commits.get(id).cloned())
    }

    async fn insert_commit(&self, commit: Commit) -> Result<()> {
        let mut txn = self.begin(&commit.id)?;
        Self::check_new_commit(txn.graph(), &commit)?;
        txn.stage(Mutation::InsertCommit(commit));
        txn.commit();
        Ok(())
    }

    async fn list_next_commits(&self, id: &Id) -> Result<Vec<Id>> {
        Ok(Graph::targets(&self.graph.read().next, id))
    }

    async fn list_previous_commits(&self, id: &Id) -> Result<Vec<Id>> {
        Ok(Graph::targets(&self.graph.read().previous, id))
    }

    async fn insert_child_relationship(&self, relationship: ChildRelationship) -> Result<()> {
        let mut txn = self.begin(&relationship.parent_commit_id)?;
        let graph = txn.graph();
        if graph.relationship_ids.contains(&relationship.id) {
            return Err(HistoryError::DuplicateId(relationship.id));
        }
        for commit_id in [&relationship.parent_commit_id, &relationship.child_commit_id] {
            if !graph.commits.contains_key(commit_id) {
                return Err(HistoryError::not_found("Commit", commit_id.clone()));
            }
        }
        txn.stage(Mutation::InsertChild(relationship));
        txn.commit();
        Ok(())
    }

    async fn list_child_relationships(
        &self,
        parent_commit_id: &Id,
    ) -> Result<Vec<ChildRelationship>> {
        Ok(self
            .graph
            .read()
            .children
            .get(parent_commit_id)
            .cloned()
            .unwrap_or_default())
    }
}

impl Store for InMemoryStore {}
