use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::Result;
use crate::logic::HistoryService;
use crate::model::{Commit, Id};
use crate::store::traits::Store;

/// Outcome of checking a branch's chain from initial commit to head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchVerification {
    pub branch_id: Id,
    pub initial_commit_id: Option<Id>,
    pub head_commit_id: Option<Id>,
    /// Next-edge hops walked from the initial commit
    pub chain_length: usize,
    pub head_reachable: bool,
    /// Commits with more than one in-branch successor
    pub forks: Vec<Id>,
    /// Commits whose identity fields no longer match their digest
    pub tampered_commits: Vec<Id>,
    pub is_valid: bool,
}

/// Read-only traversal of a branch's history
pub struct HistoryWalker;

impl HistoryWalker {
    /// Commits from the initial commit to head, following only the next edges
    /// created by advances on this branch
    pub async fn log<S: Store>(store: &S, branch_id: &Id) -> Result<Vec<Commit>> {
        let walk = Self::walk(store, branch_id).await?;
        HistoryService::resolve_commits(store, &walk.chain).await
    }

    pub async fn verify_branch<S: Store>(store: &S, branch_id: &Id) -> Result<BranchVerification> {
        let walk = Self::walk(store, branch_id).await?;
        let head = store.get_head(branch_id).await?;

        let mut tampered_commits = Vec::new();
        for commit in HistoryService::resolve_commits(store, &walk.chain).await? {
            if !commit.verify_digest() {
                tampered_commits.push(commit.id);
            }
        }

        let head_reachable = match (&head, walk.chain.last()) {
            (Some(head), Some(last)) => head == last,
            _ => false,
        };
        let is_valid = head_reachable && walk.forks.is_empty() && tampered_commits.is_empty();

        if !is_valid {
            log::warn!(
                "Branch {} failed verification: head_reachable={}, forks=[{}], tampered=[{}]",
                branch_id,
                head_reachable,
                walk.forks.iter().join(", "),
                tampered_commits.iter().join(", ")
            );
        }

        Ok(BranchVerification {
            branch_id: branch_id.clone(),
            initial_commit_id: walk.chain.first().cloned(),
            head_commit_id: head,
            chain_length: walk.chain.len().saturating_sub(1),
            head_reachable,
            forks: walk.forks,
            tampered_commits,
            is_valid,
        })
    }

    async fn walk<S: Store>(store: &S, branch_id: &Id) -> Result<Walk> {
        let branch = HistoryService::get_branch(store, branch_id).await?;
        let Some(initial) = branch.initial_commit_id else {
            return Ok(Walk::default());
        };

        let mut chain = vec![initial.clone()];
        let mut visited = HashSet::from([initial.clone()]);
        let mut forks = Vec::new();
        let mut cursor = initial;

        loop {
            let successors = store
                .list_branch_next_commits(branch_id, &cursor)
                .await?
                .into_iter()
                .unique()
                .collect_vec();

            let next = match successors.as_slice() {
                [] => break,
                [only] => only.clone(),
                [first, ..] => {
                    forks.push(cursor.clone());
                    first.clone()
                }
            };
            // Guard against cycles in a corrupted graph
            if !visited.insert(next.clone()) {
                forks.push(next);
                break;
            }
            chain.push(next.clone());
            cursor = next;
        }

        Ok(Walk { chain, forks })
    }
}

#[derive(Debug, Default)]
struct Walk {
    chain: Vec<Id>,
    forks: Vec<Id>,
}
