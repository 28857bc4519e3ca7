//! Behaviour shared by every store backend, run against each one from its
//! own test module.

use crate::error::HistoryError;
use crate::logic::{HistoryService, HistoryWalker, StructureSetup};
use crate::model::{Id, NewBranch, NewCommit, NewStructure};
use crate::store::traits::Store;

fn new_commit(id: &str) -> NewCommit {
    NewCommit {
        id: Some(id.to_string()),
        name: id.to_string(),
        commit_message: format!("commit {}", id),
    }
}

struct Fixture {
    prefix: String,
    structure_id: Id,
    main: Id,
}

impl Fixture {
    /// Structure with branch `main` seeded at commit `A`
    async fn new<S: Store>(store: &S, prefix: &str) -> Self {
        let setup = HistoryService::setup_structure(
            store,
            StructureSetup {
                structure: NewStructure {
                    id: Some(format!("{}S", prefix)),
                    name: "Project".to_string(),
                    description: "shared commits".to_string(),
                },
                branch: NewBranch {
                    id: Some(format!("{}main", prefix)),
                    name: "main".to_string(),
                    reason_for_branch: "Initial Branch".to_string(),
                },
                initial_commit: new_commit(&format!("{}A", prefix)),
            },
        )
        .await
        .unwrap();

        Self {
            prefix: prefix.to_string(),
            structure_id: setup.structure.id,
            main: setup.branch.id,
        }
    }

    fn id(&self, name: &str) -> Id {
        format!("{}{}", self.prefix, name)
    }

    fn ids(&self, names: &[&str]) -> Vec<Id> {
        names.iter().map(|name| self.id(name)).collect()
    }

    async fn commit<S: Store>(&self, store: &S, name: &str) -> Id {
        HistoryService::create_commit(store, new_commit(&self.id(name)))
            .await
            .unwrap()
            .id
    }

    /// New branch seeded at the existing commit `at`
    async fn branch_at<S: Store>(&self, store: &S, name: &str, at: &str) -> Id {
        let branch = HistoryService::create_branch(
            store,
            &self.structure_id,
            NewBranch {
                id: Some(self.id(name)),
                name: name.to_string(),
                reason_for_branch: format!("Start from {}", at),
            },
        )
        .await
        .unwrap();
        HistoryService::seed_branch(store, &branch.id, &self.id(at))
            .await
            .unwrap();
        branch.id
    }

    async fn advance<S: Store>(&self, store: &S, branch_id: &Id, name: &str) {
        HistoryService::advance_head(store, branch_id, &self.id(name))
            .await
            .unwrap();
    }

    async fn log<S: Store>(&self, store: &S, branch_id: &Id) -> Vec<Id> {
        HistoryWalker::log(store, branch_id)
            .await
            .unwrap()
            .into_iter()
            .map(|commit| commit.id)
            .collect()
    }
}

/// main: A -> B -> C, then `other` seeded at A advances straight to C
pub(crate) async fn shared_target_is_not_a_fork<S: Store>(store: &S, prefix: &str) {
    let fx = Fixture::new(store, prefix).await;
    fx.commit(store, "B").await;
    fx.commit(store, "C").await;
    fx.advance(store, &fx.main, "B").await;
    fx.advance(store, &fx.main, "C").await;

    let other = fx.branch_at(store, "other", "A").await;
    fx.advance(store, &other, "C").await;

    let main_report = HistoryWalker::verify_branch(store, &fx.main).await.unwrap();
    assert!(main_report.is_valid, "{:?}", main_report);
    assert!(main_report.forks.is_empty());
    assert_eq!(main_report.chain_length, 2);
    assert_eq!(fx.log(store, &fx.main).await, fx.ids(&["A", "B", "C"]));

    assert!(HistoryWalker::verify_branch(store, &other).await.unwrap().is_valid);
    assert_eq!(fx.log(store, &other).await, fx.ids(&["A", "C"]));

    assert_eq!(
        store.list_next_commits(&fx.id("A")).await.unwrap(),
        fx.ids(&["B", "C"])
    );
}

/// The other branch links A -> C first; main's own chain still goes through B
pub(crate) async fn log_ignores_edges_of_other_branches<S: Store>(store: &S, prefix: &str) {
    let fx = Fixture::new(store, prefix).await;
    fx.commit(store, "B").await;
    fx.commit(store, "C").await;

    let other = fx.branch_at(store, "other", "A").await;
    fx.advance(store, &other, "C").await;
    fx.advance(store, &fx.main, "B").await;
    fx.advance(store, &fx.main, "C").await;

    assert_eq!(fx.log(store, &fx.main).await, fx.ids(&["A", "B", "C"]));
    let report = HistoryWalker::verify_branch(store, &fx.main).await.unwrap();
    assert!(report.is_valid, "{:?}", report);
    assert_eq!(report.head_commit_id, Some(fx.id("C")));
}

/// main: A -> B; a branch seeded at B must not link back to A
pub(crate) async fn advance_closing_a_cycle_is_rejected<S: Store>(store: &S, prefix: &str) {
    let fx = Fixture::new(store, prefix).await;
    fx.commit(store, "B").await;
    fx.advance(store, &fx.main, "B").await;

    let back = fx.branch_at(store, "back", "B").await;
    let err = HistoryService::advance_head(store, &back, &fx.id("A"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, HistoryError::CycleDetected { ref head_id, ref commit_id }
            if *head_id == fx.id("B") && *commit_id == fx.id("A")),
        "{:?}",
        err
    );

    assert!(store.list_next_commits(&fx.id("B")).await.unwrap().is_empty());
    assert_eq!(store.get_head(&back).await.unwrap(), Some(fx.id("B")));
    assert!(HistoryWalker::verify_branch(store, &fx.main).await.unwrap().is_valid);
}

/// Two branches advancing A -> B leave a single visible edge each way
pub(crate) async fn shared_edge_is_listed_once<S: Store>(store: &S, prefix: &str) {
    let fx = Fixture::new(store, prefix).await;
    fx.commit(store, "B").await;
    fx.advance(store, &fx.main, "B").await;

    let twin = fx.branch_at(store, "twin", "A").await;
    fx.advance(store, &twin, "B").await;

    assert_eq!(store.list_next_commits(&fx.id("A")).await.unwrap(), fx.ids(&["B"]));
    assert_eq!(
        store.list_previous_commits(&fx.id("B")).await.unwrap(),
        fx.ids(&["A"])
    );
    for branch in [&fx.main, &twin] {
        assert_eq!(fx.log(store, branch).await, fx.ids(&["A", "B"]));
    }
}

/// Two swaps expecting the same head: one wins, the loser writes nothing
pub(crate) async fn racing_swaps_have_one_winner<S: Store>(store: &S, prefix: &str) {
    let fx = Fixture::new(store, prefix).await;
    let b = fx.commit(store, "B").await;
    let c = fx.commit(store, "C").await;
    let head = fx.id("A");

    let (first, second) = tokio::join!(
        store.swap_head(&fx.main, &head, &b),
        store.swap_head(&fx.main, &head, &c)
    );
    let (winner, loser_err) = match (first, second) {
        (Ok(()), Err(e)) => (b, e),
        (Err(e), Ok(())) => (c, e),
        other => panic!("expected exactly one winner, got {:?}", other),
    };
    assert!(loser_err.is_retryable(), "{:?}", loser_err);

    assert_eq!(store.get_head(&fx.main).await.unwrap(), Some(winner.clone()));
    assert_eq!(store.list_next_commits(&head).await.unwrap(), vec![winner.clone()]);
    assert_eq!(
        store.list_branch_commits(&fx.main).await.unwrap(),
        vec![head, winner]
    );
}
