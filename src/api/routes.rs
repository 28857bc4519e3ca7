use axum::{
    routing::{get, post},
    Router,
};

use crate::api::handlers::{self, AppState};
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Structures
        .route(
            "/structures",
            get(handlers::list_structures::<S>).post(handlers::create_structure::<S>),
        )
        .route("/structures/setup", post(handlers::setup_structure::<S>))
        .route("/structures/:structure_id", get(handlers::get_structure::<S>))
        .route(
            "/structures/:structure_id/branches",
            post(handlers::create_branch::<S>),
        )
        // Branches
        .route("/branches/:branch_id", get(handlers::get_branch::<S>))
        .route("/branches/:branch_id/head", get(handlers::get_branch_head::<S>))
        .route("/branches/:branch_id/log", get(handlers::get_branch_log::<S>))
        .route("/branches/:branch_id/verify", get(handlers::verify_branch::<S>))
        .route("/branches/:branch_id/seed", post(handlers::seed_branch::<S>))
        .route("/branches/:branch_id/advance", post(handlers::advance_branch::<S>))
        .route("/branches/:branch_id/checkout", post(handlers::checkout_branch::<S>))
        // Commits
        .route("/commits", post(handlers::create_commit::<S>))
        .route("/commits/:commit_id", get(handlers::get_commit::<S>))
        .route("/commits/:commit_id/next", get(handlers::get_next_commits::<S>))
        .route(
            "/commits/:commit_id/previous",
            get(handlers::get_previous_commits::<S>),
        )
        .route(
            "/commits/:commit_id/children",
            get(handlers::list_children::<S>).post(handlers::link_child::<S>),
        )
}
