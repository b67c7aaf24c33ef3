use axum::routing::get;
use axum::Router;

use crate::handlers::workflows;
use crate::state::AppState;

/// Workflow template routes mounted at `/workflows`.
///
/// ```text
/// GET /  -> list_workflows
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(workflows::list_workflows))
}
