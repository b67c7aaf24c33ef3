pub mod generate;
pub mod health;
pub mod workflows;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /workflows      GET   list workflow templates
/// /generate       POST  run one job (multipart)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/workflows", workflows::router())
        .nest("/generate", generate::router())
}
