use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::Router;

use crate::handlers::generate;
use crate::state::AppState;

/// Upper bound on a generate request, reference image included.
const MAX_GENERATE_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Generation routes mounted at `/generate`.
///
/// ```text
/// POST /  -> generate
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(generate::generate))
        .layer(DefaultBodyLimit::max(MAX_GENERATE_BODY_BYTES))
}
