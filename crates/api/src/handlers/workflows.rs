use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WorkflowList {
    /// Template file names, sorted.
    pub workflows: Vec<String>,
}

/// GET /api/v1/workflows
pub async fn list_workflows(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<WorkflowList>>> {
    let workflows = state.runner.templates().list().await?;
    Ok(Json(DataResponse {
        data: WorkflowList { workflows },
    }))
}
