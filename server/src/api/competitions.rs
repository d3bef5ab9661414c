//! Competition read endpoint.

#![allow(clippy::missing_errors_doc)]

use crate::error::ApiError;
use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use ticket_engine_core::competition::Competition;
use ticket_engine_core::error::EngineError;
use ticket_engine_core::types::CompetitionSlug;

/// A competition with derived availability.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitionResponse {
    /// Stored competition.
    #[serde(flatten)]
    pub competition: Competition,
    /// Tickets left.
    pub remaining: u32,
}

impl From<Competition> for CompetitionResponse {
    fn from(competition: Competition) -> Self {
        Self {
            remaining: competition.remaining(),
            competition,
        }
    }
}

/// GET /api/competitions/:slug
pub async fn get_competition(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<CompetitionResponse>, ApiError> {
    let slug = CompetitionSlug::new(slug);
    let competition = state
        .engine
        .store()
        .find_competition(&slug)
        .await
        .map_err(EngineError::from)?
        .ok_or_else(|| EngineError::CompetitionNotFound(slug.clone()))?;
    Ok(Json(competition.into()))
}
