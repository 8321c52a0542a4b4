//! Per-package OAuth endpoints: `GET /{id}/auth/login` and
//! `GET /{id}/auth/callback`.

use crate::error::Error;
use crate::http::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::Value;

pub async fn login(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> Result<Response, Error> {
    if !state.routes.load().has_auth(&server_id) {
        return Err(Error::UnknownServer(server_id));
    }

    let config = state.registry.get(&server_id)?;
    let auth = config
        .auth
        .ok_or_else(|| Error::BadInput(format!("{server_id} has no auth configuration")))?;

    let authorize_url =
        state
            .auth
            .begin_login(&server_id, &auth, &state.config.public_base_url())?;

    Ok((
        StatusCode::FOUND,
        [(header::LOCATION, authorize_url)],
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

pub async fn callback(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<Value>, Error> {
    if !state.routes.load().has_auth(&server_id) {
        return Err(Error::UnknownServer(server_id));
    }

    // The provider's token JSON is the response body; nothing is retained.
    let tokens = state
        .auth
        .finish_login(
            &server_id,
            &params.code,
            &params.state,
            &state.config.public_base_url(),
        )
        .await?;
    Ok(Json(tokens))
}
