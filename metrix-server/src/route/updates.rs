use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
};
use metrix_proto::msg::HASH_HEADER;
use serde_json::{Value, json};

use crate::{
    AppState,
    chain::{Delivery, Rejection},
    route::Origin,
};

/// Request/response entry point: one sealed snapshot per `POST`.
pub async fn updates(
    State(state): State<AppState>,
    origin: Origin,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, Rejection> {
    let tag = headers
        .get(HASH_HEADER)
        .and_then(|value| value.to_str().ok());

    let stored = state.ingest.handle(&Delivery {
        forwarded: origin.forwarded.as_deref(),
        peer: origin.peer,
        tag,
        body: &body,
    })?;

    Ok(Json(json!({"stored": stored})))
}
