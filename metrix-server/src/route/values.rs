use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrix_proto::{MetricKind, UnknownKind};
use serde::Serialize;

use crate::AppState;

pub async fn get_value(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<String, ValueError> {
    let value = match kind.parse::<MetricKind>()? {
        MetricKind::Gauge => state.storage.get_gauge(&id).map(|v| v.to_string()),
        MetricKind::Counter => state.storage.get_counter(&id).map(|v| v.to_string()),
    };

    value.ok_or(ValueError::NotFound(id))
}

#[derive(Debug, Serialize)]
pub struct MetricsView {
    pub gauges: BTreeMap<String, f64>,
    pub counters: BTreeMap<String, i64>,
}

pub async fn list_metrics(State(state): State<AppState>) -> Json<MetricsView> {
    Json(MetricsView {
        gauges: state.storage.gauges().into_iter().collect(),
        counters: state.storage.counters().into_iter().collect(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    #[error(transparent)]
    UnknownKind(#[from] UnknownKind),
    #[error("metric {0} not found")]
    NotFound(String),
}

impl IntoResponse for ValueError {
    fn into_response(self) -> Response {
        match self {
            ValueError::UnknownKind(_) => (StatusCode::BAD_REQUEST, self.to_string()).into_response(),
            ValueError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()).into_response(),
        }
    }
}
