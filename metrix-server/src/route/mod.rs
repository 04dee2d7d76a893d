mod metrics;
mod origin;
mod updates;
mod values;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::chain::{RejectKind, Rejection};

pub use metrics::metric_rpc_ws;
pub use origin::Origin;
pub use updates::updates;
pub use values::{get_value, list_metrics};

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

impl RejectKind {
    pub fn status_code(self) -> StatusCode {
        match self {
            RejectKind::PermissionDenied => StatusCode::FORBIDDEN,
            RejectKind::InvalidArgument => StatusCode::BAD_REQUEST,
            RejectKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.kind.status_code(), self.to_string()).into_response()
    }
}
