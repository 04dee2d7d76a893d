use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use tracing::{Instrument, debug_span};

use crate::{AppState, route::Origin};

mod ingress;

pub async fn metric_rpc_ws(
    origin: Origin,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let peer = origin.peer.map(|p| p.to_string()).unwrap_or_default();
    ws.on_upgrade(move |socket| {
        ingress::handle_socket(socket, state, origin).instrument(debug_span!("rpc_ws", peer))
    })
}
