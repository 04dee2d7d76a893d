use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures_util::SinkExt;
use metrix_proto::msg::{HASH_HEADER, REAL_IP_HEADER, RpcCode, RpcRequest, RpcResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    AppState,
    chain::{Delivery, RejectKind, Rejection},
    ingest::Ingest,
    route::Origin,
};

pub async fn handle_socket(socket: WebSocket, state: AppState, origin: Origin) {
    let _tracker_token = state.ws_graceful_shutdown.tracker.token();
    let cancellation_token = state.ws_graceful_shutdown.token.child_token();

    debug!("rpc socket connected");
    let mut controller = RpcController {
        ingest: state.ingest.clone(),
        ws: socket,
        cancellation_token,
        origin,
    };

    while controller.next().await {}
    controller.ws.close().await.ok();
    debug!("rpc socket disconnected");
}

struct RpcController {
    ingest: Arc<Ingest>,
    ws: WebSocket,
    cancellation_token: CancellationToken,
    origin: Origin,
}

impl RpcController {
    async fn close(&mut self, err: RpcWsError) -> anyhow::Result<()> {
        let frame = err.into_close_frame();
        if frame.code != close_code::NORMAL {
            debug!(code = frame.code, reason = %frame.reason, "closing rpc socket with error");
        }
        self.ws.send(Message::Close(Some(frame))).await?;
        Ok(())
    }

    async fn next(&mut self) -> bool {
        tokio::select! {
            msg = self.ws.recv() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        self.close(RpcWsError::Internal(e.to_string())).await.ok();
                        return false;
                    }
                    None => return false, // connection closed
                };

                match self.process_msg(msg).await {
                    Ok(keep_open) => keep_open,
                    Err(e) => {
                        self.close(e).await.ok();
                        false
                    }
                }
            }
            _ = self.cancellation_token.cancelled() => {
                self.close(RpcWsError::Shutdown).await.ok();
                false
            }
        }
    }

    /// `Ok(false)` once the peer closed the socket.
    async fn process_msg(&mut self, msg: Message) -> Result<bool, RpcWsError> {
        match msg {
            Message::Close(frame) => {
                trace!(?frame, "rpc socket closed by peer");
                return Ok(false);
            }
            Message::Binary(bytes) => {
                let req: RpcRequest = postcard::from_bytes(&bytes)
                    .map_err(|e| RpcWsError::MalformedRequest(e.to_string()))?;
                trace!(id = req.id, len = req.payload.len(), "rpc request");

                let resp = self.call(&req);
                let frame = postcard::to_allocvec(&resp)
                    .map_err(|e| RpcWsError::Internal(e.to_string()))?;
                self.ws
                    .send(Message::Binary(Bytes::from(frame)))
                    .await
                    .map_err(|e| RpcWsError::Internal(e.to_string()))?;
            }
            Message::Text(_) => return Err(RpcWsError::UnexpectedMessage),
            _ => {} // ignore ping/pong
        }
        Ok(true)
    }

    fn call(&self, req: &RpcRequest) -> RpcResponse {
        let delivery = Delivery {
            forwarded: req.metadata(REAL_IP_HEADER),
            peer: self.origin.peer,
            tag: req.metadata(HASH_HEADER),
            body: &req.payload,
        };

        match self.ingest.handle(&delivery) {
            Ok(stored) => RpcResponse {
                id: req.id,
                code: RpcCode::Ok,
                message: format!("stored {stored} metrics"),
            },
            Err(rejection) => rejection_response(req.id, rejection),
        }
    }
}

fn rejection_response(id: u64, rejection: Rejection) -> RpcResponse {
    let code = match rejection.kind {
        RejectKind::PermissionDenied => RpcCode::PermissionDenied,
        RejectKind::InvalidArgument => RpcCode::InvalidArgument,
        RejectKind::Internal => RpcCode::Internal,
    };
    RpcResponse {
        id,
        code,
        message: rejection.message,
    }
}

#[derive(Debug, thiserror::Error)]
enum RpcWsError {
    #[error("server is shutting down")]
    Shutdown,
    #[error("unexpected message from client")]
    UnexpectedMessage,
    #[error("malformed rpc request: {0}")]
    MalformedRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcWsError {
    fn into_close_frame(self) -> CloseFrame {
        let code = match self {
            RpcWsError::Shutdown => close_code::AWAY,
            RpcWsError::UnexpectedMessage => close_code::UNSUPPORTED,
            RpcWsError::MalformedRequest(_) => close_code::INVALID,
            RpcWsError::Internal(_) => close_code::ERROR,
        };
        CloseFrame {
            code,
            reason: self.to_string().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_kinds_map_to_rpc_codes() {
        let resp = rejection_response(7, Rejection::permission_denied("nope"));
        assert_eq!((resp.id, resp.code), (7, RpcCode::PermissionDenied));

        let resp = rejection_response(8, Rejection::invalid_argument("bad"));
        assert_eq!(resp.code, RpcCode::InvalidArgument);
        assert_eq!(resp.message, "bad");

        let resp = rejection_response(9, Rejection::internal("oops"));
        assert_eq!(resp.code, RpcCode::Internal);
    }

    #[test]
    fn close_frames_carry_reason() {
        let frame = RpcWsError::MalformedRequest("eof".into()).into_close_frame();
        assert_eq!(frame.code, close_code::INVALID);
        assert_eq!(frame.reason.as_str(), "malformed rpc request: eof");
    }
}
