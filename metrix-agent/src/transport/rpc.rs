use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use metrix_proto::{
    Snapshot,
    msg::{HASH_HEADER, REAL_IP_HEADER, RPC_PATH, RpcCode, RpcRequest, RpcResponse},
    seal::Sealer,
};
use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest, protocol::CloseFrame};
use tracing::{debug, trace};

use super::{Transport, TransportError, net};
use crate::config::AgentConfig;

/// Sends each snapshot as one call on a short-lived RPC socket.
pub struct RpcTransport {
    url: String,
    tls: bool,
    prefer_ipv6: bool,
    sealer: Sealer,
    next_id: AtomicU64,
}

impl RpcTransport {
    pub fn new(config: &AgentConfig, sealer: Sealer) -> anyhow::Result<Self> {
        let url = format!(
            "{}://{}{RPC_PATH}",
            if config.tls { "wss" } else { "ws" },
            config.server_addr
        );
        // reject a bad address at startup rather than on every call
        url.as_str().into_client_request()?;

        Ok(RpcTransport {
            url,
            tls: config.tls,
            prefer_ipv6: config.prefer_ipv6,
            sealer,
            next_id: AtomicU64::new(1),
        })
    }

    /// Connects, sends `req` and waits for the response carrying its id.
    ///
    /// The agent address is added to the metadata once the socket is up so
    /// that it names the interface actually used.
    async fn call(&self, mut req: RpcRequest) -> anyhow::Result<RpcResponse> {
        let ws_req = self.url.as_str().into_client_request()?;
        let net::Connection { stream, local_addr } =
            net::connect(ws_req.uri(), self.tls, self.prefer_ipv6).await?;
        let (mut socket, _) = tokio_tungstenite::client_async(ws_req, stream).await?;

        req.metadata
            .push((REAL_IP_HEADER.to_owned(), local_addr.ip().to_string()));
        socket
            .send(Message::Binary(Bytes::from(postcard::to_allocvec(&req)?)))
            .await?;

        let resp = loop {
            let Some(msg) = socket.next().await else {
                anyhow::bail!("RPC error: connection closed before response");
            };
            match msg? {
                Message::Binary(bytes) => {
                    let resp: RpcResponse = postcard::from_bytes(&bytes)?;
                    if resp.id == req.id {
                        break resp;
                    }
                    trace!(id = resp.id, "ignoring response to another call");
                }
                Message::Close(Some(CloseFrame { code, reason })) => {
                    anyhow::bail!("RPC error: socket closed by collector: code={code:?}, reason={reason}");
                }
                Message::Close(None) => anyhow::bail!("RPC error: socket closed by collector"),
                Message::Text(_) => anyhow::bail!("RPC error: unexpected text frame"),
                _ => {} // ping/pong
            }
        };

        socket.close(None).await.ok();
        Ok(resp)
    }
}

impl Transport for RpcTransport {
    async fn send_metrics(&self, snapshot: &Snapshot) -> Result<(), TransportError> {
        let sealed = self.sealer.seal(&snapshot.to_bytes()?)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let metadata = sealed
            .tag
            .map(|tag| (HASH_HEADER.to_owned(), tag))
            .into_iter()
            .collect();

        let resp = self
            .call(RpcRequest {
                id,
                metadata,
                payload: sealed.body,
            })
            .await?;

        match resp.code {
            RpcCode::Ok => {
                debug!(id, "rpc call accepted: {}", resp.message);
                Ok(())
            }
            code => Err(TransportError::Rejected {
                code,
                message: resp.message,
            }),
        }
    }
}
