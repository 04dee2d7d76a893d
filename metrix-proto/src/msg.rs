use serde::{Deserialize, Serialize};

/// Out-of-band field carrying the integrity tag.
pub const HASH_HEADER: &str = "hashsha256";
/// Out-of-band field carrying the caller's own address.
pub const REAL_IP_HEADER: &str = "x-real-ip";

pub const MIME_APPLICATION_POSTCARD: &str = "application/postcard";

pub const UPDATES_PATH: &str = "/updates";
pub const RPC_PATH: &str = "/ws/v1/metrics";

/// A call on the RPC socket, sent as one binary frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub metadata: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl RpcRequest {
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub code: RpcCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcCode {
    Ok,
    PermissionDenied,
    InvalidArgument,
    Internal,
}

impl std::fmt::Display for RpcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RpcCode::Ok => "ok",
            RpcCode::PermissionDenied => "permission denied",
            RpcCode::InvalidArgument => "invalid argument",
            RpcCode::Internal => "internal",
        };
        f.write_str(name)
    }
}
