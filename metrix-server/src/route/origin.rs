use std::{convert::Infallible, net::IpAddr, net::SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use metrix_proto::msg::REAL_IP_HEADER;

/// Where a request claims to come from and where it actually came from.
#[derive(Clone, Debug, Default)]
pub struct Origin {
    pub forwarded: Option<String>,
    pub peer: Option<IpAddr>,
}

impl<S> FromRequestParts<S> for Origin
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // a present but non-ASCII value is kept lossily so it fails address
        // parsing instead of looking absent
        let forwarded = parts
            .headers
            .get(REAL_IP_HEADER)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

        // absent when the router is driven without `into_make_service_with_connect_info`
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Ok(Origin { forwarded, peer })
    }
}
