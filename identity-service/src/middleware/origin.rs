use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::{models::RequestOrigin, AppState};

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Client address and user agent of the current request, for audit events.
///
/// Uses the socket peer address when the server was started with connect
/// info. The first hop of `x-forwarded-for` replaces it only when
/// `trust_proxy_headers` is configured.
pub struct ClientOrigin(pub RequestOrigin);

pub fn origin_from_parts(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded: bool,
) -> RequestOrigin {
    let forwarded = headers
        .get(FORWARDED_FOR_HEADER)
        .filter(|_| trust_forwarded)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty());

    let ip_address = forwarded.or_else(|| peer.map(|addr| addr.ip().to_string()));
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(|ua| ua.to_string());

    RequestOrigin {
        ip_address,
        user_agent,
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for ClientOrigin {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientOrigin(origin_from_parts(
            &parts.headers,
            peer,
            state.config.trust_proxy_headers,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn proxied_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("pantry-cli/1.2"));
        headers
    }

    #[test]
    fn test_forwarded_for_wins_behind_trusted_proxy() {
        let peer = Some(SocketAddr::from(([127, 0, 0, 1], 9000)));
        let origin = origin_from_parts(&proxied_headers(), peer, true);
        assert_eq!(origin.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(origin.user_agent.as_deref(), Some("pantry-cli/1.2"));
    }

    #[test]
    fn test_forwarded_for_ignored_by_default() {
        let peer = Some(SocketAddr::from(([127, 0, 0, 1], 9000)));
        let origin = origin_from_parts(&proxied_headers(), peer, false);
        assert_eq!(origin.ip_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(origin.user_agent.as_deref(), Some("pantry-cli/1.2"));

        let origin = origin_from_parts(&proxied_headers(), None, false);
        assert!(origin.ip_address.is_none());
    }

    #[test]
    fn test_peer_address_without_port() {
        let peer = Some(SocketAddr::from(([192, 168, 1, 4], 5123)));
        let origin = origin_from_parts(&HeaderMap::new(), peer, true);
        assert_eq!(origin.ip_address.as_deref(), Some("192.168.1.4"));
        assert!(origin.user_agent.is_none());

        assert_eq!(origin_from_parts(&HeaderMap::new(), None, true), RequestOrigin::default());
    }
}
