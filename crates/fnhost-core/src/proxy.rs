// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Streaming reverse proxy to a single backend address.
//!
//! Request and response bodies are streamed, never buffered. The request
//! path and query are forwarded verbatim, `Host` is rewritten to the
//! backend, hop-by-hop headers are dropped in both directions, and
//! `X-Forwarded-For` / `X-Forwarded-Host` are added.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri, header};
use axum::response::Response;
use futures::TryStreamExt;
use thiserror::Error;
use tracing::debug;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forwarding to the backend failed.
#[derive(Debug, Error)]
#[error("upstream request to {target} failed: {source}")]
pub struct ProxyError {
    /// Backend address.
    pub target: SocketAddr,
    /// Underlying client error.
    #[source]
    pub source: reqwest::Error,
}

impl ProxyError {
    /// Whether the backend refused or dropped the connection.
    pub fn is_connect(&self) -> bool {
        self.source.is_connect()
    }
}

/// HTTP client used for proxying: no system proxies, no redirects.
pub fn http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// Proxy handle for one backend.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    target: SocketAddr,
    client: reqwest::Client,
}

impl ReverseProxy {
    /// Create a proxy for `target` sharing `client`'s connection pool.
    pub fn new(target: SocketAddr, client: reqwest::Client) -> Self {
        Self { target, client }
    }

    /// Backend address.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Backend URL for an incoming request URI, keeping path and query.
    pub fn upstream_url(&self, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("http://{}{}", self.target, path_and_query)
    }

    /// Forward `req` to the backend and stream back its response.
    pub async fn forward(&self, req: Request) -> Result<Response, ProxyError> {
        let url = self.upstream_url(req.uri());
        let client_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let (parts, body) = req.into_parts();

        let mut headers = parts.headers;
        let original_host = headers.remove(header::HOST);
        strip_hop_by_hop(&mut headers);
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST.clone(), host);
        }
        if let Some(addr) = client_addr {
            append_forwarded_for(&mut headers, addr);
        }

        debug!(method = %parts.method, %url, "Proxying request");

        let mut upstream = self.client.request(parts.method, &url).headers(headers);
        // bodiless requests stay bodiless instead of going out chunked
        if !body.is_end_stream() {
            let stream = http_body_util::BodyStream::new(body)
                .map_ok(|frame| frame.into_data().unwrap_or_default());
            upstream = upstream.body(reqwest::Body::wrap_stream(stream));
        }

        let response = upstream.send().await.map_err(|source| ProxyError {
            target: self.target,
            source,
        })?;

        let status = response.status();
        let mut response_headers = response.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut out = Response::new(Body::from_stream(response.bytes_stream()));
        *out.status_mut() = status;
        *out.headers_mut() = response_headers;
        Ok(out)
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let client = addr.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {client}"),
        None => client,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
