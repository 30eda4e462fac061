//! Local proxy for forwarding tunneled requests

use std::time::{Duration, Instant};

use relaytap_shared::protocol::{is_valid_status, Headers, TunnelResponse};
use relaytap_shared::{Error, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::history::ExchangeOutcome;

/// Request headers that describe the tunnel hop rather than the request
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

/// Response headers that no longer apply once the body is fully buffered
const STRIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding"];

/// Issues HTTP calls against the local service
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    host: String,
    port: u16,
    timeout: Duration,
}

/// Result of a single forwarding attempt
#[derive(Debug, Clone)]
pub struct Forwarded {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub duration_ms: u64,
}

impl Forwarder {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Forward(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            host: host.into(),
            port,
            timeout,
        })
    }

    /// `host:port` of the local service
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward one request. Never fails: unreachable or misbehaving local
    /// services produce a synthetic 502.
    pub async fn forward(
        &self,
        method: &str,
        path: &str,
        headers: &Headers,
        body: Option<&[u8]>,
    ) -> Forwarded {
        let start = Instant::now();
        match self.try_forward(method, path, headers, body).await {
            Ok((status, headers, body)) => Forwarded {
                status,
                headers,
                body,
                duration_ms: elapsed_ms(start),
            },
            Err(reason) => {
                warn!("Forward {} {} to {} failed: {}", method, path, self.target(), reason);
                Forwarded::bad_gateway(&self.target(), &reason, elapsed_ms(start))
            }
        }
    }

    async fn try_forward(
        &self,
        method: &str,
        path: &str,
        headers: &Headers,
        body: Option<&[u8]>,
    ) -> std::result::Result<(u16, Headers, Vec<u8>), String> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| format!("invalid method {:?}", method))?;

        let mut outbound = headers.clone();
        strip_host(&mut outbound);
        strip_headers(&mut outbound, STRIPPED_REQUEST_HEADERS);

        let url = self.url_for(path);
        debug!("Forwarding {} {}", method, url);

        let mut request = self.client.request(method, url).headers(to_header_map(&outbound));
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        let response = request.send().await.map_err(|e| self.describe(e))?;
        let status = response.status().as_u16();
        if !is_valid_status(status) {
            return Err(format!("local service answered with invalid status {}", status));
        }

        let mut headers = collapse_headers(response.headers());
        strip_headers(&mut headers, STRIPPED_RESPONSE_HEADERS);

        let body = response.bytes().await.map_err(|e| self.describe(e))?;
        Ok((status, headers, body.to_vec()))
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("http://{}:{}{}", self.host, self.port, path)
        } else {
            format!("http://{}:{}/{}", self.host, self.port, path)
        }
    }

    fn describe(&self, err: reqwest::Error) -> String {
        if err.is_timeout() {
            format!("timed out after {}s waiting for {}", self.timeout.as_secs_f64(), self.target())
        } else if err.is_connect() {
            format!("could not connect to {}: {}", self.target(), err)
        } else {
            format!("request to {} failed: {}", self.target(), err)
        }
    }
}

impl Forwarded {
    fn bad_gateway(target: &str, reason: &str, duration_ms: u64) -> Self {
        let mut headers = Headers::new();
        headers.insert("content-type".to_string(), "text/plain; charset=utf-8".to_string());
        Self {
            status: 502,
            headers,
            body: format!("Bad Gateway: relaytap could not reach {}: {}", target, reason).into_bytes(),
            duration_ms,
        }
    }

    /// Inspector view of this result
    pub fn outcome(&self) -> ExchangeOutcome {
        ExchangeOutcome {
            status: self.status,
            headers: self.headers.clone(),
            body: (!self.body.is_empty()).then(|| self.body.clone()),
            duration_ms: self.duration_ms,
        }
    }

    /// Wire response correlated with `request_id`
    pub fn into_response(self, request_id: String) -> TunnelResponse {
        TunnelResponse {
            request_id,
            status: self.status,
            headers: self.headers,
            body: (!self.body.is_empty()).then_some(self.body),
        }
    }
}

/// Remove every `Host` header regardless of case
pub fn strip_host(headers: &mut Headers) {
    headers.retain(|name, _| !name.eq_ignore_ascii_case("host"));
}

fn strip_headers(headers: &mut Headers, names: &[&str]) {
    headers.retain(|name, _| !names.iter().any(|n| name.eq_ignore_ascii_case(n)));
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (k, v) in headers {
        match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!("Dropping unrepresentable header {:?}", k),
        }
    }
    map
}

/// Join repeated header values with ", "
fn collapse_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes()).to_string();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    headers
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderMap as AxumHeaders, StatusCode},
        routing::{get, post},
        Router,
    };

    async fn spawn_local_service() -> u16 {
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/teapot", get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }))
            .route(
                "/echo",
                post(|headers: AxumHeaders, body: String| async move {
                    let host = headers
                        .get("host")
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    ([("x-seen-host", host)], body)
                }),
            )
            .route(
                "/multi",
                get(|| async {
                    let mut headers = AxumHeaders::new();
                    headers.append("x-tag", "a".parse().unwrap());
                    headers.append("x-tag", "b".parse().unwrap());
                    (headers, "")
                }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_forward_success() {
        let port = spawn_local_service().await;
        let forwarder = Forwarder::new("127.0.0.1", port, Duration::from_secs(5)).unwrap();

        let result = forwarder.forward("GET", "/health", &Headers::new(), None).await;
        assert_eq!(result.status, 200);
        assert_eq!(result.body, b"ok");

        let response = result.into_response("r1".into());
        assert_eq!(response.request_id, "r1");
        assert_eq!(response.body.as_deref(), Some(&b"ok"[..]));
    }

    #[tokio::test]
    async fn test_non_2xx_is_relayed() {
        let port = spawn_local_service().await;
        let forwarder = Forwarder::new("127.0.0.1", port, Duration::from_secs(5)).unwrap();

        let result = forwarder.forward("GET", "/teapot", &Headers::new(), None).await;
        assert_eq!(result.status, 418);
        assert_eq!(result.body, b"short and stout");
    }

    #[tokio::test]
    async fn test_tunnel_host_is_not_forwarded() {
        let port = spawn_local_service().await;
        let forwarder = Forwarder::new("127.0.0.1", port, Duration::from_secs(5)).unwrap();

        let mut headers = Headers::new();
        headers.insert("HOST".into(), "demo.tunnel.example.com".into());
        headers.insert("content-type".into(), "text/plain".into());

        let result = forwarder.forward("POST", "/echo", &headers, Some(b"ping")).await;
        assert_eq!(result.status, 200);
        assert_eq!(result.body, b"ping");
        assert_eq!(result.headers.get("x-seen-host").unwrap(), &format!("127.0.0.1:{}", port));
    }

    #[tokio::test]
    async fn test_duplicate_response_headers_collapse() {
        let port = spawn_local_service().await;
        let forwarder = Forwarder::new("127.0.0.1", port, Duration::from_secs(5)).unwrap();

        let result = forwarder.forward("GET", "/multi", &Headers::new(), None).await;
        assert_eq!(result.headers.get("x-tag").map(String::as_str), Some("a, b"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_bad_gateway() {
        let port = closed_port().await;
        let forwarder = Forwarder::new("127.0.0.1", port, Duration::from_secs(5)).unwrap();

        let mut headers = Headers::new();
        headers.insert("content-type".into(), "application/json".into());
        let result = forwarder.forward("POST", "/webhooks/x", &headers, Some(b"{}")).await;

        assert_eq!(result.status, 502);
        assert!(!result.body.is_empty());
        assert!(String::from_utf8_lossy(&result.body).contains("Bad Gateway"));
    }

    #[tokio::test]
    async fn test_timeout_is_bad_gateway() {
        let port = spawn_local_service().await;
        let forwarder = Forwarder::new("127.0.0.1", port, Duration::from_millis(200)).unwrap();

        let result = forwarder.forward("GET", "/slow", &Headers::new(), None).await;
        assert_eq!(result.status, 502);
        assert!(String::from_utf8_lossy(&result.body).contains("timed out"));
    }

    #[tokio::test]
    async fn test_invalid_method_is_bad_gateway() {
        let port = spawn_local_service().await;
        let forwarder = Forwarder::new("127.0.0.1", port, Duration::from_secs(5)).unwrap();

        let result = forwarder.forward("BAD METHOD", "/health", &Headers::new(), None).await;
        assert_eq!(result.status, 502);
    }

    #[test]
    fn test_strip_host() {
        let mut headers = Headers::new();
        headers.insert("Host".into(), "a".into());
        headers.insert("hOsT".into(), "b".into());
        headers.insert("accept".into(), "*/*".into());

        strip_host(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));

        strip_host(&mut headers);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_url_for() {
        let forwarder = Forwarder::new("localhost", 3000, Duration::from_secs(1)).unwrap();
        assert_eq!(forwarder.url_for("/a?b=c"), "http://localhost:3000/a?b=c");
        assert_eq!(forwarder.url_for("a"), "http://localhost:3000/a");
    }
}
