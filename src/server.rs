//! HTTP front end for the serving proxy
//!
//! Routes:
//! - `GET /api/image?url=&size=[&skipCache=true][&format=]`
//! - `HEAD /api/image` answers from the cache only, redirecting on a miss
//! - `GET /metrics` Prometheus text exposition
//! - `GET /health`

use crate::error::{ImageCacheError, Result};
use crate::metrics;
use crate::serving::{ImageRequest, ImageResponse, ServingProxy, CACHE_CONTROL_IMMUTABLE};
use http::header::{HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::response::Builder;
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::Registry;
use reqwest::Url;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Image server
pub struct ImageServer {
    proxy: Arc<ServingProxy>,
    registry: Arc<Registry>,
}

impl ImageServer {
    pub fn new(proxy: Arc<ServingProxy>, registry: Arc<Registry>) -> Self {
        Self { proxy, registry }
    }

    /// Bind `addr` and serve until the process ends
    pub async fn start(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ImageCacheError::ConfigError(format!("Failed to bind {}: {}", addr, e))
        })?;
        info!("Image server listening on http://{}", addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.map_err(|e| {
                ImageCacheError::InternalError(format!("Failed to accept connection: {}", e))
            })?;
            let io = TokioIo::new(stream);
            let proxy = Arc::clone(&self.proxy);
            let registry = Arc::clone(&self.registry);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let proxy = Arc::clone(&proxy);
                    let registry = Arc::clone(&registry);
                    async move { handle_request(req, proxy, registry).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection from {}: {:?}", peer, err);
                }
            });
        }
    }
}

/// Handle incoming HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    proxy: Arc<ServingProxy>,
    registry: Arc<Registry>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"));
    }

    let response = match req.uri().path() {
        "/api/image" if req.method() == Method::HEAD => {
            let request = parse_image_query(req.uri().query());
            debug!("HEAD image request url={} size={}", request.url, request.size);
            head_response(image_response(proxy.peek(&request).await))
        }
        "/api/image" => {
            let request = parse_image_query(req.uri().query());
            debug!("Image request url={} size={}", request.url, request.size);
            image_response(proxy.handle(&request).await)
        }
        "/metrics" => metrics_response(&registry),
        "/health" => health_response(),
        _ => text_response(StatusCode::NOT_FOUND, "404 Not Found"),
    };
    Ok(response)
}

/// Decode the `/api/image` query string
///
/// Missing parameters become empty values and are rejected by the proxy.
pub fn parse_image_query(query: Option<&str>) -> ImageRequest {
    let mut request = ImageRequest::default();
    let Ok(mut parsed) = Url::parse("http://localhost/") else {
        return request;
    };
    parsed.set_query(query);

    for (name, value) in parsed.query_pairs() {
        match name.as_ref() {
            "url" => request.url = value.into_owned(),
            "size" => request.size = value.into_owned(),
            "skipCache" => request.skip_cache = matches!(value.as_ref(), "true" | "1"),
            "format" => request.format = Some(value.into_owned()),
            _ => {}
        }
    }
    request
}

fn image_response(response: ImageResponse) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(response.status()).unwrap_or(StatusCode::OK);
    match response {
        ImageResponse::Image {
            data,
            content_type,
            cache_status,
        } => build(
            Response::builder()
                .status(status)
                .header(CONTENT_TYPE, content_type)
                .header(CACHE_CONTROL, CACHE_CONTROL_IMMUTABLE)
                .header("X-Cache", cache_status.as_str()),
            data,
        ),
        ImageResponse::Redirect { location } => build(
            Response::builder()
                .status(status)
                .header(LOCATION, location),
            Bytes::new(),
        ),
        ImageResponse::NotFound { message } | ImageResponse::BadRequest { message } => {
            text_response(status, &message)
        }
    }
}

/// Drop the body of a full response, keeping its length header
fn head_response(response: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
    let length = response.body().size_hint().exact().unwrap_or(0);
    let (mut parts, _) = response.into_parts();
    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    Response::from_parts(parts, Full::new(Bytes::new()))
}

fn metrics_response(registry: &Registry) -> Response<Full<Bytes>> {
    match metrics::encode_text(registry) {
        Ok(body) => build(
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8"),
            Bytes::from(body),
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}

fn health_response() -> Response<Full<Bytes>> {
    build(
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json"),
        Bytes::from_static(br#"{"status":"healthy"}"#),
    )
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    build(
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8"),
        Bytes::from(body.to_string()),
    )
}

/// Finish a response; a header value that fails to encode yields a bare 500
fn build(builder: Builder, body: Bytes) -> Response<Full<Bytes>> {
    builder.body(Full::new(body)).unwrap_or_else(|e| {
        error!("Failed to build response: {}", e);
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serving::CacheStatus;

    #[test]
    fn test_parse_image_query() {
        let request = parse_image_query(Some(
            "url=https%3A%2F%2Fbilder.vinmonopolet.no%2Fcache%2F300x300-0%2F1-1.jpg&size=small&skipCache=true&format=png",
        ));
        assert_eq!(request.url, "https://bilder.vinmonopolet.no/cache/300x300-0/1-1.jpg");
        assert_eq!(request.size, "small");
        assert!(request.skip_cache);
        assert_eq!(request.format.as_deref(), Some("png"));
    }

    #[test]
    fn test_parse_empty_query() {
        let request = parse_image_query(None);
        assert!(request.url.is_empty());
        assert!(!request.skip_cache);
    }

    #[test]
    fn test_image_response_headers() {
        let response = image_response(ImageResponse::Image {
            data: Bytes::from_static(b"abc"),
            content_type: "image/webp".to_string(),
            cache_status: CacheStatus::Hit,
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "HIT");
        assert_eq!(response.headers()[CACHE_CONTROL], CACHE_CONTROL_IMMUTABLE);
        assert_eq!(response.headers()[CONTENT_TYPE], "image/webp");
    }

    #[test]
    fn test_redirect_response() {
        let response = image_response(ImageResponse::Redirect {
            location: "https://bilder.vinmonopolet.no/cache/300x300-0/1-1.jpg".to_string(),
        });
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[LOCATION],
            "https://bilder.vinmonopolet.no/cache/300x300-0/1-1.jpg"
        );
    }

    #[test]
    fn test_head_response_keeps_length_without_body() {
        let response = head_response(image_response(ImageResponse::Image {
            data: Bytes::from_static(b"abcdef"),
            content_type: "image/webp".to_string(),
            cache_status: CacheStatus::Hit,
        }));
        assert_eq!(response.headers()[CONTENT_LENGTH], "6");
        assert_eq!(response.headers()["x-cache"], "HIT");
        assert_eq!(response.body().size_hint().exact(), Some(0));
    }

    #[test]
    fn test_health_response() {
        assert_eq!(health_response().status(), StatusCode::OK);
    }
}
