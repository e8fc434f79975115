use image::{DynamicImage, ImageFormat, RgbImage};
use product_image_cache::{
    CacheKeyCodec, CacheStatus, ImageCacheConfig, ImagePipeline, ImageRequest, ImageResponse,
    ImageServer, ImageVariant, ServingMetrics, ServingProxy,
};
use prometheus::Registry;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const IMAGE_PATH: &str = "/cache/300x300-0/4242-1.jpg";

fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 200) as u8, (y % 180) as u8, 120])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

fn test_config(server: &MockServer, root: &Path) -> ImageCacheConfig {
    let mut config = ImageCacheConfig::default();
    config.cache_root = root.display().to_string();
    config.origin.scheme = "http".to_string();
    config.origin.host = server.address().to_string();
    config.origin.retry_delay_ms = 10;
    config
}

fn proxy(config: &ImageCacheConfig) -> ServingProxy {
    let pipeline = Arc::new(ImagePipeline::from_config(config).unwrap());
    ServingProxy::new(pipeline, config.server.clone(), config.origin.url_prefix())
}

fn image_url(config: &ImageCacheConfig) -> String {
    format!("{}{}", config.origin.base_url(), IMAGE_PATH)
}

async fn mount_image(server: &MockServer) {
    Mock::given(method("HEAD"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw(jpeg_bytes(600, 400), "image/jpeg"))
        .mount(server)
        .await;
}

fn cache_status(response: &ImageResponse) -> Option<CacheStatus> {
    match response {
        ImageResponse::Image { cache_status, .. } => Some(*cache_status),
        _ => None,
    }
}

#[tokio::test]
async fn test_miss_then_hit() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());
    mount_image(&server).await;

    let proxy = proxy(&config);
    let request = ImageRequest::new(image_url(&config), "small");

    let first = proxy.handle(&request).await;
    assert_eq!(cache_status(&first), Some(CacheStatus::Miss));
    let ImageResponse::Image { data, content_type, .. } = &first else {
        panic!("expected image, got {:?}", first);
    };
    assert_eq!(content_type, "image/webp");
    let decoded = image::load_from_memory(data).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (300, 200));

    server.reset().await;
    let second = proxy.handle(&request).await;
    assert_eq!(cache_status(&second), Some(CacheStatus::Hit));
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(proxy.inflight_count(), 0);
}

#[tokio::test]
async fn test_fetch_failure_redirects_to_exact_url() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());

    Mock::given(method("HEAD"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let url = image_url(&config);
    let response = proxy(&config)
        .handle(&ImageRequest::new(url.clone(), "small"))
        .await;

    assert_eq!(response, ImageResponse::Redirect { location: url });
}

#[tokio::test]
async fn test_absent_head_is_not_found_without_fetch() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());

    Mock::given(method("HEAD"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let url = image_url(&config);
    let proxy = proxy(&config);
    let response = proxy.handle(&ImageRequest::new(url.clone(), "small")).await;
    assert_eq!(response.status(), 404);
    assert!(proxy.placeholders().is_placeholder(&url));

    // Every miss asks the origin again
    let again = proxy.handle(&ImageRequest::new(url, "small")).await;
    assert_eq!(again.status(), 404);
}

#[tokio::test]
async fn test_image_published_after_absence_is_served() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());

    Mock::given(method("HEAD"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_image(&server).await;

    let url = image_url(&config);
    let proxy = proxy(&config);
    let first = proxy.handle(&ImageRequest::new(url.clone(), "small")).await;
    assert_eq!(first.status(), 404);

    let second = proxy.handle(&ImageRequest::new(url.clone(), "small")).await;
    assert_eq!(cache_status(&second), Some(CacheStatus::Miss));
    assert!(!proxy.placeholders().is_placeholder(&url));

    let heads = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.to_string() == "HEAD")
        .count();
    assert_eq!(heads, 2);
}

#[tokio::test]
async fn test_get_not_found_after_head_success_redirects() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());

    Mock::given(method("HEAD"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(404))
        .expect(3)
        .mount(&server)
        .await;

    let url = image_url(&config);
    let proxy = proxy(&config);
    let response = proxy.handle(&ImageRequest::new(url.clone(), "small")).await;

    assert_eq!(response, ImageResponse::Redirect { location: url.clone() });
    assert!(!proxy.placeholders().is_placeholder(&url));
}

#[tokio::test]
async fn test_bad_variant_is_rejected() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());

    let response = proxy(&config)
        .handle(&ImageRequest::new(image_url(&config), "gigantic"))
        .await;

    assert_eq!(response.status(), 400);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_skip_cache_does_not_store() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());
    mount_image(&server).await;

    let proxy = proxy(&config);
    let url = image_url(&config);
    let mut request = ImageRequest::new(url.clone(), "small");
    request.skip_cache = true;

    let response = proxy.handle(&request).await;
    assert_eq!(cache_status(&response), Some(CacheStatus::Miss));

    let key = CacheKeyCodec::key(&url).unwrap();
    let pipeline = ImagePipeline::from_config(&config).unwrap();
    assert!(!pipeline.store.exists(&key, ImageVariant::Small).await);
}

#[tokio::test]
async fn test_other_format_bypasses_cache() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());
    mount_image(&server).await;

    let proxy = proxy(&config);
    let url = image_url(&config);
    let mut request = ImageRequest::new(url.clone(), "small");
    request.format = Some("png".to_string());

    let response = proxy.handle(&request).await;
    let ImageResponse::Image { content_type, cache_status, .. } = response else {
        panic!("expected image");
    };
    assert_eq!(content_type, "image/png");
    assert_eq!(cache_status, CacheStatus::Miss);

    let key = CacheKeyCodec::key(&url).unwrap();
    let pipeline = ImagePipeline::from_config(&config).unwrap();
    assert!(!pipeline.store.exists(&key, ImageVariant::Small).await);
}

#[tokio::test]
async fn test_stale_entry_served_when_refresh_fails() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&server, dir.path());
    config.server.serve_stale_on_error = true;
    mount_image(&server).await;

    let url = image_url(&config);
    let key = CacheKeyCodec::key(&url).unwrap();
    let pipeline = ImagePipeline::from_config(&config).unwrap();
    let mut metadata = pipeline.refresh(&url, ImageVariant::Small).await.unwrap();

    // Age the entry past the TTL
    metadata.cached_at = 1;
    pipeline
        .store
        .write_metadata(&key, ImageVariant::Small, &metadata)
        .await
        .unwrap();

    server.reset().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let response = proxy(&config)
        .handle(&ImageRequest::new(url.clone(), "small"))
        .await;
    assert_eq!(cache_status(&response), Some(CacheStatus::Stale));

    // Without the option the same failure redirects
    config.server.serve_stale_on_error = false;
    let response = proxy(&config)
        .handle(&ImageRequest::new(url.clone(), "small"))
        .await;
    assert_eq!(response, ImageResponse::Redirect { location: url });
}

#[tokio::test]
async fn test_storage_failure_still_serves_image() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("not-a-dir");
    std::fs::write(&root, b"file").unwrap();
    let config = test_config(&server, &root);
    mount_image(&server).await;

    let response = proxy(&config)
        .handle(&ImageRequest::new(image_url(&config), "small"))
        .await;

    assert_eq!(cache_status(&response), Some(CacheStatus::Miss));
}

#[tokio::test]
async fn test_http_server_end_to_end() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());
    mount_image(&server).await;

    let registry = Arc::new(Registry::new());
    let metrics = ServingMetrics::with_registry(&registry).unwrap();
    let proxy = Arc::new(proxy(&config).with_metrics(metrics));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(ImageServer::new(proxy, registry).serve(listener));

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let endpoint = format!("http://{}/api/image", addr);
    let url = image_url(&config);

    // HEAD never reaches the origin
    let response = client
        .head(&endpoint)
        .query(&[("url", url.as_str()), ("size", "small")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 302);
    assert_eq!(response.headers()["location"], url.as_str());
    assert!(server.received_requests().await.unwrap().is_empty());

    let response = client
        .get(&endpoint)
        .query(&[("url", url.as_str()), ("size", "small")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-cache"], "MISS");
    assert_eq!(response.headers()["cache-control"], "public, max-age=31536000");
    assert_eq!(response.headers()["content-type"], "image/webp");

    let response = client
        .get(&endpoint)
        .query(&[("url", url.as_str()), ("size", "small")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["x-cache"], "HIT");

    let response = client
        .head(&endpoint)
        .query(&[("url", url.as_str()), ("size", "small")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-cache"], "HIT");
    assert_eq!(response.headers()["content-type"], "image/webp");

    // Origin reports the image but fails to deliver it
    let broken = format!("{}/cache/300x300-0/5151-1.jpg", config.origin.base_url());
    Mock::given(method("HEAD"))
        .and(path("/cache/300x300-0/5151-1.jpg"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cache/300x300-0/5151-1.jpg"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    let response = client
        .get(&endpoint)
        .query(&[("url", broken.as_str()), ("size", "small")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 302);
    assert_eq!(response.headers()["location"], broken.as_str());

    let response = client
        .get(&endpoint)
        .query(&[("size", "small")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let health = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    let text = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("image_cache_requests_total{outcome=\"hit\"} 1"));
    assert!(text.contains("image_cache_requests_total{outcome=\"miss\"} 1"));
    assert!(text.contains("image_cache_requests_total{outcome=\"redirect\"} 1"));
}
