use image::{DynamicImage, ImageFormat, RgbImage};
use product_image_cache::{
    AuditSummary, CacheKeyCodec, CacheStore, ImageCacheConfig, ImagePipeline, ImageVariant,
    IntegrityAuditor,
};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const IMAGE_PATH: &str = "/cache/515x515-0/777-1.jpg";

fn png_bytes() -> Vec<u8> {
    let img = RgbImage::from_fn(640, 480, |x, y| image::Rgb([(x % 251) as u8, (y % 241) as u8, 7]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

async fn setup() -> (MockServer, TempDir, ImageCacheConfig, Arc<ImagePipeline>) {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let mut config = ImageCacheConfig::default();
    config.cache_root = dir.path().display().to_string();
    config.origin.scheme = "http".to_string();
    config.origin.host = server.address().to_string();
    config.origin.retry_delay_ms = 10;
    config.audit.variants = vec![ImageVariant::Medium];

    let pipeline = Arc::new(ImagePipeline::from_config(&config).unwrap());
    (server, dir, config, pipeline)
}

#[tokio::test]
async fn test_corrupted_blob_is_restored_from_origin() {
    let (server, _dir, config, pipeline) = setup().await;
    Mock::given(method("GET"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png_bytes(), "image/png"))
        .expect(2)
        .mount(&server)
        .await;

    let url = format!("{}{}", config.origin.base_url(), IMAGE_PATH);
    let key = CacheKeyCodec::key(&url).unwrap();
    let original = pipeline.refresh(&url, ImageVariant::Medium).await.unwrap();

    // Flip bytes in the stored blob
    let blob_path = pipeline.store.blob_path(&key, ImageVariant::Medium);
    let mut data = std::fs::read(&blob_path).unwrap();
    for byte in data.iter_mut().skip(32).take(64) {
        *byte ^= 0x5A;
    }
    std::fs::write(&blob_path, &data).unwrap();

    let summary = IntegrityAuditor::new(Arc::clone(&pipeline), config.audit.clone())
        .audit()
        .await
        .unwrap();

    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.corrupted_found, 1);
    assert_eq!(summary.repaired, 1);
    assert_eq!(summary.repair_failed, 0);

    let restored = pipeline
        .store
        .read(&key, ImageVariant::Medium)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(CacheStore::checksum(&restored.data), restored.metadata.checksum);
    assert_eq!(restored.metadata.checksum, original.checksum);
}

#[tokio::test]
async fn test_repair_failure_is_counted() {
    let (server, _dir, config, pipeline) = setup().await;
    Mock::given(method("GET"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png_bytes(), "image/png"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let url = format!("{}{}", config.origin.base_url(), IMAGE_PATH);
    let key = CacheKeyCodec::key(&url).unwrap();
    pipeline.refresh(&url, ImageVariant::Medium).await.unwrap();
    std::fs::write(pipeline.store.blob_path(&key, ImageVariant::Medium), b"garbage").unwrap();

    // Origin is gone now
    let summary = IntegrityAuditor::new(Arc::clone(&pipeline), config.audit.clone())
        .audit()
        .await
        .unwrap();

    assert_eq!(summary.corrupted_found, 1);
    assert_eq!(summary.repaired, 0);
    assert_eq!(summary.repair_failed, 1);
}

#[tokio::test]
async fn test_repair_disabled_only_reports() {
    let (server, _dir, mut config, pipeline) = setup().await;
    Mock::given(method("GET"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png_bytes(), "image/png"))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}{}", config.origin.base_url(), IMAGE_PATH);
    let key = CacheKeyCodec::key(&url).unwrap();
    pipeline.refresh(&url, ImageVariant::Medium).await.unwrap();
    std::fs::write(pipeline.store.blob_path(&key, ImageVariant::Medium), b"garbage").unwrap();

    config.audit.repair = false;
    let summary = IntegrityAuditor::new(pipeline, config.audit.clone())
        .audit()
        .await
        .unwrap();

    assert_eq!(
        summary,
        AuditSummary {
            scanned: 1,
            corrupted_found: 1,
            total_bytes: 7,
            ..AuditSummary::default()
        }
    );
}
