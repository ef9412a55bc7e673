use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aperture_core::clock::VirtualClock;
use aperture_server::{http::router, AppState};
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use blob_store::BlobStore;
use pipeline::{Pipeline, PipelineConfig};
use result_cache::ResultCache;
use signer::Signer;
use tower::ServiceExt;

const API_KEY: &str = "pw";

struct Harness {
    app: Router,
    state: AppState,
    clock: Arc<VirtualClock>,
    _dir: tempfile::TempDir,
}

fn harness(unsafe_mode: bool, auto_webp: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
    let clock = Arc::new(VirtualClock::new(now));
    let store = BlobStore::open(blob_store::Config::new(
        dir.path().join("uploads"),
        dir.path().join("index"),
    ))
    .unwrap();
    let cache = ResultCache::new(dir.path().join("cache"), Duration::from_secs(600), clock.clone())
        .unwrap();
    let signer = Signer::new(API_KEY, "sekrit", clock.clone());
    let pipeline = Pipeline::new(
        PipelineConfig { allow_unsafe: unsafe_mode, auto_webp, ..PipelineConfig::default() },
        store.clone(),
        cache.clone(),
        signer.clone(),
    )
    .unwrap();
    let state = AppState {
        store,
        signer,
        pipeline,
        cache,
        cache_control: "public, max-age=600, stale-while-revalidate=60".to_string(),
        default_page_limit: 100,
    };
    Harness { app: router(state.clone()), state, clock, _dir: dir }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec();
    (status, headers, body)
}

fn put(uri: &str, body: &[u8]) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("x-api-key", API_KEY)
        .header("content-length", body.len().to_string())
        .body(Body::from(body.to_vec()))
        .unwrap()
}

fn get_with_key(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).header("x-api-key", API_KEY).body(Body::empty()).unwrap()
}

fn get_anon(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn scenario_1_put_then_get_with_md5() {
    let h = harness(false, false);
    let (status, _, _) = send(&h.app, put("/files/a/b.jpg", b"hello world!")).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, headers, body) = send(&h.app, get_with_key("/files/a/b.jpg")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello world!");
    assert_eq!(headers.get("content-md5").unwrap(), "fc3ff98e8c6a0d3087d515c0473f8677");
    assert_eq!(headers.get("content-length").unwrap(), "12");
}

#[tokio::test]
async fn scenario_2_signed_url_lifecycle() {
    let h = harness(false, false);
    send(&h.app, put("/files/a/b.jpg", b"hello world!")).await;

    // no credentials at all
    let (status, _, _) = send(&h.app, get_anon("/files/a/b.jpg")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // mint a signed URL with the API key
    let (status, _, body) = send(&h.app, get_with_key("/sign/files/a/b.jpg")).await;
    assert_eq!(status, StatusCode::OK);
    let signed_url = String::from_utf8(body).unwrap();
    assert!(signed_url.starts_with("/files/a/b.jpg?"));

    // the signed URL works without the key...
    let (status, _, body) = send(&h.app, get_anon(&signed_url)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello world!");

    // ...within the hour
    h.clock.advance_ms(60 * 60 * 1000);
    let (status, _, _) = send(&h.app, get_anon(&signed_url)).await;
    assert_eq!(status, StatusCode::OK);

    // one past the hour it is expired
    h.clock.advance_ms(1);
    let (status, _, _) = send(&h.app, get_anon(&signed_url)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // a tampered signature never passes
    let broken = signed_url.replace("x-signature=", "x-signature=Q");
    let (status, _, _) = send(&h.app, get_anon(&broken)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn scenario_3_hard_delete() {
    let h = harness(false, false);
    send(&h.app, put("/files/a/b.jpg", b"hello world!")).await;
    let blob_path = h.state.store.blob_path(b"a/b.jpg");
    assert!(blob_path.exists());

    let req = Request::builder()
        .method("DELETE")
        .uri("/files/a/b.jpg")
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = send(&h.app, get_with_key("/files/a/b.jpg")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!blob_path.exists());
}

#[tokio::test]
async fn scenario_4_soft_delete_and_unlinked_listing() {
    let h = harness(false, false);
    send(&h.app, put("/files/a/b.jpg", b"hello world!")).await;

    let req = Request::builder()
        .method("DELETE")
        .uri("/files/a/b.jpg?unlink=true")
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, body) =
        send(&h.app, get_with_key("/files?unlinked=true&prefix=a/")).await;
    assert_eq!(status, StatusCode::OK);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["keys"], serde_json::json!(["a/b.jpg"]));

    let (_, _, body) = send(&h.app, get_with_key("/files?prefix=a/")).await;
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["keys"], serde_json::json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_5_concurrent_puts_conflict() {
    let h = harness(false, false);

    // First writer's body is gated so it stays in flight.
    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
    let gated = Body::from_stream(futures_util::stream::once(async move {
        gate_rx.await.ok();
        Ok::<_, std::io::Error>(axum::body::Bytes::from_static(b"first body!!"))
    }));
    let first_req = Request::builder()
        .method("PUT")
        .uri("/files/x")
        .header("x-api-key", API_KEY)
        .header("content-length", "12")
        .body(gated)
        .unwrap();
    let first = {
        let app = h.app.clone();
        tokio::spawn(async move { app.oneshot(first_req).await.unwrap().status() })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, _, _) = send(&h.app, put("/files/x", b"second body!")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    gate_tx.send(()).unwrap();
    assert_eq!(first.await.unwrap(), StatusCode::CREATED);

    // stored bytes are exactly the winner's
    let (status, _, body) = send(&h.app, get_with_key("/files/x")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"first body!!");
}

#[tokio::test]
async fn scenario_6_serve_resizes_an_uploaded_png() {
    let h = harness(true, false);
    let png = test_png(200, 200);
    send(&h.app, put("/files/a/b.png", &png)).await;

    let (status, headers, body) = send(&h.app, get_anon("/serve/unsafe/100x100/blob/a/b.png")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "image/png");
    assert_eq!(
        headers.get("cache-control").unwrap(),
        "public, max-age=600, stale-while-revalidate=60"
    );
    let img = image::load_from_memory(&body).unwrap();
    use image::GenericImageView as _;
    assert_eq!(img.dimensions(), (100, 100));
}

#[tokio::test]
async fn serve_negotiates_webp_when_enabled() {
    let h = harness(true, true);
    let png = test_png(64, 64);
    send(&h.app, put("/files/pic.png", &png)).await;

    let req = Request::builder()
        .method("GET")
        .uri("/serve/unsafe/32x32/blob/pic.png")
        .header("accept", "image/webp,image/*;q=0.8")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "image/webp");
    assert_eq!(&body[..4], b"RIFF");
}

#[tokio::test]
async fn serve_meta_reports_dimensions() {
    let h = harness(true, false);
    let png = test_png(120, 60);
    send(&h.app, put("/files/pic.png", &png)).await;

    let (status, headers, body) =
        send(&h.app, get_anon("/serve/unsafe/meta/60x30/blob/pic.png")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["width"], 60);
    assert_eq!(v["height"], 30);
    assert_eq!(v["orientation"], "landscape");
}

#[tokio::test]
async fn list_pagination_mints_a_working_next_page() {
    let h = harness(false, false);
    for key in ["k1", "k2", "k3", "k4", "k5"] {
        send(&h.app, put(&format!("/files/{key}"), b"v")).await;
    }

    let (status, _, body) = send(&h.app, get_with_key("/files?prefix=k&limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["keys"], serde_json::json!(["k1", "k2"]));
    assert_eq!(v["has_more"], true);
    let next = v["next_page"].as_str().unwrap().to_string();
    assert!(!next.is_empty());

    // the next page link is signed: it works without the API key
    let (status, _, body) = send(&h.app, get_anon(&next)).await;
    assert_eq!(status, StatusCode::OK);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["keys"], serde_json::json!(["k3", "k4"]));

    // final page reports no continuation
    let (_, _, body) = send(&h.app, get_with_key("/files?prefix=k&limit=2&starting_at=k5")).await;
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["keys"], serde_json::json!(["k5"]));
    assert_eq!(v["has_more"], false);
    assert_eq!(v["next_page"], "");
}

#[tokio::test]
async fn put_without_content_length_is_411() {
    let h = harness(false, false);
    let req = Request::builder()
        .method("PUT")
        .uri("/files/k")
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::LENGTH_REQUIRED);
}

#[tokio::test]
async fn sign_requires_the_api_key() {
    let h = harness(false, false);
    let (status, _, _) = send(&h.app, get_anon("/sign/files/a/b.jpg")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .method("GET")
        .uri("/sign/files/a/b.jpg")
        .header("x-api-key", "wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sign_rejects_unknown_surfaces() {
    let h = harness(false, false);
    let (status, _, _) = send(&h.app, get_with_key("/sign/other/x")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

fn test_png(w: u32, h: u32) -> Vec<u8> {
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(w, h, |x, y| {
        Rgba([(x % 199) as u8, (y % 193) as u8, 77, 255])
    }));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}
