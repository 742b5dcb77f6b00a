//! Handler-level tests driven through the router with `tower::ServiceExt`.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use blobmirror_cache::{Cache, CacheBuilder};
use blobmirror_core::ObjectStoreBlob;
use blobmirror_server::{AppState, build_router, config::Settings};
use object_store::{ObjectStore, PutPayload, memory::InMemory, path::Path as StorePath};
use regex::Regex;
use tempfile::TempDir;
use tower::ServiceExt;

struct Mirror {
    router: Router,
    cache: Arc<Cache>,
    _dir: TempDir,
}

async fn setup(settings: Settings) -> Mirror {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemory::new());
    for (key, body) in [
        ("a/b.bin", vec![7u8; 1000]),
        ("404.html", b"<h1>gone</h1>".to_vec()),
        ("index.html", b"<h1>downloads</h1>".to_vec()),
        ("notes/page.html", b"<p>notes</p>".to_vec()),
    ] {
        store
            .put(&StorePath::from(key), PutPayload::from(body))
            .await
            .unwrap();
    }

    let blob = ObjectStoreBlob::new(store as Arc<dyn ObjectStore>);
    let cache = Arc::new(
        CacheBuilder::new(dir.path())
            .with_trigger_debounce(Duration::from_millis(25))
            .build(Arc::new(blob))
            .unwrap(),
    );
    let router = build_router(AppState {
        cache: Arc::clone(&cache),
        settings: Arc::new(settings),
    });
    Mirror {
        router,
        cache,
        _dir: dir,
    }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, header::HeaderMap, Vec<u8>) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let res = router.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

async fn post_reload(router: &Router, api_key: Option<&str>, body: &str) -> StatusCode {
    let mut req = Request::builder()
        .method("POST")
        .uri("/reload")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(api_key) = api_key {
        req = req.header("X-API-KEY", api_key);
    }
    let req = req.body(Body::from(body.to_string())).unwrap();
    router.clone().oneshot(req).await.unwrap().status()
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_blob_with_headers() {
    let mirror = setup(Settings::default()).await;

    let (status, headers, body) = get(&mirror.router, "/a/b.bin").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_LENGTH], "1000");
    assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=86399");
    assert_eq!(body, vec![7u8; 1000]);

    // second hit is served from the cache
    let (status, _, body) = get(&mirror.router, "/a/b.bin").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, vec![7u8; 1000]);

    let item = mirror.cache.get("a/b.bin").unwrap();
    assert!(item.download().await.unwrap());
    assert_eq!(mirror.cache.current_size(), 1000);

    mirror.cache.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_key_is_plain_404() {
    let mirror = setup(Settings::default()).await;

    let (status, _, body) = get(&mirror.router, "/definitely/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.is_empty());
    assert_eq!(mirror.cache.not_found_count(), 1);

    mirror.cache.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_key_serves_substitute_body() {
    let mirror = setup(Settings {
        not_found_key: Some("404.html".to_string()),
        ..Settings::default()
    })
    .await;

    let (status, headers, body) = get(&mirror.router, "/definitely/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers[header::CONTENT_TYPE], "text/html; charset=utf-8");
    assert_eq!(body, b"<h1>gone</h1>");

    mirror.cache.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn no_cache_pattern_disables_client_caching() {
    let mirror = setup(Settings {
        no_cache: Some(Regex::new(r"\.html$").unwrap()),
        ..Settings::default()
    })
    .await;

    let (status, headers, _) = get(&mirror.router, "/notes/page.html").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CACHE_CONTROL], "private, no-cache, no-store");

    let (_, headers, _) = get(&mirror.router, "/a/b.bin").await;
    assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=86399");

    mirror.cache.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn index_pattern_rewrites_to_index_key() {
    let mirror = setup(Settings {
        index_key: Some("index.html".to_string()),
        index_match: Some(Regex::new(r"^latest/?$").unwrap()),
        ..Settings::default()
    })
    .await;

    let (status, headers, body) = get(&mirror.router, "/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "text/html; charset=utf-8");
    assert_eq!(body, b"<h1>downloads</h1>");

    mirror.cache.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn root_redirects_when_configured() {
    let mirror = setup(Settings {
        redirect: Some("https://downloads.example.com/".to_string()),
        ..Settings::default()
    })
    .await;
    let (status, headers, _) = get(&mirror.router, "/").await;
    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(headers[header::LOCATION], "https://downloads.example.com/");
    mirror.cache.close().await;

    let mirror = setup(Settings::default()).await;
    let (status, _, _) = get(&mirror.router, "/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    mirror.cache.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn robots_denies_everything() {
    let mirror = setup(Settings::default()).await;
    let (status, _, body) = get(&mirror.router, "/robots.txt").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"User-agent: *\nDisallow: /\n");
    mirror.cache.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_requires_the_api_key() {
    let mirror = setup(Settings {
        api_key: Some("sekrit".to_string()),
        ..Settings::default()
    })
    .await;

    // prime the cache
    let (status, _, _) = get(&mirror.router, "/a/b.bin").await;
    assert_eq!(status, StatusCode::OK);
    let item = mirror.cache.get("a/b.bin").unwrap();

    let status = post_reload(&mirror.router, Some("wrong"), r#"["a/b.bin"]"#).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let status = post_reload(&mirror.router, None, r#"["a/b.bin"]"#).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(item.ptr_eq(&mirror.cache.get("a/b.bin").unwrap()));

    let status = post_reload(&mirror.router, Some("sekrit"), r#"["a/b.bin"]"#).await;
    assert_eq!(status, StatusCode::OK);

    // the item was evicted and the next request fetches it anew
    let fresh = mirror.cache.get("a/b.bin").unwrap();
    assert!(!item.ptr_eq(&fresh));
    let (status, _, body) = get(&mirror.router, "/a/b.bin").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, vec![7u8; 1000]);

    mirror.cache.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_is_disabled_without_a_key() {
    let mirror = setup(Settings::default()).await;
    let status = post_reload(&mirror.router, Some("anything"), r#"[]"#).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    mirror.cache.close().await;
}
