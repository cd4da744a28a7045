mod common;

use std::sync::Arc;

use spider_intercept::prelude::*;
use spider_intercept::settings::{CachePolicyKind, CacheStorageKind};

use common::MockTransport;

fn cached_settings(dir: &std::path::Path, policy: CachePolicyKind) -> Settings {
    Settings {
        cache_enabled: true,
        cache_policy: policy,
        cache_storage: CacheStorageKind::Filesystem,
        cache_dir: Some(dir.to_path_buf()),
        ..Settings::default()
    }
}

async fn crawl(settings: Settings, transport: Arc<MockTransport>, urls: &[&str]) -> (RunReport, Arc<StatsCollector>) {
    let stats = Arc::new(StatsCollector::new());
    let chain = ChainBuilder::new(settings)
        .transport(transport.clone())
        .stats(stats.clone())
        .build()
        .unwrap();
    let dispatcher = Dispatcher::new(Arc::new(chain), transport);
    dispatcher.open().await.unwrap();
    let requests = urls.iter().map(|u| Request::get(u).unwrap());
    let report = dispatcher.run(requests, 4).await;
    dispatcher.close().await.unwrap();
    (report, stats)
}

#[tokio::test]
async fn dummy_policy_replays_a_crawl_without_network() {
    let dir = tempfile::tempdir().unwrap();
    let urls = ["http://example.com/a", "http://example.com/b"];

    let live = MockTransport::new();
    live.reply(urls[0], 200, &[("Content-Type", "text/html")], "<p>a</p>");
    live.reply(urls[1], 200, &[("Content-Type", "text/html")], "<p>b</p>");
    let (report, stats) = crawl(cached_settings(dir.path(), CachePolicyKind::Dummy), live.clone(), &urls).await;
    assert_eq!(report.responses.len(), 2);
    assert_eq!(live.calls(), 2);
    assert_eq!(stats.get("httpcache/store"), 2);

    let offline = MockTransport::new();
    let (report, stats) = crawl(cached_settings(dir.path(), CachePolicyKind::Dummy), offline.clone(), &urls).await;
    assert_eq!(offline.calls(), 0);
    assert_eq!(stats.get("httpcache/hit"), 2);
    assert_eq!(report.responses.len(), 2);
    for response in &report.responses {
        assert!(response.is_cached());
        let expected: &[u8] = if response.url.path() == "/a" { b"<p>a</p>" } else { b"<p>b</p>" };
        assert_eq!(&response.body[..], expected);
    }
}

#[tokio::test]
async fn ignore_missing_drops_uncached_requests_quietly() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        cache_ignore_missing: true,
        ..cached_settings(dir.path(), CachePolicyKind::Dummy)
    };
    let transport = MockTransport::new();

    let (report, stats) = crawl(settings, transport.clone(), &["http://example.com/never"]).await;

    assert_eq!(transport.calls(), 0);
    assert!(report.responses.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind(), FailureKind::Ignored);
    assert_eq!(stats.get("httpcache/ignore"), 1);
}

#[tokio::test]
async fn rfc2616_revalidates_stale_entries() {
    let dir = tempfile::tempdir().unwrap();
    let url = "http://example.com/doc";

    let transport = MockTransport::new();
    transport.reply(url, 200, &[("Cache-Control", "max-age=0"), ("ETag", "\"v1\"")], "first body");
    transport.reply(url, 304, &[("ETag", "\"v1\"")], "");

    let (report, _) = crawl(cached_settings(dir.path(), CachePolicyKind::Rfc2616), transport.clone(), &[url]).await;
    assert_eq!(&report.responses[0].body[..], b"first body");

    let (report, stats) = crawl(cached_settings(dir.path(), CachePolicyKind::Rfc2616), transport.clone(), &[url]).await;
    assert_eq!(transport.calls(), 2);
    let conditional = &transport.seen()[1];
    assert_eq!(conditional.headers["if-none-match"], "\"v1\"");

    let response = &report.responses[0];
    assert!(response.is_cached());
    assert_eq!(response.status, http::StatusCode::OK);
    assert_eq!(&response.body[..], b"first body");
    assert_eq!(stats.get("httpcache/revalidate"), 1);
}
