//! Cache stage behavior against the in-memory store.

use std::sync::Arc;

use courier::client::conn::mock::{
    MemoryCacheStore, MockCodecFactory, MockExchange, MockSocketFactory, RecordingListener,
    StaticDns,
};
use courier::{Builder, Client, Request};

fn builder(factory: &Arc<MockCodecFactory>, store: &Arc<MemoryCacheStore>) -> Builder {
    Client::builder()
        .dns(Arc::new(StaticDns::new(&["10.0.0.1:80"])))
        .socket_factory(Arc::new(MockSocketFactory::default()))
        .codec_factory(factory.clone())
        .cache(store.clone())
}

async fn fetch(client: &Client, request: Request) -> (http::StatusCode, bytes::Bytes, http::HeaderMap) {
    let response = client.call(request).execute().await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().unwrap().collect().await.unwrap();
    (status, body, headers)
}

fn get(uri: &'static str) -> Request {
    Request::get(uri.parse().unwrap())
}

#[tokio::test]
async fn miss_then_hit() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MockCodecFactory::new();
    factory.enqueue(
        MockExchange::reply(200)
            .header("cache-control", "max-age=60")
            .header("content-type", "text/plain")
            .header("x-origin", "network")
            .body("cached payload"),
    );
    let store = MemoryCacheStore::new();
    let listener = RecordingListener::new();
    let client = builder(&factory, &store)
        .event_listener(listener.clone())
        .build();

    let (status, body, headers) = fetch(&client, get("http://example.com/doc")).await;
    assert_eq!(status, 200);
    assert_eq!(body, "cached payload");
    assert_eq!(store.entry_count(), 1);

    // Second fetch: served from cache, no network exchange.
    let (status, cached_body, cached_headers) = fetch(&client, get("http://example.com/doc")).await;
    assert_eq!(status, 200);
    assert_eq!(cached_body, body);
    assert_eq!(
        cached_headers.get("content-type"),
        headers.get("content-type")
    );
    assert_eq!(cached_headers.get("x-origin"), headers.get("x-origin"));

    assert_eq!(factory.recorded().len(), 1);
    assert_eq!(store.hit_count(), 1);
    assert!(listener.events().contains(&"cache_miss"));
    assert!(listener.events().contains(&"cache_hit"));
}

#[tokio::test]
async fn stale_entry_revalidates_and_merges_headers() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MockCodecFactory::new();
    factory.enqueue(
        MockExchange::reply(200)
            .header("cache-control", "max-age=0")
            .header("etag", "\"v1\"")
            .header("content-type", "text/plain")
            .body("payload v1"),
    );
    factory.enqueue(MockExchange::reply(304).header("cache-control", "max-age=120"));

    let store = MemoryCacheStore::new();
    let listener = RecordingListener::new();
    let client = builder(&factory, &store)
        .event_listener(listener.clone())
        .build();

    let (status, body, _) = fetch(&client, get("http://example.com/doc")).await;
    assert_eq!(status, 200);
    assert_eq!(body, "payload v1");

    // Stale on arrival: the second call revalidates conditionally.
    let (status, body, headers) = fetch(&client, get("http://example.com/doc")).await;
    assert_eq!(status, 200);
    assert_eq!(body, "payload v1", "body comes from the cache on a 304");
    // End-to-end headers refreshed from the network, content-specific
    // headers kept from the cache.
    assert_eq!(headers.get("cache-control").unwrap(), "max-age=120");
    assert_eq!(headers.get("content-type").unwrap(), "text/plain");
    assert_eq!(headers.get("etag").unwrap(), "\"v1\"");

    let recorded = factory.recorded();
    assert_eq!(recorded.len(), 2);
    assert_eq!(
        recorded[1].headers.get("if-none-match").unwrap(),
        "\"v1\""
    );

    assert_eq!(store.conditional_hit_count(), 1);
    assert!(listener.events().contains(&"cache_conditional_hit"));
    assert!(listener.events().contains(&"cache_hit"));

    // The entry was updated: a third call is now a direct hit.
    let (_, body, _) = fetch(&client, get("http://example.com/doc")).await;
    assert_eq!(body, "payload v1");
    assert_eq!(factory.recorded().len(), 2);
}

#[tokio::test]
async fn only_if_cached_miss_synthesizes_504() {
    let factory = MockCodecFactory::new();
    let store = MemoryCacheStore::new();
    let listener = RecordingListener::new();
    let client = builder(&factory, &store)
        .event_listener(listener.clone())
        .build();

    let request = Request::builder()
        .uri("http://example.com/doc".parse().unwrap())
        .header("cache-control", "only-if-cached")
        .build()
        .unwrap();

    let response = client.call(request).execute().await.unwrap();
    assert_eq!(response.status(), 504);
    assert_eq!(factory.recorded().len(), 0, "no network exchange happened");
    assert!(listener.events().contains(&"satisfaction_failure"));
}

#[tokio::test]
async fn invalidating_method_removes_the_entry() {
    let factory = MockCodecFactory::new();
    factory.enqueue(
        MockExchange::reply(200)
            .header("cache-control", "max-age=60")
            .body("v1"),
    );
    factory.enqueue(MockExchange::reply(200).body("posted"));
    let store = MemoryCacheStore::new();
    let client = builder(&factory, &store).build();

    let (_, body, _) = fetch(&client, get("http://example.com/doc")).await;
    assert_eq!(body, "v1");
    assert_eq!(store.entry_count(), 1);

    let post = Request::builder()
        .method(http::Method::POST)
        .uri("http://example.com/doc".parse().unwrap())
        .body("data")
        .build()
        .unwrap();
    let (status, _, _) = fetch(&client, post).await;
    assert_eq!(status, 200);

    assert_eq!(store.entry_count(), 0, "successful POST invalidated the entry");
}

#[tokio::test]
async fn vary_mismatch_misses() {
    let factory = MockCodecFactory::new();
    factory.enqueue(
        MockExchange::reply(200)
            .header("cache-control", "max-age=60")
            .header("vary", "accept-language")
            .body("english"),
    );
    factory.enqueue(
        MockExchange::reply(200)
            .header("cache-control", "max-age=60")
            .header("vary", "accept-language")
            .body("french"),
    );
    let store = MemoryCacheStore::new();
    let client = builder(&factory, &store).build();

    let english = Request::builder()
        .uri("http://example.com/doc".parse().unwrap())
        .header("accept-language", "en")
        .build()
        .unwrap();
    let (_, body, _) = fetch(&client, english.clone()).await;
    assert_eq!(body, "english");

    let french = Request::builder()
        .uri("http://example.com/doc".parse().unwrap())
        .header("accept-language", "fr")
        .build()
        .unwrap();
    let (_, body, _) = fetch(&client, french).await;
    assert_eq!(body, "french", "different vary key goes to the network");

    assert_eq!(factory.recorded().len(), 2);
}

#[tokio::test]
async fn write_through_round_trip() {
    // Cache write then read back: body bytes and end-to-end headers are
    // preserved.
    let factory = MockCodecFactory::new();
    factory.enqueue(
        MockExchange::reply(200)
            .header("cache-control", "max-age=300")
            .header("content-type", "application/octet-stream")
            .header("x-checksum", "abc123")
            .body(vec![0xA5u8; 32 * 1024]),
    );
    let store = MemoryCacheStore::new();
    let client = builder(&factory, &store).build();

    let (_, network_body, network_headers) =
        fetch(&client, get("http://example.com/blob")).await;
    let (_, cached_body, cached_headers) = fetch(&client, get("http://example.com/blob")).await;

    assert_eq!(network_body, cached_body);
    assert_eq!(
        network_headers.get("content-type"),
        cached_headers.get("content-type")
    );
    assert_eq!(
        network_headers.get("x-checksum"),
        cached_headers.get("x-checksum")
    );
    assert_eq!(factory.recorded().len(), 1);
}

#[tokio::test]
async fn abandoned_body_aborts_the_cache_write() {
    let factory = MockCodecFactory::new();
    factory.enqueue(
        MockExchange::reply(200)
            .header("cache-control", "max-age=60")
            .body(vec![1u8; 64 * 1024])
            .hang_body_after(1024),
    );
    let store = MemoryCacheStore::new();
    let client = builder(&factory, &store).build();

    let call = client.call(get("http://example.com/doc"));
    let response = call.execute().await.unwrap();
    // Drop the body after the first kilobyte would still be pending.
    drop(response);

    assert_eq!(store.put_count(), 1, "a write was started");
    assert_eq!(store.entry_count(), 0, "but never committed");
}
