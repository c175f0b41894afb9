//! Call lifecycle: execution, pooling, cancellation, timeouts, retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use courier::client::conn::mock::{
    MockCodecFactory, MockExchange, MockSocketFactory, RecordingListener, StaticDns,
};
use courier::{Builder, Client, ErrorKind, Request};

fn builder(factory: &Arc<MockCodecFactory>) -> Builder {
    Client::builder()
        .dns(Arc::new(StaticDns::new(&["10.0.0.1:80"])))
        .socket_factory(Arc::new(MockSocketFactory::default()))
        .codec_factory(factory.clone())
}

fn client(factory: &Arc<MockCodecFactory>) -> Client {
    builder(factory).build()
}

fn get(uri: &'static str) -> Request {
    Request::get(uri.parse().unwrap())
}

#[tokio::test]
async fn get_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MockCodecFactory::new();
    factory.enqueue(
        MockExchange::reply(200)
            .header("content-type", "text/plain")
            .body("hello world"),
    );
    let client = client(&factory);

    let response = client.get("http://example.com/".parse().unwrap()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("content-type"), Some("text/plain"));

    let body = response.into_body().unwrap().collect().await.unwrap();
    assert_eq!(body, "hello world");

    // The bridge filled in the wire headers.
    let recorded = factory.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].headers.get("host").unwrap(), "example.com");
    assert_eq!(recorded[0].headers.get("connection").unwrap(), "Keep-Alive");
    assert!(recorded[0]
        .headers
        .get("user-agent")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("courier/"));
    assert!(recorded[0].finished);

    // Fully consumed: the connection went back to the pool.
    assert_eq!(client.pool().connection_count(), 1);
    assert_eq!(client.pool().idle_connection_count(), 1);
}

#[tokio::test]
async fn sequential_calls_reuse_the_connection() {
    let factory = MockCodecFactory::new();
    factory.enqueue(MockExchange::reply(200).body("one"));
    factory.enqueue(MockExchange::reply(200).body("two"));
    let client = client(&factory);

    for expected in ["one", "two"] {
        let response = client.get("http://example.com/".parse().unwrap()).await.unwrap();
        let body = response.into_body().unwrap().collect().await.unwrap();
        assert_eq!(body, expected);
    }

    assert_eq!(factory.connections_created(), 1);
}

#[tokio::test]
async fn execute_is_one_shot() {
    let factory = MockCodecFactory::new();
    factory.enqueue(MockExchange::reply(200));
    let client = client(&factory);

    let call = client.call(get("http://example.com/"));
    let response = call.execute().await.unwrap();
    drop(response.into_body());

    let error = call.execute().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Contract);
    assert!(call.is_executed());
}

#[tokio::test]
async fn cloned_calls_are_independent() {
    let factory = MockCodecFactory::new();
    factory.enqueue(MockExchange::reply(200).body("first"));
    factory.enqueue(MockExchange::reply(200).body("second"));
    let client = client(&factory);

    let call = client.call(get("http://example.com/"));
    let clone = call.clone_call();

    let response = call.execute().await.unwrap();
    assert_eq!(
        response.into_body().unwrap().collect().await.unwrap(),
        "first"
    );

    assert!(!clone.is_executed());
    let response = clone.execute().await.unwrap();
    assert_eq!(
        response.into_body().unwrap().collect().await.unwrap(),
        "second"
    );
}

#[tokio::test]
async fn enqueue_runs_on_the_dispatcher() {
    let factory = MockCodecFactory::new();
    factory.enqueue(MockExchange::reply(200).body("async"));
    let client = client(&factory);

    let call = client.call(get("http://example.com/"));
    let (tx, rx) = tokio::sync::oneshot::channel();
    call.enqueue(move |result| {
        let _ = tx.send(result.map(|response| response.status()));
    })
    .unwrap();

    let status = rx.await.unwrap().unwrap();
    assert_eq!(status, 200);

    // The one-shot guard also covers enqueue.
    let error = call.enqueue(|_| {}).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Contract);
}

#[tokio::test]
async fn cancel_during_body_read() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MockCodecFactory::new();
    factory.enqueue(
        MockExchange::reply(200)
            .body(vec![0u8; 64 * 1024])
            .hang_body_after(16 * 1024),
    );
    let client = client(&factory);

    let call = client.call(get("http://example.com/"));
    let response = call.execute().await.unwrap();
    let mut body = response.into_body().unwrap();

    let mut buf = [0u8; 8 * 1024];
    let mut read = 0usize;
    while read < 16 * 1024 {
        read += body.read(&mut buf).await.unwrap();
    }

    call.cancel();
    assert!(call.is_canceled());

    let error = body.read(&mut buf).await.unwrap_err();
    assert!(error.to_string().contains("cancel"));

    // An aborted stream never returns its connection to the pool.
    assert_eq!(client.pool().connection_count(), 0);
}

#[tokio::test]
async fn call_timeout_cancels_the_call() {
    let factory = MockCodecFactory::new();
    factory.enqueue(
        MockExchange::reply(200)
            .body("never delivered")
            .hang_body_after(0),
    );
    let client = builder(&factory)
        .call_timeout(Duration::from_millis(50))
        .build();

    let call = client.call(get("http://example.com/"));
    let response = call.execute().await.unwrap();
    let mut body = response.into_body().unwrap();

    let mut buf = [0u8; 64];
    let error = body.read(&mut buf).await.unwrap_err();
    assert!(call.is_canceled());
    let message = error.to_string();
    assert!(
        message.contains("timed out") || message.contains("cancel"),
        "unexpected error: {message}"
    );
}

#[tokio::test]
async fn connection_shutdown_is_retried_transparently() {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = MockCodecFactory::new();
    factory.enqueue(MockExchange::reply(200).fail_send(ErrorKind::ConnectionShutdown));
    factory.enqueue(MockExchange::reply(200).body("recovered"));
    let client = client(&factory);

    let response = client.get("http://example.com/".parse().unwrap()).await.unwrap();
    assert_eq!(
        response.into_body().unwrap().collect().await.unwrap(),
        "recovered"
    );
    assert_eq!(factory.connections_created(), 2);
}

#[tokio::test]
async fn transport_failure_recovers_on_another_route() {
    let factory = MockCodecFactory::new();
    factory.enqueue(MockExchange::reply(200).fail_send(ErrorKind::Transport));
    factory.enqueue(MockExchange::reply(200).body("second route"));

    let client = Client::builder()
        .dns(Arc::new(StaticDns::new(&["10.0.0.1:80", "10.0.0.2:80"])))
        .socket_factory(Arc::new(MockSocketFactory::default()))
        .codec_factory(factory.clone())
        .build();

    let response = client.get("http://example.com/".parse().unwrap()).await.unwrap();
    assert_eq!(
        response.into_body().unwrap().collect().await.unwrap(),
        "second route"
    );
    assert_eq!(factory.connections_created(), 2);
}

#[tokio::test]
async fn events_fire_in_order() {
    let factory = MockCodecFactory::new();
    factory.enqueue(MockExchange::reply(200).body("ok"));
    let listener = RecordingListener::new();
    let client = builder(&factory).event_listener(listener.clone()).build();

    let response = client.get("http://example.com/".parse().unwrap()).await.unwrap();
    let _ = response.into_body().unwrap().collect().await.unwrap();

    assert_eq!(
        listener.events(),
        vec![
            "call_start",
            "response_headers_start",
            "response_headers_end",
            "connection_released",
            "call_end",
        ]
    );
}

#[tokio::test]
async fn canceled_before_execute_fails_fast() {
    let factory = MockCodecFactory::new();
    factory.enqueue(MockExchange::reply(200));
    let client = client(&factory);

    let call = client.call(get("http://example.com/"));
    call.cancel();
    let error = call.execute().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Canceled);
    assert_eq!(factory.recorded().len(), 0);
}
