mod common;

use common::{connect, header_value, read_response, start_server, status_code, test_config};
use ember_limit::{KeyStrategy, RateLimitConfig, RateLimitStrategy};
use ember_server::HttpResponse;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

fn token_bucket_config(burst: usize, refill_per_window: usize, window_secs: u64) -> RateLimitConfig {
    RateLimitConfig {
        strategy: RateLimitStrategy::TokenBucket,
        max_requests: refill_per_window,
        window_duration_seconds: window_secs,
        burst_capacity: burst,
        key_strategy: KeyStrategy::ClientIp,
        enabled: true,
    }
}

#[tokio::test]
async fn token_bucket_denies_after_burst_then_recovers() {
    let mut config = test_config();
    config.rate_limit = Some(token_bucket_config(3, 1, 1));
    let server = start_server(config, |server| {
        server.add_get_route("/limited", |_| HttpResponse::ok("ok"));
    })
    .await;

    let mut stream = connect(server.addr).await;
    for expected_remaining in ["2", "1", "0"] {
        stream
            .write_all(b"GET /limited HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .expect("write request");
        let (head, _) = read_response(&mut stream).await;
        assert_eq!(status_code(&head), 200);
        assert_eq!(
            header_value(&head, "x-ratelimit-remaining").as_deref(),
            Some(expected_remaining)
        );
        assert_eq!(header_value(&head, "x-ratelimit-limit").as_deref(), Some("1"));
    }

    stream
        .write_all(b"GET /limited HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .expect("write fourth request");
    let (head, body) = read_response(&mut stream).await;
    assert_eq!(status_code(&head), 429);
    assert_eq!(header_value(&head, "x-ratelimit-remaining").as_deref(), Some("0"));
    assert_eq!(
        header_value(&head, "x-ratelimit-type").as_deref(),
        Some("token_bucket")
    );
    assert!(String::from_utf8_lossy(&body).contains("Rate limit exceeded"));

    // One refill interval restores one token.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    stream
        .write_all(b"GET /limited HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .expect("write fifth request");
    let (head, _) = read_response(&mut stream).await;
    assert_eq!(status_code(&head), 200);

    server.stop().await;
}

#[tokio::test]
async fn forwarded_clients_are_limited_separately() {
    let mut config = test_config();
    config.rate_limit = Some(RateLimitConfig {
        strategy: RateLimitStrategy::FixedWindow,
        max_requests: 1,
        window_duration_seconds: 60,
        burst_capacity: 1,
        key_strategy: KeyStrategy::ClientIp,
        enabled: true,
    });
    let server = start_server(config, |server| {
        server.add_get_route("/limited", |_| HttpResponse::ok("ok"));
    })
    .await;

    let mut stream = connect(server.addr).await;
    stream
        .write_all(b"GET /limited HTTP/1.1\r\nHost: x\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n")
        .await
        .expect("write request");
    let (head, _) = read_response(&mut stream).await;
    assert_eq!(status_code(&head), 200);

    stream
        .write_all(b"GET /limited HTTP/1.1\r\nHost: x\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n")
        .await
        .expect("write request");
    let (head, _) = read_response(&mut stream).await;
    assert_eq!(status_code(&head), 429);

    // A different forwarded client has its own budget.
    stream
        .write_all(b"GET /limited HTTP/1.1\r\nHost: x\r\nX-Forwarded-For: 10.0.0.2\r\n\r\n")
        .await
        .expect("write request");
    let (head, _) = read_response(&mut stream).await;
    assert_eq!(status_code(&head), 200);

    server.stop().await;
}

#[tokio::test]
async fn disabled_rate_limit_is_a_pass_through() {
    let mut config = test_config();
    config.rate_limit = Some(RateLimitConfig {
        enabled: false,
        max_requests: 1,
        ..RateLimitConfig::default()
    });
    let server = start_server(config, |server| {
        server.add_get_route("/open", |_| HttpResponse::ok("ok"));
    })
    .await;

    let mut stream = connect(server.addr).await;
    for _ in 0..5 {
        stream
            .write_all(b"GET /open HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .expect("write request");
        let (head, _) = read_response(&mut stream).await;
        assert_eq!(status_code(&head), 200);
        assert!(header_value(&head, "x-ratelimit-limit").is_none());
    }

    server.stop().await;
}
