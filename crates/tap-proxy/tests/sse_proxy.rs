use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tap_http::StreamEvent;
use tap_observe::{
    Direction, ExchangeContext, Observer, ObserverError, ObserverRegistry, VecObserver,
};
use tap_proxy::{MetricsHandle, ProxyConfig, ProxyMetrics, ProxyServer, ShutdownHandle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct RunningProxy {
    addr: SocketAddr,
    task: JoinHandle<std::io::Result<()>>,
    metrics: MetricsHandle,
    shutdown: ShutdownHandle,
}

fn test_config() -> ProxyConfig {
    ProxyConfig {
        listen_address: "127.0.0.1:0".to_string(),
        upstream_connect_timeout_seconds: 2,
        shutdown_grace_seconds: 1,
        ..ProxyConfig::default()
    }
}

async fn start_proxy(config: ProxyConfig, registry: ObserverRegistry) -> RunningProxy {
    let server = ProxyServer::new(config, registry).expect("build proxy");
    let listener = server.bind_listener().await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    let metrics = server.metrics_handle();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run_with_listener(listener));
    RunningProxy {
        addr,
        task,
        metrics,
        shutdown,
    }
}

fn registry_with(observers: Vec<Arc<dyn Observer>>) -> ObserverRegistry {
    let mut registry = ObserverRegistry::new();
    for observer in observers {
        registry.register(observer).expect("register observer");
    }
    registry
}

async fn read_http_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut data = Vec::new();
    let mut byte = [0_u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read HTTP head");
        if read == 0 {
            break;
        }
        data.push(byte[0]);
    }
    data
}

async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, out: &mut Vec<u8>, needle: &[u8]) {
    let mut buffer = [0_u8; 1024];
    while !out.windows(needle.len()).any(|window| window == needle) {
        let read = stream.read(&mut buffer).await.expect("read until needle");
        assert!(read > 0, "EOF before {:?}", String::from_utf8_lossy(needle));
        out.extend_from_slice(&buffer[..read]);
    }
}

async fn read_to_end_allow_reset<S: AsyncRead + Unpin>(stream: &mut S, out: &mut Vec<u8>) {
    let mut buffer = [0_u8; 1024];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => out.extend_from_slice(&buffer[..read]),
            Err(error) if error.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(error) => panic!("read response: {error}"),
        }
    }
}

async fn wait_for_events(observer: &VecObserver, count: usize) -> Vec<String> {
    for _ in 0..200 {
        let data = observer.data();
        if data.len() >= count {
            return data;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    observer.data()
}

struct FailingObserver;

impl Observer for FailingObserver {
    fn name(&self) -> &str {
        "failing"
    }

    fn on_event(
        &self,
        _direction: Direction,
        _exchange: &ExchangeContext,
        _event: &StreamEvent,
    ) -> Result<(), ObserverError> {
        Err(ObserverError::failed("rejects every event"))
    }
}

struct SleepingObserver;

impl Observer for SleepingObserver {
    fn name(&self) -> &str {
        "sleeping"
    }

    fn on_event(
        &self,
        _direction: Direction,
        _exchange: &ExchangeContext,
        _event: &StreamEvent,
    ) -> Result<(), ObserverError> {
        std::thread::sleep(Duration::from_millis(1500));
        Ok(())
    }
}

/// Serves one connection: reads a request head, writes `wire`, then keeps the
/// socket open. Resolves to whether the proxy closed it within five seconds.
fn serve_and_hold(upstream: TcpListener, wire: Vec<u8>) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let (mut tcp, _) = upstream.accept().await.expect("accept upstream");
        read_http_head(&mut tcp).await;
        tcp.write_all(&wire).await.expect("write response");
        let mut buffer = [0_u8; 64];
        matches!(
            tokio::time::timeout(Duration::from_secs(5), tcp.read(&mut buffer)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    })
}

async fn wait_for_metric(proxy: &RunningProxy, read: impl Fn(&ProxyMetrics) -> u64) -> u64 {
    let mut value = 0;
    for _ in 0..100 {
        value = read(&proxy.metrics.snapshot());
        if value > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    value
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_reach_observers_before_their_bytes_reach_the_client() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let upstream_task = tokio::spawn(async move {
        let (mut tcp, _) = upstream.accept().await.expect("accept upstream");
        let head = read_http_head(&mut tcp).await;
        let text = String::from_utf8_lossy(&head).to_string();
        tcp.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n",
        )
        .await
        .expect("write head");
        tcp.write_all(b"data: a\n\n").await.expect("write first event");
        release_rx.await.expect("release second event");
        tcp.write_all(b"data: b\n\n").await.expect("write second event");
        tcp.shutdown().await.expect("shutdown upstream");
        text
    });

    let recorder = VecObserver::new("recorder");
    let config = ProxyConfig {
        observer_queue_depth: 0,
        ..test_config()
    };
    let proxy = start_proxy(config, registry_with(vec![Arc::new(recorder.clone())])).await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET http://127.0.0.1:{}/stream HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nAccept: text/event-stream\r\n\r\n",
        upstream_addr.port(),
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let mut received = Vec::new();
    read_until(&mut client, &mut received, b"data: a\n\n").await;
    assert_eq!(recorder.data(), vec!["a".to_string()]);

    release_tx.send(()).expect("release upstream");
    read_to_end_allow_reset(&mut client, &mut received).await;
    assert_eq!(
        String::from_utf8_lossy(&received),
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\ndata: a\n\ndata: b\n\n"
    );

    let upstream_request = upstream_task.await.expect("upstream task");
    assert!(
        upstream_request.starts_with("GET /stream HTTP/1.1\r\n"),
        "{upstream_request}"
    );

    let recorded = recorder.snapshot();
    assert_eq!(recorded.len(), 2);
    assert!(recorded
        .iter()
        .all(|event| event.direction == Direction::Server));
    assert_eq!(recorded[0].exchange_id, recorded[1].exchange_id);
    assert_eq!(recorded[0].exchange_id.sequence, 1);

    let metrics = proxy.metrics.snapshot();
    assert_eq!(metrics.events_decoded, 2);
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunked_stream_is_relayed_verbatim_and_decoded_across_chunks() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let wire: &[u8] = concat!(
        "HTTP/1.1 200 OK\r\n",
        "Content-Type: text/event-stream; charset=utf-8\r\n",
        "Transfer-Encoding: chunked\r\n",
        "Connection: close\r\n",
        "\r\n",
        "7\r\nevent: \r\n",
        "e\r\ndelta\ndata: he\r\n",
        "b\r\nllo\nid: 7\n\n\r\n",
        "a\r\ndata: tail\r\n",
        "0\r\n\r\n",
    )
    .as_bytes();
    let upstream_task = tokio::spawn(async move {
        let (mut tcp, _) = upstream.accept().await.expect("accept upstream");
        read_http_head(&mut tcp).await;
        for piece in wire.chunks(9) {
            tcp.write_all(piece).await.expect("write piece");
            tcp.flush().await.expect("flush piece");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let recorder = VecObserver::new("recorder");
    let proxy = start_proxy(test_config(), registry_with(vec![Arc::new(recorder.clone())])).await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET /events HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let mut received = Vec::new();
    read_to_end_allow_reset(&mut client, &mut received).await;
    upstream_task.await.expect("upstream task");
    assert_eq!(received, wire);

    let data = wait_for_events(&recorder, 1).await;
    assert_eq!(data, vec!["hello".to_string()]);
    let recorded = recorder.snapshot();
    assert_eq!(recorded[0].event.event.as_deref(), Some("delta"));
    assert_eq!(recorded[0].event.id.as_deref(), Some("7"));
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plain_responses_are_relayed_without_decoding() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let (mut tcp, _) = upstream.accept().await.expect("accept upstream");
        read_http_head(&mut tcp).await;
        tcp.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 9\r\nConnection: close\r\n\r\ndata: x\n\n",
        )
        .await
        .expect("write response");
    });

    let recorder = VecObserver::new("recorder");
    let proxy = start_proxy(test_config(), registry_with(vec![Arc::new(recorder.clone())])).await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET http://127.0.0.1:{}/plain HTTP/1.1\r\nHost: x\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let mut received = Vec::new();
    read_to_end_allow_reset(&mut client, &mut received).await;
    assert!(received.ends_with(b"\r\n\r\ndata: x\n\n"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.data().is_empty());
    assert_eq!(proxy.metrics.snapshot().events_decoded, 0);
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn event_stream_request_bodies_are_observed_as_client_events() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task = tokio::spawn(async move {
        let (mut tcp, _) = upstream.accept().await.expect("accept upstream");
        read_http_head(&mut tcp).await;
        let mut body = [0_u8; 19];
        tcp.read_exact(&mut body).await.expect("read body");
        tcp.write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
            .await
            .expect("write response");
        body
    });

    let recorder = VecObserver::new("recorder");
    let proxy = start_proxy(test_config(), registry_with(vec![Arc::new(recorder.clone())])).await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "POST /ingest HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Type: text/event-stream\r\nContent-Length: 19\r\n\r\ndata: up\n\ndata: x\n\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let head = read_http_head(&mut client).await;
    assert!(head.starts_with(b"HTTP/1.1 204 No Content"));
    assert_eq!(&upstream_task.await.expect("upstream task"), b"data: up\n\ndata: x\n\n");

    let data = wait_for_events(&recorder, 2).await;
    assert_eq!(data, vec!["up".to_string(), "x".to_string()]);
    assert!(recorder
        .snapshot()
        .iter()
        .all(|event| event.direction == Direction::Client));
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_observer_does_not_starve_the_next_one() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let (mut tcp, _) = upstream.accept().await.expect("accept upstream");
        read_http_head(&mut tcp).await;
        tcp.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\ndata: one\n\ndata: two\n\n",
        )
        .await
        .expect("write response");
    });

    let recorder = VecObserver::new("recorder");
    let proxy = start_proxy(
        test_config(),
        registry_with(vec![Arc::new(FailingObserver), Arc::new(recorder.clone())]),
    )
    .await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET /s HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");
    let mut received = Vec::new();
    read_to_end_allow_reset(&mut client, &mut received).await;
    assert!(received.ends_with(b"data: one\n\ndata: two\n\n"));

    let data = wait_for_events(&recorder, 2).await;
    assert_eq!(data, vec!["one".to_string(), "two".to_string()]);
    let mut errors = 0;
    for _ in 0..100 {
        errors = proxy.metrics.snapshot().observer_errors;
        if errors >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(errors, 2);
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_upstream_gets_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let closed_port = closed.local_addr().expect("addr").port();
    drop(closed);

    let proxy = start_proxy(test_config(), ObserverRegistry::new()).await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET http://127.0.0.1:{closed_port}/ HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let mut received = Vec::new();
    read_to_end_allow_reset(&mut client, &mut received).await;
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{text}");
    assert!(text.contains("Connection: close"), "{text}");

    let metrics = proxy.metrics.snapshot();
    assert_eq!(metrics.upstream_connect_errors, 1);
    assert_eq!(metrics.exchanges_failed, 1);
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_request_head_is_rejected() {
    let proxy = start_proxy(test_config(), ObserverRegistry::new()).await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    client
        .write_all(b"this is not http\r\n\r\n")
        .await
        .expect("write garbage");

    let mut received = Vec::new();
    read_to_end_allow_reset(&mut client, &mut received).await;
    assert!(received.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_disconnect_releases_the_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task = tokio::spawn(async move {
        let (mut tcp, _) = upstream.accept().await.expect("accept upstream");
        read_http_head(&mut tcp).await;
        tcp.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\ndata: first\n\n",
        )
        .await
        .expect("write response");
        let mut buffer = [0_u8; 64];
        tokio::time::timeout(Duration::from_secs(5), tcp.read(&mut buffer)).await
    });

    let recorder = VecObserver::new("recorder");
    let proxy = start_proxy(test_config(), registry_with(vec![Arc::new(recorder.clone())])).await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET /forever HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");
    let mut received = Vec::new();
    read_until(&mut client, &mut received, b"data: first\n\n").await;
    drop(client);

    let upstream_read = upstream_task.await.expect("upstream task");
    match upstream_read {
        Ok(Ok(read)) => assert_eq!(read, 0, "upstream saw unexpected bytes"),
        Ok(Err(error)) => assert_eq!(error.kind(), std::io::ErrorKind::ConnectionReset),
        Err(_) => panic!("upstream connection outlived the client"),
    }
    assert_eq!(wait_for_events(&recorder, 1).await, vec!["first".to_string()]);
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keep_alive_requests_share_one_upstream_connection() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let response: &[u8] =
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: 11\r\n\r\ndata: one\n\n";
    let upstream_task = tokio::spawn(async move {
        let (mut tcp, _) = upstream.accept().await.expect("accept upstream");
        for _ in 0..2 {
            let head = read_http_head(&mut tcp).await;
            assert!(head.starts_with(b"GET /ka HTTP/1.1\r\n"));
            tcp.write_all(response).await.expect("write response");
        }
        let second = tokio::time::timeout(Duration::from_millis(200), upstream.accept()).await;
        (tcp, second.is_err())
    });

    let recorder = VecObserver::new("recorder");
    let proxy = start_proxy(test_config(), registry_with(vec![Arc::new(recorder.clone())])).await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET /ka HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port()
    );
    for _ in 0..2 {
        client.write_all(request.as_bytes()).await.expect("write request");
        let mut received = vec![0_u8; response.len()];
        client.read_exact(&mut received).await.expect("read response");
        assert_eq!(received, response);
    }

    let (_upstream_conn, no_second_connection) = upstream_task.await.expect("upstream task");
    assert!(no_second_connection);

    let recorded = {
        wait_for_events(&recorder, 2).await;
        recorder.snapshot()
    };
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].exchange_id.sequence, 1);
    assert_eq!(recorded[1].exchange_id.sequence, 2);
    assert_eq!(proxy.metrics.snapshot().exchanges_completed, 2);
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_closes_idle_sessions_and_stops_the_server() {
    let proxy = start_proxy(test_config(), ObserverRegistry::new()).await;
    let mut idle_client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(proxy.metrics.snapshot().sessions_active, 1);

    proxy.shutdown.shutdown();
    let finished = tokio::time::timeout(Duration::from_secs(3), proxy.task)
        .await
        .expect("server stops within the grace period")
        .expect("server task");
    assert!(finished.is_ok());

    let mut buffer = [0_u8; 16];
    let read = idle_client.read(&mut buffer).await.unwrap_or(0);
    assert_eq!(read, 0);
    assert_eq!(proxy.metrics.snapshot().sessions_active, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_observer_does_not_stall_forwarding() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        while let Ok((mut tcp, _)) = upstream.accept().await {
            tokio::spawn(async move {
                read_http_head(&mut tcp).await;
                tcp.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\ndata: first\n\n",
                )
                .await
                .expect("write first event");
                tokio::time::sleep(Duration::from_millis(100)).await;
                tcp.write_all(b"data: second\n\n").await.expect("write second event");
                let _ = tcp.shutdown().await;
            });
        }
    });

    let proxy = start_proxy(test_config(), registry_with(vec![Arc::new(SleepingObserver)])).await;
    let request = format!(
        "GET /slow HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port()
    );
    let mut clients = Vec::new();
    for _ in 0..2 {
        let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
        client.write_all(request.as_bytes()).await.expect("write request");
        clients.push((client, Vec::new()));
    }
    for (client, received) in clients.iter_mut() {
        read_until(client, received, b"data: first\n\n").await;
    }

    let started = Instant::now();
    for (client, received) in clients.iter_mut() {
        read_until(client, received, b"data: second\n\n").await;
    }
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "forwarding waited {:?} on the observer",
        started.elapsed()
    );
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_upstream_chunk_closes_both_connections() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task = serve_and_hold(
        upstream,
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n9\r\ndata: a\n\n\r\nzz\r\n".to_vec(),
    );

    let recorder = VecObserver::new("recorder");
    let proxy = start_proxy(test_config(), registry_with(vec![Arc::new(recorder.clone())])).await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET /broken HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let mut received = Vec::new();
    tokio::time::timeout(
        Duration::from_secs(3),
        read_to_end_allow_reset(&mut client, &mut received),
    )
    .await
    .expect("client connection closed");
    assert!(received.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(!received.windows(2).any(|window| window == b"zz"));
    assert!(upstream_task.await.expect("upstream task"));

    assert_eq!(wait_for_metric(&proxy, |metrics| metrics.framing_errors).await, 1);
    assert_eq!(wait_for_events(&recorder, 1).await, vec!["a".to_string()]);
    assert_eq!(proxy.metrics.snapshot().exchanges_failed, 1);
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunk_over_frame_limit_closes_both_connections() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task = serve_and_hold(
        upstream,
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n100\r\n".to_vec(),
    );

    let config = ProxyConfig {
        max_frame_bytes: 64,
        ..test_config()
    };
    let proxy = start_proxy(config, ObserverRegistry::new()).await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET /huge HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let mut received = Vec::new();
    tokio::time::timeout(
        Duration::from_secs(3),
        read_to_end_allow_reset(&mut client, &mut received),
    )
    .await
    .expect("client connection closed");
    assert!(received.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(upstream_task.await.expect("upstream task"));
    assert_eq!(wait_for_metric(&proxy, |metrics| metrics.framing_errors).await, 1);
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_upstream_stream_is_torn_down_after_the_idle_timeout() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task = serve_and_hold(
        upstream,
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\ndata: a\n\n".to_vec(),
    );

    let recorder = VecObserver::new("recorder");
    let config = ProxyConfig {
        idle_timeout_seconds: 1,
        ..test_config()
    };
    let proxy = start_proxy(config, registry_with(vec![Arc::new(recorder.clone())])).await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET /quiet HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let mut received = Vec::new();
    read_until(&mut client, &mut received, b"data: a\n\n").await;
    let started = Instant::now();
    tokio::time::timeout(
        Duration::from_secs(3),
        read_to_end_allow_reset(&mut client, &mut received),
    )
    .await
    .expect("session closed after going idle");
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(received.ends_with(b"data: a\n\n"));
    assert!(upstream_task.await.expect("upstream task"));
    assert_eq!(wait_for_events(&recorder, 1).await, vec!["a".to_string()]);
    proxy.task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_event_stops_decoding_but_not_relaying() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let body = format!("data: a\n\ndata: {}\n\ndata: b\n\n", "x".repeat(40));
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let wire = response.clone().into_bytes();
    tokio::spawn(async move {
        let (mut tcp, _) = upstream.accept().await.expect("accept upstream");
        read_http_head(&mut tcp).await;
        tcp.write_all(&wire).await.expect("write response");
    });

    let recorder = VecObserver::new("recorder");
    let config = ProxyConfig {
        max_event_bytes: 16,
        ..test_config()
    };
    let proxy = start_proxy(config, registry_with(vec![Arc::new(recorder.clone())])).await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let request = format!(
        "GET /big HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.expect("write request");

    let mut received = Vec::new();
    read_to_end_allow_reset(&mut client, &mut received).await;
    assert_eq!(String::from_utf8_lossy(&received), response);

    assert_eq!(wait_for_events(&recorder, 1).await, vec!["a".to_string()]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.data(), vec!["a".to_string()]);
    let metrics = proxy.metrics.snapshot();
    assert_eq!(metrics.events_decoded, 1);
    assert_eq!(metrics.exchanges_completed, 1);
    proxy.task.abort();
}
