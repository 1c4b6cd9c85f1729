use std::sync::Arc;
use std::time::Duration;

use tap_http::StreamEvent;
use tap_observe::{
    Direction, ExchangeContext, ExchangeId, Observer, ObserverError, ObserverRegistry,
    SessionDispatcher, VecObserver,
};

fn context() -> Arc<ExchangeContext> {
    Arc::new(ExchangeContext {
        id: ExchangeId {
            session_id: 11,
            sequence: 2,
        },
        client_addr: "127.0.0.1:40000".to_string(),
        server_host: "api.example.test".to_string(),
        server_port: 443,
        method: "POST".to_string(),
        target: "/v1/stream".to_string(),
        intercepted_tls: true,
    })
}

fn event(data: &str) -> StreamEvent {
    StreamEvent {
        event: Some("delta".to_string()),
        id: None,
        retry_ms: None,
        data: data.to_string(),
        data_line_count: 1,
    }
}

struct Broken;

impl Observer for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn on_event(
        &self,
        _direction: Direction,
        _exchange: &ExchangeContext,
        _event: &StreamEvent,
    ) -> Result<(), ObserverError> {
        Err(ObserverError::failed("sink unavailable"))
    }
}

struct Stuck;

impl Observer for Stuck {
    fn name(&self) -> &str {
        "stuck"
    }

    fn on_event(
        &self,
        _direction: Direction,
        _exchange: &ExchangeContext,
        _event: &StreamEvent,
    ) -> Result<(), ObserverError> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_observer_does_not_starve_its_neighbour() {
    let recorder = VecObserver::new("recorder");
    let mut registry = ObserverRegistry::new();
    registry.register(Arc::new(Broken)).expect("register broken");
    registry
        .register(Arc::new(recorder.clone()))
        .expect("register recorder");
    let registry = Arc::new(registry);

    let dispatcher = SessionDispatcher::new(Arc::clone(&registry), 8);
    let exchange = context();
    dispatcher.publish(Direction::Server, &exchange, vec![event("a"), event("b")]);
    dispatcher.publish(Direction::Client, &exchange, vec![event("c")]);

    let report = dispatcher.close_and_drain(Duration::from_secs(2)).await;
    assert!(!report.timed_out);
    assert_eq!(recorder.data(), vec!["a", "b", "c"]);
    let directions = recorder
        .snapshot()
        .into_iter()
        .map(|recorded| recorded.direction)
        .collect::<Vec<_>>();
    assert_eq!(
        directions,
        vec![Direction::Server, Direction::Server, Direction::Client]
    );
    assert_eq!(registry.stats().errors, 3);
    assert_eq!(registry.stats().delivered, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_gives_up_on_a_stuck_observer_after_grace() {
    let mut registry = ObserverRegistry::new();
    registry.register(Arc::new(Stuck)).expect("register");
    let dispatcher = SessionDispatcher::new(Arc::new(registry), 4);
    let exchange = context();
    dispatcher.publish(
        Direction::Server,
        &exchange,
        vec![event("1"), event("2"), event("3")],
    );

    let report = dispatcher.close_and_drain(Duration::from_millis(100)).await;
    assert!(report.timed_out);
    assert_eq!(report.lanes.len(), 1);
    assert_eq!(report.lanes[0].observer, "stuck");
    assert!(report.lanes[0].pending > 0);
}

#[tokio::test]
async fn publishing_after_close_is_ignored() {
    let recorder = VecObserver::new("recorder");
    let mut registry = ObserverRegistry::new();
    registry
        .register(Arc::new(recorder.clone()))
        .expect("register");
    let dispatcher = SessionDispatcher::new(Arc::new(registry), 4);
    let report = dispatcher.close_and_drain(Duration::from_secs(1)).await;
    assert_eq!(report.dropped(), 0);
    assert!(recorder.data().is_empty());
}
