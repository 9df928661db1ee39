//! End-to-end dispatcher behaviour against a fake engine

mod common;

use async_trait::async_trait;
use common::{connect, connect_with, next_event, WAIT};
use pretty_assertions::assert_eq;
use quill_core::rpc::{AlertParams, EngineNotification, MeasureWidthRequest};
use quill_core::{
    CallError, ClientDelegate, CloseReason, CompletionLatch, ConnectionOptions, ConnectionState,
    DelegateEvent, Error, ProtocolError, RemoteError, TransportError,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio_test::assert_ok;

fn capture() -> (
    impl FnOnce(Result<Value, CallError>) + Send + 'static,
    oneshot::Receiver<Result<Value, CallError>>,
) {
    let (tx, rx) = oneshot::channel();
    (
        move |result| {
            let _ = tx.send(result);
        },
        rx,
    )
}

#[tokio::test]
async fn test_new_view_round_trip() {
    let (connection, mut engine, _events) = connect(ConnectionOptions::default());

    let (first, _) = capture();
    assert_ok!(connection.send_request("client_started", json!({}), first));
    let (callback, rx) = capture();
    let id = assert_ok!(connection.send_request(
        "new_view",
        json!({"file_path": "/tmp/a.txt"}),
        callback
    ));
    assert_eq!(id, 1);

    engine.recv().await;
    assert_eq!(
        engine.recv().await,
        json!({"id": 1, "method": "new_view", "params": {"file_path": "/tmp/a.txt"}})
    );
    engine.send(json!({"id": 1, "result": "view-1"})).await;

    assert_eq!(rx.await.unwrap(), Ok(json!("view-1")));
    assert_eq!(connection.diagnostics().responses, 1);
    assert_eq!(connection.diagnostics().pending_calls, 1);
}

#[tokio::test]
async fn test_error_response_reaches_callback() {
    let (connection, mut engine, _events) = connect(ConnectionOptions::default());

    let call = connection.call("get_config", json!({"view_id": "view-id-9"}));
    let (result, _) = tokio::join!(call, async {
        engine.recv().await;
        engine
            .send(json!({"id": 0, "error": {"code": 2, "message": "no such view"}}))
            .await;
    });

    match result {
        Err(Error::Call(CallError::Application(error))) => {
            assert_eq!(error, RemoteError::new(2, "no such view"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_engine_eof_fails_pending_call() {
    let (connection, mut engine, mut events) = connect(ConnectionOptions::default());

    let (callback, rx) = capture();
    assert_ok!(connection.send_request("new_view", json!({}), callback));
    engine.recv().await;
    drop(engine);

    let expected = CloseReason::Transport(TransportError::UnexpectedExit { code: None });
    assert_eq!(
        rx.await.unwrap(),
        Err(CallError::ConnectionClosed(expected.clone()))
    );
    assert_eq!(connection.wait_closed(WAIT).await.unwrap(), expected);
    assert_eq!(next_event(&mut events).await, DelegateEvent::Closed(expected));
    assert_eq!(connection.diagnostics().pending_calls, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_engine_exit_reports_exit_code() {
    use quill_core::{Connection, EngineConfig, ForwardingDelegate};

    let config = EngineConfig::new("sh")
        .with_args(vec!["-c".to_string(), "read line; exit 3".to_string()]);
    let (delegate, _events) = ForwardingDelegate::new();
    let connection = Connection::spawn(&config, Arc::new(delegate)).unwrap();

    let (callback, rx) = capture();
    connection.send_request("new_view", json!({}), callback).unwrap();

    let expected = CloseReason::Transport(TransportError::UnexpectedExit { code: Some(3) });
    let result = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
    assert_eq!(result, Err(CallError::ConnectionClosed(expected.clone())));
    assert_eq!(
        connection.state(),
        ConnectionState::Closed(expected)
    );
}

#[tokio::test]
async fn test_out_of_order_responses_follow_wire_order() {
    let (connection, mut engine, _events) = connect(ConnectionOptions::default());
    let order = Arc::new(Mutex::new(Vec::new()));
    let latch = CompletionLatch::new(2);

    for _ in 0..2 {
        let order = Arc::clone(&order);
        let latch = latch.clone();
        connection
            .send_request("find", json!({}), move |result| {
                order.lock().unwrap().push(result.unwrap());
                latch.count_down();
            })
            .unwrap();
    }
    engine.recv().await;
    engine.recv().await;

    engine
        .send_raw("{\"id\":1,\"result\":\"second\"}\n{\"id\":0,\"result\":\"first\"}\n")
        .await;

    latch.wait(WAIT).await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec![json!("second"), json!("first")]);
}

#[tokio::test]
async fn test_malformed_line_does_not_stop_dispatch() {
    let (connection, mut engine, mut events) = connect(ConnectionOptions::default());

    engine.send_raw("{not json\n").await;
    engine
        .send(json!({"method": "alert", "params": {"msg": "hello"}}))
        .await;

    assert_eq!(
        next_event(&mut events).await,
        DelegateEvent::Notification(EngineNotification::Alert(AlertParams {
            msg: "hello".to_string()
        }))
    );
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(connection.diagnostics().framing_errors, 1);
}

#[tokio::test]
async fn test_message_split_across_writes() {
    let (_connection, mut engine, mut events) = connect(ConnectionOptions::default());

    engine.send_raw("{\"method\":\"ale").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.send_raw("rt\",\"params\":{\"msg\":\"split\"}}\r\n").await;

    match next_event(&mut events).await {
        DelegateEvent::Notification(EngineNotification::Alert(params)) => {
            assert_eq!(params.msg, "split")
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_notification_is_not_fatal() {
    let (connection, mut engine, mut events) = connect(ConnectionOptions::default());

    engine
        .send(json!({"method": "frobnicate", "params": {"x": 1}}))
        .await;
    engine
        .send(json!({"method": "alert", "params": {"msg": "still here"}}))
        .await;

    assert!(matches!(
        next_event(&mut events).await,
        DelegateEvent::Notification(EngineNotification::Unknown { ref method, .. }) if method == "frobnicate"
    ));
    assert!(matches!(
        next_event(&mut events).await,
        DelegateEvent::Notification(EngineNotification::Alert(_))
    ));
    assert!(connection.is_ready());
}

#[tokio::test]
async fn test_unknown_response_id_is_dropped() {
    let (connection, mut engine, _events) = connect(ConnectionOptions::default());

    let (callback, rx) = capture();
    connection.send_request("new_view", json!({}), callback).unwrap();
    engine.recv().await;

    engine.send(json!({"id": 42, "result": "stray"})).await;
    engine.send(json!({"id": 0, "result": "view-id-1"})).await;

    assert_eq!(rx.await.unwrap(), Ok(json!("view-id-1")));
    assert_eq!(connection.diagnostics().protocol_errors, 1);
    assert!(connection.is_ready());
}

#[tokio::test]
async fn test_duplicate_response_fires_callback_once() {
    let (connection, mut engine, _events) = connect(ConnectionOptions::default());
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    connection
        .send_request("new_view", json!({}), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    engine.recv().await;

    engine.send(json!({"id": 0, "result": "a"})).await;
    engine.send(json!({"id": 0, "result": "b"})).await;
    engine.send(json!({"method": "alert", "params": {"msg": "sync"}})).await;

    let (callback, rx) = capture();
    connection.send_request("ping", json!({}), callback).unwrap();
    engine.recv().await;
    engine.send(json!({"id": 1, "result": null})).await;
    rx.await.unwrap().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(connection.diagnostics().protocol_errors, 1);
}

#[tokio::test]
async fn test_strict_protocol_closes_on_unknown_id() {
    let options = ConnectionOptions {
        strict_protocol: true,
        ..ConnectionOptions::default()
    };
    let (connection, mut engine, _events) = connect(options);

    let (callback, rx) = capture();
    connection.send_request("new_view", json!({}), callback).unwrap();
    engine.recv().await;
    engine.send(json!({"id": 99, "result": 1})).await;

    let expected = CloseReason::Protocol(ProtocolError::UnknownRequestId(99));
    assert_eq!(connection.wait_closed(WAIT).await.unwrap(), expected);
    assert_eq!(
        rx.await.unwrap(),
        Err(CallError::ConnectionClosed(expected))
    );
}

#[tokio::test]
async fn test_concurrent_senders_get_unique_ids() {
    const SENDERS: usize = 64;

    let (connection, mut engine, _events) = connect(ConnectionOptions::default());
    let connection = Arc::new(connection);
    let latch = CompletionLatch::new(SENDERS);
    let results = Arc::new(Mutex::new(Vec::new()));

    let senders = (0..SENDERS).map(|n| {
        let connection = Arc::clone(&connection);
        let latch = latch.clone();
        let results = Arc::clone(&results);
        tokio::spawn(async move {
            connection
                .send_request("echo", json!({"n": n}), move |result| {
                    results.lock().unwrap().push((n, result.unwrap()));
                    latch.count_down();
                })
                .unwrap()
        })
    });
    let sent = futures::future::join_all(senders);

    let echo = async {
        for _ in 0..SENDERS {
            let request = engine.recv().await;
            engine
                .send(json!({"id": request["id"], "result": request["params"]["n"]}))
                .await;
        }
    };

    let (sent, _) = tokio::join!(sent, echo);
    latch.wait(WAIT).await.unwrap();

    let mut ids: Vec<u64> = sent.into_iter().map(|id| id.unwrap()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..SENDERS as u64).collect::<Vec<_>>());

    let results = results.lock().unwrap();
    assert_eq!(results.len(), SENDERS);
    for (n, value) in results.iter() {
        assert_eq!(value, &json!(n));
    }
    assert_eq!(connection.diagnostics().pending_calls, 0);
}

#[tokio::test]
async fn test_close_racing_response_fires_once() {
    let (connection, mut engine, mut events) = connect(ConnectionOptions::default());
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    connection
        .send_request("new_view", json!({}), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    engine.recv().await;

    let (_, _) = tokio::join!(connection.close(), async {
        let _ = engine.try_send_raw("{\"id\":0,\"result\":\"view-id-1\"}\n").await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(
        next_event(&mut events).await,
        DelegateEvent::Closed(CloseReason::Shutdown)
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_callback_can_send_new_request() {
    let (connection, mut engine, _events) = connect(ConnectionOptions::default());
    let connection = Arc::new(connection);
    let (done_tx, done_rx) = oneshot::channel();

    let chained = Arc::clone(&connection);
    connection
        .send_request("new_view", json!({}), move |result| {
            let view_id = result.unwrap();
            chained
                .send_request("get_config", json!({"view_id": view_id}), move |result| {
                    let _ = done_tx.send(result);
                })
                .unwrap();
        })
        .unwrap();

    engine.recv().await;
    engine.send(json!({"id": 0, "result": "view-id-1"})).await;
    assert_eq!(
        engine.recv().await,
        json!({"id": 1, "method": "get_config", "params": {"view_id": "view-id-1"}})
    );
    engine.send(json!({"id": 1, "result": {"tab_size": 4}})).await;

    assert_eq!(done_rx.await.unwrap(), Ok(json!({"tab_size": 4})));
}

#[tokio::test]
async fn test_notifications_and_responses_keep_wire_order() {
    struct OrderLog(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl ClientDelegate for OrderLog {
        async fn alert(&self, params: AlertParams) {
            self.0.lock().unwrap().push(format!("alert:{}", params.msg));
        }
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let (connection, mut engine) =
        connect_with(Arc::new(OrderLog(Arc::clone(&log))), ConnectionOptions::default());

    let response_log = Arc::clone(&log);
    let latch = CompletionLatch::new(1);
    let done = latch.clone();
    connection
        .send_request("save", json!({}), move |_| {
            response_log.lock().unwrap().push("response:0".to_string());
            done.count_down();
        })
        .unwrap();
    engine.recv().await;

    engine
        .send_raw(concat!(
            "{\"method\":\"alert\",\"params\":{\"msg\":\"before\"}}\n",
            "{\"id\":0,\"result\":null}\n",
            "{\"method\":\"alert\",\"params\":{\"msg\":\"after\"}}\n",
        ))
        .await;

    latch.wait(WAIT).await.unwrap();
    let mut attempts = 0;
    while log.lock().unwrap().len() < 3 && attempts < 100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        attempts += 1;
    }

    assert_eq!(
        *log.lock().unwrap(),
        vec!["alert:before", "response:0", "alert:after"]
    );
}

#[tokio::test]
async fn test_measure_width_request_is_answered() {
    struct Measurer;

    #[async_trait]
    impl ClientDelegate for Measurer {
        async fn measure_width(
            &self,
            requests: Vec<MeasureWidthRequest>,
        ) -> Result<Vec<Vec<f64>>, RemoteError> {
            Ok(requests
                .iter()
                .map(|request| request.strings.iter().map(|s| s.len() as f64 * 7.0).collect())
                .collect())
        }
    }

    let (connection, mut engine) = connect_with(Arc::new(Measurer), ConnectionOptions::default());

    engine
        .send(json!({
            "id": 0,
            "method": "measure_width",
            "params": [{"id": 1, "strings": ["abc", "de"]}]
        }))
        .await;

    assert_eq!(engine.recv().await, json!({"id": 0, "result": [[21.0, 14.0]]}));
    assert_eq!(connection.diagnostics().engine_requests, 1);
}

#[tokio::test]
async fn test_unknown_engine_request_gets_method_not_found() {
    let (_connection, mut engine, _events) = connect(ConnectionOptions::default());

    engine
        .send(json!({"id": 5, "method": "frobnicate", "params": {}}))
        .await;

    assert_eq!(
        engine.recv().await,
        json!({"id": 5, "error": {"code": -32601, "message": "Unsupported method: frobnicate"}})
    );
}

#[tokio::test]
async fn test_oversized_line_is_skipped() {
    let options = ConnectionOptions {
        max_line_bytes: 128,
        ..ConnectionOptions::default()
    };
    let (connection, mut engine, mut events) = connect(options);

    let huge = format!(
        "{{\"method\":\"alert\",\"params\":{{\"msg\":\"{}\"}}}}\n",
        "x".repeat(512)
    );
    engine.send_raw(&huge).await;
    engine
        .send(json!({"method": "alert", "params": {"msg": "small"}}))
        .await;

    match next_event(&mut events).await {
        DelegateEvent::Notification(EngineNotification::Alert(params)) => {
            assert_eq!(params.msg, "small")
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(connection.diagnostics().framing_errors, 1);
}

#[tokio::test]
async fn test_timed_out_call_releases_pending_entry() {
    let (connection, mut engine, _events) = connect(ConnectionOptions::default());

    for _ in 0..3 {
        let result = connection
            .call_timeout("find_next", json!({}), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(Error::Call(CallError::Timeout))));
    }
    assert_eq!(connection.diagnostics().pending_calls, 0);

    for _ in 0..3 {
        engine.recv().await;
    }
    engine.send(json!({"id": 0, "result": "late"})).await;

    let (result, _) = tokio::join!(connection.call("ping", json!({})), async {
        engine.recv().await;
        engine.send(json!({"id": 3, "result": null})).await;
    });
    assert_eq!(result.unwrap(), Value::Null);
    assert_eq!(connection.diagnostics().protocol_errors, 1);
}

#[tokio::test]
async fn test_frames_after_close_are_not_dispatched() {
    struct GatedAlerts {
        log: Arc<Mutex<Vec<String>>>,
        entered: Arc<Notify>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ClientDelegate for GatedAlerts {
        async fn alert(&self, params: AlertParams) {
            self.log.lock().unwrap().push(format!("alert:{}", params.msg));
            if params.msg == "first" {
                self.entered.notify_one();
                self.gate.notified().await;
            }
        }

        async fn connection_closed(&self, _reason: CloseReason) {
            self.log.lock().unwrap().push("closed".to_string());
        }
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let delegate = GatedAlerts {
        log: Arc::clone(&log),
        entered: Arc::clone(&entered),
        gate: Arc::clone(&gate),
    };
    let (connection, mut engine) = connect_with(Arc::new(delegate), ConnectionOptions::default());

    engine
        .send_raw(concat!(
            "{\"method\":\"alert\",\"params\":{\"msg\":\"first\"}}\n",
            "{\"method\":\"alert\",\"params\":{\"msg\":\"second\"}}\n",
            "{\"id\":0,\"result\":null}\n",
            "{\"method\":\"alert\",\"params\":{\"msg\":\"third\"}}\n",
        ))
        .await;

    tokio::time::timeout(WAIT, entered.notified()).await.unwrap();
    connection.close().await;
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*log.lock().unwrap(), vec!["alert:first", "closed"]);
    assert_eq!(connection.diagnostics().protocol_errors, 0);
    assert_eq!(connection.diagnostics().notifications, 1);
}

#[tokio::test]
async fn test_panicking_handler_keeps_connection_alive() {
    struct Panicky {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ClientDelegate for Panicky {
        async fn alert(&self, params: AlertParams) {
            if params.msg == "boom" {
                panic!("alert handler failed");
            }
        }

        async fn measure_width(
            &self,
            _requests: Vec<MeasureWidthRequest>,
        ) -> Result<Vec<Vec<f64>>, RemoteError> {
            panic!("measure_width handler failed");
        }

        async fn connection_closed(&self, _reason: CloseReason) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    let closed = Arc::new(AtomicUsize::new(0));
    let delegate = Panicky {
        closed: Arc::clone(&closed),
    };
    let (connection, mut engine) = connect_with(Arc::new(delegate), ConnectionOptions::default());

    let fired = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel();
    let counter = Arc::clone(&fired);
    assert_ok!(connection.send_request("new_view", json!({}), move |result| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(result);
    }));
    engine.recv().await;

    engine
        .send(json!({"method": "alert", "params": {"msg": "boom"}}))
        .await;
    engine
        .send(json!({"id": 7, "method": "measure_width", "params": [{"id": 0, "strings": ["a"]}]}))
        .await;

    let reply = engine.recv().await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["error"]["code"], -32603);
    assert!(connection.is_ready());

    connection.close().await;

    assert_eq!(
        rx.await.unwrap(),
        Err(CallError::ConnectionClosed(CloseReason::Shutdown))
    );
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(
        connection.state(),
        ConnectionState::Closed(CloseReason::Shutdown)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_state_is_closed_once_sends_are_rejected() {
    let (connection, _engine, _events) = connect(ConnectionOptions::default());
    let connection = Arc::new(connection);

    let sender = Arc::clone(&connection);
    let sending = tokio::spawn(async move {
        loop {
            match sender.send_notification("scroll", json!([0, 1])) {
                Ok(()) => tokio::task::yield_now().await,
                Err(Error::NotReady(_)) => {
                    assert!(sender.state().is_closed());
                    break;
                }
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(5)).await;
    connection.close().await;

    tokio::time::timeout(WAIT, sending).await.unwrap().unwrap();
}
