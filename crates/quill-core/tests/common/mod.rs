//! Shared helpers: an in-process fake engine on the far side of a duplex pipe

#![allow(dead_code)]

use quill_core::rpc::{ClientDelegate, Connection, DelegateEvent, ForwardingDelegate, Transport};
use quill_core::ConnectionOptions;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const WAIT: Duration = Duration::from_secs(5);

/// Engine side of a connection. Reads what the client wrote, writes raw lines back.
pub struct FakeEngine {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeEngine {
    /// Next message the client sent
    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for client message")
            .expect("read failed")
            .expect("client closed its side");
        serde_json::from_str(&line).expect("client wrote invalid JSON")
    }

    pub async fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.send_raw(&line).await;
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.try_send_raw(raw).await.unwrap();
    }

    /// Write without asserting the client is still reading
    pub async fn try_send_raw(&mut self, raw: &str) -> std::io::Result<()> {
        self.writer.write_all(raw.as_bytes()).await?;
        self.writer.flush().await
    }
}

/// Connect to a fake engine with a caller-supplied delegate
pub fn connect_with(
    delegate: Arc<dyn ClientDelegate>,
    options: ConnectionOptions,
) -> (Connection, FakeEngine) {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (read_half, write_half) = tokio::io::split(ours);
    let (transport, reader) = Transport::from_streams(read_half, write_half);
    let connection = Connection::with_transport(transport, reader, delegate, options);

    let (engine_read, engine_write) = tokio::io::split(theirs);
    let engine = FakeEngine {
        lines: BufReader::new(engine_read).lines(),
        writer: engine_write,
    };
    (connection, engine)
}

/// Connect with a `ForwardingDelegate`, returning its event stream
pub fn connect(
    options: ConnectionOptions,
) -> (Connection, FakeEngine, UnboundedReceiver<DelegateEvent>) {
    let (delegate, events) = ForwardingDelegate::new();
    let (connection, engine) = connect_with(Arc::new(delegate), options);
    (connection, engine, events)
}

pub async fn next_event(events: &mut UnboundedReceiver<DelegateEvent>) -> DelegateEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for delegate event")
        .expect("delegate channel closed")
}
