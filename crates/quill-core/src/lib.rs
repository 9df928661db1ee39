//! Quill Core Library
//!
//! This crate connects an editor front-end to a text-engine subprocess that
//! speaks line-delimited JSON-RPC over its stdin/stdout:
//! - Engine process lifecycle and pipe ownership
//! - Line framing of the engine's output
//! - Request/response correlation with exactly-once callbacks
//! - Routing of engine notifications to a client delegate
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       quill-core                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  client.rs         - Typed engine API, completion latch     │
//! │  rpc/connection    - Request ids, pending calls, read loop  │
//! │  rpc/delegate      - Handlers for engine events             │
//! │  rpc/notification  - Typed notification payloads            │
//! │  rpc/message       - Wire encoding and classification       │
//! │  rpc/framer        - Newline framing of stdout bytes        │
//! │  rpc/transport     - Engine subprocess and pipes            │
//! │  config.rs         - Engine configuration                   │
//! │  error.rs          - Error types                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod rpc;

// Re-export commonly used types
pub use client::{CompletionLatch, ConfigDomain, EngineClient};
pub use config::{ConnectionOptions, EngineConfig};
pub use error::{
    CallError, CloseReason, Error, FramingError, ProtocolError, RemoteError, Result,
    TransportError,
};
pub use rpc::{
    ClientDelegate, Connection, ConnectionState, DelegateEvent, Diagnostics, EngineNotification,
    EngineRequest, ForwardingDelegate, RequestId, ViewId,
};
