//! Line-delimited JSON-RPC plumbing between the front-end and the engine
//!
//! - `transport`: engine subprocess and its three pipes
//! - `framer`: splits stdout bytes into JSON values
//! - `message`: wire encoding and classification of inbound values
//! - `notification`: typed engine notifications and engine requests
//! - `delegate`: caller-supplied handlers for engine events
//! - `connection`: request ids, pending calls, and the read loop

pub mod connection;
pub mod delegate;
pub mod framer;
pub mod message;
pub mod notification;
pub mod transport;

/// Id of a request we sent. Allocated from 0, never reused on a connection.
pub type RequestId = u64;

pub use connection::{CallResult, Connection, ConnectionState, Diagnostics, RequestCallback};
pub use delegate::{dispatch_notification, ClientDelegate, DelegateEvent, ForwardingDelegate};
pub use framer::LineFramer;
pub use message::{IncomingMessage, ResponseOutcome};
pub use notification::*;
pub use transport::{Transport, TransportReader};
