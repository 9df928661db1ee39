//! Wire messages: encoding outbound traffic and classifying inbound values

use super::notification::{EngineNotification, EngineRequest};
use super::RequestId;
use crate::error::{ProtocolError, RemoteError};
use serde::Serialize;
use serde_json::Value;

/// Outcome carried by an inbound response
pub type ResponseOutcome = std::result::Result<Value, RemoteError>;

#[derive(Serialize)]
struct RequestFrame<'a> {
    id: RequestId,
    method: &'a str,
    params: &'a Value,
}

#[derive(Serialize)]
struct NotificationFrame<'a> {
    method: &'a str,
    params: &'a Value,
}

#[derive(Serialize)]
struct ResultFrame<'a> {
    id: RequestId,
    result: &'a Value,
}

#[derive(Serialize)]
struct ErrorFrame {
    id: RequestId,
    error: Value,
}

/// Encode `{"id","method","params"}` followed by a newline
pub fn encode_request(
    id: RequestId,
    method: &str,
    params: &Value,
) -> Result<Vec<u8>, serde_json::Error> {
    to_line(&RequestFrame { id, method, params })
}

/// Encode `{"method","params"}` followed by a newline
pub fn encode_notification(method: &str, params: &Value) -> Result<Vec<u8>, serde_json::Error> {
    to_line(&NotificationFrame { method, params })
}

/// Encode our reply to an engine-initiated request
pub fn encode_response(
    id: RequestId,
    outcome: &ResponseOutcome,
) -> Result<Vec<u8>, serde_json::Error> {
    match outcome {
        Ok(result) => to_line(&ResultFrame { id, result }),
        Err(error) => to_line(&ErrorFrame {
            id,
            error: error.to_value(),
        }),
    }
}

fn to_line<T: Serialize>(frame: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Reply to one of our requests
    Response {
        id: RequestId,
        outcome: ResponseOutcome,
    },
    /// Fire-and-forget event from the engine
    Notification(EngineNotification),
    /// Call from the engine that expects a reply
    Request { id: RequestId, request: EngineRequest },
}

/// Classify a framed JSON value.
///
/// A value with an `id` and a `result` or `error` is a response; a value
/// with a `method` and no `id` is a notification; `id` plus `method` is an
/// engine request. Anything else is a protocol error.
pub fn parse_message(value: Value) -> Result<IncomingMessage, ProtocolError> {
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::UnrecognizedMessage(snippet(&value)));
    };

    let id = object.remove("id");
    let method = object.remove("method");
    let result = object.remove("result");
    let error = object.remove("error");
    let params = object.remove("params").unwrap_or_else(|| Value::Object(Default::default()));

    match (id, method) {
        (Some(id), None) => {
            let id = parse_id(&id)?;
            let outcome = match (result, error) {
                (Some(result), None) => Ok(result),
                (None, Some(error)) => Err(RemoteError::from_value(error)),
                (Some(_), Some(_)) => {
                    return Err(ProtocolError::MalformedResponse {
                        id,
                        reason: "both result and error present".to_string(),
                    })
                }
                (None, None) => {
                    return Err(ProtocolError::MalformedResponse {
                        id,
                        reason: "neither result nor error present".to_string(),
                    })
                }
            };
            Ok(IncomingMessage::Response { id, outcome })
        }
        (None, Some(method)) => {
            let method = method_name(method)?;
            EngineNotification::decode(&method, params).map(IncomingMessage::Notification)
        }
        (Some(id), Some(method)) => {
            let id = parse_id(&id)?;
            let method = method_name(method)?;
            let request = EngineRequest::decode(&method, params)?;
            Ok(IncomingMessage::Request { id, request })
        }
        (None, None) => Err(ProtocolError::UnrecognizedMessage(snippet(&Value::Object(
            object,
        )))),
    }
}

fn parse_id(id: &Value) -> Result<RequestId, ProtocolError> {
    id.as_u64()
        .ok_or_else(|| ProtocolError::InvalidId(id.to_string()))
}

fn method_name(method: Value) -> Result<String, ProtocolError> {
    match method {
        Value::String(name) => Ok(name),
        other => Err(ProtocolError::UnrecognizedMessage(format!(
            "method is not a string: {}",
            other
        ))),
    }
}

fn snippet(value: &Value) -> String {
    value.to_string().chars().take(200).collect()
}
