//! Response bodies the host writes on a handler's behalf.
//!
//! Strings and bytes go out raw. Anything else is wrapped as
//! `{"code":"0","message":"success","data":...}`. Failures are a 400 with
//! `{"code":"1","kind":...,"message":...}`.

use capbridge_core::{Error, Value};
use serde_json::json;

pub const SUCCESS_STATUS: u16 = 200;
pub const FAILURE_STATUS: u16 = 400;

const JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn success(value: &Value) -> Self {
        let (content_type, body) = match value {
            Value::String(text) => ("text/plain; charset=utf-8", text.as_bytes().to_vec()),
            Value::Bytes(bytes) => ("application/octet-stream", bytes.clone()),
            other => (
                JSON,
                json!({"code": "0", "message": "success", "data": other.to_json()})
                    .to_string()
                    .into_bytes(),
            ),
        };
        Self {
            status: SUCCESS_STATUS,
            content_type,
            body,
        }
    }

    pub fn failure(error: &Error) -> Self {
        let body = json!({
            "code": "1",
            "kind": error.kind().as_str(),
            "message": error.to_string(),
        });
        Self {
            status: FAILURE_STATUS,
            content_type: JSON,
            body: body.to_string().into_bytes(),
        }
    }
}
