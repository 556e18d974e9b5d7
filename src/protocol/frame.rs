// src/protocol/frame.rs

//! The two JSON shapes exchanged over the wire: a client request, and a
//! server response (either a command's return value or a fan-out
//! notification).

use serde::{Deserialize, Serialize};

/// `{"command": string, "args": [..], "kwargs": {..}}`
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

/// Either `{"return": value}` in response to a command, or a fan-out
/// notification object.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Response {
    Return {
        #[serde(rename = "return")]
        value: serde_json::Value,
    },
    JobsChanged {
        jobs_changed: Vec<u64>,
    },
    MachinesChanged {
        machines_changed: Vec<String>,
    },
}

impl Response {
    pub fn ret(value: serde_json::Value) -> Self {
        Response::Return { value }
    }
}
