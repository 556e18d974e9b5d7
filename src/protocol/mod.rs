// src/protocol/mod.rs

//! The wire protocol: newline-delimited JSON-RPC-ish frames over TCP.

pub mod codec;
pub mod frame;

pub use codec::JsonLineCodec;
pub use frame::{Request, Response};
