// src/protocol/codec.rs

//! A `tokio_util::codec` for newline-delimited JSON: one `serde_json::Value`
//! per line, no other framing. Grounded in the same `Decoder`/`Encoder`
//! shape as the reference crate's RESP codec, with line-splitting standing
//! in for RESP's length-prefixed frames.

use crate::core::SpallocError;
use bytes::{BufMut, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Default)]
pub struct JsonLineCodec;

impl Decoder for JsonLineCodec {
    type Item = serde_json::Value;
    type Error = SpallocError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(newline_pos) = src.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut line = src.split_to(newline_pos + 1);
        line.truncate(line.len() - 1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return self.decode(src);
        }
        let value: serde_json::Value = serde_json::from_slice(&line)?;
        Ok(Some(value))
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec {
    type Error = SpallocError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = serde_json::to_vec(&item)?;
        dst.reserve(bytes.len() + 1);
        dst.extend_from_slice(&bytes);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn decodes_one_complete_line() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::from(&b"{\"command\":\"version\"}\n"[..]);
        let value = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(value["command"], "version");
        assert!(buf.is_empty());
    }

    #[test]
    fn returns_none_on_incomplete_line() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::from(&b"{\"command\":\"versi"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn skips_blank_lines() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::from(&b"\n{\"command\":\"version\"}\n"[..]);
        let value = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(value["command"], "version");
    }

    #[test]
    fn encodes_with_trailing_newline() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::new();
        codec.encode(serde_json::json!({"return": 1}), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"return\":1}\n");
    }
}
