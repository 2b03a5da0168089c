//! RESP2 protocol implementation
//!
//! Encodes commands and decodes replies for the endpoint connections. The
//! decoder is incremental: it returns `Ok(None)` until a full frame is
//! buffered, so callers can keep reading from the socket and retry.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use redis_mesh_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::io::Cursor;

const CRLF: &[u8] = b"\r\n";
const MAX_PREALLOCATED_ITEMS: i64 = 1024;

/// A command name plus its arguments, as queued for a pipeline
pub type CommandFrame = (String, Vec<RespValue>);

/// Encodes RESP values and commands
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a RESP value into a buffer
    pub fn encode(value: &RespValue, buf: &mut BytesMut) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(e) => {
                buf.put_u8(b'-');
                buf.put_slice(e.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(i) => {
                buf.put_u8(b':');
                buf.put_slice(i.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(data) => Self::put_bulk(data, buf),
            RespValue::Null => buf.put_slice(b"$-1\r\n"),
            RespValue::Array(items) => {
                Self::put_header(b'*', items.len(), buf);
                for item in items {
                    Self::encode(item, buf);
                }
            }
        }
    }

    /// Append one command to a buffer
    ///
    /// Arguments are always sent as bulk strings, as the server expects for
    /// request frames.
    pub fn encode_command_into(command: &str, args: &[RespValue], buf: &mut BytesMut) {
        Self::put_header(b'*', 1 + args.len(), buf);
        Self::put_bulk(command.as_bytes(), buf);
        for arg in args {
            match arg {
                RespValue::Integer(i) => Self::put_bulk(i.to_string().as_bytes(), buf),
                RespValue::SimpleString(s) => Self::put_bulk(s.as_bytes(), buf),
                other => Self::encode(other, buf),
            }
        }
    }

    /// Encode a command with arguments
    pub fn encode_command(command: &str, args: &[RespValue]) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        Self::encode_command_into(command, args, &mut buf);
        buf.freeze()
    }

    /// Encode several commands back to back for a single write
    pub fn encode_pipeline(commands: &[CommandFrame]) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 * commands.len());
        for (command, args) in commands {
            Self::encode_command_into(command, args, &mut buf);
        }
        buf.freeze()
    }

    fn put_header(prefix: u8, len: usize, buf: &mut BytesMut) {
        buf.put_u8(prefix);
        buf.put_slice(len.to_string().as_bytes());
        buf.put_slice(CRLF);
    }

    fn put_bulk(data: &[u8], buf: &mut BytesMut) {
        Self::put_header(b'$', data.len(), buf);
        buf.put_slice(data);
        buf.put_slice(CRLF);
    }
}

/// Decodes RESP values from bytes
pub struct RespDecoder;

impl RespDecoder {
    /// Decode one RESP value, or `None` if the buffer holds a partial frame
    pub fn decode(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let type_byte = buf.chunk()[0];
        buf.advance(1);

        match type_byte {
            b'+' => Ok(Self::read_text(buf)?.map(RespValue::SimpleString)),
            b'-' => Ok(Self::read_text(buf)?.map(RespValue::Error)),
            b':' => Ok(Self::read_number(buf)?.map(RespValue::Integer)),
            b'$' => Self::decode_bulk_string(buf),
            b'*' => Self::decode_array(buf),
            _ => Err(RedisError::Protocol(format!(
                "Invalid RESP type byte: {}",
                type_byte as char
            ))),
        }
    }

    fn decode_bulk_string(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        let len = match Self::read_number(buf)? {
            Some(len) => len,
            None => return Ok(None),
        };
        if len < 0 {
            return Ok(Some(RespValue::Null));
        }

        let len = len as usize;
        if buf.remaining() < len + 2 {
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
        buf.advance(len + 2);
        Ok(Some(RespValue::BulkString(data)))
    }

    fn decode_array(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        let len = match Self::read_number(buf)? {
            Some(len) => len,
            None => return Ok(None),
        };
        if len < 0 {
            return Ok(Some(RespValue::Null));
        }

        // Length comes off the wire, cap the up-front allocation
        let mut items = Vec::with_capacity(len.min(MAX_PREALLOCATED_ITEMS) as usize);
        for _ in 0..len {
            match Self::decode(buf)? {
                Some(value) => items.push(value),
                None => return Ok(None),
            }
        }
        Ok(Some(RespValue::Array(items)))
    }

    fn read_number(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<i64>> {
        match Self::read_text(buf)? {
            Some(line) => line
                .parse::<i64>()
                .map(Some)
                .map_err(|e| RedisError::Protocol(format!("Invalid integer {line:?}: {e}"))),
            None => Ok(None),
        }
    }

    fn read_text(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<String>> {
        match Self::read_line(buf) {
            Some(line) => String::from_utf8(line)
                .map(Some)
                .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {e}"))),
            None => Ok(None),
        }
    }

    fn read_line(buf: &mut Cursor<&[u8]>) -> Option<Vec<u8>> {
        let start = buf.position() as usize;
        let slice = buf.get_ref();
        let end = slice[start..].windows(2).position(|w| w == CRLF)? + start;
        let line = slice[start..end].to_vec();
        buf.set_position((end + 2) as u64);
        Some(line)
    }
}
