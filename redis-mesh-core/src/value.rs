//! RESP (`REdis` Serialization Protocol) value types

use crate::error::{RedisError, RedisResult};
use bytes::Bytes;

/// RESP protocol value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// Null bulk string: $-1\r\n
    Null,
    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Convert to a string if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a string.
    pub fn as_string(&self) -> RedisResult<String> {
        match self {
            Self::SimpleString(s) => Ok(s.clone()),
            Self::BulkString(b) => String::from_utf8(b.to_vec())
                .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}"))),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to string"
            ))),
        }
    }

    /// Convert to an optional string, mapping null to `None`
    ///
    /// # Errors
    ///
    /// Returns an error if a non-null value cannot be converted to a string.
    pub fn into_optional_string(self) -> RedisResult<Option<String>> {
        match self {
            Self::Null => Ok(None),
            other => other.as_string().map(Some),
        }
    }

    /// Convert to an integer if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an integer.
    pub fn as_int(&self) -> RedisResult<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::BulkString(b) => {
                let s = std::str::from_utf8(b)
                    .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}")))?;
                s.parse::<i64>()
                    .map_err(|e| RedisError::Type(format!("Cannot parse integer: {e}")))
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to integer"
            ))),
        }
    }

    /// Interpret an integer reply as a boolean (`1` is true)
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an integer-like reply.
    pub fn as_bool(&self) -> RedisResult<bool> {
        match self {
            Self::Null => Ok(false),
            Self::SimpleString(s) if s == "OK" => Ok(true),
            other => other.as_int().map(|i| i != 0),
        }
    }

    /// Convert to bytes if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to bytes.
    pub fn as_bytes(&self) -> RedisResult<Bytes> {
        match self {
            Self::BulkString(b) => Ok(b.clone()),
            Self::SimpleString(s) => Ok(Bytes::from(s.clone().into_bytes())),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to bytes"
            ))),
        }
    }

    /// Take the elements of an array reply
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an array.
    pub fn into_array(self) -> RedisResult<Vec<Self>> {
        match self {
            Self::Array(arr) => Ok(arr),
            other => Err(RedisError::Type(format!(
                "Cannot convert {other:?} to array"
            ))),
        }
    }

    /// Check if this is a null value
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this is an error
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Turn an error reply into a [`RedisError::Server`], passing other values through
    ///
    /// # Errors
    ///
    /// Returns the server error if this value is an error reply.
    pub fn into_result(self) -> RedisResult<Self> {
        match self {
            Self::Error(msg) => Err(RedisError::Server(msg)),
            other => Ok(other),
        }
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        Self::BulkString(Bytes::from(s.into_bytes()))
    }
}

impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        Self::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<&String> for RespValue {
    fn from(s: &String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        Self::BulkString(Bytes::from(i.to_string()))
    }
}

impl From<u64> for RespValue {
    fn from(i: u64) -> Self {
        Self::BulkString(Bytes::from(i.to_string()))
    }
}

impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        Self::BulkString(b)
    }
}

impl TryFrom<RespValue> for String {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_string()
    }
}

impl TryFrom<RespValue> for Option<String> {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.into_optional_string()
    }
}

impl TryFrom<RespValue> for i64 {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_int()
    }
}

impl TryFrom<RespValue> for bool {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_bool()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_string() {
        assert_eq!(RespValue::Null.into_optional_string().unwrap(), None);
        assert_eq!(
            RespValue::from("v").into_optional_string().unwrap(),
            Some("v".to_string())
        );
    }

    #[test]
    fn test_bool_replies() {
        assert!(RespValue::Integer(1).as_bool().unwrap());
        assert!(!RespValue::Integer(0).as_bool().unwrap());
        assert!(!RespValue::Null.as_bool().unwrap());
        assert!(RespValue::SimpleString("OK".to_string()).as_bool().unwrap());
        assert!(RespValue::Array(vec![]).as_bool().is_err());
    }

    #[test]
    fn test_integer_arguments_are_bulk_strings() {
        assert_eq!(RespValue::from(42_i64), RespValue::from("42"));
    }

    #[test]
    fn test_error_reply_into_result() {
        let err = RespValue::Error("ERR boom".to_string())
            .into_result()
            .unwrap_err();
        assert!(matches!(err, RedisError::Server(ref m) if m == "ERR boom"));
        assert_eq!(
            RespValue::Integer(3).into_result().unwrap(),
            RespValue::Integer(3)
        );
    }
}
