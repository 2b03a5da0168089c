//! Core types for the redis-mesh cluster backend
//!
//! This crate provides the configuration surface, error taxonomy and wire
//! value types shared by every layer of `redis-mesh`.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::{ClusterConfig, ConnectionConfig, EndpointUri};
pub use error::{RedisError, RedisResult};
pub use types::{EndpointRole, EndpointState, NodeAddress};
pub use value::RespValue;
