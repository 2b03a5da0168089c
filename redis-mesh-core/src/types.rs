//! Common types used throughout the cluster backend

use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a node in the host runtime's cluster
///
/// The runtime owns the meaning of the string; this crate only requires
/// that distinct nodes have distinct addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Create a node address
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The address as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Logical role a pool of endpoints serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointRole {
    /// Actor placement directory
    ActorDirectory,
    /// Node registration directory
    NodeDirectory,
    /// Pub/sub messaging
    Messaging,
}

impl EndpointRole {
    /// All roles, in pool construction order
    pub const ALL: [Self; 3] = [Self::ActorDirectory, Self::NodeDirectory, Self::Messaging];
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActorDirectory => write!(f, "actor-directory"),
            Self::NodeDirectory => write!(f, "node-directory"),
            Self::Messaging => write!(f, "messaging"),
        }
    }
}

/// Health state of one endpoint client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Serving requests
    Live,
    /// Failed too many consecutive health checks; excluded from routing
    Degraded,
    /// Shut down; never serves again
    Closed,
}

impl EndpointState {
    /// Encode for atomic storage
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Live => 0,
            Self::Degraded => 1,
            Self::Closed => 2,
        }
    }

    /// Decode from atomic storage
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Live,
            1 => Self::Degraded,
            _ => Self::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_state_roundtrip() {
        for state in [EndpointState::Live, EndpointState::Degraded, EndpointState::Closed] {
            assert_eq!(EndpointState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_role_display() {
        assert_eq!(EndpointRole::NodeDirectory.to_string(), "node-directory");
        assert_eq!(EndpointRole::ALL.len(), 3);
    }
}
