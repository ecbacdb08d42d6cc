// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use custom_error::custom_error;

use std::{io, net::SocketAddr};

//==============================================================================
// Fail
//==============================================================================

custom_error! {#[derive(Clone, PartialEq)] pub Fail
    Cancelled{} = "operation cancelled",
    Timeout{} = "operation timed out",
    ConnectionClosed{ by: String, reason: String } = "connection closed by {by}: {reason}",
    QueueFull{} = "queue is full",
    QueueEmpty{} = "queue is empty",
    Os{ errno: i32 } = "os error {errno}",
    Malformed{ details: &'static str } = "malformed message: {details}",
    Unsupported{ details: &'static str } = "unsupported operation: {details}",
    Resolution{ host: String } = "could not resolve {host}",
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Fail].
impl Fail {
    /// Creates a connection-closed error naming the remote peer.
    pub fn closed_by(peer: SocketAddr) -> Fail {
        Fail::ConnectionClosed {
            by: peer.to_string(),
            reason: "connection closed".to_string(),
        }
    }

    /// Creates the error raised when a delimited read overruns its limit.
    pub fn entity_too_large() -> Fail {
        Fail::ConnectionClosed {
            by: "[::]:0".to_string(),
            reason: "Entity Too Large".to_string(),
        }
    }

    /// Creates an error from the calling thread's last OS error.
    pub fn last_os_error() -> Fail {
        io::Error::last_os_error().into()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Conversion trait implementation for OS-level failures.
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Fail::Os {
            errno: e.raw_os_error().unwrap_or(0),
        }
    }
}
