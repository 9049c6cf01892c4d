// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::{
    error,
    fmt,
};

//==============================================================================
// Structures
//==============================================================================

/// Failure conditions surfaced by the stack.
///
/// The enumeration is closed: every condition a caller can observe is one of
/// these variants, and nothing outside of this space is ever returned.
/// `ConnectStarted` and `WouldBlock` are flow-control results rather than
/// failures, but they travel through the same channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fail {
    UnknownProtocol,
    UnknownNicId,
    UnknownProtocolOption,
    DuplicateNicId,
    DuplicateAddress,
    NoRoute,
    BadLinkEndpoint,
    AlreadyBound,
    InvalidEndpointState,
    AlreadyConnecting,
    AlreadyConnected,
    NoPortAvailable,
    PortInUse,
    BadLocalAddress,
    ClosedForSend,
    ClosedForReceive,
    WouldBlock,
    ConnectionRefused,
    Timeout,
    Aborted,
    ConnectStarted,
    DestinationRequired,
    NotSupported,
    QueueSizeNotSupported,
    NotConnected,
    ConnectionReset,
    ConnectionAborted,
    NoSuchFile,
    InvalidOptionValue,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Fail {
    /// Returns the canonical message for this failure.
    pub fn message(&self) -> &'static str {
        match self {
            Fail::UnknownProtocol => "unknown protocol",
            Fail::UnknownNicId => "unknown nic id",
            Fail::UnknownProtocolOption => "unknown option for protocol",
            Fail::DuplicateNicId => "duplicate nic id",
            Fail::DuplicateAddress => "duplicate address",
            Fail::NoRoute => "no route",
            Fail::BadLinkEndpoint => "bad link layer endpoint",
            Fail::AlreadyBound => "endpoint already bound",
            Fail::InvalidEndpointState => "endpoint is in invalid state",
            Fail::AlreadyConnecting => "endpoint is already connecting",
            Fail::AlreadyConnected => "endpoint is already connected",
            Fail::NoPortAvailable => "no ports are available",
            Fail::PortInUse => "port is in use",
            Fail::BadLocalAddress => "bad local address",
            Fail::ClosedForSend => "endpoint is closed for send",
            Fail::ClosedForReceive => "endpoint is closed for receive",
            Fail::WouldBlock => "operation would block",
            Fail::ConnectionRefused => "connection was refused",
            Fail::Timeout => "operation timed out",
            Fail::Aborted => "operation aborted",
            Fail::ConnectStarted => "connection attempt started",
            Fail::DestinationRequired => "destination address is required",
            Fail::NotSupported => "operation not supported",
            Fail::QueueSizeNotSupported => "queue size querying not supported",
            Fail::NotConnected => "endpoint not connected",
            Fail::ConnectionReset => "connection reset by peer",
            Fail::ConnectionAborted => "connection aborted",
            Fail::NoSuchFile => "no such file",
            Fail::InvalidOptionValue => "invalid option value specified",
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl error::Error for Fail {}
