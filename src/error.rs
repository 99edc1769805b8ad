// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io::{self, Error, ErrorKind};

/// Bus-specific failure conditions that do not map cleanly onto a transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// `send_message`/`subscribe` given an empty channel name.
    InvalidChannel,
    /// `add_to_group`/`close_group` by a listener that does not own the group.
    NotGroupOwner,
    /// `add_to_group` against a channel name already owned by someone else.
    GroupOwnerConflict,
    /// No mailbox, channel, or return-path entry could resolve the destination.
    NoRoute,
    /// A bridge handshake or frame could not be parsed.
    Protocol(&'static str),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::InvalidChannel => write!(f, "invalid channel name"),
            BusError::NotGroupOwner => write!(f, "listener does not own this group"),
            BusError::GroupOwnerConflict => write!(f, "channel already exists with a different owner"),
            BusError::NoRoute => write!(f, "no route to destination"),
            BusError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<BusError> for Error {
    fn from(e: BusError) -> Error {
        let kind = match e {
            BusError::InvalidChannel => ErrorKind::InvalidInput,
            BusError::NotGroupOwner => ErrorKind::PermissionDenied,
            BusError::GroupOwnerConflict => ErrorKind::AlreadyExists,
            BusError::NoRoute => ErrorKind::NotFound,
            BusError::Protocol(_) => ErrorKind::InvalidData,
        };
        Error::new(kind, e)
    }
}

pub type BusResult<T> = Result<T, BusError>;

pub fn other_io_error(msg: &'static str) -> Error {
    Error::new(ErrorKind::Other, msg)
}

/// Reported by the reactor for failures that have no caller to return a `Result` to.
pub trait ErrorCallback: Send + Sync {
    fn on_error(&self, action: &'static str, location: &'static str, err: &io::Error);
}

/// Default `ErrorCallback` that logs via the `log` facade.
pub struct LoggingErrorCallback;

impl ErrorCallback for LoggingErrorCallback {
    fn on_error(&self, action: &'static str, location: &'static str, err: &io::Error) {
        log::error!("[{location}] {action} failed: {err}");
    }
}
