// Copyright 2024 All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::error::Error;

use thiserror::Error as ThisError;

/// Everything that can go wrong while reversing a connection.
///
/// None of these are retried internally. A failed exchange leaves the
/// reversed connection in an unknown state; recovering means performing a
/// fresh upgrade handshake on a new connection.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum ReverseError {
    /// The inbound request does not carry the reverse HTTP upgrade marker.
    #[error("request is not a valid reverse HTTP upgrade request")]
    NotUpgradeRequest,

    /// The response is not a `101 Switching Protocols` carrying the
    /// reverse HTTP upgrade marker.
    #[error("response is not a valid reverse HTTP upgrade response")]
    NotUpgradeResponse,

    /// The serving stack never exposed the connection for takeover.
    #[error("connection does not support protocol upgrades")]
    HijackUnsupported,

    /// The connection takeover was offered but failed to complete.
    #[error("failed to take over the upgraded connection")]
    Hijack(#[source] hyper::Error),

    /// A read, write, or flush on the reversed connection failed. Fatal
    /// for the current exchange.
    #[error("i/o on the reversed connection failed")]
    Io(#[from] std::io::Error),

    /// The peer sent something that does not parse as an HTTP/1.1 message.
    #[error("malformed HTTP message on the reversed connection")]
    Parse(#[from] httparse::Error),

    /// [`ResponseWriter::hijack`](crate::ResponseWriter::hijack) was
    /// called on a writer that was already hijacked.
    #[error("cannot re-hijack an already hijacked response")]
    AlreadyHijacked,

    /// The response was hijacked; its writer no longer accepts body bytes.
    #[error("cannot write to the response after hijacking")]
    Hijacked,

    /// The upgrade URL could not be parsed.
    #[error("invalid upgrade request url")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The caller-supplied HTTP client failed to perform the upgrade
    /// request.
    #[error("upgrade request could not be performed")]
    Client(#[source] Box<dyn Error + Send + Sync>),
}
