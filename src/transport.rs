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

//! Round trips requests over an already-established reversed stream.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::codec;
use crate::error::ReverseError;
use crate::stream::DuplexStream;

/// Sends requests and reads responses over one reversed connection
/// instead of dialing anywhere.
///
/// The stream is owned exclusively for the lifetime of the reversed
/// relationship. One connection carries one request/response pair at a
/// time: a second [`round_trip`](Self::round_trip) started while another
/// is in flight queues on the internal lock, it does not error.
pub struct ReversedTransport<S> {
    stream: Arc<Mutex<DuplexStream<S>>>,
}

impl<S> Clone for ReversedTransport<S> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            stream: Arc::clone(&self.stream),
        }
    }
}

impl<S> fmt::Debug for ReversedTransport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReversedTransport").finish_non_exhaustive()
    }
}

impl<S> ReversedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Takes exclusive ownership of `stream` for reversed exchanges.
    #[inline]
    pub fn new(stream: DuplexStream<S>) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    /// Performs one full exchange: serializes `req` onto the reversed
    /// stream, flushes, and parses the single response that follows.
    ///
    /// When the peer answers `101 Switching Protocols` the returned body
    /// is [`ReversedBody::Upgraded`]: the connection now speaks the
    /// switched protocol and the body carries the exclusively-owned
    /// duplex stream, which allows reversal to be chained a further
    /// level.
    ///
    /// # Errors
    ///
    /// A write or flush failure is returned as is and leaves the peer's
    /// state unknown; the reversed connection must not be reused. A
    /// malformed response fails the exchange the same way. Nothing is
    /// retried.
    pub async fn round_trip(
        &self,
        req: Request<Bytes>,
    ) -> Result<Response<ReversedBody<S>>, ReverseError> {
        let mut io = Arc::clone(&self.stream).lock_owned().await;
        trace!(method = %req.method(), uri = %req.uri(), "sending reversed request");
        codec::write_request(&mut *io, &req).await?;
        let resp = codec::read_response(&mut *io).await?;
        debug!(status = %resp.status(), "reversed exchange completed");
        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let (parts, _) = resp.into_parts();
            return Ok(Response::from_parts(
                parts,
                ReversedBody::Upgraded(UpgradedIo { io }),
            ));
        }
        Ok(resp.map(ReversedBody::Complete))
    }
}

/// The body of a response obtained over a reversed connection.
///
/// Callers branch on the tag: ordinary responses arrive fully buffered,
/// while a nested protocol switch hands over the raw duplex stream.
pub enum ReversedBody<S> {
    /// A regular response body, read to completion.
    Complete(Bytes),
    /// The peer switched protocols; the stream now belongs to the caller.
    Upgraded(UpgradedIo<S>),
}

impl<S> ReversedBody<S> {
    /// The buffered body bytes, unless the connection was upgraded.
    #[inline]
    #[must_use]
    pub const fn bytes(&self) -> Option<&Bytes> {
        match *self {
            Self::Complete(ref bytes) => Some(bytes),
            Self::Upgraded(_) => None,
        }
    }

    /// Consumes the body, yielding its bytes unless upgraded.
    #[inline]
    #[must_use]
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Self::Complete(bytes) => Some(bytes),
            Self::Upgraded(_) => None,
        }
    }

    /// True when the peer switched protocols on this exchange.
    #[inline]
    #[must_use]
    pub const fn is_upgraded(&self) -> bool {
        matches!(*self, Self::Upgraded(_))
    }
}

impl<S> fmt::Debug for ReversedBody<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Complete(ref bytes) => f.debug_tuple("Complete").field(bytes).finish(),
            Self::Upgraded(_) => f.debug_tuple("Upgraded").finish(),
        }
    }
}

/// The duplex stream of a nested protocol switch.
///
/// Holds the transport's exclusive lock for as long as it lives, so no
/// further round trip can start on a connection whose ownership moved to
/// the switched protocol.
pub struct UpgradedIo<S> {
    io: OwnedMutexGuard<DuplexStream<S>>,
}

impl<S> fmt::Debug for UpgradedIo<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradedIo").finish_non_exhaustive()
    }
}

impl<S> AsyncRead for UpgradedIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for UpgradedIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }
}
