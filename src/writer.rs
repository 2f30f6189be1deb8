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

//! The response writer handed to handlers of reversed requests.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Request, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::ReverseError;
use crate::handshake::{apply_upgrade_headers, is_upgrade_request};
use crate::server::ReverseClient;
use crate::stream::DuplexStream;

/// Answers a single request framed on a reversed stream.
///
/// Headers and body bytes are buffered; nothing touches the wire before
/// [`flush`](Self::flush), [`close`](Self::close), or
/// [`hijack`](Self::hijack). The status line and headers are serialized
/// exactly once, with `content-length` computed from the buffered body.
/// Header mutation after the head went out is permitted and silently has
/// no wire effect.
///
/// One writer exists per reversed exchange and is driven from a single
/// task; it is consumed by the serving loop once the handler hands it
/// back.
pub struct ResponseWriter<S> {
    io: DuplexStream<S>,
    version: Version,
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    head_written: bool,
    flushed: bool,
    hijacked: bool,
}

impl<S> ResponseWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: DuplexStream<S>, version: Version) -> Self {
        Self {
            io,
            version,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            head_written: false,
            flushed: false,
            hijacked: false,
        }
    }

    /// The response headers. Mutable until the head is serialized;
    /// mutations after that are ignored on the wire but are not an error.
    #[inline]
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the response headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Records the response status. The first call wins; later calls are
    /// no-ops, matching the idempotent-header contract of HTTP response
    /// writers.
    #[inline]
    pub fn write_header(&mut self, status: StatusCode) {
        if self.head_written {
            return;
        }
        self.status = status;
        self.head_written = true;
    }

    /// Appends `buf` to the buffered response body. A write before any
    /// [`write_header`](Self::write_header) records status `200 OK`.
    ///
    /// # Errors
    ///
    /// Returns [`ReverseError::Hijacked`] once the connection has been
    /// taken over; the writer no longer owns the stream then.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, ReverseError> {
        if self.hijacked {
            return Err(ReverseError::Hijacked);
        }
        if !self.head_written {
            self.write_header(StatusCode::OK);
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Serializes the status line, headers, and buffered body onto the
    /// stream. A no-op after the first call; body bytes buffered after a
    /// flush are forwarded by [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// Write failures on the underlying stream propagate unchanged and
    /// are terminal for the exchange.
    pub async fn flush(&mut self) -> Result<(), ReverseError> {
        if self.hijacked || self.flushed {
            return Ok(());
        }
        self.flush_to_stream().await
    }

    /// Finishes the response: flushes head and body if nothing went out
    /// yet, otherwise forwards whatever was buffered since the flush.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Write failures on the underlying stream propagate unchanged.
    pub async fn close(&mut self) -> Result<(), ReverseError> {
        if self.hijacked {
            return Ok(());
        }
        self.finalize().await
    }

    /// Takes over the raw duplex stream, first forcing a flush so the
    /// peer has a consistent partial response. After this, ordinary
    /// writes fail.
    ///
    /// # Errors
    ///
    /// Returns [`ReverseError::AlreadyHijacked`] when the stream was
    /// already taken over; that failure performs no I/O.
    pub async fn hijack(&mut self) -> Result<&mut DuplexStream<S>, ReverseError> {
        if self.hijacked {
            return Err(ReverseError::AlreadyHijacked);
        }
        self.finalize().await?;
        self.hijacked = true;
        Ok(&mut self.io)
    }

    /// Completes a nested reverse HTTP upgrade requested by the peer:
    /// validates `req`, answers `101 Switching Protocols`, hijacks this
    /// writer's stream, and returns a client that issues requests over
    /// it. This is how a reversed connection is reversed again in the
    /// opposite direction.
    ///
    /// # Errors
    ///
    /// Returns [`ReverseError::NotUpgradeRequest`] when `req` lacks the
    /// upgrade marker, or [`ReverseError::AlreadyHijacked`] when the
    /// stream is already gone; I/O failures while writing the `101` head
    /// propagate unchanged.
    pub async fn reverse(
        &mut self,
        req: &Request<Bytes>,
    ) -> Result<ReverseClient<&mut DuplexStream<S>>, ReverseError> {
        if !is_upgrade_request(req) {
            return Err(ReverseError::NotUpgradeRequest);
        }
        apply_upgrade_headers(&mut self.headers);
        self.write_header(StatusCode::SWITCHING_PROTOCOLS);
        let io = self.hijack().await?;
        debug!("reversed an already-reversed connection");
        Ok(ReverseClient::from_stream(io))
    }

    async fn finalize(&mut self) -> Result<(), ReverseError> {
        if self.flushed {
            if !self.body.is_empty() {
                let stragglers = self.body.split().freeze();
                self.io.write_all(&stragglers).await?;
            }
            self.io.flush().await?;
            return Ok(());
        }
        self.flush_to_stream().await
    }

    async fn flush_to_stream(&mut self) -> Result<(), ReverseError> {
        if !self.head_written {
            self.write_header(StatusCode::OK);
        }
        let length = content_length_for(self.status, self.body.len());
        let head = crate::codec::response_head(self.version, self.status, &self.headers, length);
        self.io.write_all(&head).await?;
        if !self.body.is_empty() {
            let body = self.body.split().freeze();
            self.io.write_all(&body).await?;
        }
        self.io.flush().await?;
        self.flushed = true;
        Ok(())
    }
}

/// Statuses whose responses carry no body get no `content-length`; every
/// other response advertises the buffered body's length.
fn content_length_for(status: StatusCode, len: usize) -> Option<usize> {
    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
    {
        None
    } else {
        Some(len)
    }
}
