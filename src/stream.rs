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

//! Presents one upgraded connection as a single buffered duplex channel.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use futures::ready;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, BufStream, ReadBuf};

/// A buffered bidirectional stream over one upgraded connection.
///
/// Reads go through an internal buffer with no framing applied. A write is
/// reported complete only once the buffered bytes have been flushed to the
/// underlying stream: the HTTP message writer sitting on top has no
/// end-of-message signal of its own, so without the eager flush a reversed
/// request could sit in user-space buffers indefinitely. Shutdown is
/// delegated to the underlying stream, never just the buffer.
///
/// The adapter owns its stream exclusively; I/O errors propagate unchanged
/// and are terminal for the exchange in progress.
#[pin_project]
#[derive(Debug)]
pub struct DuplexStream<S> {
    #[pin]
    io: BufStream<S>,
    // Set once the bytes of an accepted write are handed to the buffer;
    // cleared when the flush that completes that write has finished.
    pending_flush: Option<usize>,
}

impl<S> DuplexStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wraps `io` in a buffered duplex adapter.
    #[inline]
    pub fn new(io: S) -> Self {
        Self {
            io: BufStream::new(io),
            pending_flush: None,
        }
    }
}

impl<S> AsyncRead for DuplexStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    #[inline]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().io.poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for DuplexStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        let len = match *this.pending_flush {
            Some(len) => len,
            None => {
                let len = ready!(this.io.as_mut().poll_write(cx, buf))?;
                *this.pending_flush = Some(len);
                len
            }
        };
        ready!(this.io.poll_flush(cx))?;
        *this.pending_flush = None;
        Poll::Ready(Ok(len))
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_shutdown(cx)
    }
}
