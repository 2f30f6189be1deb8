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

//! Turns an inbound upgrade request into an outbound-looking HTTP client.

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use bytes::Bytes;
use futures::ready;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::Empty;
use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tower_service::Service;
use tracing::debug;

use crate::error::ReverseError;
use crate::handshake::is_upgrade_request;
use crate::stream::DuplexStream;
use crate::transport::{ReversedBody, ReversedTransport};
use crate::{UPGRADE_PROTOCOL, UPGRADE_TOKEN};

/// Accepts a reverse HTTP upgrade inside an ordinary hyper service.
///
/// Validates `req`, takes the connection-takeover capability out of it,
/// and returns the `101 Switching Protocols` response to hand back to
/// hyper together with an [`OnReverse`] future. Once hyper has written
/// the response and released the connection, the future resolves to a
/// [`ReverseClient`] whose calls travel down the connection the peer
/// opened.
///
/// # Errors
///
/// [`ReverseError::NotUpgradeRequest`] when `req` lacks the upgrade
/// marker, and [`ReverseError::HijackUnsupported`] when the serving stack
/// never exposed the connection for takeover (for hyper, the connection
/// must be served with upgrades enabled).
pub fn reverse_request<B>(
    req: &mut Request<B>,
) -> Result<(Response<Empty<Bytes>>, OnReverse), ReverseError> {
    if !is_upgrade_request(req) {
        return Err(ReverseError::NotUpgradeRequest);
    }
    // The takeover capability rides along in the request extensions;
    // a serving stack that cannot release the connection never put it
    // there.
    if req.extensions().get::<OnUpgrade>().is_none() {
        return Err(ReverseError::HijackUnsupported);
    }
    let on_upgrade = hyper::upgrade::on(&mut *req);

    let mut response = Response::new(Empty::new());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static(UPGRADE_TOKEN));
    debug!(uri = %req.uri(), "accepted reverse HTTP upgrade");
    Ok((response, OnReverse { on_upgrade }))
}

/// Resolves to the [`ReverseClient`] of a completed upgrade.
#[pin_project]
#[derive(Debug)]
pub struct OnReverse {
    #[pin]
    on_upgrade: OnUpgrade,
}

impl Future for OnReverse {
    type Output = Result<ReverseClient<TokioIo<Upgraded>>, ReverseError>;

    #[inline]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let upgraded = ready!(self.project().on_upgrade.poll(cx)).map_err(ReverseError::Hijack)?;
        Poll::Ready(Ok(ReverseClient::from_stream(TokioIo::new(upgraded))))
    }
}

/// An HTTP client whose every request physically reuses one reversed
/// connection.
///
/// Behaves like a normal client to its caller, but nothing is ever
/// dialed: requests are serialized onto the hijacked stream and answered
/// by the peer that originally connected. A reversed connection is meant
/// for a single exchange; it is possible the connection stays usable and
/// the client works for more than one call, but that behavior should not
/// be relied on. Concurrent calls are serialized with no ordering
/// guarantee beyond that.
pub struct ReverseClient<S> {
    transport: ReversedTransport<S>,
}

impl<S> Clone for ReverseClient<S> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<S> fmt::Debug for ReverseClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseClient").finish_non_exhaustive()
    }
}

impl<S> ReverseClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a reversed transport.
    #[inline]
    #[must_use]
    pub const fn new(transport: ReversedTransport<S>) -> Self {
        Self { transport }
    }

    /// Builds a client over any established duplex stream, e.g. a freshly
    /// upgraded connection.
    #[inline]
    pub fn from_stream(io: S) -> Self {
        Self::new(ReversedTransport::new(DuplexStream::new(io)))
    }

    /// Performs `req` over the reversed connection.
    ///
    /// # Errors
    ///
    /// Propagates [`ReverseError`] from the round trip; failures are
    /// terminal for the reversed connection.
    pub async fn request(
        &self,
        req: Request<Bytes>,
    ) -> Result<Response<ReversedBody<S>>, ReverseError> {
        self.transport.round_trip(req).await
    }

    /// Issues a GET for `uri` over the reversed connection.
    ///
    /// # Errors
    ///
    /// [`ReverseError::InvalidUri`] when `uri` does not parse, otherwise
    /// as [`request`](Self::request).
    pub async fn get(&self, uri: &str) -> Result<Response<ReversedBody<S>>, ReverseError> {
        let uri: Uri = uri.parse()?;
        let mut req = Request::new(Bytes::new());
        *req.uri_mut() = uri;
        self.request(req).await
    }
}

impl<S> Service<Request<Bytes>> for ReverseClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Response = Response<ReversedBody<S>>;
    type Error = ReverseError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    #[inline]
    fn call(&mut self, req: Request<Bytes>) -> Self::Future {
        let transport = self.transport.clone();
        Box::pin(async move { transport.round_trip(req).await })
    }
}
