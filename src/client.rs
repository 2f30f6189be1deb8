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

//! Answers requests arriving over a connection this side dialed out.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::error::Error;

use bytes::Bytes;
use futures::future::poll_fn;
use http::{Request, Response};
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1::SendRequest;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tower_service::Service;
use tracing::{debug, trace};

use crate::codec;
use crate::error::ReverseError;
use crate::handshake::{is_upgrade_response, new_request};
use crate::stream::DuplexStream;
use crate::transport::{ReversedBody, UpgradedIo};
use crate::writer::ResponseWriter;

/// A response body that can turn into the raw connection once the peer
/// has switched protocols.
///
/// This is the contract client-side reversal places on whatever produced
/// the upgrade response: after a `101` the body must also support
/// writing. Bodies that cannot make the switch fail with a typed error
/// instead of a runtime type test.
pub trait UpgradableBody: Sized {
    /// The duplex stream the upgraded connection turns into.
    type Io: AsyncRead + AsyncWrite + Unpin + Send;

    /// Consumes the response, yielding the upgraded duplex stream.
    fn into_duplex(
        resp: Response<Self>,
    ) -> impl Future<Output = Result<Self::Io, ReverseError>> + Send;
}

impl UpgradableBody for Incoming {
    type Io = TokioIo<Upgraded>;

    async fn into_duplex(resp: Response<Self>) -> Result<Self::Io, ReverseError> {
        hyper::upgrade::on(resp)
            .await
            .map(TokioIo::new)
            .map_err(ReverseError::Hijack)
    }
}

impl<S> UpgradableBody for ReversedBody<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Io = UpgradedIo<S>;

    async fn into_duplex(resp: Response<Self>) -> Result<Self::Io, ReverseError> {
        match resp.into_body() {
            ReversedBody::Upgraded(io) => Ok(io),
            ReversedBody::Complete(_) => Err(ReverseError::NotUpgradeResponse),
        }
    }
}

/// Serves one reversed request.
///
/// The handler owns the [`ResponseWriter`] while it runs and hands it
/// back so the serving loop can finish the exchange; any closure of the
/// right shape is a handler.
pub trait Handler<S>: Send {
    /// Answers `req` through `w`, returning the writer when done.
    fn handle(
        &mut self,
        w: ResponseWriter<S>,
        req: Request<Bytes>,
    ) -> impl Future<Output = ResponseWriter<S>> + Send;
}

impl<S, F, Fut> Handler<S> for F
where
    F: FnMut(ResponseWriter<S>, Request<Bytes>) -> Fut + Send,
    Fut: Future<Output = ResponseWriter<S>> + Send,
{
    #[inline]
    fn handle(
        &mut self,
        w: ResponseWriter<S>,
        req: Request<Bytes>,
    ) -> impl Future<Output = ResponseWriter<S>> + Send {
        (self)(w, req)
    }
}

/// Reads one request off an established duplex stream, runs `handler`
/// against a fresh [`ResponseWriter`], and finishes the exchange with a
/// final flush. The exchange runs entirely on the caller's task.
///
/// This is the serving half used by [`reverse_response`]; it is public so
/// transports that did not arrive through an HTTP client (raw sockets,
/// in-memory pipes, chained upgrades) can be served directly.
///
/// # Errors
///
/// A malformed or truncated request fails the exchange before the handler
/// runs; I/O failures while finishing the response propagate unchanged.
pub async fn serve<S, H>(io: S, mut handler: H) -> Result<(), ReverseError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: Handler<S>,
{
    let mut stream = DuplexStream::new(io);
    let req = codec::read_request(&mut stream).await?;
    trace!(method = %req.method(), uri = %req.uri(), "serving reversed request");
    let writer = ResponseWriter::new(stream, req.version());
    let mut writer = handler.handle(writer, req).await;
    writer.close().await?;
    Ok(())
}

/// Takes over the body of an upgrade response and serves the single
/// request the peer sends over it.
///
/// The response body is re-presented as a duplex stream, one request is
/// parsed off it, `handler` answers that request, and the exchange is
/// flushed and closed; the connection underneath the response goes away
/// when the exchange does.
///
/// # Errors
///
/// [`ReverseError::NotUpgradeResponse`] when `resp` is not a valid
/// reverse HTTP upgrade response or its body cannot make the switch;
/// otherwise as [`serve`].
pub async fn reverse_response<B, H>(resp: Response<B>, handler: H) -> Result<(), ReverseError>
where
    B: UpgradableBody,
    H: Handler<B::Io>,
{
    if !is_upgrade_response(&resp) {
        return Err(ReverseError::NotUpgradeResponse);
    }
    let io = B::into_duplex(resp).await?;
    serve(io, handler).await
}

/// Dials a reverse HTTP upgrade to `url` through `client` and serves the
/// request the peer calls back with.
///
/// `client` is any HTTP client in [`Service`] shape: an [`Http1Client`]
/// over a dialed connection, a pooled client, or a
/// [`ReverseClient`](crate::ReverseClient) when chaining reversals.
/// Passing the client explicitly keeps concurrent reversed exchanges from
/// sharing hidden global state.
///
/// # Errors
///
/// [`ReverseError::InvalidUri`] for an unparsable `url`,
/// [`ReverseError::Client`] when the client fails to perform the upgrade
/// request, otherwise as [`reverse_response`].
pub async fn reverse<C, ReqB, RespB, H>(
    client: &mut C,
    url: &str,
    handler: H,
) -> Result<(), ReverseError>
where
    C: Service<Request<ReqB>, Response = Response<RespB>>,
    C::Error: Into<Box<dyn Error + Send + Sync>>,
    ReqB: Default,
    RespB: UpgradableBody,
    H: Handler<RespB::Io>,
{
    let req = new_request(url)?;
    poll_fn(|cx| client.poll_ready(cx))
        .await
        .map_err(|err| ReverseError::Client(err.into()))?;
    let resp = client
        .call(req)
        .await
        .map_err(|err| ReverseError::Client(err.into()))?;
    debug!(status = %resp.status(), "upgrade request answered");
    reverse_response(resp, handler).await
}

/// A conn-level hyper HTTP/1.1 sender in [`Service`] shape.
///
/// [`reverse`] accepts any client; this adapter is the plain way to drive
/// it over a connection the caller dialed:
/// `hyper::client::conn::http1::handshake`, spawn the connection future
/// with upgrades enabled, and hand the sender here.
#[derive(Debug)]
pub struct Http1Client<B>(SendRequest<B>);

impl<B> Http1Client<B> {
    /// Wraps a hyper HTTP/1.1 request sender.
    #[inline]
    #[must_use]
    pub const fn new(sender: SendRequest<B>) -> Self {
        Self(sender)
    }
}

impl<B> Service<Request<B>> for Http1Client<B>
where
    B: Body + Send + 'static,
{
    type Response = Response<Incoming>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    #[inline]
    fn call(&mut self, req: Request<B>) -> Self::Future {
        Box::pin(self.0.send_request(req))
    }
}

/// [`reverse`] for a plain closure handler.
///
/// # Errors
///
/// As [`reverse`].
pub async fn reverse_func<C, ReqB, RespB, F, Fut>(
    client: &mut C,
    url: &str,
    f: F,
) -> Result<(), ReverseError>
where
    C: Service<Request<ReqB>, Response = Response<RespB>>,
    C::Error: Into<Box<dyn Error + Send + Sync>>,
    ReqB: Default,
    RespB: UpgradableBody,
    F: FnMut(ResponseWriter<RespB::Io>, Request<Bytes>) -> Fut + Send,
    Fut: Future<Output = ResponseWriter<RespB::Io>> + Send,
{
    reverse(client, url, f).await
}
