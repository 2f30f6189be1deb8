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

//! Reverse HTTP lets an HTTP server make requests to an HTTP client.
//!
//! The client connects to the server and asks to upgrade the connection
//! to the `PTTH/1.0` protocol. Once the server answers `101 Switching
//! Protocols`, the roles swap: the server sends ordinary HTTP/1.1
//! requests down the very connection the client opened, and the client
//! answers them. This is useful for reaching peers behind NAT or a
//! firewall that can dial out but never accept inbound connections.
//!
//! A connection carries one request/response pair at a time; there is no
//! pipelining, multiplexing, or automatic reconnection. A broken reversed
//! connection is a failed exchange, and reversal starts over with a fresh
//! upgrade.
//!
//! On the serving side, [`reverse_request`] turns an inbound upgrade
//! request into a [`ReverseClient`]:
//!
//! ```no_run
//! use bytes::Bytes;
//! use http_body_util::Empty;
//! use hyper::body::Incoming;
//! use hyper::{Request, Response};
//!
//! async fn handle(mut req: Request<Incoming>) -> Result<Response<Empty<Bytes>>, reverse_http::ReverseError> {
//!     let (response, on_reverse) = reverse_http::reverse_request(&mut req)?;
//!     tokio::spawn(async move {
//!         if let Ok(client) = on_reverse.await {
//!             let _resp = client.get("/path").await;
//!         }
//!     });
//!     Ok(response)
//! }
//! ```
//!
//! On the dialing side, [`reverse_func`] performs the upgrade through any
//! HTTP client in `tower_service::Service` shape and then serves the
//! request the peer sends back. [`Http1Client`] adapts a plain hyper
//! connection into that shape:
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::header::CONTENT_TYPE;
//! use http_body_util::Empty;
//! use hyper_util::rt::TokioIo;
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let tcp = TcpStream::connect("example.com:80").await?;
//! let (sender, conn) = hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(tcp)).await?;
//! tokio::spawn(conn.with_upgrades());
//!
//! let mut client = reverse_http::Http1Client::new(sender);
//! reverse_http::reverse_func(&mut client, "http://example.com/ptth", |mut w, _req| async move {
//!     w.headers_mut()
//!         .insert(CONTENT_TYPE, http::HeaderValue::from_static("text/plain"));
//!     let _ = w.write(b"hello world\n");
//!     w
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

#![deny(
    clippy::all,
    clippy::restriction,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]
#![allow(
    clippy::implicit_return,
    clippy::question_mark_used,
    clippy::blanket_clippy_restriction_lints
)]

mod client;
mod codec;
mod error;
mod handshake;
mod server;
mod stream;
mod transport;
mod writer;

pub use client::{reverse, reverse_func, reverse_response, serve, Handler, Http1Client, UpgradableBody};
pub use error::ReverseError;
pub use handshake::{is_upgrade_request, is_upgrade_response, new_request};
pub use server::{reverse_request, OnReverse, ReverseClient};
pub use stream::DuplexStream;
pub use transport::{ReversedBody, ReversedTransport, UpgradedIo};
pub use writer::ResponseWriter;

/// The `Upgrade` header value that selects the reverse HTTP protocol.
pub const UPGRADE_PROTOCOL: &str = "PTTH/1.0";

/// The `Connection` header value required alongside [`UPGRADE_PROTOCOL`].
const UPGRADE_TOKEN: &str = "Upgrade";
