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

//! Cross-component flows: whole reversed exchanges, with and without a
//! real HTTP stack on the outside.

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, StatusCode};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use reverse_http::{
    reverse_func, reverse_request, serve, Http1Client, ResponseWriter, ReverseClient,
};

/// Dials `addr` and returns an upgrade-capable client for it, with the
/// connection driven in the background.
async fn dial(addr: SocketAddr) -> Http1Client<Empty<Bytes>> {
    let tcp = TcpStream::connect(addr).await.expect("connect");
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp))
        .await
        .expect("handshake");
    tokio::spawn(conn.with_upgrades());
    Http1Client::new(sender)
}

/// The byte-exact contract of one served exchange: an echoing handler
/// must produce exactly this 200 response for a 12-byte request body.
#[tokio::test]
async fn echo_exchange_is_byte_exact() {
    let (near, mut far) = tokio::io::duplex(4096);

    let peer = tokio::spawn(async move {
        far.write_all(
            b"POST /path HTTP/1.1\r\ncontent-type: text/plain\r\ncontent-length: 12\r\n\r\nhello world\n",
        )
        .await
        .expect("write request");
        let mut got = Vec::new();
        far.read_to_end(&mut got).await.expect("read response");
        got
    });

    serve(near, |mut w: ResponseWriter<_>, req: Request<Bytes>| {
        async move {
            assert_eq!(
                req.headers().get(CONTENT_TYPE),
                Some(&HeaderValue::from_static("text/plain"))
            );
            w.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            let _ = w.write(req.body());
            w
        }
    })
    .await
    .expect("serve");

    assert_eq!(
        peer.await.expect("peer"),
        b"HTTP/1.1 200 OK\r\ncontent-length: 12\r\ncontent-type: text/plain\r\n\r\nhello world\n"
    );
}

#[tokio::test]
async fn reversed_client_get_delivers_the_peer_response() {
    let (near, far) = tokio::io::duplex(4096);
    let client = ReverseClient::from_stream(near);

    let peer = tokio::spawn(serve(far, |mut w: ResponseWriter<_>, _req| async move {
        w.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let _ = w.write(b"hello world\n");
        w
    }));

    let resp = client.get("/path2").await.expect("get");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(CONTENT_TYPE),
        Some(&HeaderValue::from_static("text/plain"))
    );
    assert_eq!(
        resp.into_body().into_bytes().expect("complete body").as_ref(),
        b"hello world\n"
    );
    peer.await.expect("join").expect("serve");
}

/// Handler for [`concurrent_round_trips_do_not_interleave`], lifted out of
/// the test body so its elided lifetime is higher-ranked over the borrowed
/// stream — a closure in the `tokio::spawn` loop cannot be inferred that way.
async fn concurrent_path_echo(
    mut w: ResponseWriter<&mut tokio::io::DuplexStream>,
    req: Request<Bytes>,
) -> ResponseWriter<&mut tokio::io::DuplexStream> {
    let _ = w.write(req.uri().path().as_bytes());
    w
}

/// Two round trips issued concurrently on one reversed connection must
/// come out as two well-formed, non-interleaved exchanges.
#[tokio::test]
async fn concurrent_round_trips_do_not_interleave() {
    let (near, mut far) = tokio::io::duplex(4096);
    let client = ReverseClient::from_stream(near);

    let peer = tokio::spawn(async move {
        for _ in 0_u8..2 {
            serve(&mut far, concurrent_path_echo)
                .await
                .expect("serve");
        }
    });

    let (one, two) = tokio::join!(client.get("/one"), client.get("/two"));
    assert_eq!(
        one.expect("first").into_body().into_bytes().expect("body").as_ref(),
        b"/one"
    );
    assert_eq!(
        two.expect("second").into_body().into_bytes().expect("body").as_ref(),
        b"/two"
    );
    peer.await.expect("peer");
}

/// The full protocol over a real server: the dialing side upgrades, the
/// serving side gets a client and calls back over the same connection.
#[tokio::test]
async fn get_over_a_reversed_connection_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("accept");
        let service = service_fn(move |mut req: Request<Incoming>| {
            let tx = tx.clone();
            async move {
                let (response, on_reverse) = reverse_request(&mut req)?;
                tokio::spawn(async move {
                    let client = on_reverse.await.expect("upgrade completes");
                    let resp = client.get("/path2").await.expect("reversed get");
                    assert_eq!(resp.status(), StatusCode::OK);
                    assert_eq!(
                        resp.headers().get(CONTENT_TYPE),
                        Some(&HeaderValue::from_static("text/plain"))
                    );
                    let body = resp.into_body().into_bytes().expect("complete body");
                    tx.send(body.to_vec()).expect("report body");
                });
                Ok::<_, reverse_http::ReverseError>(response)
            }
        });
        http1::Builder::new()
            .serve_connection(TokioIo::new(tcp), service)
            .with_upgrades()
            .await
            .expect("serve connection");
    });

    let mut client = dial(addr).await;
    reverse_func(
        &mut client,
        &format!("http://{addr}/callback"),
        |mut w, _req| async move {
            w.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            let _ = w.write(b"hello world\n");
            w
        },
    )
    .await
    .expect("reverse");

    assert_eq!(rx.recv().await.expect("server saw the body"), b"hello world\n");
}

/// Reversing a reversed connection: the server upgrades the inbound
/// connection, then dials a reverse upgrade of its own back through the
/// resulting client, putting the roles back the way they started.
#[tokio::test]
async fn chained_reversal_flips_the_connection_twice() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (server_tx, mut server_rx) = mpsc::unbounded_channel::<&'static str>();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("accept");
        let service = service_fn(move |mut req: Request<Incoming>| {
            let server_tx = server_tx.clone();
            async move {
                let (response, on_reverse) = reverse_request(&mut req)?;
                tokio::spawn(async move {
                    let mut client = on_reverse.await.expect("upgrade completes");
                    reverse_func(
                        &mut client,
                        "http://whatever.example/blah",
                        |mut w, _req| async move {
                            w.headers_mut()
                                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                            let _ = w.write(b"hello world\n");
                            w
                        },
                    )
                    .await
                    .expect("chained reverse");
                    server_tx.send("served the chained exchange").expect("report");
                });
                Ok::<_, reverse_http::ReverseError>(response)
            }
        });
        http1::Builder::new()
            .serve_connection(TokioIo::new(tcp), service)
            .with_upgrades()
            .await
            .expect("serve connection");
    });

    let (body_tx, mut body_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut client = dial(addr).await;
    reverse_func(&mut client, &format!("http://{addr}/callback"), move |mut w, req| {
        let body_tx = body_tx.clone();
        async move {
            let c2 = w.reverse(&req).await.expect("nested reversal");
            let resp = c2.get("/path2").await.expect("get over the re-reversed connection");
            let body = resp.into_body().into_bytes().expect("complete body");
            body_tx.send(body.to_vec()).expect("report body");
            drop(c2);
            w
        }
    })
    .await
    .expect("reverse");

    assert_eq!(body_rx.recv().await.expect("client body"), b"hello world\n");
    assert_eq!(
        server_rx.recv().await.expect("server done"),
        "served the chained exchange"
    );
}
