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

//! Reads and writes single HTTP/1.1 messages on a reversed stream.
//!
//! After the upgrade the connection carries plain HTTP/1.1 message bytes
//! with no extra framing: status line or request line, headers, CRLF CRLF,
//! optional body. Bodies are framed by `content-length`, by chunked
//! transfer coding (decode only), or by end of stream for responses that
//! declare neither. One message is consumed at a time; bytes past the
//! message stay on the stream untouched.

use std::io;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::uri::PathAndQuery;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ReverseError;

/// Upper bound on the size of a message head (start line plus headers).
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Maximum number of headers accepted on one message.
const MAX_HEADERS: usize = 64;

/// Reads one request off the stream, leaving anything after its body
/// untouched.
pub(crate) async fn read_request<S>(io: &mut S) -> Result<Request<Bytes>, ReverseError>
where
    S: AsyncRead + Unpin,
{
    let head = read_head(io).await?;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    if parsed.parse(&head)?.is_partial() {
        return Err(invalid_data("truncated request head"));
    }

    let mut req = Request::new(Bytes::new());
    *req.method_mut() = parsed
        .method
        .and_then(|method| Method::from_bytes(method.as_bytes()).ok())
        .ok_or_else(|| invalid_data("unrecognized request method"))?;
    *req.uri_mut() = parsed
        .path
        .and_then(|path| path.parse::<Uri>().ok())
        .ok_or_else(|| invalid_data("unparsable request target"))?;
    *req.version_mut() = http_version(parsed.version);
    copy_headers(parsed.headers, req.headers_mut())?;

    let body = if is_chunked(req.headers()) {
        read_chunked(io).await?
    } else if let Some(len) = declared_length(req.headers())? {
        read_sized(io, len).await?
    } else {
        // A request with neither content-length nor chunked coding has no
        // body.
        Bytes::new()
    };
    *req.body_mut() = body;
    Ok(req)
}

/// Reads one response off the stream.
///
/// For `101 Switching Protocols` no body is consumed: whatever follows the
/// head belongs to the switched protocol and stays on the stream for the
/// caller to take over.
pub(crate) async fn read_response<S>(io: &mut S) -> Result<Response<Bytes>, ReverseError>
where
    S: AsyncRead + Unpin,
{
    let head = read_head(io).await?;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    if parsed.parse(&head)?.is_partial() {
        return Err(invalid_data("truncated response head"));
    }

    let mut resp = Response::new(Bytes::new());
    *resp.status_mut() = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid_data("unrecognized response status"))?;
    *resp.version_mut() = http_version(parsed.version);
    copy_headers(parsed.headers, resp.headers_mut())?;

    if bodyless_status(resp.status()) {
        return Ok(resp);
    }
    let body = if is_chunked(resp.headers()) {
        read_chunked(io).await?
    } else if let Some(len) = declared_length(resp.headers())? {
        read_sized(io, len).await?
    } else {
        // No declared framing: the body runs to end of stream. A reversed
        // connection carries a single exchange, so EOF is unambiguous.
        let mut body = Vec::new();
        io.read_to_end(&mut body).await?;
        Bytes::from(body)
    };
    *resp.body_mut() = body;
    Ok(resp)
}

/// Serializes `req` onto the stream and flushes it.
///
/// The request target goes out in origin form; `host` is derived from the
/// URI authority when the request does not carry one. `content-length` is
/// attached when the body is non-empty, or for any method other than GET
/// and HEAD.
pub(crate) async fn write_request<S>(io: &mut S, req: &Request<Bytes>) -> Result<(), ReverseError>
where
    S: AsyncWrite + Unpin,
{
    let mut head = BytesMut::with_capacity(256);
    head.extend_from_slice(req.method().as_str().as_bytes());
    head.extend_from_slice(b" ");
    let target = req
        .uri()
        .path_and_query()
        .map_or("/", PathAndQuery::as_str);
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(version_str(req.version()).as_bytes());
    head.extend_from_slice(b"\r\n");

    if !req.headers().contains_key(HOST) {
        if let Some(authority) = req.uri().authority() {
            head.extend_from_slice(b"host: ");
            head.extend_from_slice(authority.as_str().as_bytes());
            head.extend_from_slice(b"\r\n");
        }
    }
    write_header_lines(&mut head, req.headers());

    let body = req.body();
    let wants_length = !body.is_empty() || !matches!(*req.method(), Method::GET | Method::HEAD);
    if wants_length && !req.headers().contains_key(CONTENT_LENGTH) {
        head.extend_from_slice(b"content-length: ");
        head.extend_from_slice(body.len().to_string().as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    io.write_all(&head).await?;
    if !body.is_empty() {
        io.write_all(body).await?;
    }
    io.flush().await?;
    Ok(())
}

/// Serializes a response head: status line, `content-length` when given,
/// then the headers in map order.
///
/// Header names go on the wire in their lowercase canonical form and the
/// output is deterministic for a fixed header-insertion order.
pub(crate) fn response_head(
    version: Version,
    status: StatusCode,
    headers: &HeaderMap,
    content_length: Option<usize>,
) -> BytesMut {
    let mut head = BytesMut::with_capacity(128);
    head.extend_from_slice(version_str(version).as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(status.as_str().as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    head.extend_from_slice(b"\r\n");
    if let Some(len) = content_length {
        head.extend_from_slice(b"content-length: ");
        head.extend_from_slice(len.to_string().as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    write_header_lines(&mut head, headers);
    head.extend_from_slice(b"\r\n");
    head
}

/// True for statuses that never carry a body, including `101` whose
/// trailing bytes belong to the switched protocol.
fn bodyless_status(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn write_header_lines(head: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
}

fn copy_headers(
    parsed: &[httparse::Header<'_>],
    headers: &mut HeaderMap,
) -> Result<(), ReverseError> {
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| invalid_data("invalid header name"))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| invalid_data("invalid header value"))?;
        headers.append(name, value);
    }
    Ok(())
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get(TRANSFER_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        })
}

fn declared_length(headers: &HeaderMap) -> Result<Option<usize>, ReverseError> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .map(Some)
        .ok_or_else(|| invalid_data("unparsable content-length"))
}

fn http_version(minor: Option<u8>) -> Version {
    if minor == Some(0) {
        Version::HTTP_10
    } else {
        Version::HTTP_11
    }
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// Reads up to and including the blank line terminating a message head.
///
/// The scan is byte-wise so no bytes past the head are consumed; the
/// buffering underneath [`DuplexStream`](crate::DuplexStream) keeps that
/// from hitting the socket one byte at a time.
async fn read_head<S>(io: &mut S) -> Result<Vec<u8>, ReverseError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = io.read(&mut byte).await?;
        if n == 0 {
            return Err(unexpected_eof("connection closed inside a message head"));
        }
        head.push(byte[0]);
        if head.len() > MAX_HEAD_BYTES {
            return Err(invalid_data("message head exceeded the size limit"));
        }
    }
    Ok(head)
}

async fn read_sized<S>(io: &mut S, len: usize) -> Result<Bytes, ReverseError>
where
    S: AsyncRead + Unpin,
{
    let mut body = vec![0_u8; len];
    io.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

async fn read_chunked<S>(io: &mut S) -> Result<Bytes, ReverseError>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_line(io).await?;
        let size_text = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| invalid_data("unparsable chunk size"))?;
        if size == 0 {
            break;
        }
        let start = body.len();
        body.resize(start + size, 0);
        io.read_exact(&mut body[start..]).await?;
        let mut crlf = [0_u8; 2];
        io.read_exact(&mut crlf).await?;
        if crlf != *b"\r\n" {
            return Err(invalid_data("chunk data not terminated by CRLF"));
        }
    }
    // Trailer section: discard header lines up to the blank line.
    loop {
        if read_line(io).await?.is_empty() {
            break;
        }
    }
    Ok(Bytes::from(body))
}

async fn read_line<S>(io: &mut S) -> Result<String, ReverseError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0_u8; 1];
    loop {
        let n = io.read(&mut byte).await?;
        if n == 0 {
            return Err(unexpected_eof("connection closed inside chunked framing"));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_HEAD_BYTES {
            return Err(invalid_data("chunk metadata exceeded the size limit"));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| invalid_data("chunk metadata is not valid ascii"))
}

fn invalid_data(message: &'static str) -> ReverseError {
    ReverseError::Io(io::Error::new(io::ErrorKind::InvalidData, message))
}

fn unexpected_eof(message: &'static str) -> ReverseError {
    ReverseError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, message))
}

#[cfg(test)]
mod tests {
    use http::header::CONTENT_TYPE;

    use super::*;

    async fn parse_request(raw: &[u8]) -> Result<Request<Bytes>, ReverseError> {
        let mut io = raw;
        read_request(&mut io).await
    }

    #[tokio::test]
    async fn reads_a_request_with_a_sized_body() {
        let raw = b"POST /path HTTP/1.1\r\ncontent-type: text/plain\r\ncontent-length: 12\r\n\r\nhello world\n";
        let req = parse_request(raw).await.expect("parse");
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().path(), "/path");
        assert_eq!(req.version(), Version::HTTP_11);
        assert_eq!(
            req.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/plain"))
        );
        assert_eq!(req.body().as_ref(), b"hello world\n");
    }

    #[tokio::test]
    async fn request_without_length_has_no_body() {
        let raw = b"GET /path HTTP/1.1\r\nhost: example.com\r\n\r\n";
        let req = parse_request(raw).await.expect("parse");
        assert!(req.body().is_empty());
    }

    #[tokio::test]
    async fn reads_a_chunked_request_body() {
        let raw = b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n6\r\nhello \r\n6\r\nworld\n\r\n0\r\n\r\n";
        let req = parse_request(raw).await.expect("parse");
        assert_eq!(req.body().as_ref(), b"hello world\n");
    }

    #[tokio::test]
    async fn switching_protocols_leaves_the_stream_untouched() {
        let raw: &[u8] =
            b"HTTP/1.1 101 Switching Protocols\r\nupgrade: test\r\nconnection: Upgrade\r\n\r\nhello world\n";
        let mut io = raw;
        let resp = read_response(&mut io).await.expect("parse");
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert!(resp.body().is_empty());
        // The switched-protocol bytes are still there for the caller.
        assert_eq!(io, b"hello world\n");
    }

    #[tokio::test]
    async fn response_without_framing_reads_to_end_of_stream() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\n\r\nhello world\n";
        let mut io = raw;
        let resp = read_response(&mut io).await.expect("parse");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body().as_ref(), b"hello world\n");
    }

    #[tokio::test]
    async fn truncated_head_is_an_error() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-";
        let mut io = raw;
        assert!(read_response(&mut io).await.is_err());
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"GET / HTTP/1.1\r\n");
        while raw.len() <= MAX_HEAD_BYTES {
            raw.extend_from_slice(b"x-filler: yes\r\n");
        }
        raw.extend_from_slice(b"\r\n");
        let mut io = raw.as_slice();
        assert!(read_request(&mut io).await.is_err());
    }

    #[tokio::test]
    async fn writes_a_get_request_in_origin_form() {
        let mut req = Request::new(Bytes::new());
        *req.method_mut() = Method::GET;
        *req.uri_mut() = Uri::from_static("http://example.com/path2");
        let mut out = Vec::new();
        write_request(&mut out, &req).await.expect("write");
        assert_eq!(out, b"GET /path2 HTTP/1.1\r\nhost: example.com\r\n\r\n");
    }

    #[tokio::test]
    async fn writes_a_post_request_with_length() {
        let mut req = Request::new(Bytes::from_static(b"hello world\n"));
        *req.method_mut() = Method::POST;
        *req.uri_mut() = Uri::from_static("/submit");
        req.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let mut out = Vec::new();
        write_request(&mut out, &req).await.expect("write");
        assert_eq!(
            out,
            b"POST /submit HTTP/1.1\r\ncontent-type: text/plain\r\ncontent-length: 12\r\n\r\nhello world\n"
                .as_slice()
        );
    }

    #[test]
    fn response_head_is_deterministic() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let head = response_head(Version::HTTP_11, StatusCode::OK, &headers, Some(12));
        assert_eq!(
            head.as_ref(),
            b"HTTP/1.1 200 OK\r\ncontent-length: 12\r\ncontent-type: text/plain\r\n\r\n"
        );
    }
}
