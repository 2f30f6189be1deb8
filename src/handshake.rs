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

//! Predicates deciding whether a message is a valid reverse HTTP upgrade.
//!
//! These are pure functions with no side effects. Every entry point of the
//! crate calls them before touching the underlying stream.

use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, UPGRADE};
use http::{Method, Request, Response, StatusCode, Uri};

use crate::error::ReverseError;
use crate::{UPGRADE_PROTOCOL, UPGRADE_TOKEN};

/// Returns true iff `req` asks for the reverse HTTP upgrade: an `Upgrade`
/// header naming [`UPGRADE_PROTOCOL`] and a `Connection: Upgrade` header.
/// Header values match case-insensitively.
#[inline]
#[must_use]
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    header_value_eq(req.headers(), &UPGRADE, UPGRADE_PROTOCOL)
        && header_value_eq(req.headers(), &CONNECTION, UPGRADE_TOKEN)
}

/// Returns true iff `resp` completes the reverse HTTP upgrade: status
/// `101 Switching Protocols` with both upgrade marker headers echoed.
#[inline]
#[must_use]
pub fn is_upgrade_response<B>(resp: &Response<B>) -> bool {
    resp.status() == StatusCode::SWITCHING_PROTOCOLS
        && header_value_eq(resp.headers(), &UPGRADE, UPGRADE_PROTOCOL)
        && header_value_eq(resp.headers(), &CONNECTION, UPGRADE_TOKEN)
}

/// Builds the request that upgrades a connection to reverse HTTP: a POST
/// to `url` carrying the upgrade marker headers.
///
/// The request is meant to be performed by an ordinary HTTP client, e.g.
/// through [`reverse`](crate::reverse).
///
/// # Errors
///
/// Returns [`ReverseError::InvalidUri`] when `url` does not parse.
pub fn new_request<B>(url: &str) -> Result<Request<B>, ReverseError>
where
    B: Default,
{
    let uri: Uri = url.parse()?;
    let mut req = Request::new(B::default());
    *req.method_mut() = Method::POST;
    *req.uri_mut() = uri;
    apply_upgrade_headers(req.headers_mut());
    Ok(req)
}

/// Stamps the upgrade marker headers onto `headers`, replacing any
/// previous values.
pub(crate) fn apply_upgrade_headers(headers: &mut HeaderMap) {
    headers.insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
    headers.insert(CONNECTION, HeaderValue::from_static(UPGRADE_TOKEN));
}

fn header_value_eq(headers: &HeaderMap, name: &HeaderName, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case(expected))
}
