//! Primitive edits on intercepted messages, used by the built-in plugins.

use bstr::ByteSlice;
use http::Response;
use http::header::{CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue};

use crate::{Body, Error};

/// Sets a header, replacing any existing value.
pub fn inject_header(headers: &mut HeaderMap, name: HeaderName, value: HeaderValue) {
    headers.insert(name, value);
}

/// Removes a header if present.
pub fn drop_header(headers: &mut HeaderMap, name: &HeaderName) {
    headers.remove(name);
}

/// Replaces every occurrence of `needle` in the response body with
/// `replacement`, buffering the body in full.
///
/// If a `Content-Length` header was present it is rewritten to the new byte
/// length; otherwise the serializer recomputes framing from the buffered
/// body. On a read failure the response keeps its headers and is left with
/// an empty body (the original stream is already consumed).
pub async fn replace_in_body(
    res: &mut Response<Body>,
    needle: &str,
    replacement: &str,
) -> Result<(), Error> {
    let body = std::mem::take(res.body_mut());
    let bytes = body.collect_bytes().await.map_err(Error::BodyRewrite)?;
    let rewritten = bytes.replace(needle, replacement);

    if res.headers().contains_key(CONTENT_LENGTH) {
        res.headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
    }
    *res.body_mut() = Body::from(rewritten);
    Ok(())
}
