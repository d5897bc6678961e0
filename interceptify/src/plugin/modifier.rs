use async_trait::async_trait;
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue};
use http::{Request, Response};
use tracing::warn;

use super::{HttpContext, Plugin, RequestOrResponse};
use crate::{Body, manipulator};

/// Header stamped onto every request passing through the plugin.
const INTERCEPT_HEADER: HeaderName = HeaderName::from_static("x-interceptified");

/// Injects a marker header on requests and rewrites a literal needle in
/// response bodies, fixing `Content-Length` up for the new length.
pub struct Modifier {
    needle: String,
    replacement: String,
}

impl Modifier {
    /// Modifier with the stock rewrite rule.
    pub fn new() -> Self {
        Self::with_rule("Google", "Interceptify")
    }

    /// Modifier replacing `needle` with `replacement` in response bodies.
    pub fn with_rule(needle: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
            replacement: replacement.into(),
        }
    }
}

impl Default for Modifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for Modifier {
    fn name(&self) -> &str {
        "modifier"
    }

    fn description(&self) -> &str {
        "Injects headers and modifies response bodies"
    }

    async fn on_request(&self, _ctx: &HttpContext, mut req: Request<Body>) -> RequestOrResponse {
        manipulator::inject_header(
            req.headers_mut(),
            INTERCEPT_HEADER,
            HeaderValue::from_static("true"),
        );
        req.into()
    }

    async fn on_response(&self, ctx: &HttpContext, mut res: Response<Body>) -> Response<Body> {
        if let Err(e) =
            manipulator::replace_in_body(&mut res, &self.needle, &self.replacement).await
        {
            warn!(plugin = self.name(), uri = %ctx.uri, error = %e, "passing response through");
            // The stream is gone; a stale Content-Length must not survive it.
            res.headers_mut().remove(CONTENT_LENGTH);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn test_ctx() -> HttpContext {
        HttpContext {
            client_addr: "127.0.0.1:40000".parse().unwrap(),
            method: Method::GET,
            uri: "https://example.com/".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn stamps_requests() {
        let modifier = Modifier::new();
        let req = Request::new(Body::empty());

        let RequestOrResponse::Request(req) = modifier.on_request(&test_ctx(), req).await else {
            panic!("modifier must not synthesize responses");
        };
        assert_eq!(req.headers()["x-interceptified"], "true");
    }

    #[tokio::test]
    async fn rewrites_response_bodies_with_length_fixup() {
        let modifier = Modifier::with_rule("World", "Interceptify");
        let res = Response::builder()
            .header(CONTENT_LENGTH, "11")
            .body(Body::from("Hello World"))
            .unwrap();

        let mut res = modifier.on_response(&test_ctx(), res).await;

        assert_eq!(res.headers()[CONTENT_LENGTH], "18");
        let body = std::mem::take(res.body_mut()).collect_bytes().await.unwrap();
        assert_eq!(body, "Hello Interceptify".as_bytes());
    }
}
