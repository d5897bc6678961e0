use async_trait::async_trait;
use http::{Request, Response};
use tracing::info;

use super::{HttpContext, Plugin, RequestOrResponse};
use crate::Body;

/// Logs every intercepted request and response. Never mutates traffic.
#[derive(Clone, Copy, Debug, Default)]
pub struct Logger;

impl Logger {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Plugin for Logger {
    fn name(&self) -> &str {
        "logger"
    }

    fn description(&self) -> &str {
        "Logs all intercepted HTTP requests and responses"
    }

    async fn on_request(&self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        info!(plugin = self.name(), method = %req.method(), uri = %req.uri(), "request");
        req.into()
    }

    async fn on_response(&self, ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        info!(plugin = self.name(), status = %res.status().as_u16(), uri = %ctx.uri, "response");
        res
    }
}
