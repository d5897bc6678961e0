//! Plugin contract and the ordered hook pipeline.

mod logger;
mod modifier;

pub use logger::Logger;
pub use modifier::Modifier;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, Request, Response, Uri};
use tracing::info;

use crate::Body;

/// Context for one intercepted exchange.
///
/// Captured before request hooks run, so response hooks can attribute a
/// response even after plugins have replaced the request.
#[derive(Clone, Debug)]
pub struct HttpContext {
    /// Address of the client driving the exchange.
    pub client_addr: SocketAddr,
    /// Method of the intercepted request.
    pub method: Method,
    /// Effective URL of the intercepted request.
    pub uri: Uri,
}

/// Outcome of a request hook: either the (possibly rewritten) request to
/// send upstream, or a response synthesized by the plugin that ends the
/// exchange without upstream contact.
pub enum RequestOrResponse {
    Request(Request<Body>),
    Response(Response<Body>),
}

impl From<Request<Body>> for RequestOrResponse {
    fn from(req: Request<Body>) -> Self {
        Self::Request(req)
    }
}

impl From<Response<Body>> for RequestOrResponse {
    fn from(res: Response<Body>) -> Self {
        Self::Response(res)
    }
}

/// An inspection and mutation hook pair invoked on intercepted traffic.
///
/// A plugin's hooks for one exchange always run on the task driving that
/// stream's I/O, but two streams may invoke the same plugin concurrently, so
/// plugin state must be internally synchronized.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Human-readable description of what the plugin does.
    fn description(&self) -> &str;

    /// Called for each intercepted request, in registration order.
    /// Returning a response short-circuits the chain: later request hooks
    /// and all response hooks are skipped, and the response goes straight to
    /// the client.
    async fn on_request(&self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        req.into()
    }

    /// Called for each upstream response, in reverse registration order, so
    /// the earliest-registered plugin has the last word on what the client
    /// sees.
    async fn on_response(&self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        res
    }
}

/// Ordered plugin registry.
///
/// Registration order is identity. The proxy freezes the registry behind an
/// `Arc` when it is built, so every plugin must be registered before the
/// proxy starts.
#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a plugin to the chain.
    pub fn register<P: Plugin + 'static>(&mut self, plugin: P) {
        info!(name = plugin.name(), "registering plugin");
        self.plugins.push(Arc::new(plugin));
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Runs request hooks in registration order, short-circuiting on the
    /// first synthesized response.
    pub async fn run_request_hooks(
        &self,
        ctx: &HttpContext,
        mut req: Request<Body>,
    ) -> RequestOrResponse {
        for plugin in &self.plugins {
            match plugin.on_request(ctx, req).await {
                RequestOrResponse::Request(next) => req = next,
                RequestOrResponse::Response(res) => return RequestOrResponse::Response(res),
            }
        }
        RequestOrResponse::Request(req)
    }

    /// Runs response hooks in reverse registration order.
    pub async fn run_response_hooks(
        &self,
        ctx: &HttpContext,
        mut res: Response<Body>,
    ) -> Response<Body> {
        for plugin in self.plugins.iter().rev() {
            res = plugin.on_response(ctx, res).await;
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use parking_lot::Mutex;

    fn test_ctx() -> HttpContext {
        HttpContext {
            client_addr: "127.0.0.1:40000".parse().unwrap(),
            method: Method::GET,
            uri: "https://example.com/".parse().unwrap(),
        }
    }

    struct Recorder {
        label: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn description(&self) -> &str {
            "records hook invocations"
        }

        async fn on_request(&self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
            self.calls.lock().push(format!("req:{}", self.label));
            if self.short_circuit {
                let res = Response::builder()
                    .status(StatusCode::IM_A_TEAPOT)
                    .body(Body::from("teapot"))
                    .unwrap();
                return res.into();
            }
            req.into()
        }

        async fn on_response(&self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
            self.calls.lock().push(format!("res:{}", self.label));
            res
        }
    }

    fn manager_with(
        calls: &Arc<Mutex<Vec<String>>>,
        short_circuit_second: bool,
    ) -> PluginManager {
        let mut manager = PluginManager::new();
        manager.register(Recorder {
            label: "first",
            calls: Arc::clone(calls),
            short_circuit: false,
        });
        manager.register(Recorder {
            label: "second",
            calls: Arc::clone(calls),
            short_circuit: short_circuit_second,
        });
        manager.register(Recorder {
            label: "third",
            calls: Arc::clone(calls),
            short_circuit: false,
        });
        manager
    }

    #[tokio::test]
    async fn request_hooks_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_with(&calls, false);

        let outcome = manager
            .run_request_hooks(&test_ctx(), Request::new(Body::empty()))
            .await;

        assert!(matches!(outcome, RequestOrResponse::Request(_)));
        assert_eq!(*calls.lock(), ["req:first", "req:second", "req:third"]);
    }

    #[tokio::test]
    async fn response_hooks_run_in_reverse_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_with(&calls, false);

        manager
            .run_response_hooks(&test_ctx(), Response::new(Body::empty()))
            .await;

        assert_eq!(*calls.lock(), ["res:third", "res:second", "res:first"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_remaining_request_hooks() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_with(&calls, true);

        let outcome = manager
            .run_request_hooks(&test_ctx(), Request::new(Body::empty()))
            .await;

        let RequestOrResponse::Response(res) = outcome else {
            panic!("expected a short-circuit response");
        };
        assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(*calls.lock(), ["req:first", "req:second"]);
    }
}
