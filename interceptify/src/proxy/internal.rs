use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::header::{
    CONNECTION, Entry, HOST, HeaderMap, HeaderName, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{Instrument, debug, error, info_span, instrument, warn};

use super::InternalHosts;
use crate::certificate_authority::CertificateAuthority;
use crate::events::EventBus;
use crate::plugin::{HttpContext, PluginManager, RequestOrResponse};
use crate::{Body, Error};

/// Upstream HTTP client shared by every connection task. ALPN on the
/// connector decides whether a given origin is spoken to over HTTP/1.1 or
/// HTTP/2.
pub(crate) type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Upper bound on one upstream round trip, connect through response head.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers stripped before a request is re-issued upstream.
const HOP_BY_HOP: [HeaderName; 8] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Per-connection handler state. Cheap to clone; everything heavy is shared.
pub(crate) struct InternalProxy<CA> {
    pub ca: Arc<CA>,
    pub client: UpstreamClient,
    pub plugins: Arc<PluginManager>,
    pub events: EventBus,
    pub internal: Arc<InternalHosts>,
    pub client_addr: SocketAddr,
}

impl<CA> Clone for InternalProxy<CA> {
    fn clone(&self) -> Self {
        InternalProxy {
            ca: Arc::clone(&self.ca),
            client: self.client.clone(),
            plugins: Arc::clone(&self.plugins),
            events: self.events.clone(),
            internal: Arc::clone(&self.internal),
            client_addr: self.client_addr,
        }
    }
}

impl<CA: CertificateAuthority> InternalProxy<CA> {
    /// Classifies one request from the client-facing connection: CONNECT
    /// tunnel, internal dashboard host, or plain forward.
    #[instrument(
        skip_all,
        fields(
            method = %req.method(),
            uri = %req.uri(),
            client_addr = %self.client_addr,
        )
    )]
    pub(crate) async fn dispatch(self, req: Request<Incoming>) -> Result<Response<Body>, Error> {
        if req.method() == Method::CONNECT {
            return self.process_connect(req);
        }

        if let Some(host) = request_host(&req) {
            if self.internal.matches(&host) {
                return Ok(crate::dashboard::respond(&req, &self.events));
            }
        }

        self.forward_http(req).await
    }

    /// Plain-HTTP forward path. Plugin hooks are not run here; only
    /// decrypted tunnel traffic flows through the pipeline.
    async fn forward_http(self, req: Request<Incoming>) -> Result<Response<Body>, Error> {
        self.events
            .emit(format!("HTTP: {} {}", req.method(), req.uri()));

        let req = normalize_request(req.map(Body::from));
        match tokio::time::timeout(UPSTREAM_TIMEOUT, self.client.request(req)).await {
            Ok(Ok(res)) => Ok(res.map(Body::from)),
            Ok(Err(e)) => {
                warn!(error = %e, "failed to forward request upstream");
                Err(Error::upstream(e))
            }
            Err(_) => {
                warn!("upstream request timed out");
                Err(Error::upstream_timeout())
            }
        }
    }

    /// Acknowledges a CONNECT and hands the upgraded socket to the TLS
    /// intercept path on a fresh task.
    fn process_connect(self, mut req: Request<Incoming>) -> Result<Response<Body>, Error> {
        let Some(authority) = req.uri().authority().cloned() else {
            return Ok(bad_request());
        };

        if self.internal.is_self(authority.as_str()) {
            warn!(%authority, "refusing CONNECT back to the proxy itself");
            return Ok(forbidden());
        }

        self.events.emit(format!("CONNECT: {authority}"));

        let span = info_span!("tunnel", %authority);
        tokio::spawn(
            async move {
                match hyper::upgrade::on(&mut req).await {
                    Ok(upgraded) => {
                        self.intercept_tunnel(TokioIo::new(upgraded), authority).await;
                    }
                    Err(e) => debug!(error = %e, "connection upgrade failed"),
                }
            }
            .instrument(span),
        );

        Ok(connection_established())
    }

    /// Terminates TLS on the tunneled socket with a leaf minted for the
    /// CONNECT host, then serves the decrypted stream with the protocol the
    /// client negotiated via ALPN.
    async fn intercept_tunnel(self, io: TokioIo<Upgraded>, authority: Authority) {
        let host = authority.host().to_owned();

        let config = match self.ca.server_config(&host).await {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "aborting tunnel: leaf certificate unavailable");
                return;
            }
        };

        let stream = match TlsAcceptor::from(config).accept(io).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %Error::TlsHandshake(e), "closing tunnel");
                return;
            }
        };

        let negotiated_h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());

        let result = if negotiated_h2 {
            self.serve_intercepted_h2(stream, authority).await
        } else {
            self.serve_intercepted_h1(stream, authority).await
        };

        if let Err(e) = result {
            if !e.to_string().starts_with("error shutting down connection") {
                debug!(error = %e, "intercepted connection ended with error");
            }
        }
    }

    /// HTTP/1.1 intercept loop: requests are read sequentially from the
    /// decrypted stream until EOF.
    async fn serve_intercepted_h1<I>(
        self,
        stream: I,
        authority: Authority,
    ) -> Result<(), hyper::Error>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            self.clone()
                .handle_intercepted(req, authority.clone(), Version::HTTP_11)
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(stream), service)
            .await
    }

    /// HTTP/2 intercept loop: streams are served concurrently; ordering
    /// across streams is not guaranteed.
    async fn serve_intercepted_h2<I>(
        self,
        stream: I,
        authority: Authority,
    ) -> Result<(), hyper::Error>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            self.clone()
                .handle_intercepted(req, authority.clone(), Version::HTTP_2)
        });

        http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service)
            .await
    }

    /// One intercepted exchange: synthesize the effective URL, run request
    /// hooks, fetch upstream, run response hooks, stream the result back.
    async fn handle_intercepted(
        self,
        req: Request<Incoming>,
        authority: Authority,
        via: Version,
    ) -> Result<Response<Body>, Error> {
        let req = match rewrite_intercepted_uri(req.map(Body::from), &authority) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "dropping request with unbuildable target");
                return Ok(bad_request());
            }
        };

        let ctx = HttpContext {
            client_addr: self.client_addr,
            method: req.method().clone(),
            uri: req.uri().clone(),
        };

        let mut req = match self.plugins.run_request_hooks(&ctx, req).await {
            RequestOrResponse::Request(req) => req,
            RequestOrResponse::Response(res) => {
                debug!(uri = %ctx.uri, "request short-circuited by plugin");
                return Ok(res);
            }
        };

        let label = if via == Version::HTTP_2 { "HTTPS/2" } else { "HTTPS" };
        self.events
            .emit(format!("{label}: {} {}", req.method(), req.uri()));

        strip_hop_by_hop(req.headers_mut());
        let req = normalize_request(req);

        let res = match tokio::time::timeout(UPSTREAM_TIMEOUT, self.client.request(req)).await {
            Ok(Ok(res)) => res.map(Body::from),
            Ok(Err(e)) => {
                warn!(error = %e, uri = %ctx.uri, "upstream request failed");
                if via == Version::HTTP_2 {
                    return Ok(bad_gateway());
                }
                return Err(Error::upstream(e));
            }
            Err(_) => {
                warn!(uri = %ctx.uri, "upstream request timed out");
                if via == Version::HTTP_2 {
                    return Ok(bad_gateway());
                }
                return Err(Error::upstream_timeout());
            }
        };

        Ok(self.plugins.run_response_hooks(&ctx, res).await)
    }
}

/// Host the request addresses: the URI authority in forward-proxy form,
/// falling back to the `Host` header.
fn request_host<T>(req: &Request<T>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Rebuilds the target of an intercepted request as
/// `https://<CONNECT-authority><path-and-query>`. HTTP/2 requests carry no
/// host in the request line, so the tunnel authority is authoritative.
fn rewrite_intercepted_uri(
    req: Request<Body>,
    authority: &Authority,
) -> Result<Request<Body>, http::uri::InvalidUriParts> {
    let (mut parts, body) = req.into_parts();
    let mut uri = parts.uri.into_parts();
    uri.scheme = Some(Scheme::HTTPS);
    uri.authority = Some(authority.clone());
    if uri.path_and_query.is_none() {
        uri.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    parts.uri = Uri::from_parts(uri)?;
    Ok(Request::from_parts(parts, body))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("proxy-connection");
}

/// Prepares a request for the upstream client.
fn normalize_request<T>(mut req: Request<T>) -> Request<T> {
    // The client re-derives Host from the target URI.
    req.headers_mut().remove(HOST);

    // HTTP/2 allows repeated cookie headers, but HTTP/1.1 upstreams expect
    // a single one.
    if let Entry::Occupied(mut cookies) = req.headers_mut().entry(http::header::COOKIE) {
        let joined = bstr::join(b"; ", cookies.iter());
        cookies.insert(joined.try_into().expect("joined cookies are valid"));
    }

    *req.version_mut() = Version::HTTP_11;
    req
}

fn connection_established() -> Response<Body> {
    let mut res = Response::new(Body::empty());
    res.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    res
}

fn bad_request() -> Response<Body> {
    status_response(StatusCode::BAD_REQUEST)
}

fn forbidden() -> Response<Body> {
    status_response(StatusCode::FORBIDDEN)
}

fn bad_gateway() -> Response<Body> {
    status_response(StatusCode::BAD_GATEWAY)
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("valid response")
}
