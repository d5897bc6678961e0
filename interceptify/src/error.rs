use thiserror::Error;

/// Boxed error used to carry heterogeneous underlying causes.
pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the proxy engine.
///
/// Only [`Error::Bind`] and [`Error::CaInit`] are fatal; every other kind is
/// confined to the connection that produced it, so one bad exchange never
/// takes the proxy down.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The listen socket could not be created.
    #[error("failed to bind proxy listener")]
    Bind(#[source] std::io::Error),

    /// The root certificate authority could not be loaded or generated.
    #[error("certificate authority initialization failed")]
    CaInit(#[source] BoxError),

    /// Minting a leaf certificate for an intercepted host failed.
    #[error("failed to sign leaf certificate for {host}")]
    CaSign {
        host: String,
        #[source]
        source: BoxError,
    },

    /// The TLS handshake with the intercepted client failed.
    #[error("client TLS handshake failed")]
    TlsHandshake(#[source] std::io::Error),

    /// The client sent a malformed or truncated request.
    #[error("failed to read request from client")]
    ClientRead(#[source] hyper::Error),

    /// A request to the upstream server failed or timed out.
    #[error("upstream request failed")]
    Upstream(#[source] BoxError),

    /// A plugin body rewrite could not read the response stream.
    #[error("response body rewrite failed")]
    BodyRewrite(#[source] BoxError),

    /// An event could not be delivered to a dashboard subscriber.
    #[error("dashboard subscriber is gone")]
    SubscriberWrite,
}

impl Error {
    pub(crate) fn ca_init(source: impl Into<BoxError>) -> Self {
        Error::CaInit(source.into())
    }

    pub(crate) fn ca_sign(host: &str, source: impl Into<BoxError>) -> Self {
        Error::CaSign {
            host: host.to_owned(),
            source: source.into(),
        }
    }

    pub(crate) fn upstream(source: impl Into<BoxError>) -> Self {
        Error::Upstream(source.into())
    }

    pub(crate) fn upstream_timeout() -> Self {
        Error::Upstream(Box::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "upstream round trip timed out",
        )))
    }
}
