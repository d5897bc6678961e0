//! Proxy assembly: builder, accept loop, and shutdown.

mod internal;

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, error, info};

use crate::certificate_authority::CertificateAuthority;
use crate::events::EventBus;
use crate::plugin::{Plugin, PluginManager};
use crate::Error;

use internal::{InternalProxy, UpstreamClient};

/// Hostnames the dispatcher routes to the built-in dashboard. The configured
/// listen address is matched as well.
#[derive(Debug)]
pub(crate) struct InternalHosts {
    listen_addr: String,
}

impl InternalHosts {
    fn new(addr: SocketAddr) -> Self {
        Self {
            listen_addr: addr.to_string(),
        }
    }

    pub(crate) fn matches(&self, host: &str) -> bool {
        host == "interceptify" || host.starts_with("interceptify.local") || host == self.listen_addr
    }

    pub(crate) fn is_self(&self, authority: &str) -> bool {
        authority == self.listen_addr
    }
}

enum Listen {
    Addr(SocketAddr),
    Bound(TcpListener),
}

/// Configures and assembles a [`Proxy`].
pub struct ProxyBuilder<CA> {
    listen: Listen,
    ca: CA,
    plugins: PluginManager,
    extra_roots: Vec<CertificateDer<'static>>,
    event_capacity: Option<usize>,
}

impl<CA: CertificateAuthority> ProxyBuilder<CA> {
    /// Listen address; defaults to `127.0.0.1:8080`.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.listen = Listen::Addr(addr);
        self
    }

    /// Adopts an already-bound listener instead of binding at start.
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listen = Listen::Bound(listener);
        self
    }

    /// Registers a plugin. Registration order is hook order.
    pub fn with_plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.register(plugin);
        self
    }

    /// Adds a root certificate to the upstream trust store, on top of the
    /// bundled webpki roots.
    pub fn with_extra_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.extra_roots.push(cert);
        self
    }

    /// Overrides the event bus queue depth.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Builds the proxy, constructing the upstream client and freezing the
    /// plugin registry. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Proxy<CA>, Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in self.extra_roots {
            roots.add(cert).map_err(Error::ca_init)?;
        }

        let tls = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_all_versions()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .http1_title_case_headers(true)
            .build(connector);

        let events = match self.event_capacity {
            Some(capacity) => EventBus::with_capacity(capacity),
            None => EventBus::new(),
        };

        Ok(Proxy {
            listen: self.listen,
            ca: Arc::new(self.ca),
            client,
            plugins: Arc::new(self.plugins),
            events,
        })
    }
}

/// The intercepting proxy server.
///
/// One task is spawned per accepted connection; tasks share only the
/// certificate authority (read-only), the frozen plugin registry, and the
/// event bus.
pub struct Proxy<CA> {
    listen: Listen,
    ca: Arc<CA>,
    client: UpstreamClient,
    plugins: Arc<PluginManager>,
    events: EventBus,
}

impl<CA: CertificateAuthority> Proxy<CA> {
    /// Starts configuring a proxy backed by `ca`.
    pub fn builder(ca: CA) -> ProxyBuilder<CA> {
        ProxyBuilder {
            listen: Listen::Addr(SocketAddr::from(([127, 0, 0, 1], 8080))),
            ca,
            plugins: PluginManager::new(),
            extra_roots: Vec::new(),
            event_capacity: None,
        }
    }

    /// The event bus shared with connection handlers.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Runs the accept loop until `shutdown` resolves.
    ///
    /// Binding failures are fatal; accept failures are logged and the loop
    /// continues. In-flight connection tasks are not awaited on shutdown.
    pub async fn start<F>(self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let listener = match self.listen {
            Listen::Addr(addr) => TcpListener::bind(addr).await.map_err(Error::Bind)?,
            Listen::Bound(listener) => listener,
        };
        let local_addr = listener.local_addr().map_err(Error::Bind)?;
        let internal = Arc::new(InternalHosts::new(local_addr));

        info!(addr = %local_addr, "interceptify proxy listening");

        let mut server = http1::Builder::new();
        server.preserve_header_case(true).title_case_headers(true);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            let proxy = InternalProxy {
                                ca: Arc::clone(&self.ca),
                                client: self.client.clone(),
                                plugins: Arc::clone(&self.plugins),
                                events: self.events.clone(),
                                internal: Arc::clone(&internal),
                                client_addr,
                            };
                            spawn_connection(server.clone(), stream, proxy);
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received; stopping accept loop");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn spawn_connection<CA: CertificateAuthority>(
    server: http1::Builder,
    stream: TcpStream,
    proxy: InternalProxy<CA>,
) {
    tokio::spawn(async move {
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| proxy.clone().dispatch(req));
        if let Err(e) = server.serve_connection(io, service).with_upgrades().await {
            log_connection_error(e);
        }
    });
}

/// EOF before a full request is normal client behavior and stays silent;
/// anything else is surfaced at debug level and the connection closes.
fn log_connection_error(e: hyper::Error) {
    if e.is_incomplete_message() {
        return;
    }
    debug!(error = %Error::ClientRead(e), "connection closed with error");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_hosts_match_reserved_names_and_listen_addr() {
        let hosts = InternalHosts::new("127.0.0.1:8080".parse().unwrap());

        assert!(hosts.matches("interceptify"));
        assert!(hosts.matches("interceptify.local"));
        assert!(hosts.matches("interceptify.local:8080"));
        assert!(hosts.matches("127.0.0.1:8080"));

        assert!(!hosts.matches("example.com"));
        assert!(!hosts.matches("interceptify.example.com"));
        assert!(!hosts.matches("127.0.0.1:9999"));
    }

    #[test]
    fn connect_to_self_is_detected() {
        let hosts = InternalHosts::new("127.0.0.1:8080".parse().unwrap());
        assert!(hosts.is_self("127.0.0.1:8080"));
        assert!(!hosts.is_self("example.com:443"));
    }
}
