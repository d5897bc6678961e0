#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use interceptify::certificate_authority::{CertificateAuthority, RootAuthority};
use interceptify::rustls::pki_types::{CertificateDer, ServerName};
use interceptify::rustls::{ClientConfig, RootCertStore, ServerConfig};
use interceptify::ProxyBuilder;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;

/// Opens (or creates) a root CA inside `dir`. Opening the same directory
/// twice yields the same material, so tests can hold a second handle for
/// client-side trust while the proxy owns the first.
pub fn open_ca(dir: &TempDir) -> RootAuthority {
    RootAuthority::open(dir.path().join("ca.crt"), dir.path().join("ca.key"))
        .expect("CA should open")
}

/// The root certificate as DER, for rustls trust stores.
pub fn root_cert_der(ca: &RootAuthority) -> CertificateDer<'static> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(ca.ca_cert_pem().as_bytes())
        .expect("root PEM should parse");
    CertificateDer::from(pem.contents.clone())
}

/// Binds an ephemeral listener, hands it to the builder, and runs the proxy
/// until the returned sender fires (or is dropped).
pub async fn spawn_proxy<CA>(builder: ProxyBuilder<CA>) -> (SocketAddr, oneshot::Sender<()>)
where
    CA: CertificateAuthority,
{
    let _ = interceptify::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = builder.with_listener(listener).build().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = proxy
            .start(async {
                let _ = stop_rx.await;
            })
            .await;
    });

    (addr, stop_tx)
}

/// Plain HTTP backend answering every request with `body`; returns the hit
/// counter so tests can prove whether upstream was contacted.
pub async fn start_http_backend(
    body: &'static str,
) -> (SocketAddr, Arc<AtomicUsize>, oneshot::Sender<()>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { break };
                    let counter = Arc::clone(&counter);
                    tokio::spawn(async move {
                        let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            async move {
                                Ok::<_, Infallible>(Response::new(Full::new(
                                    Bytes::from_static(body.as_bytes()),
                                )))
                            }
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                _ = &mut stop_rx => break,
            }
        }
    });

    (addr, hits, stop_tx)
}

/// HTTPS backend terminating TLS with `tls` and answering with `body`.
pub async fn start_https_backend(
    tls: Arc<ServerConfig>,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(tls);
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { break };
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let Ok(stream) = acceptor.accept(stream).await else { return };
                        let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                            async move {
                                Ok::<_, Infallible>(Response::new(Full::new(
                                    Bytes::from_static(body.as_bytes()),
                                )))
                            }
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                _ = &mut stop_rx => break,
            }
        }
    });

    (addr, stop_tx)
}

/// Server config for a test backend, with a leaf minted by `ca` for `host`.
pub fn backend_tls_config(ca: &RootAuthority, host: &str) -> Arc<ServerConfig> {
    let leaf = ca.sign(host).unwrap();
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![leaf.cert], leaf.key)
        .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Client that routes plain-HTTP URLs through the proxy.
pub fn plain_proxied_client(proxy_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).unwrap())
        .build()
        .unwrap()
}

/// Client that routes everything through the proxy and trusts the CA's root.
pub fn tls_proxied_client(proxy_addr: SocketAddr, ca: &RootAuthority) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy_addr}")).unwrap())
        .use_rustls_tls()
        .add_root_certificate(reqwest::Certificate::from_pem(ca.ca_cert_pem().as_bytes()).unwrap())
        .build()
        .unwrap()
}

/// Issues a raw CONNECT to the proxy, asserts the acknowledgement line, and
/// returns the tunneled socket.
pub async fn connect_tunnel(proxy_addr: SocketAddr, authority: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut ack = Vec::new();
    let mut byte = [0u8; 1];
    while !ack.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "proxy closed the connection before acknowledging CONNECT");
        ack.push(byte[0]);
    }
    assert!(
        ack.starts_with(b"HTTP/1.1 200 Connection Established\r\n"),
        "unexpected CONNECT acknowledgement: {}",
        String::from_utf8_lossy(&ack)
    );

    stream
}

/// Completes a client-side TLS handshake over an established tunnel,
/// verifying the presented chain against the CA's root.
pub async fn tls_handshake(
    stream: TcpStream,
    ca: &RootAuthority,
    server_name: &str,
    alpn: &[&[u8]],
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let mut roots = RootCertStore::empty();
    roots.add(root_cert_der(ca)).unwrap();

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(server_name.to_owned()).unwrap();
    connector.connect(name, stream).await.unwrap()
}
