//! Dynamic certificate authority: a persistent root plus per-host leaves
//! minted on demand while terminating intercepted TLS.

mod root_authority;

pub use root_authority::{RootAuthority, SignedLeaf};

use std::sync::Arc;

use tokio_rustls::rustls::ServerConfig;

use crate::Error;

/// Leaf certificate lifetime: one year.
pub(crate) const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Server-config cache entries live for half the leaf lifetime.
pub(crate) const CACHE_TTL_SECS: u64 = (LEAF_TTL_SECS / 2) as u64;
/// Leaves are backdated one hour to tolerate client clock skew.
pub(crate) const NOT_BEFORE_BACKDATE_SECS: i64 = 60 * 60;

/// Issues TLS server configurations for intercepted hosts.
///
/// Clients must trust the authority's root certificate; the proxy then
/// presents a minted leaf for every host it terminates.
pub trait CertificateAuthority: Send + Sync + 'static {
    /// Produce a rustls [`ServerConfig`] carrying a leaf certificate for
    /// `host`, with ALPN offering `h2` then `http/1.1`.
    fn server_config(
        &self,
        host: &str,
    ) -> impl Future<Output = Result<Arc<ServerConfig>, Error>> + Send;
}
