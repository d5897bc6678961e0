//! Interceptify is an intercepting HTTP/S proxy engine for security testing
//! and traffic analysis on hosts where the operator controls the proxy's
//! root certificate.
//!
//! The engine:
//!
//! - terminates TLS with leaf certificates minted on demand by a local root
//!   certificate authority ([`certificate_authority::RootAuthority`])
//! - classifies each inbound connection as plain HTTP, a CONNECT tunnel, or
//!   an internal dashboard request, and forks accordingly
//! - negotiates HTTP/1.1 or HTTP/2 with the intercepted client via ALPN
//! - runs every intercepted request and response through an ordered
//!   [`plugin`] pipeline with short-circuit semantics
//! - streams live traffic events to a built-in dashboard over server-sent
//!   events
//!
//! ```no_run
//! use interceptify::Proxy;
//! use interceptify::certificate_authority::RootAuthority;
//! use interceptify::plugin::Logger;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), interceptify::Error> {
//!     let ca = RootAuthority::open("ca.crt", "ca.key")?;
//!
//!     Proxy::builder(ca)
//!         .with_addr(([127, 0, 0, 1], 8080).into())
//!         .with_plugin(Logger::new())
//!         .build()?
//!         .start(std::future::pending())
//!         .await
//! }
//! ```

mod body;
pub mod certificate_authority;
mod dashboard;
mod error;
mod events;
pub mod manipulator;
pub mod plugin;
mod proxy;

pub use body::Body;
pub use error::Error;
pub use events::EventBus;
pub use plugin::{HttpContext, Plugin, PluginManager, RequestOrResponse};
pub use proxy::{Proxy, ProxyBuilder};

pub use hyper;
pub use tokio_rustls::rustls;
