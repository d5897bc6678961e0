use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use moka::future::Cache;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::{CryptoProvider, aws_lc_rs};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tracing::{debug, info};

use super::{CACHE_TTL_SECS, CertificateAuthority, LEAF_TTL_SECS, NOT_BEFORE_BACKDATE_SECS};
use crate::Error;

const ROOT_ORGANIZATION: &str = "Interceptify Security";
const ROOT_COMMON_NAME: &str = "Interceptify Root CA";
const ROOT_TTL_DAYS: i64 = 3650;
const ROOT_KEY_BITS: u32 = 4096;
const LEAF_KEY_BITS: u32 = 2048;
const CONFIG_CACHE_CAPACITY: u64 = 1_000;

/// A leaf certificate minted for one host, chained to the root.
#[derive(Debug)]
pub struct SignedLeaf {
    /// DER-encoded leaf certificate.
    pub cert: CertificateDer<'static>,
    /// The leaf's fresh private key.
    pub key: PrivateKeyDer<'static>,
}

/// File-backed root certificate authority.
///
/// The root is a 4096-bit RSA key with a self-signed certificate, created on
/// first use and persisted as `ca.crt` (PEM `CERTIFICATE`) and `ca.key`
/// (PKCS#1 PEM `RSA PRIVATE KEY`, mode 0600) inside a 0700 directory. Loaded
/// material is never rewritten, so repeated startups observe identical bytes.
///
/// Leaves are 2048-bit RSA, valid from one hour in the past to one year out,
/// with a 128-bit random serial. Minted rustls configs are cached per host.
pub struct RootAuthority {
    key_pair: KeyPair,
    ca_cert: Certificate,
    ca_cert_pem: String,
    cache: Cache<String, Arc<ServerConfig>>,
    provider: Arc<CryptoProvider>,
}

impl RootAuthority {
    /// Loads the root from `cert_path`/`key_path`, generating and persisting
    /// a new one when either file is missing.
    pub fn open(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, Error> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        if cert_path.exists() && key_path.exists() {
            Self::load(cert_path, key_path)
        } else {
            Self::generate(cert_path, key_path)
        }
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, Error> {
        let cert_pem = fs::read_to_string(cert_path).map_err(Error::ca_init)?;
        let key_pem = fs::read(key_path).map_err(Error::ca_init)?;

        let rsa = Rsa::private_key_from_pem(&key_pem).map_err(Error::ca_init)?;
        let key_pair = rcgen_key_pair(rsa).map_err(Error::ca_init)?;

        let ca_cert = CertificateParams::from_ca_cert_pem(&cert_pem)
            .and_then(|params| params.self_signed(&key_pair))
            .map_err(Error::ca_init)?;

        debug!(cert = %cert_path.display(), "loaded existing root certificate authority");
        Ok(Self::assemble(key_pair, ca_cert, cert_pem))
    }

    fn generate(cert_path: &Path, key_path: &Path) -> Result<Self, Error> {
        let rsa = Rsa::generate(ROOT_KEY_BITS).map_err(Error::ca_init)?;
        let key_pem = rsa.private_key_to_pem().map_err(Error::ca_init)?;
        let key_pair = rcgen_key_pair(rsa).map_err(Error::ca_init)?;

        let mut params = CertificateParams::default();
        params.serial_number = Some(random_serial());
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(ROOT_TTL_DAYS);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);
        params.distinguished_name = dn;

        let ca_cert = params.self_signed(&key_pair).map_err(Error::ca_init)?;
        let cert_pem = ca_cert.pem();

        write_material(cert_path, key_path, cert_pem.as_bytes(), &key_pem)?;
        info!(cert = %cert_path.display(), "generated new root certificate authority");

        Ok(Self::assemble(key_pair, ca_cert, cert_pem))
    }

    fn assemble(key_pair: KeyPair, ca_cert: Certificate, ca_cert_pem: String) -> Self {
        Self {
            key_pair,
            ca_cert,
            ca_cert_pem,
            cache: Cache::builder()
                .max_capacity(CONFIG_CACHE_CAPACITY)
                .time_to_live(std::time::Duration::from_secs(CACHE_TTL_SECS))
                .build(),
            provider: Arc::new(aws_lc_rs::default_provider()),
        }
    }

    /// The root certificate as PEM, for trust-store installation.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Mints a leaf certificate and fresh private key for `host`.
    pub fn sign(&self, host: &str) -> Result<SignedLeaf, Error> {
        let rsa = Rsa::generate(LEAF_KEY_BITS).map_err(|e| Error::ca_sign(host, e))?;
        let pkcs8 = PKey::from_rsa(rsa)
            .and_then(|key| key.private_key_to_pkcs8())
            .map_err(|e| Error::ca_sign(host, e))?;
        let leaf_key = KeyPair::try_from(pkcs8.as_slice()).map_err(|e| Error::ca_sign(host, e))?;

        let mut params = CertificateParams::default();
        params.serial_number = Some(random_serial());
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::seconds(NOT_BEFORE_BACKDATE_SECS);
        params.not_after = now + Duration::seconds(LEAF_TTL_SECS);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![host_san(host).map_err(|e| Error::ca_sign(host, e))?];

        let cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.key_pair)
            .map_err(|e| Error::ca_sign(host, e))?;

        Ok(SignedLeaf {
            cert: cert.into(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8)),
        })
    }
}

impl CertificateAuthority for RootAuthority {
    async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, Error> {
        if let Some(config) = self.cache.get(host).await {
            debug!(host, "using cached server config");
            return Ok(config);
        }

        let leaf = self.sign(host)?;
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::ca_sign(host, e))?
            .with_no_client_auth()
            .with_single_cert(vec![leaf.cert], leaf.key)
            .map_err(|e| Error::ca_sign(host, e))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.cache
            .insert(host.to_owned(), Arc::clone(&config))
            .await;
        Ok(config)
    }
}

/// Bridges an openssl RSA key into rcgen via PKCS#8 DER.
///
/// rcgen cannot generate RSA keys itself; the disk format stays PKCS#1 while
/// signing happens through rcgen's key pair type.
fn rcgen_key_pair(rsa: Rsa<openssl::pkey::Private>) -> Result<KeyPair, crate::error::BoxError> {
    let pkcs8 = PKey::from_rsa(rsa)?.private_key_to_pkcs8()?;
    Ok(KeyPair::try_from(pkcs8.as_slice())?)
}

/// 128-bit random serial; the space is large enough that collisions are
/// never checked for.
fn random_serial() -> SerialNumber {
    let bytes = rand::rng().random::<[u8; 16]>();
    SerialNumber::from_slice(&bytes)
}

fn host_san(host: &str) -> Result<SanType, rcgen::Error> {
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(SanType::IpAddress(ip)),
        Err(_) => Ok(SanType::DnsName(Ia5String::try_from(host)?)),
    }
}

fn write_material(
    cert_path: &Path,
    key_path: &Path,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(), Error> {
    if let Some(dir) = cert_path.parent() {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(dir).map_err(Error::ca_init)?;
    }
    write_atomic(cert_path, cert_pem, 0o644)?;
    write_atomic(key_path, key_pem, 0o600)?;
    Ok(())
}

/// Write-then-rename so a crash cannot leave partial key material behind.
fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).map_err(Error::ca_init)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode)).map_err(Error::ca_init)?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(&tmp, path).map_err(Error::ca_init)?;
    Ok(())
}
