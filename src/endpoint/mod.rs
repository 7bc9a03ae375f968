//! Listening and connecting endpoint resolution.
//!
//! A [`UrlEndpoint`] is parsed from a `smtp://host:port` or
//! `smtps://host:port` URL and decides everything the transport layer needs:
//! plaintext vs. TLS, the default port for the scheme, the server identity a
//! secure listener presents, and the peer-verification policy an outbound
//! connection applies. Endpoints compare by an identity key so that sets of
//! configured addresses deduplicate.

use std::fmt;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use url::Url;

const SMTP_PORT: u16 = 25;
const SMTPS_PORT: u16 = 465;
const LOCALHOST: &str = "localhost";

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid address {url:?}: {reason}")]
    InvalidAddress { url: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
}

/// Peer-certificate verification policy for outbound TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Certificates are not validated. Selected only for `localhost`, where
    /// peers are expected to present self-signed certificates.
    None,
    /// Certificates must chain to a platform trust root.
    Peer,
}

/// Options shared by an endpoint and every instance it enumerates to.
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    /// Overrides the URL port.
    pub port: Option<u16>,
    /// Overrides the URL hostname, for binding, SNI and the greeting.
    pub hostname: Option<String>,
    /// Sets SO_REUSEPORT on the listening socket.
    pub reuse_port: bool,
    /// PEM certificate chain presented by a secure listener.
    pub tls_cert: Option<PathBuf>,
    /// PEM private key matching `tls_cert`.
    pub tls_key: Option<PathBuf>,
    /// Replaces the policy-derived client TLS configuration wholesale.
    pub client_config: Option<Arc<rustls::ClientConfig>>,
}

impl PartialEq for EndpointOptions {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port
            && self.hostname == other.hostname
            && self.reuse_port == other.reuse_port
            && self.tls_cert == other.tls_cert
            && self.tls_key == other.tls_key
            // An injected TLS configuration has no value identity; compare
            // by pointer.
            && match (&self.client_config, &other.client_config) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

impl Eq for EndpointOptions {}

impl Hash for EndpointOptions {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.port.hash(state);
        self.hostname.hash(state);
        self.reuse_port.hash(state);
        self.tls_cert.hash(state);
        self.tls_key.hash(state);
        if let Some(config) = &self.client_config {
            (Arc::as_ptr(config) as usize).hash(state);
        }
    }
}

/// A plaintext or TLS byte stream, as produced by [`UrlEndpoint::connect`].
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

/// A URL-addressed listen or connect target.
#[derive(Debug, Clone)]
pub struct UrlEndpoint {
    url: Url,
    options: EndpointOptions,
    /// Concrete socket address, set on instances produced by
    /// [`enumerate`](Self::enumerate).
    address: Option<SocketAddr>,
}

impl UrlEndpoint {
    /// Parses a `smtp://` or `smtps://` URL.
    ///
    /// Fails with [`EndpointError::InvalidAddress`] when the string is not an
    /// absolute URL, names another scheme, or lacks a host.
    pub fn parse(input: &str, options: EndpointOptions) -> Result<UrlEndpoint, EndpointError> {
        let url = Url::parse(input).map_err(|err| EndpointError::InvalidAddress {
            url: input.to_string(),
            reason: err.to_string(),
        })?;
        match url.scheme() {
            "smtp" | "smtps" => {}
            other => {
                return Err(EndpointError::InvalidAddress {
                    url: input.to_string(),
                    reason: format!("unsupported scheme {other:?}"),
                })
            }
        }
        if url.host_str().is_none() {
            return Err(EndpointError::InvalidAddress {
                url: input.to_string(),
                reason: "missing host".to_string(),
            });
        }
        Ok(UrlEndpoint {
            url,
            options,
            address: None,
        })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Whether connections on this endpoint are wrapped in TLS.
    pub fn secure(&self) -> bool {
        self.url.scheme() == "smtps"
    }

    pub fn default_port(&self) -> u16 {
        if self.secure() {
            SMTPS_PORT
        } else {
            SMTP_PORT
        }
    }

    /// Option override, then the explicit URL port, then the scheme default.
    pub fn port(&self) -> u16 {
        self.options
            .port
            .or_else(|| self.url.port())
            .unwrap_or_else(|| self.default_port())
    }

    pub fn is_default_port(&self) -> bool {
        self.port() == self.default_port()
    }

    /// Option override, then the URL host.
    pub fn hostname(&self) -> &str {
        self.options
            .hostname
            .as_deref()
            .unwrap_or_else(|| self.url.host_str().unwrap_or_default())
    }

    /// `host` or `host:port`, omitting a default port.
    pub fn authority(&self) -> String {
        if self.is_default_port() {
            self.hostname().to_string()
        } else {
            format!("{}:{}", self.hostname(), self.port())
        }
    }

    /// Unused by SMTP itself; retained so descriptors round-trip.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }

    /// The concrete address of an enumerated instance.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Certificates from loopback peers would always be self-signed, so
    /// verification is skipped for them and enforced everywhere else.
    pub fn verify_mode(&self) -> VerifyMode {
        if self.hostname() == LOCALHOST {
            VerifyMode::None
        } else {
            VerifyMode::Peer
        }
    }

    /// Identity key. Enumerated instances share their parent's key, so a
    /// descriptor and its concrete addresses collapse under deduplication.
    fn key(&self) -> (&str, &str, Option<&str>, Option<&str>, Option<u16>, &EndpointOptions) {
        (
            self.url.scheme(),
            self.url.username(),
            self.url.password(),
            self.url.host_str(),
            self.url.port(),
            &self.options,
        )
    }

    /// Resolves the authority to every concrete socket address (dual-stack
    /// hosts yield several), each instance sharing this endpoint's options.
    pub async fn enumerate(&self) -> Result<Vec<UrlEndpoint>, EndpointError> {
        let instances: Vec<UrlEndpoint> = lookup_host((self.hostname(), self.port()))
            .await?
            .map(|address| UrlEndpoint {
                url: self.url.clone(),
                options: self.options.clone(),
                address: Some(address),
            })
            .collect();
        if instances.is_empty() {
            return Err(EndpointError::InvalidAddress {
                url: self.url.as_str().to_string(),
                reason: "resolved to no addresses".to_string(),
            });
        }
        Ok(instances)
    }

    /// Binds a listener, attaching a TLS acceptor when the scheme is secure.
    pub async fn bind(&self) -> Result<BoundEndpoint, EndpointError> {
        let address = match self.address {
            Some(address) => address,
            None => lookup_host((self.hostname(), self.port()))
                .await?
                .next()
                .ok_or_else(|| EndpointError::InvalidAddress {
                    url: self.url.as_str().to_string(),
                    reason: "resolved to no addresses".to_string(),
                })?,
        };
        let socket = match address {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        #[cfg(unix)]
        if self.options.reuse_port {
            socket.set_reuseport(true)?;
        }
        socket.bind(address)?;
        let listener = socket.listen(1024)?;
        let tls = if self.secure() {
            Some(self.tls_acceptor()?)
        } else {
            None
        };
        Ok(BoundEndpoint {
            listener,
            tls,
            hostname: self.hostname().to_string(),
        })
    }

    /// Connects to the endpoint, wrapping the stream in TLS with SNI and the
    /// policy-selected verifier when the scheme is secure.
    pub async fn connect(&self) -> Result<Box<dyn Connection>, EndpointError> {
        let stream = match self.address {
            Some(address) => TcpStream::connect(address).await?,
            None => TcpStream::connect((self.hostname(), self.port())).await?,
        };
        if !self.secure() {
            return Ok(Box::new(stream));
        }
        let config = match &self.options.client_config {
            Some(config) => Arc::clone(config),
            None => Arc::new(self.client_tls_config()?),
        };
        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(self.hostname().to_string()).map_err(|err| {
            EndpointError::InvalidAddress {
                url: self.url.as_str().to_string(),
                reason: err.to_string(),
            }
        })?;
        Ok(Box::new(connector.connect(server_name, stream).await?))
    }

    fn tls_acceptor(&self) -> Result<TlsAcceptor, EndpointError> {
        let (certs, key) = match (&self.options.tls_cert, &self.options.tls_key) {
            (Some(cert_path), Some(key_path)) => load_pem_identity(cert_path, key_path)?,
            // Without configured PEM material the listener presents a
            // generated self-signed certificate, which localhost peers
            // accept by policy.
            _ => self_signed_identity(self.hostname())?,
        };
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    fn client_tls_config(&self) -> Result<rustls::ClientConfig, EndpointError> {
        let config = match self.verify_mode() {
            VerifyMode::None => rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification {}))
                .with_no_client_auth(),
            VerifyMode::Peer => {
                let mut roots = rustls::RootCertStore::empty();
                for cert in rustls_native_certs::load_native_certs().certs {
                    roots.add(cert)?;
                }
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
        };
        Ok(config)
    }
}

impl fmt::Display for UrlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(f, "{}://{}", self.scheme(), address),
            None => write!(f, "{}://{}", self.scheme(), self.authority()),
        }
    }
}

impl PartialEq for UrlEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for UrlEndpoint {}

impl Hash for UrlEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// A listener produced by [`UrlEndpoint::bind`].
pub struct BoundEndpoint {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    hostname: String,
}

impl BoundEndpoint {
    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    pub fn tls_acceptor(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

fn load_pem_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), EndpointError> {
    let mut cert_reader = std::io::BufReader::new(File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    let mut key_reader = std::io::BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| EndpointError::NoPrivateKey(key_path.to_path_buf()))?;
    Ok((certs, key))
}

fn self_signed_identity(
    hostname: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), EndpointError> {
    let certified = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
    let cert = CertificateDer::from(certified.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.signing_key.serialize_der()));
    Ok((vec![cert], key))
}

/// Verifier for peers whose certificates are not validated. Signatures are
/// still checked with the default provider's algorithms.
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoCertificateVerification {}

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
