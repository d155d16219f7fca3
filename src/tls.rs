//! Mutual TLS towards the broker.
//!
//! TLS is all-or-nothing: it is configured only when the client
//! certificate, client key and CA bundle paths are all set.  Otherwise the
//! broker connection is made in clear text.
//!
//! The broker certificate must chain to the CA bundle and name the broker
//! as `AMQP/<host>` in a DNS subject alternative name or the common name.
//! A certificate naming only the plain host is rejected.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::TlsConnector;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::config::{AmqpConfig, TlsPaths};
use crate::error::TlsError;

/// Prefix of the identity the broker certificate is expected to carry.
pub const SERVER_IDENTITY_PREFIX: &str = "AMQP/";

/// Client TLS settings for one broker.
#[derive(Clone)]
pub struct TlsSettings {
    client_config: Arc<ClientConfig>,
    server_host: String,
    server_identity: String,
}

impl TlsSettings {
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.client_config))
    }

    /// Host used for SNI and certificate name checks.
    pub fn server_host(&self) -> &str {
        &self.server_host
    }

    /// `AMQP/<host>`, the broker identity announced by the deployment.
    pub fn server_identity(&self) -> &str {
        &self.server_identity
    }
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server_host", &self.server_host)
            .field("server_identity", &self.server_identity)
            .finish_non_exhaustive()
    }
}

/// Builds the TLS settings for `config`, or `None` when any of the three
/// paths is unset.
pub fn configure(config: &AmqpConfig) -> Result<Option<TlsSettings>, TlsError> {
    let Some(paths) = config.tls_paths() else {
        return Ok(None);
    };
    build(paths, config.host_name()).map(Some)
}

fn build(paths: TlsPaths<'_>, host: &str) -> Result<TlsSettings, TlsError> {
    info!("Loading client cert and key..");
    let cert_chain = load_certs(paths.client_cert)?;
    let key = load_key(paths.client_key)?;

    info!("Loading cacert...");
    let mut roots = RootCertStore::empty();
    for ca in load_certs(paths.ca_cert)? {
        roots.add(ca)?;
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server_identity = format!("{}{}", SERVER_IDENTITY_PREFIX, host);
    let verifier = IdentityVerifier {
        inner: WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
            .build()?,
        identity: server_identity.clone(),
    };

    let client_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(cert_chain, key)?;

    Ok(TlsSettings {
        client_config: Arc::new(client_config),
        server_host: host.to_string(),
        server_identity,
    })
}

/// WebPKI chain and signature checks against the CA bundle, with the host
/// name check replaced by a match on the `AMQP/<host>` identity.
#[derive(Debug)]
struct IdentityVerifier {
    inner: Arc<WebPkiServerVerifier>,
    identity: String,
}

impl ServerCertVerifier for IdentityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            // The chain is checked before the name, so a name error means
            // the chain was accepted.
            Ok(_)
            | Err(Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => {}
            Err(e) => return Err(e),
        }

        if presents_identity(end_entity, &self.identity)? {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!("Broker certificate does not name {}", self.identity);
            Err(Error::InvalidCertificate(CertificateError::NotValidForName))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Whether the certificate carries `identity` as a DNS SAN or a common name,
/// compared ASCII case-insensitively.
fn presents_identity(der: &CertificateDer<'_>, identity: &str) -> Result<bool, Error> {
    fn bad_encoding<E>(_: E) -> Error {
        Error::InvalidCertificate(CertificateError::BadEncoding)
    }

    let (_, cert) = X509Certificate::from_der(der.as_ref()).map_err(bad_encoding)?;

    let in_san = cert
        .subject_alternative_name()
        .map_err(bad_encoding)?
        .is_some_and(|san| {
            san.value.general_names.iter().any(
                |name| matches!(name, GeneralName::DNSName(dns) if dns.eq_ignore_ascii_case(identity)),
            )
        });
    let in_cn = cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| cn.eq_ignore_ascii_case(identity));

    Ok(in_san || in_cn)
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
