//! Error types for floating-dns.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while loading the broker TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no PEM certificate found in {}", .0.display())]
    NoCertificate(PathBuf),

    #[error("no PEM private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("invalid broker CA bundle: {0}")]
    Verifier(#[from] rustls::client::VerifierBuilderError),
}

/// Failures while talking to the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid broker address '{0}'")]
    InvalidAddress(String),

    #[error("AMQP error: {0}")]
    Amqp(#[from] amqprs::error::Error),

    #[error("queue '{0}' was not declared")]
    QueueNotDeclared(String),
}

/// Failures while talking to the OpenStack identity or compute APIs.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("invalid OpenStack configuration: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("identity service response carried no X-Subject-Token")]
    MissingToken,

    #[error("no '{service}' endpoint for interface '{interface}' in region '{region}'")]
    EndpointNotFound {
        service: &'static str,
        interface: String,
        region: String,
    },
}
