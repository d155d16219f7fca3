use anyhow::Context;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    value::{Dict, Map, Value},
    Figment, Metadata, Profile, Provider,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const CONFIG_TOML: &str = "floating-dns.toml";
const CONFIG_JSON: &str = "floating-dns.json";

/// Region used when `OS_REGION_NAME` is unset or empty.
pub const DEFAULT_REGION: &str = "RegionOne";

/// Catalog interface used when `OS_INTERFACE` is unset or empty.
pub const DEFAULT_INTERFACE: &str = "public";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub amqp: AmqpConfig,
    #[serde(default)]
    pub openstack: OpenStackConfig,
}

/// Broker settings, read from the `AMQP_*` environment variables.
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct AmqpConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    /// `host` or `host:port`.
    #[serde(default)]
    pub host: String,
    /// `AMQP_CLIENCERTFILE` is the historical spelling and stays the primary key.
    #[serde(
        rename = "cliencertfile",
        alias = "clientcertfile",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_cert_file: Option<String>,
    #[serde(rename = "clientkeyfile", skip_serializing_if = "Option::is_none")]
    pub client_key_file: Option<String>,
    #[serde(rename = "cacert", skip_serializing_if = "Option::is_none")]
    pub ca_cert_file: Option<String>,
}

/// The three files needed for mutual TLS towards the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsPaths<'a> {
    pub client_cert: &'a Path,
    pub client_key: &'a Path,
    pub ca_cert: &'a Path,
}

impl AmqpConfig {
    /// Returns the TLS file set only if all three paths are non-empty.
    pub fn tls_paths(&self) -> Option<TlsPaths<'_>> {
        Some(TlsPaths {
            client_cert: Path::new(non_empty(&self.client_cert_file)?),
            client_key: Path::new(non_empty(&self.client_key_file)?),
            ca_cert: Path::new(non_empty(&self.ca_cert_file)?),
        })
    }

    /// Host portion of `host`, with any port stripped.
    pub fn host_name(&self) -> &str {
        split_host_port(&self.host).0
    }
}

impl fmt::Debug for AmqpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConfig")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("host", &self.host)
            .field("client_cert_file", &self.client_cert_file)
            .field("client_key_file", &self.client_key_file)
            .field("ca_cert_file", &self.ca_cert_file)
            .finish()
    }
}

/// OpenStack identity settings, read from the standard `OS_*` variables.
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct OpenStackConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_domain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_domain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_credential_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_credential_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_credential_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_name: Option<String>,
}

impl OpenStackConfig {
    pub fn region(&self) -> &str {
        non_empty(&self.region_name).unwrap_or(DEFAULT_REGION)
    }

    pub fn interface(&self) -> &str {
        non_empty(&self.interface).unwrap_or(DEFAULT_INTERFACE)
    }

    pub fn project_name(&self) -> Option<&str> {
        non_empty(&self.project_name).or_else(|| non_empty(&self.tenant_name))
    }

    pub fn project_id(&self) -> Option<&str> {
        non_empty(&self.project_id).or_else(|| non_empty(&self.tenant_id))
    }
}

impl fmt::Debug for OpenStackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenStackConfig")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("userid", &self.userid)
            .field("project", &self.project_name().or(self.project_id()))
            .field("application_credential_id", &self.application_credential_id)
            .field("application_credential_name", &self.application_credential_name)
            .field("interface", &self.interface())
            .field("region", &self.region())
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Defaults, then the optional config files, then the environment.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(CONFIG_TOML))
            .merge(Json::file(CONFIG_JSON))
            .merge(StringEnv::prefixed("AMQP_", "amqp"))
            .merge(StringEnv::prefixed("OS_", "openstack"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("AMQP_PASS_FILE") {
            config.amqp.pass = std::fs::read_to_string(&secret_file)
                .with_context(|| format!("reading AMQP_PASS_FILE {}", secret_file))?
                .trim()
                .to_string();
        }

        Ok(config)
    }
}

/// Prefixed environment variables placed under `section`, every value kept
/// verbatim as a string.
///
/// `Env` parses values, so `123456` would become an integer and `{x}` a
/// dict; credentials and ids must reach the config exactly as set.
struct StringEnv {
    env: Env,
    section: &'static str,
}

impl StringEnv {
    fn prefixed(prefix: &str, section: &'static str) -> Self {
        Self {
            env: Env::prefixed(prefix),
            section,
        }
    }
}

impl Provider for StringEnv {
    fn metadata(&self) -> Metadata {
        self.env.metadata()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        let values: Dict = self
            .env
            .iter()
            .map(|(key, value)| (key.as_str().to_string(), Value::from(value)))
            .collect();
        let mut root = Dict::new();
        root.insert(self.section.to_string(), Value::from(values));
        Ok(Profile::Default.collect(root))
    }
}

/// Empty strings count as unset.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
pub(crate) fn split_host_port(addr: &str) -> (&str, Option<&str>) {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            return (host, tail.strip_prefix(':'));
        }
    }
    match addr.split_once(':') {
        Some((host, port)) if !port.contains(':') => (host, Some(port)),
        // bare IPv6 literal without brackets
        Some(_) => (addr, None),
        None => (addr, None),
    }
}
