use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ComputeInventory, Server};
use crate::config::{non_empty, OpenStackConfig};
use crate::error::CloudError;

const COMPUTE_SERVICE: &str = "compute";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Nova client authenticated once against Keystone v3.
///
/// The token is never refreshed; it lives as long as the process does.
pub struct OpenStackCompute {
    http: Client,
    token: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
    #[serde(default)]
    expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ServerPage {
    #[serde(default)]
    servers: Vec<Server>,
    #[serde(default)]
    servers_links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    rel: String,
    href: String,
}

impl OpenStackCompute {
    /// Authenticates with the identity service and picks the compute
    /// endpoint for the configured region from the service catalog.
    pub async fn authenticate(config: &OpenStackConfig) -> Result<Self, CloudError> {
        let auth_url = non_empty(&config.auth_url)
            .ok_or_else(|| CloudError::Config("OS_AUTH_URL is not set".into()))?;
        let url = tokens_url(auth_url);
        let request = auth_request(config)?;

        let http = Client::builder()
            .user_agent(concat!("floating-dns/", env!("CARGO_PKG_VERSION")))
            .build()?;

        debug!("Requesting token from {}", url);
        let response = http.post(&url).json(&request).send().await?;
        let response = check(response, "POST", &url).await?;
        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(CloudError::MissingToken)?;
        let body: TokenResponse = response.json().await?;

        let endpoint = find_endpoint(
            &body.token.catalog,
            COMPUTE_SERVICE,
            config.interface(),
            config.region(),
        )
        .ok_or_else(|| CloudError::EndpointNotFound {
            service: COMPUTE_SERVICE,
            interface: config.interface().to_string(),
            region: config.region().to_string(),
        })?
        .trim_end_matches('/')
        .to_string();

        info!(
            "Authenticated against {} (token expires {}), compute endpoint {}",
            auth_url,
            body.token.expires_at.as_deref().unwrap_or("unknown"),
            endpoint
        );

        Ok(Self {
            http,
            token,
            endpoint,
        })
    }
}

#[async_trait]
impl ComputeInventory for OpenStackCompute {
    async fn list_servers(&self) -> Result<Vec<Server>, CloudError> {
        let mut url = format!("{}/servers/detail?all_tenants=True", self.endpoint);
        let mut servers = Vec::new();

        loop {
            let response = self
                .http
                .get(&url)
                .header(AUTH_TOKEN_HEADER, &self.token)
                .header(ACCEPT, "application/json")
                .send()
                .await?;
            let page: ServerPage = check(response, "GET", &url).await?.json().await?;
            debug!("Fetched {} servers from {}", page.servers.len(), url);

            let next = next_link(&page.servers_links).map(str::to_string);
            servers.extend(page.servers);
            match next {
                Some(next) if next != url => url = next,
                _ => break,
            }
        }

        Ok(servers)
    }
}

async fn check(
    response: Response,
    method: &'static str,
    url: &str,
) -> Result<Response, CloudError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CloudError::Status {
        method,
        url: url.to_string(),
        status,
        body,
    })
}

/// `<auth_url>/v3/auth/tokens`, tolerating URLs with or without `/v3`.
fn tokens_url(auth_url: &str) -> String {
    let base = auth_url.trim_end_matches('/');
    if base.ends_with("/v3") {
        format!("{}/auth/tokens", base)
    } else {
        format!("{}/v3/auth/tokens", base)
    }
}

fn domain_ref(id: Option<&str>, name: Option<&str>) -> Option<Value> {
    match (id, name) {
        (Some(id), _) => Some(json!({ "id": id })),
        (None, Some(name)) => Some(json!({ "name": name })),
        (None, None) => None,
    }
}

fn user_ref(config: &OpenStackConfig) -> Result<Value, CloudError> {
    if let Some(id) = non_empty(&config.userid) {
        return Ok(json!({ "id": id }));
    }
    let name = non_empty(&config.username)
        .ok_or_else(|| CloudError::Config("OS_USERNAME or OS_USERID must be set".into()))?;
    let domain = domain_ref(
        non_empty(&config.user_domain_id).or(non_empty(&config.domain_id)),
        non_empty(&config.user_domain_name).or(non_empty(&config.domain_name)),
    )
    .ok_or_else(|| {
        CloudError::Config(format!("user '{}' needs a domain id or domain name", name))
    })?;
    Ok(json!({ "name": name, "domain": domain }))
}

fn scope(config: &OpenStackConfig) -> Result<Option<Value>, CloudError> {
    if let Some(id) = config.project_id() {
        return Ok(Some(json!({ "project": { "id": id } })));
    }
    if let Some(name) = config.project_name() {
        let domain = domain_ref(
            non_empty(&config.project_domain_id).or(non_empty(&config.domain_id)),
            non_empty(&config.project_domain_name).or(non_empty(&config.domain_name)),
        )
        .ok_or_else(|| {
            CloudError::Config(format!("project '{}' needs a domain id or domain name", name))
        })?;
        return Ok(Some(
            json!({ "project": { "name": name, "domain": domain } }),
        ));
    }
    Ok(domain_ref(non_empty(&config.domain_id), non_empty(&config.domain_name))
        .map(|domain| json!({ "domain": domain })))
}

fn auth_request(config: &OpenStackConfig) -> Result<Value, CloudError> {
    if let Some(secret) = non_empty(&config.application_credential_secret) {
        let mut credential = json!({ "secret": secret });
        if let Some(id) = non_empty(&config.application_credential_id) {
            credential["id"] = json!(id);
        } else if let Some(name) = non_empty(&config.application_credential_name) {
            credential["name"] = json!(name);
            credential["user"] = user_ref(config)?;
        } else {
            return Err(CloudError::Config(
                "application credential secret given without an id or name".into(),
            ));
        }
        return Ok(json!({
            "auth": {
                "identity": {
                    "methods": ["application_credential"],
                    "application_credential": credential
                }
            }
        }));
    }

    let password = non_empty(&config.password)
        .ok_or_else(|| CloudError::Config("OS_PASSWORD is not set".into()))?;
    let mut user = user_ref(config)?;
    user["password"] = json!(password);

    let mut auth = json!({
        "identity": {
            "methods": ["password"],
            "password": { "user": user }
        }
    });
    if let Some(scope) = scope(config)? {
        auth["scope"] = scope;
    }
    Ok(json!({ "auth": auth }))
}

fn find_endpoint<'a>(
    catalog: &'a [CatalogEntry],
    service: &str,
    interface: &str,
    region: &str,
) -> Option<&'a str> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == service)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            ep.interface == interface
                && (ep.region_id.as_deref() == Some(region) || ep.region.as_deref() == Some(region))
        })
        .map(|ep| ep.url.as_str())
}

fn next_link(links: &[Link]) -> Option<&str> {
    links
        .iter()
        .find(|link| link.rel == "next")
        .map(|link| link.href.as_str())
}
