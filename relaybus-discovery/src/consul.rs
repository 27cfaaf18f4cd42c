use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use relaybus_models::core::ServiceEndpoint;
use reqwest::{Client, Response, Url};
use serde::Deserialize;

use crate::{
    error::{DiscoveryError, Result},
    locator::{filter_endpoints, RegisteredService, ServiceLocator},
};

const TOKEN_HEADER: &str = "X-Consul-Token";

#[derive(Debug, Clone)]
pub struct ConsulConfig {
    pub address: String,
    pub port: u16,
    pub datacenter: Option<String>,
    pub token: Option<String>,
}

/// Entry of the agent's `/v1/agent/services` map.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl From<AgentService> for RegisteredService {
    fn from(service: AgentService) -> Self {
        Self {
            name: service.service,
            endpoint: ServiceEndpoint {
                address: service.address,
                port: service.port,
                tags: service.tags.unwrap_or_default(),
            },
        }
    }
}

/// Queries the local Consul agent on every call.
#[derive(Clone)]
pub struct ConsulServiceLocator {
    client: Client,
    base_url: Url,
    datacenter: Option<String>,
    token: Option<String>,
}

impl ConsulServiceLocator {
    pub fn new(config: ConsulConfig) -> Result<Self> {
        Self::with_client(config, Client::new())
    }

    pub fn with_client(config: ConsulConfig, client: Client) -> Result<Self> {
        let raw = format!("http://{}:{}", config.address, config.port);
        let base_url = Url::parse(&raw).map_err(|source| DiscoveryError::InvalidAddress {
            url: raw.clone(),
            source,
        })?;

        Ok(Self {
            client,
            base_url,
            datacenter: config.datacenter.filter(|dc| !dc.is_empty()),
            token: config.token.filter(|token| !token.is_empty()),
        })
    }

    fn services_url(&self) -> Result<Url> {
        let mut url = self
            .base_url
            .join("/v1/agent/services")
            .map_err(|source| DiscoveryError::InvalidAddress {
                url: self.base_url.to_string(),
                source,
            })?;
        if let Some(dc) = &self.datacenter {
            url.query_pairs_mut().append_pair("dc", dc);
        }
        Ok(url)
    }

    async fn handle_response(url: Url, response: Response) -> Result<Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(DiscoveryError::Http {
                status: response.status(),
                url,
            })
        }
    }
}

#[async_trait]
impl ServiceLocator for ConsulServiceLocator {
    async fn find(&self, service_name: &str, tag_filter: &str) -> Result<Vec<ServiceEndpoint>> {
        let url = self.services_url()?;
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = Self::handle_response(url, request.send().await?).await?;
        let services: HashMap<String, AgentService> = response.json().await?;
        let services: Vec<RegisteredService> = services.into_values().map(Into::into).collect();
        let found = filter_endpoints(&services, service_name, tag_filter);
        debug!(
            "Consul returned {} instance(s) of {service_name} for tags '{tag_filter}'",
            found.len()
        );
        Ok(found)
    }
}
