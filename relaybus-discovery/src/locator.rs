use async_trait::async_trait;
use relaybus_models::core::ServiceEndpoint;

use crate::error::Result;

/// Stateless lookup of service instances by name and tags. Every call goes
/// to the registry; nothing is cached.
#[async_trait]
pub trait ServiceLocator: Send + Sync {
    /// `tag_filter` is a comma-separated list. Empty matches any instance,
    /// otherwise an instance must carry at least one of the tags.
    async fn find(&self, service_name: &str, tag_filter: &str) -> Result<Vec<ServiceEndpoint>>;
}

/// A service entry as reported by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredService {
    pub name: String,
    pub endpoint: ServiceEndpoint,
}

pub fn parse_tag_filter(tag_filter: &str) -> Vec<String> {
    tag_filter
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

/// Keep the endpoints of `service_name` (case-insensitive) matching the tag filter.
pub fn filter_endpoints<'a, I>(services: I, service_name: &str, tag_filter: &str) -> Vec<ServiceEndpoint>
where
    I: IntoIterator<Item = &'a RegisteredService>,
{
    let tags = parse_tag_filter(tag_filter);
    services
        .into_iter()
        .filter(|service| service.name.eq_ignore_ascii_case(service_name))
        .filter(|service| {
            tags.is_empty() || service.endpoint.tags.iter().any(|tag| tags.contains(tag))
        })
        .map(|service| service.endpoint.clone())
        .collect()
}

/// Locator over a fixed list of services.
#[derive(Clone, Default)]
pub struct StaticLocator {
    services: Vec<RegisteredService>,
}

impl StaticLocator {
    pub fn new(services: Vec<RegisteredService>) -> Self {
        Self { services }
    }

    pub fn with_service(mut self, name: impl Into<String>, endpoint: ServiceEndpoint) -> Self {
        self.services.push(RegisteredService {
            name: name.into(),
            endpoint,
        });
        self
    }
}

#[async_trait]
impl ServiceLocator for StaticLocator {
    async fn find(&self, service_name: &str, tag_filter: &str) -> Result<Vec<ServiceEndpoint>> {
        Ok(filter_endpoints(&self.services, service_name, tag_filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(address: &str, tags: &[&str]) -> ServiceEndpoint {
        ServiceEndpoint {
            address: address.into(),
            port: 5672,
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
        }
    }

    fn locator() -> StaticLocator {
        StaticLocator::default()
            .with_service("Broker", endpoint("10.0.0.1", &["blue"]))
            .with_service("broker", endpoint("10.0.0.2", &["green", "canary"]))
            .with_service("cache", endpoint("10.0.0.3", &["blue"]))
    }

    #[tokio::test]
    async fn empty_filter_matches_every_instance_of_the_service() {
        let found = locator().find("BROKER", "").await.unwrap();
        let addresses: Vec<_> = found.iter().map(|e| e.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn tags_must_intersect_the_filter() {
        let found = locator().find("broker", "canary, red").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "10.0.0.2");

        assert!(locator().find("broker", "red").await.unwrap().is_empty());
    }

    #[test]
    fn tag_filter_ignores_blank_entries() {
        assert_eq!(parse_tag_filter(" a,,b , "), vec!["a".to_string(), "b".to_string()]);
    }
}
