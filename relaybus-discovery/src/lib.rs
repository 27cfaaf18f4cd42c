mod consul;
mod error;
mod locator;

pub use consul::{ConsulConfig, ConsulServiceLocator};
pub use error::{DiscoveryError, Result};
pub use locator::{filter_endpoints, parse_tag_filter, RegisteredService, ServiceLocator, StaticLocator};
