// Metrics module - the catalog of analytics series this exporter can expose
//
// Each definition ties an external identifier (as given in the metrics
// filter) to the upstream query and to its Prometheus exposition. Decode
// paths are plain data: adding a metric means adding a table row.

use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::azion::MetricQuery;

pub mod assertion;
pub mod series;

pub use assertion::assert_latest_value;
pub use series::{decode_series, DecodeError};

/// Prefix of every exposed metric name
pub const NAMESPACE: &str = "azion";

/// Azion product id of Content Delivery
pub const CONTENT_DELIVERY_PRODUCT: &str = "1441740010";

/// One row of the content-delivery catalog
struct Family {
    /// Upstream metric name
    metric: &'static str,
    /// Exposed name without namespace
    exposed: &'static str,
    description: &'static str,
    label: &'static str,
    dimensions: &'static [&'static str],
}

const CONTENT_DELIVERY_FAMILIES: &[Family] = &[
    Family {
        metric: "requests",
        exposed: "cd_requests_count",
        description: "Azion Analytics Content Delivery Requests Count",
        label: "type",
        dimensions: &["total", "saved", "missed"],
    },
    Family {
        metric: "bandwidth",
        exposed: "cd_bandwidth_gb",
        description: "Azion Analytics Content Delivery Bandwidth Count",
        label: "type",
        dimensions: &["total", "saved", "missed"],
    },
    Family {
        metric: "data_transferred",
        exposed: "cd_data_transferred_mb",
        description: "Azion Analytics Content Delivery Data Transferred in MB",
        label: "type",
        dimensions: &["total", "saved", "missed"],
    },
    Family {
        metric: "status_code",
        exposed: "cd_status_code_total",
        description: "Azion Analytics Content Delivery Status Code Total",
        label: "code",
        dimensions: &[
            "2xx", "200", "204", "206", "3xx", "301", "302", "304", "4xx", "400", "403", "404",
            "5xx", "500", "502", "503",
        ],
    },
];

/// Errors raised while building the registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("none of the requested metrics are known: {0:?}")]
    Empty(Vec<String>),
}

/// How one analytics series is queried and exposed
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    /// External identifier, e.g. "cd_status_code_5xx"
    pub identifier: String,

    /// Fully qualified Prometheus name, e.g. "azion_cd_status_code_total"
    pub exposed_name: String,

    pub description: String,

    /// Label names, shared by every definition with the same exposed name
    pub label_names: Vec<String>,

    /// Label values for this definition, in `label_names` order
    pub label_values: Vec<String>,

    pub query: MetricQuery,
}

/// Every definition this exporter knows about, in catalog order.
pub fn catalog() -> Vec<MetricDefinition> {
    CONTENT_DELIVERY_FAMILIES
        .iter()
        .flat_map(|family| {
            family.dimensions.iter().map(move |dimension| MetricDefinition {
                identifier: format!("cd_{}_{}", family.metric, dimension),
                exposed_name: format!("{}_{}", NAMESPACE, family.exposed),
                description: family.description.to_string(),
                label_names: vec![family.label.to_string()],
                label_values: vec![dimension.to_string()],
                query: MetricQuery::new(CONTENT_DELIVERY_PRODUCT, family.metric, *dimension),
            })
        })
        .collect()
}

/// Immutable set of enabled metric definitions
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    definitions: Vec<MetricDefinition>,
}

impl MetricRegistry {
    /// Builds the registry from the enabled identifiers.
    ///
    /// An empty list enables the whole catalog. Unknown identifiers are
    /// skipped with a warning; only a list with no known identifier at all
    /// is an error.
    pub fn from_enabled<S: AsRef<str>>(enabled: &[S]) -> Result<Self, RegistryError> {
        let catalog = catalog();

        if enabled.is_empty() {
            info!("No metrics filter given, enabling all {} metrics", catalog.len());
            return Ok(MetricRegistry {
                definitions: catalog,
            });
        }

        let mut seen = HashSet::new();
        let mut definitions = Vec::new();

        for identifier in enabled.iter().map(|id| id.as_ref().trim()) {
            if !seen.insert(identifier) {
                debug!("Metric '{}' listed more than once, ignoring duplicate", identifier);
                continue;
            }

            match catalog.iter().find(|def| def.identifier == identifier) {
                Some(definition) => definitions.push(definition.clone()),
                None => warn!("Unknown metric '{}' in metrics filter, skipping", identifier),
            }
        }

        if definitions.is_empty() {
            return Err(RegistryError::Empty(
                enabled.iter().map(|id| id.as_ref().to_string()).collect(),
            ));
        }

        info!("Enabled {} of {} known metrics", definitions.len(), catalog.len());
        Ok(MetricRegistry { definitions })
    }

    pub fn definitions(&self) -> &[MetricDefinition] {
        &self.definitions
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|def| def.identifier.as_str())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }
}
