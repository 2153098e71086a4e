//! SeaORM entity models for the tenant registry.

pub mod tenant;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Basic service information returned by the root endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// Service name
    #[schema(example = "stratum")]
    pub name: String,
    /// Service version
    #[schema(example = "0.1.0")]
    pub version: String,
}
