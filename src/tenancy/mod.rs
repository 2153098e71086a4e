//! # Multi-Tenancy Core
//!
//! Everything that decides which database a request talks to and under what
//! session identity: the per-request tenant context, the bounded cache of
//! per-tenant connection pools, the router that checks connections out with
//! tenant session state applied, the provisioner that creates tenant storage,
//! and the admin service orchestrating tenant onboarding.

pub mod admin;
pub mod context;
pub mod pool_cache;
pub mod provisioner;
pub mod router;

use regex::Regex;
use std::sync::OnceLock;

/// Request header carrying the logical tenant identifier.
pub const TENANT_HEADER: &str = "X-TENANT-ID";

/// Request header carrying the parent tenant identifier for hierarchical tenants.
pub const PARENT_TENANT_HEADER: &str = "X-PARENT-TENANT-ID";

/// Sentinel meaning "no tenant". Never a valid routing target.
pub const NO_TENANT: &str = "-1";

/// Postgres session variable that row-level-security policies read.
pub const SESSION_TENANT_VAR: &str = "app.tenantid";

/// Suffix of the restricted row-access role derived from a tenant's owner role.
pub const ROW_ACCESS_ROLE_SUFFIX: &str = "user";

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]*$").expect("identifier pattern is valid"))
}

/// Whether a value is safe to interpolate into DDL and role statements.
///
/// Matches `[A-Za-z0-9_]*`. The empty string passes; callers that require a
/// non-empty name must check separately.
pub fn is_valid_identifier(value: &str) -> bool {
    identifier_pattern().is_match(value)
}
