//! # Connection Routing
//!
//! Checks connections out of the right tenant pool and applies the session
//! state row-level security depends on. For hierarchical child tenants the
//! checkout sets the `app.tenantid` session variable to the child tenant and
//! switches from the schema-owner role to its restricted row-access role, so
//! the child can only see its own rows inside the parent's schema.
//!
//! Session state is undone on [`TenantConnection::release`]. A scoped
//! connection that is dropped without release is detached from its pool
//! instead of being returned, so a dirty session can never leak into another
//! request.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, Postgres};
use thiserror::Error;

use crate::models::tenant::IsolationType;
use crate::tenancy::context::TenantIdentity;
use crate::tenancy::pool_cache::{CacheError, PoolCache, TenantPoolLoader};
use crate::tenancy::{ROW_ACCESS_ROLE_SUFFIX, SESSION_TENANT_VAR, is_valid_identifier};

/// Errors from acquiring or releasing tenant connections.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to check out connection for tenant {tenant_id}: {source}")]
    Checkout {
        tenant_id: String,
        source: sqlx::Error,
    },
    #[error("failed to apply tenant session state for tenant {tenant_id}: {source}")]
    Session {
        tenant_id: String,
        source: sqlx::Error,
    },
    #[error("role name contains invalid characters: {role}")]
    InvalidRole { role: String },
}

/// Session state to apply to a freshly checked-out connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionPlan {
    /// Value for the `app.tenantid` session variable.
    pub tenant_var: Option<String>,
    /// Role to switch to for the duration of the checkout.
    pub switch_role: Option<String>,
}

impl SessionPlan {
    pub fn is_scoped(&self) -> bool {
        self.tenant_var.is_some() || self.switch_role.is_some()
    }
}

/// Decide what session state a checkout needs.
///
/// Only hierarchical child tenants on schema-backed storage need any: the
/// session variable feeds the row-security policy, and the role switch drops
/// from the schema owner (who bypasses the policy on its own tables) to the
/// restricted row-access role. A pool whose login role already is the
/// row-access role needs no switch.
pub fn session_plan(
    isolation: IsolationType,
    identity: &TenantIdentity,
    pool_username: &str,
) -> Result<SessionPlan, RouterError> {
    let schema_backed = matches!(
        isolation,
        IsolationType::Schema | IsolationType::SchemaDiscriminator
    );
    if !schema_backed || !identity.is_hierarchical() {
        return Ok(SessionPlan::default());
    }

    let switch_role = if pool_username.ends_with(ROW_ACCESS_ROLE_SUFFIX) {
        None
    } else {
        let role = format!("{}{}", pool_username, ROW_ACCESS_ROLE_SUFFIX);
        if !is_valid_identifier(&role) {
            return Err(RouterError::InvalidRole { role });
        }
        Some(role)
    };

    Ok(SessionPlan {
        tenant_var: Some(identity.tenant_id.clone()),
        switch_role,
    })
}

/// A checked-out tenant connection.
///
/// Dereferences to [`PgConnection`] for query execution. Call
/// [`release`](Self::release) when done; dropping a scoped connection without
/// releasing discards it rather than returning a dirty session to the pool.
pub struct TenantConnection {
    conn: Option<PoolConnection<Postgres>>,
    scoped: bool,
    tenant_id: String,
    isolation: IsolationType,
}

impl TenantConnection {
    /// Isolation strategy of the pool this connection came from.
    pub fn isolation(&self) -> IsolationType {
        self.isolation
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Reset tenant session state and return the connection to its pool.
    pub async fn release(mut self) -> Result<(), RouterError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        if !self.scoped {
            return Ok(());
        }

        let reset = async {
            sqlx::query(&format!("RESET {}", SESSION_TENANT_VAR))
                .execute(&mut *conn)
                .await?;
            sqlx::query("RESET ROLE").execute(&mut *conn).await?;
            Ok::<_, sqlx::Error>(())
        }
        .await;

        match reset {
            Ok(()) => Ok(()),
            Err(source) => {
                tracing::warn!(
                    tenant_id = %self.tenant_id,
                    error = %source,
                    "failed to reset tenant session state, discarding connection"
                );
                conn.detach();
                Err(RouterError::Session {
                    tenant_id: self.tenant_id.clone(),
                    source,
                })
            }
        }
    }
}

impl Deref for TenantConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        // The connection is only taken by release() and drop(), both of which
        // consume or end the value.
        self.conn
            .as_deref()
            .expect("connection present until release")
    }
}

impl DerefMut for TenantConnection {
    fn deref_mut(&mut self) -> &mut PgConnection {
        self.conn
            .as_deref_mut()
            .expect("connection present until release")
    }
}

impl Drop for TenantConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take()
            && self.scoped
        {
            tracing::warn!(
                tenant_id = %self.tenant_id,
                "scoped connection dropped without release, discarding"
            );
            conn.detach();
        }
    }
}

/// Routes requests to the correct tenant pool and hands out connections with
/// session state applied.
pub struct ConnectionRouter {
    cache: Arc<PoolCache<TenantPoolLoader>>,
}

impl ConnectionRouter {
    pub fn new(cache: Arc<PoolCache<TenantPoolLoader>>) -> Self {
        Self { cache }
    }

    /// Check a connection out of the pool serving `identity`.
    ///
    /// Hierarchical children route to their parent's pool; the child identity
    /// only affects session state.
    pub async fn acquire(&self, identity: &TenantIdentity) -> Result<TenantConnection, RouterError> {
        let routing_tenant = identity.routing_tenant();
        let pool = self.cache.get(routing_tenant).await?;

        let mut conn = pool
            .pool
            .acquire()
            .await
            .map_err(|source| RouterError::Checkout {
                tenant_id: routing_tenant.to_string(),
                source,
            })?;

        let plan = session_plan(pool.isolation, identity, &pool.username)?;
        let scoped = plan.is_scoped();

        if let Err(source) = Self::apply_plan(&mut conn, &plan).await {
            // A partially applied plan leaves the session dirty.
            conn.detach();
            return Err(RouterError::Session {
                tenant_id: identity.tenant_id.clone(),
                source,
            });
        }

        if scoped {
            tracing::debug!(
                tenant_id = %identity.tenant_id,
                routing_tenant = %routing_tenant,
                role = plan.switch_role.as_deref(),
                "applied tenant session state"
            );
        }

        Ok(TenantConnection {
            conn: Some(conn),
            scoped,
            tenant_id: identity.tenant_id.clone(),
            isolation: pool.isolation,
        })
    }

    async fn apply_plan(
        conn: &mut PoolConnection<Postgres>,
        plan: &SessionPlan,
    ) -> Result<(), sqlx::Error> {
        if let Some(ref tenant_var) = plan.tenant_var {
            // set_config is parameterized; the tenant id never reaches the
            // statement text.
            sqlx::query("SELECT set_config($1, $2, false)")
                .bind(SESSION_TENANT_VAR)
                .bind(tenant_var)
                .execute(&mut **conn)
                .await?;
        }
        if let Some(ref role) = plan.switch_role {
            // SET ROLE cannot be parameterized; the role name was validated
            // against [A-Za-z0-9_]* before it got here.
            sqlx::query(&format!("SET ROLE {}", role))
                .execute(&mut **conn)
                .await?;
        }
        Ok(())
    }
}
