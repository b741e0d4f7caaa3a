//! Gateway orchestrator
//!
//! Owns the connector manager, tenant registry and certificate resolver, gates
//! every operation on the lifecycle state, and dispatches each request to the
//! action its route selects.
//!
//! ```text
//! Uninitialized ──slots──▶ SlotReservation ──connectors/tenants──▶ Running ──wait_for_completion──▶ Stopped
//! ```

use crate::catalog::RouteAction;
use crate::certs::CertificateResolver;
use crate::config::{ConnectorConfig, ServerConfig, TenantConfig};
use crate::connector::{ConnectionInfo, ConnectionSettings, ConnectorManager, RequestHandler};
use crate::error::{json_error_response, GatewayBody, GatewayError, GatewayErrorCode, Result};
use crate::pool::{PoolConfig, PoolStats, UpstreamPool};
use crate::tenancy::TenantRegistry;
use crate::{files, proxy};
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use parking_lot::{Mutex, RwLock};
use rustls::server::ResolvesServerCert;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Lifecycle state of a [`Gateway`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Uninitialized,
    SlotReservation,
    Running,
    Stopped,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayState::Uninitialized => "Uninitialized",
            GatewayState::SlotReservation => "SlotReservation",
            GatewayState::Running => "Running",
            GatewayState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

const DECLARE_STATES: &[GatewayState] = &[GatewayState::Uninitialized, GatewayState::SlotReservation];
const RUN_STATES: &[GatewayState] = &[GatewayState::SlotReservation, GatewayState::Running];

/// Application code behind a server endpoint slot
#[async_trait]
pub trait EndpointHandler: Send + Sync + 'static {
    async fn handle(&self, tenant_id: String, req: Request<Incoming>) -> Response<GatewayBody>;
}

#[async_trait]
impl<F, Fut> EndpointHandler for F
where
    F: Fn(String, Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<GatewayBody>> + Send + 'static,
{
    async fn handle(&self, tenant_id: String, req: Request<Incoming>) -> Response<GatewayBody> {
        (self)(tenant_id, req).await
    }
}

/// A named server endpoint every tenant must route
#[derive(Clone)]
pub struct EndpointSlot {
    pub name: String,
    pub method: Method,
    handler: Arc<dyn EndpointHandler>,
}

impl fmt::Debug for EndpointSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSlot")
            .field("name", &self.name)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// A named outbound call shape offered to tenant-defined HTTP clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEndpointSlot {
    pub name: String,
    pub input_parameters: Vec<String>,
    pub output_parameters: Vec<String>,
}

/// Outcome of [`Gateway::reconcile_tenants`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadResult {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// Tenant ID and error message
    pub failed: Vec<(String, String)>,
}

/// Routes requests from every connector to slot handlers, upstreams or files
struct Dispatcher {
    tenants: Arc<TenantRegistry>,
    endpoint_slots: RwLock<BTreeMap<String, EndpointSlot>>,
    pool: UpstreamPool,
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, req: Request<Incoming>, conn: ConnectionInfo) -> Response<GatewayBody> {
        let Some((tenant_id, action)) = self.tenants.resolve_request(&conn.connector, &req, conn.is_tls) else {
            debug!(
                connector = %conn.connector,
                method = %req.method(),
                path = req.uri().path(),
                "No route"
            );
            return json_error_response(
                GatewayErrorCode::NoRoute,
                format!("No route for {} {}", req.method(), req.uri().path()),
            );
        };

        match action {
            RouteAction::ServerEndpoint { slot, .. } => {
                let handler = self
                    .endpoint_slots
                    .read()
                    .get(&slot)
                    .map(|s| Arc::clone(&s.handler));
                match handler {
                    Some(handler) => handler.handle(tenant_id, req).await,
                    None => {
                        error!(tenant = %tenant_id, slot = %slot, "Route points at an undeclared slot");
                        json_error_response(GatewayErrorCode::InternalError, "Endpoint slot unavailable")
                    }
                }
            }
            RouteAction::ReverseProxy {
                strip_prefix,
                target,
                ..
            } => proxy::forward(&self.pool, req, &strip_prefix, &target, &conn).await,
            RouteAction::FileServer {
                strip_prefix,
                root_dir,
                dir_listing,
                ..
            } => files::serve(req.uri().path(), &strip_prefix, &root_dir, dir_listing).await,
        }
    }
}

struct GatewayInner {
    state: Mutex<GatewayState>,
    client_slots: RwLock<BTreeMap<String, ClientEndpointSlot>>,
    dispatcher: Arc<Dispatcher>,
    connectors: ConnectorManager,
    /// Connectors tenants may bind to. Tenant registration holds this lock from
    /// the connector check through the commit; connector removal takes the name
    /// out under it before the listener closes.
    bindable: Mutex<HashSet<String>>,
    certificates: Arc<CertificateResolver>,
}

/// Cheaply cloneable handle to a gateway
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let pool = UpstreamPool::new(PoolConfig {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: config.pool_idle_timeout(),
        })
        .map_err(|e| GatewayError::validation(e.to_string()))?;

        let certificates = Arc::new(CertificateResolver::new());
        let tenants = Arc::new(TenantRegistry::new(Arc::clone(&certificates)));
        let settings = ConnectionSettings {
            header_read_timeout: config.header_read_timeout(),
            ..ConnectionSettings::default()
        };

        Ok(Self {
            inner: Arc::new(GatewayInner {
                state: Mutex::new(GatewayState::Uninitialized),
                client_slots: RwLock::new(BTreeMap::new()),
                dispatcher: Arc::new(Dispatcher {
                    tenants,
                    endpoint_slots: RwLock::new(BTreeMap::new()),
                    pool,
                }),
                connectors: ConnectorManager::new(settings),
                bindable: Mutex::new(HashSet::new()),
                certificates,
            }),
        })
    }

    pub fn state(&self) -> GatewayState {
        *self.inner.state.lock()
    }

    /// Check `allowed`, then move to `next` if given
    fn enter(
        &self,
        operation: &'static str,
        allowed: &[GatewayState],
        next: Option<GatewayState>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        let current = *state;
        check_state(operation, allowed, current)?;
        if let Some(next) = next {
            if current != next {
                debug!(from = %current, to = %next, operation, "Gateway state change");
                *state = next;
            }
        }
        Ok(())
    }

    /// Move to SlotReservation without declaring anything
    pub fn open_slot_reservation(&self) -> Result<()> {
        self.enter(
            "open_slot_reservation",
            DECLARE_STATES,
            Some(GatewayState::SlotReservation),
        )
    }

    /// Declare a server endpoint slot every tenant must route
    pub fn add_tenant_server_endpoint_slot<H>(&self, name: &str, method: Method, handler: H) -> Result<()>
    where
        H: EndpointHandler,
    {
        let mut state = self.inner.state.lock();
        check_state("add_tenant_server_endpoint_slot", DECLARE_STATES, *state)?;
        *state = GatewayState::SlotReservation;

        if name.is_empty() {
            return Err(GatewayError::validation("endpoint slot name must not be empty"));
        }
        let mut slots = self.inner.dispatcher.endpoint_slots.write();
        if slots.contains_key(name) {
            return Err(GatewayError::Conflict(format!(
                "endpoint slot '{}' already declared",
                name
            )));
        }
        info!(slot = name, method = %method, "Endpoint slot declared");
        slots.insert(
            name.to_string(),
            EndpointSlot {
                name: name.to_string(),
                method,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Declare a client endpoint slot for tenant-defined HTTP clients
    pub fn add_tenant_client_endpoint_slot(
        &self,
        name: &str,
        input_parameters: Vec<String>,
        output_parameters: Vec<String>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        check_state("add_tenant_client_endpoint_slot", DECLARE_STATES, *state)?;
        *state = GatewayState::SlotReservation;

        if name.is_empty() {
            return Err(GatewayError::validation("client endpoint slot name must not be empty"));
        }
        let mut slots = self.inner.client_slots.write();
        if slots.contains_key(name) {
            return Err(GatewayError::Conflict(format!(
                "client endpoint slot '{}' already declared",
                name
            )));
        }
        debug!(slot = name, "Client endpoint slot declared");
        slots.insert(
            name.to_string(),
            ClientEndpointSlot {
                name: name.to_string(),
                input_parameters,
                output_parameters,
            },
        );
        Ok(())
    }

    pub fn client_endpoint_slot(&self, name: &str) -> Option<ClientEndpointSlot> {
        self.inner.client_slots.read().get(name).cloned()
    }

    pub fn client_endpoint_slots(&self) -> Vec<ClientEndpointSlot> {
        self.inner.client_slots.read().values().cloned().collect()
    }

    /// Declared server endpoint slots with their methods
    pub fn endpoint_slots(&self) -> BTreeMap<String, Method> {
        self.inner
            .dispatcher
            .endpoint_slots
            .read()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.method.clone()))
            .collect()
    }

    /// Open a named listener, returning the bound address
    pub async fn create_server_connector(&self, name: &str, config: &ConnectorConfig) -> Result<SocketAddr> {
        self.enter("create_server_connector", RUN_STATES, Some(GatewayState::Running))?;
        let handler: Arc<dyn RequestHandler> = self.inner.dispatcher.clone();
        let resolver: Arc<dyn ResolvesServerCert> = self.inner.certificates.clone();
        let addr = self
            .inner
            .connectors
            .add_connector(name, config, handler, resolver)
            .await?;
        self.inner.bindable.lock().insert(name.to_string());
        Ok(addr)
    }

    pub async fn delete_server_connector(&self, name: &str) -> Result<()> {
        self.enter("delete_server_connector", RUN_STATES, Some(GatewayState::Running))?;
        self.inner.bindable.lock().remove(name);
        self.inner.connectors.remove_connector(name).await
    }

    pub fn create_tenant(&self, id: &str, config: TenantConfig) -> Result<()> {
        self.enter("create_tenant", RUN_STATES, Some(GatewayState::Running))?;
        let slots = self.endpoint_slots();
        let bindable = self.inner.bindable.lock();
        self.inner
            .dispatcher
            .tenants
            .register_tenant(id, config, &slots, &bindable)
    }

    pub fn replace_tenant(&self, id: &str, config: TenantConfig) -> Result<()> {
        self.enter("replace_tenant", RUN_STATES, Some(GatewayState::Running))?;
        let slots = self.endpoint_slots();
        let bindable = self.inner.bindable.lock();
        self.inner
            .dispatcher
            .tenants
            .replace_tenant(id, config, &slots, &bindable)
    }

    pub fn delete_tenant(&self, id: &str) -> Result<()> {
        self.enter("delete_tenant", RUN_STATES, Some(GatewayState::Running))?;
        self.inner.dispatcher.tenants.remove_tenant(id)
    }

    /// Register a certificate outside any tenant
    pub fn add_certificate(&self, key_pem: &str, chain_pem: &str) -> Result<()> {
        self.enter("add_certificate", RUN_STATES, None)?;
        self.inner.certificates.add_pem(key_pem, chain_pem).map(|_| ())
    }

    pub fn remove_certificate(&self, name: &str) -> Result<()> {
        self.enter("remove_certificate", RUN_STATES, None)?;
        self.inner.certificates.remove_certificate(name)
    }

    /// Stop every connector and release anything waiting for completion
    pub async fn shutdown(&self) -> Result<()> {
        info!("Gateway shutting down");
        self.inner.bindable.lock().clear();
        self.inner.connectors.shutdown().await
    }

    /// Block until `shutdown` has run, then enter Stopped
    pub async fn wait_for_completion(&self) -> Result<()> {
        self.enter("wait_for_completion", RUN_STATES, None)?;
        self.inner.connectors.wait_for_completion().await;
        *self.inner.state.lock() = GatewayState::Stopped;
        info!("Gateway stopped");
        Ok(())
    }

    /// Bring registered tenants in line with `desired`: create new ones, replace
    /// changed ones and delete the rest. Individual failures are collected, not fatal.
    pub fn reconcile_tenants(&self, desired: &BTreeMap<String, TenantConfig>) -> Result<ReloadResult> {
        self.enter("reconcile_tenants", RUN_STATES, Some(GatewayState::Running))?;
        let registry = &self.inner.dispatcher.tenants;
        let slots = self.endpoint_slots();
        let live = self.inner.bindable.lock();
        let mut result = ReloadResult::default();

        for id in registry.tenant_ids() {
            if desired.contains_key(&id) {
                continue;
            }
            match registry.remove_tenant(&id) {
                Ok(()) => result.removed.push(id),
                Err(e) => result.failed.push((id, e.to_string())),
            }
        }

        for (id, config) in desired {
            let outcome = match registry.tenant(id) {
                None => registry
                    .register_tenant(id, config.clone(), &slots, &live)
                    .map(|_| &mut result.added),
                Some(existing) if existing != *config => registry
                    .replace_tenant(id, config.clone(), &slots, &live)
                    .map(|_| &mut result.updated),
                Some(_) => continue,
            };
            match outcome {
                Ok(list) => list.push(id.clone()),
                Err(e) => result.failed.push((id.clone(), e.to_string())),
            }
        }

        Ok(result)
    }

    pub fn tenants(&self) -> &Arc<TenantRegistry> {
        &self.inner.dispatcher.tenants
    }

    pub fn connectors(&self) -> &ConnectorManager {
        &self.inner.connectors
    }

    pub fn certificates(&self) -> &Arc<CertificateResolver> {
        &self.inner.certificates
    }

    /// Request and failure counters for reverse proxy upstreams
    pub fn upstream_stats(&self) -> Arc<PoolStats> {
        self.inner.dispatcher.pool.stats()
    }
}

fn check_state(operation: &'static str, allowed: &[GatewayState], current: GatewayState) -> Result<()> {
    if allowed.contains(&current) {
        return Ok(());
    }
    Err(GatewayError::InvalidState {
        operation,
        required: allowed
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" | "),
        current,
    })
}
