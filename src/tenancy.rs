//! Tenant registry
//!
//! Projects each tenant's configuration into route catalog entries. A tenant's
//! routes and certificate are staged on a copy of the current catalog and
//! published with a single pointer swap, so a request either sees all of a
//! tenant's routes or none of them.

use crate::catalog::{RouteAction, RouteCatalog, RouteEntry, RouteKey};
use crate::certs::{CertificateEntry, CertificateResolver};
use crate::config::{parse_rule_url, TenantConfig};
use crate::error::{GatewayError, Result};
use hyper::header::HOST;
use hyper::{Method, Request};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Prefix removed from request paths before proxying or serving files.
///
/// `/static/*` strips `/static/`; any other path strips itself.
pub fn strip_prefix_for(rule_path: &str) -> String {
    match rule_path.strip_suffix("/*") {
        Some(base) => format!("{}/", base),
        None => rule_path.to_string(),
    }
}

struct TenantRecord {
    config: TenantConfig,
    /// Certificate registered with this tenant; only names it still holds are released
    certificate: Option<Arc<CertificateEntry>>,
}

#[derive(Default)]
struct RegistryState {
    tenants: HashMap<String, TenantRecord>,
    catalog: Arc<RouteCatalog>,
}

/// A route built from one rule, with the URL it came from
struct StagedRoute {
    url: String,
    entry: RouteEntry,
}

pub struct TenantRegistry {
    state: RwLock<RegistryState>,
    certificates: Arc<CertificateResolver>,
}

impl TenantRegistry {
    pub fn new(certificates: Arc<CertificateResolver>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            certificates,
        }
    }

    pub fn certificates(&self) -> &Arc<CertificateResolver> {
        &self.certificates
    }

    /// Register a new tenant; nothing is committed unless every route and the
    /// certificate are accepted.
    pub fn register_tenant(
        &self,
        id: &str,
        config: TenantConfig,
        slots: &BTreeMap<String, Method>,
        live_connectors: &HashSet<String>,
    ) -> Result<()> {
        let (routes, certificate) = self.prepare(id, &config, slots, live_connectors)?;

        let mut state = self.state.write();
        if state.tenants.contains_key(id) {
            return Err(GatewayError::validation(format!(
                "tenant '{}' is already registered",
                id
            )));
        }

        let mut catalog = state.catalog.as_ref().clone();
        let route_count = stage_routes(&mut catalog, id, routes)?;

        if certificate.is_some() {
            self.certificates.replace_entry(None, certificate.clone())?;
        }

        state.catalog = Arc::new(catalog);
        state.tenants.insert(id.to_string(), TenantRecord { config, certificate });
        info!(tenant = id, routes = route_count, "Tenant registered");
        Ok(())
    }

    /// Swap a tenant's routes and certificate for a new configuration
    pub fn replace_tenant(
        &self,
        id: &str,
        config: TenantConfig,
        slots: &BTreeMap<String, Method>,
        live_connectors: &HashSet<String>,
    ) -> Result<()> {
        let (routes, certificate) = self.prepare(id, &config, slots, live_connectors)?;

        let mut state = self.state.write();
        let old_certificate = match state.tenants.get(id) {
            Some(record) => record.certificate.clone(),
            None => return Err(GatewayError::NotFound(format!("tenant '{}'", id))),
        };

        let mut catalog = state.catalog.as_ref().clone();
        catalog.remove_where(|e| e.action.tenant_id() == id);
        let route_count = stage_routes(&mut catalog, id, routes)?;

        if old_certificate.is_some() || certificate.is_some() {
            self.certificates
                .replace_entry(old_certificate.as_ref(), certificate.clone())?;
        }

        state.catalog = Arc::new(catalog);
        state.tenants.insert(id.to_string(), TenantRecord { config, certificate });
        info!(tenant = id, routes = route_count, "Tenant replaced");
        Ok(())
    }

    /// Remove a tenant with every route it owns and its certificate
    pub fn remove_tenant(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        let record = state
            .tenants
            .remove(id)
            .ok_or_else(|| GatewayError::NotFound(format!("tenant '{}'", id)))?;

        let mut catalog = state.catalog.as_ref().clone();
        let removed = catalog.remove_where(|e| e.action.tenant_id() == id);
        state.catalog = Arc::new(catalog);

        if let Some(certificate) = record.certificate {
            if self.certificates.release(&certificate) == 0 {
                warn!(
                    tenant = id,
                    common_name = %certificate.common_name,
                    "Tenant certificate already gone"
                );
            }
        }

        info!(tenant = id, routes = removed, "Tenant removed");
        Ok(())
    }

    /// Validate a configuration and build its routes without touching shared state
    fn prepare(
        &self,
        id: &str,
        config: &TenantConfig,
        slots: &BTreeMap<String, Method>,
        live_connectors: &HashSet<String>,
    ) -> Result<(Vec<StagedRoute>, Option<Arc<CertificateEntry>>)> {
        if id.is_empty() {
            return Err(GatewayError::validation("tenant ID must not be empty"));
        }
        config.validate(id).map_err(GatewayError::Validation)?;

        let certificate = match &config.x509 {
            Some(x509) => Some(Arc::new(CertificateEntry::from_pem(&x509.key, &x509.cert)?)),
            None => None,
        };

        check_slots(config, slots)?;

        for connector in config.referenced_connectors() {
            if !live_connectors.contains(connector) {
                return Err(GatewayError::validation(format!(
                    "tenant '{}' references unknown connector '{}'",
                    id, connector
                )));
            }
        }

        let routes = build_routes(id, config, slots)?;
        Ok((routes, certificate))
    }

    /// Look up the route for a request's routing fields
    pub fn resolve(
        &self,
        connector: &str,
        scheme: &str,
        host: &str,
        path: &str,
        method: &str,
    ) -> Option<(String, RouteAction)> {
        self.catalog()
            .resolve(connector, scheme, host, path, method)
            .map(|e| (e.action.tenant_id().to_string(), e.action.clone()))
    }

    /// Look up the route for a request arriving on `connector`
    pub fn resolve_request<B>(
        &self,
        connector: &str,
        req: &Request<B>,
        is_tls: bool,
    ) -> Option<(String, RouteAction)> {
        let scheme = effective_scheme(req, is_tls);
        let host = effective_host(req);
        self.resolve(
            connector,
            &scheme,
            &host,
            req.uri().path(),
            req.method().as_str(),
        )
    }

    pub fn tenant(&self, id: &str) -> Option<TenantConfig> {
        self.state.read().tenants.get(id).map(|r| r.config.clone())
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().tenants.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn route_count(&self) -> usize {
        self.state.read().catalog.len()
    }

    /// Current catalog snapshot; later registrations do not affect it
    pub fn catalog(&self) -> Arc<RouteCatalog> {
        Arc::clone(&self.state.read().catalog)
    }
}

fn check_slots(config: &TenantConfig, slots: &BTreeMap<String, Method>) -> Result<()> {
    let declared: BTreeSet<&String> = slots.keys().collect();
    let configured: BTreeSet<&String> = config.server_endpoints.keys().collect();
    if declared == configured {
        return Ok(());
    }
    Err(GatewayError::SlotMismatch {
        missing: declared.difference(&configured).map(|s| s.to_string()).collect(),
        undeclared: configured.difference(&declared).map(|s| s.to_string()).collect(),
    })
}

fn build_routes(
    id: &str,
    config: &TenantConfig,
    slots: &BTreeMap<String, Method>,
) -> Result<Vec<StagedRoute>> {
    let mut routes = Vec::new();

    for (slot, endpoint) in &config.server_endpoints {
        let url = parse_rule_url(&endpoint.url).map_err(GatewayError::Validation)?;
        let method = slots
            .get(slot)
            .ok_or_else(|| GatewayError::validation(format!("undeclared slot '{}'", slot)))?;
        routes.push(StagedRoute {
            url: endpoint.url.clone(),
            entry: RouteEntry::new(
                RouteKey::from_url(&endpoint.connector, &url, method.as_str()),
                RouteAction::ServerEndpoint {
                    tenant_id: id.to_string(),
                    slot: slot.clone(),
                },
            ),
        });
    }

    for rule in &config.reverse_proxy {
        let url = parse_rule_url(&rule.url).map_err(GatewayError::Validation)?;
        let target = parse_rule_url(&rule.target_url).map_err(GatewayError::Validation)?;
        let strip_prefix = strip_prefix_for(url.path());
        for method in &rule.methods {
            routes.push(StagedRoute {
                url: rule.url.clone(),
                entry: RouteEntry::new(
                    RouteKey::from_url(&rule.connector, &url, method),
                    RouteAction::ReverseProxy {
                        tenant_id: id.to_string(),
                        strip_prefix: strip_prefix.clone(),
                        target: target.clone(),
                    },
                ),
            });
        }
    }

    for rule in &config.file_server {
        let url = parse_rule_url(&rule.url).map_err(GatewayError::Validation)?;
        routes.push(StagedRoute {
            url: rule.url.clone(),
            entry: RouteEntry::new(
                RouteKey::from_url(&rule.connector, &url, Method::GET.as_str()),
                RouteAction::FileServer {
                    tenant_id: id.to_string(),
                    strip_prefix: strip_prefix_for(url.path()),
                    root_dir: rule.root_dir.clone(),
                    dir_listing: rule.dir_listing,
                },
            ),
        });
    }

    Ok(routes)
}

/// Insert staged routes into a working copy; the copy is discarded on error
fn stage_routes(catalog: &mut RouteCatalog, id: &str, routes: Vec<StagedRoute>) -> Result<usize> {
    let count = routes.len();
    for StagedRoute { url, entry } in routes {
        debug!(tenant = id, route = %entry.key, "Staging route");
        catalog.insert(entry).map_err(|conflict| {
            GatewayError::Conflict(format!(
                "tenant '{}' url '{}': {} (owned by tenant '{}')",
                id,
                url,
                conflict,
                conflict.existing.action.tenant_id()
            ))
        })?;
    }
    Ok(count)
}

fn first_header_value<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `X-Forwarded-Proto` if present, else the connection's own scheme
pub fn effective_scheme<B>(req: &Request<B>, is_tls: bool) -> String {
    match first_header_value(req, X_FORWARDED_PROTO) {
        Some(proto) => proto.to_ascii_lowercase(),
        None if is_tls => "https".to_string(),
        None => "http".to_string(),
    }
}

/// `X-Forwarded-Host`, then `Host`, then the request URI authority, lowercased
pub fn effective_host<B>(req: &Request<B>) -> String {
    first_header_value(req, X_FORWARDED_HOST)
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        })
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileServerConfig, ReverseProxyConfig, ServerEndpointConfig, X509Config};
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    fn registry() -> TenantRegistry {
        TenantRegistry::new(Arc::new(CertificateResolver::new()))
    }

    fn live(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn greet_slots() -> BTreeMap<String, Method> {
        BTreeMap::from([("greet".to_string(), Method::GET)])
    }

    fn greet_tenant(url: &str) -> TenantConfig {
        let mut config = TenantConfig::default();
        config.server_endpoints.insert(
            "greet".to_string(),
            ServerEndpointConfig {
                connector: "c1".to_string(),
                url: url.to_string(),
            },
        );
        config
    }

    fn proxy_rule(url: &str) -> ReverseProxyConfig {
        ReverseProxyConfig {
            url: url.to_string(),
            connector: "c1".to_string(),
            methods: vec!["GET".to_string()],
            target_url: "http://127.0.0.1:9000/".to_string(),
        }
    }

    fn x509(common_name: &str) -> X509Config {
        let mut params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        X509Config {
            cert: cert.pem(),
            key: key.serialize_pem(),
        }
    }

    #[test]
    fn test_strip_prefix_for() {
        assert_eq!(strip_prefix_for("/static/*"), "/static/");
        assert_eq!(strip_prefix_for("/api"), "/api");
        assert_eq!(strip_prefix_for("/*"), "/");
        assert_eq!(strip_prefix_for("/"), "/");
    }

    #[test]
    fn test_register_and_resolve_server_endpoint() {
        let registry = registry();
        registry
            .register_tenant("acme", greet_tenant("http://example.test/hello"), &greet_slots(), &live(&["c1"]))
            .unwrap();

        let (tenant, action) = registry
            .resolve("c1", "http", "Example.Test", "/hello", "GET")
            .unwrap();
        assert_eq!(tenant, "acme");
        assert_eq!(
            action,
            RouteAction::ServerEndpoint {
                tenant_id: "acme".to_string(),
                slot: "greet".to_string()
            }
        );
        assert!(registry.resolve("c1", "http", "example.test", "/hello", "POST").is_none());
    }

    #[test]
    fn test_empty_and_duplicate_ids_rejected() {
        let registry = registry();
        let config = greet_tenant("http://example.test/hello");
        let err = registry
            .register_tenant("", config.clone(), &greet_slots(), &live(&["c1"]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        registry
            .register_tenant("acme", config.clone(), &greet_slots(), &live(&["c1"]))
            .unwrap();
        let err = registry
            .register_tenant("acme", greet_tenant("http://other.test/hello"), &greet_slots(), &live(&["c1"]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert_eq!(registry.route_count(), 1);
    }

    #[test]
    fn test_unknown_connector_rejected() {
        let registry = registry();
        let err = registry
            .register_tenant("acme", greet_tenant("http://example.test/hello"), &greet_slots(), &live(&["c2"]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(ref m) if m.contains("unknown connector 'c1'")));
    }

    #[test]
    fn test_slot_mismatch() {
        let registry = registry();
        let slots = BTreeMap::from([
            ("greet".to_string(), Method::GET),
            ("farewell".to_string(), Method::POST),
        ]);
        let mut config = greet_tenant("http://example.test/hello");
        config.server_endpoints.insert(
            "extra".to_string(),
            ServerEndpointConfig {
                connector: "c1".to_string(),
                url: "http://example.test/extra".to_string(),
            },
        );

        let err = registry
            .register_tenant("acme", config, &slots, &live(&["c1"]))
            .unwrap_err();
        match err {
            GatewayError::SlotMismatch { missing, undeclared } => {
                assert_eq!(missing, vec!["farewell"]);
                assert_eq!(undeclared, vec!["extra"]);
            }
            other => panic!("expected SlotMismatch, got {other:?}"),
        }
        assert_eq!(registry.route_count(), 0);
    }

    #[test]
    fn test_conflicting_tenant_commits_nothing() {
        let registry = registry();
        let mut first = TenantConfig::default();
        first.reverse_proxy.push(proxy_rule("http://shared.test/taken"));
        registry
            .register_tenant("first", first, &BTreeMap::new(), &live(&["c1"]))
            .unwrap();

        let mut second = TenantConfig::default();
        for url in [
            "http://shared.test/one",
            "http://shared.test/two",
            "http://shared.test/taken",
            "http://shared.test/four",
        ] {
            second.reverse_proxy.push(proxy_rule(url));
        }

        let err = registry
            .register_tenant("second", second, &BTreeMap::new(), &live(&["c1"]))
            .unwrap_err();
        match err {
            GatewayError::Conflict(message) => {
                assert!(message.contains("http://shared.test/taken"));
                assert!(message.contains("owned by tenant 'first'"));
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
        assert_eq!(registry.route_count(), 1);
        assert!(registry.resolve("c1", "http", "shared.test", "/one", "GET").is_none());
        assert!(registry.tenant("second").is_none());
    }

    #[test]
    fn test_reverse_proxy_entry_per_method() {
        let registry = registry();
        let mut config = TenantConfig::default();
        let mut rule = proxy_rule("http://api.test/v1/*");
        rule.methods = vec!["GET".to_string(), "POST".to_string()];
        config.reverse_proxy.push(rule);
        registry
            .register_tenant("acme", config, &BTreeMap::new(), &live(&["c1"]))
            .unwrap();

        assert_eq!(registry.route_count(), 2);
        let (_, action) = registry
            .resolve("c1", "http", "api.test", "/v1/users/1", "POST")
            .unwrap();
        match action {
            RouteAction::ReverseProxy { strip_prefix, target, .. } => {
                assert_eq!(strip_prefix, "/v1/");
                assert_eq!(target.as_str(), "http://127.0.0.1:9000/");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_remove_tenant_removes_every_kind() {
        let registry = registry();
        let root = tempfile::tempdir().unwrap();

        let mut config = greet_tenant("http://a.test/hello");
        config.reverse_proxy.push(proxy_rule("http://a.test/api/*"));
        config.file_server.push(FileServerConfig {
            url: "http://a.test/static/*".to_string(),
            connector: "c1".to_string(),
            root_dir: root.path().to_path_buf(),
            dir_listing: false,
        });
        registry
            .register_tenant("a", config, &greet_slots(), &live(&["c1"]))
            .unwrap();
        registry
            .register_tenant("b", greet_tenant("http://b.test/hello"), &greet_slots(), &live(&["c1"]))
            .unwrap();
        assert_eq!(registry.route_count(), 4);

        registry.remove_tenant("a").unwrap();
        assert_eq!(registry.route_count(), 1);
        assert!(registry.resolve("c1", "http", "a.test", "/hello", "GET").is_none());
        assert!(registry.resolve("c1", "http", "a.test", "/static/x", "GET").is_none());
        assert!(registry.resolve("c1", "http", "b.test", "/hello", "GET").is_some());

        assert!(matches!(
            registry.remove_tenant("a"),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn test_replace_tenant_swaps_routes() {
        let registry = registry();
        registry
            .register_tenant("acme", greet_tenant("http://example.test/old"), &greet_slots(), &live(&["c1"]))
            .unwrap();

        let before = registry.catalog();
        registry
            .replace_tenant("acme", greet_tenant("http://example.test/new"), &greet_slots(), &live(&["c1"]))
            .unwrap();

        assert!(registry.resolve("c1", "http", "example.test", "/old", "GET").is_none());
        assert!(registry.resolve("c1", "http", "example.test", "/new", "GET").is_some());
        // snapshots taken earlier are unaffected
        assert!(before.resolve("c1", "http", "example.test", "/old", "GET").is_some());

        let err = registry
            .replace_tenant("ghost", greet_tenant("http://example.test/x"), &greet_slots(), &live(&["c1"]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn test_tenant_certificate_lifecycle() {
        let registry = registry();
        let mut config = greet_tenant("https://secure.test/hello");
        config.x509 = Some(x509("secure.test"));
        registry
            .register_tenant("acme", config, &greet_slots(), &live(&["c1"]))
            .unwrap();
        assert!(registry.certificates().resolve("secure.test").is_some());

        let mut clash = greet_tenant("https://other.test/hello");
        clash.x509 = Some(x509("secure.test"));
        let err = registry
            .register_tenant("other", clash, &greet_slots(), &live(&["c1"]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateName(_)));
        assert_eq!(registry.route_count(), 1);

        registry.remove_tenant("acme").unwrap();
        assert!(registry.certificates().resolve("secure.test").is_none());
    }

    fn pem_pair(common_name: &str, sans: &[&str]) -> (String, String) {
        let mut params =
            CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_tenant_removal_keeps_certificate_that_took_over_its_name() {
        let registry = registry();
        let mut config = greet_tenant("https://secure.test/hello");
        config.x509 = Some(x509("secure.test"));
        registry
            .register_tenant("acme", config, &greet_slots(), &live(&["c1"]))
            .unwrap();

        registry.certificates().remove_certificate("secure.test").unwrap();
        let (chain, key) = pem_pair("other.test", &["other.test", "secure.test"]);
        registry.certificates().add_pem(&key, &chain).unwrap();

        registry.remove_tenant("acme").unwrap();
        assert!(registry.certificates().resolve("other.test").is_some());
        assert!(registry.certificates().resolve("secure.test").is_some());
    }

    #[test]
    fn test_tenant_replace_keeps_certificate_that_took_over_its_name() {
        let registry = registry();
        let mut config = greet_tenant("https://secure.test/hello");
        config.x509 = Some(x509("secure.test"));
        registry
            .register_tenant("acme", config, &greet_slots(), &live(&["c1"]))
            .unwrap();

        registry.certificates().remove_certificate("secure.test").unwrap();
        let (chain, key) = pem_pair("other.test", &["other.test", "secure.test"]);
        registry.certificates().add_pem(&key, &chain).unwrap();

        let mut replacement = greet_tenant("https://next.test/hello");
        replacement.x509 = Some(x509("next.test"));
        registry
            .replace_tenant("acme", replacement, &greet_slots(), &live(&["c1"]))
            .unwrap();
        assert!(registry.certificates().resolve("other.test").is_some());
        assert!(registry.certificates().resolve("secure.test").is_some());
        assert!(registry.certificates().resolve("next.test").is_some());

        registry.remove_tenant("acme").unwrap();
        assert!(registry.certificates().resolve("next.test").is_none());
        assert!(registry.certificates().resolve("other.test").is_some());
    }

    #[test]
    fn test_malformed_certificate_is_validation_error() {
        let registry = registry();
        let mut config = greet_tenant("https://secure.test/hello");
        config.x509 = Some(X509Config {
            cert: "not pem".to_string(),
            key: "not pem".to_string(),
        });
        let err = registry
            .register_tenant("acme", config, &greet_slots(), &live(&["c1"]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn test_effective_scheme_and_host() {
        let req = Request::builder()
            .uri("/x")
            .header("Host", "Plain.Test")
            .body(())
            .unwrap();
        assert_eq!(effective_scheme(&req, false), "http");
        assert_eq!(effective_scheme(&req, true), "https");
        assert_eq!(effective_host(&req), "plain.test");

        let req = Request::builder()
            .uri("/x")
            .header("Host", "internal.test")
            .header("X-Forwarded-Host", "public.test, proxy.test")
            .header("X-Forwarded-Proto", "HTTPS")
            .body(())
            .unwrap();
        assert_eq!(effective_scheme(&req, false), "https");
        assert_eq!(effective_host(&req), "public.test");

        let req = Request::builder()
            .uri("http://authority.test:8080/x")
            .body(())
            .unwrap();
        assert_eq!(effective_host(&req), "authority.test:8080");
    }

    #[test]
    fn test_resolve_request_ignores_query() {
        let registry = registry();
        registry
            .register_tenant("acme", greet_tenant("http://example.test/hello"), &greet_slots(), &live(&["c1"]))
            .unwrap();

        let req = Request::builder()
            .uri("/hello?name=world")
            .header("Host", "example.test")
            .body(())
            .unwrap();
        let (tenant, _) = registry.resolve_request("c1", &req, false).unwrap();
        assert_eq!(tenant, "acme");
        assert!(registry.resolve_request("c1", &req, true).is_none());
    }
}
