//! Reverse proxy request rewriting and forwarding

use crate::catalog::url_authority;
use crate::connector::ConnectionInfo;
use crate::error::{json_error_response, GatewayBody, GatewayErrorCode};
use crate::pool::UpstreamPool;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, Uri, Version};
use tracing::{debug, error};
use url::Url;
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers meaningful only for a single transport hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Drop the leading segments covered by `strip_prefix` from a request path.
///
/// Works segment by segment so `{name}` segments in the prefix strip whatever the
/// request had in that position.
pub fn strip_request_path(request_path: &str, strip_prefix: &str) -> String {
    let mut prefix: Vec<&str> = strip_prefix.trim_start_matches('/').split('/').collect();
    if prefix.last() == Some(&"") {
        prefix.pop();
    }

    let trimmed = request_path.trim_start_matches('/');
    let segments: Vec<&str> = if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    };

    match segments.get(prefix.len()..) {
        Some(rest) => format!("/{}", rest.join("/")),
        None => "/".to_string(),
    }
}

/// Join two paths with exactly one slash between them
pub fn join_paths(base: &str, rest: &str) -> String {
    match (base.ends_with('/'), rest.starts_with('/')) {
        (true, true) => format!("{}{}", base, &rest[1..]),
        (false, false) => format!("{}/{}", base, rest),
        _ => format!("{}{}", base, rest),
    }
}

/// Absolute upstream URI for a stripped request path and its query
pub fn upstream_uri(target: &Url, stripped_path: &str, request_query: Option<&str>) -> String {
    let path = join_paths(target.path(), stripped_path);
    let query = match (target.query().unwrap_or(""), request_query.unwrap_or("")) {
        ("", "") => String::new(),
        (t, "") => t.to_string(),
        ("", r) => r.to_string(),
        (t, r) => format!("{}&{}", t, r),
    };

    let mut uri = format!("{}://{}{}", target.scheme(), url_authority(target), path);
    if !query.is_empty() {
        uri.push('?');
        uri.push_str(&query);
    }
    uri
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Add the X-Forwarded-* and X-Request-ID headers
pub fn set_forwarding_headers(headers: &mut HeaderMap, conn: &ConnectionInfo) {
    let client_ip = conn.peer_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.trim().is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = headers.get(HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        let proto = if conn.is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    }

    if !headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
    }
}

/// Forward a request to `target` with `strip_prefix` removed from its path.
///
/// The original `Host` header is passed through unchanged.
pub async fn forward(
    pool: &UpstreamPool,
    req: Request<Incoming>,
    strip_prefix: &str,
    target: &Url,
    conn: &ConnectionInfo,
) -> Response<GatewayBody> {
    let (mut parts, body) = req.into_parts();

    let stripped = strip_request_path(parts.uri.path(), strip_prefix);
    let upstream = upstream_uri(target, &stripped, parts.uri.query());
    let uri: Uri = match upstream.parse() {
        Ok(uri) => uri,
        Err(e) => {
            debug!(upstream, error = %e, "Rewritten upstream URI is invalid");
            return json_error_response(
                GatewayErrorCode::BadGatewayRequest,
                "Request path cannot be forwarded upstream",
            );
        }
    };

    remove_hop_by_hop(&mut parts.headers);
    set_forwarding_headers(&mut parts.headers, conn);
    parts.uri = uri;
    parts.version = Version::HTTP_11;

    debug!(
        connector = %conn.connector,
        method = %parts.method,
        upstream = %parts.uri,
        "Forwarding request"
    );

    match pool.send(Request::from_parts(parts, body)).await {
        Ok(mut response) => {
            remove_hop_by_hop(response.headers_mut());
            response
        }
        Err(e) => {
            error!(connector = %conn.connector, upstream, error = %e, "Upstream request failed");
            json_error_response(
                GatewayErrorCode::UpstreamUnavailable,
                "Failed to connect to upstream",
            )
        }
    }
}
