//! Ordered route catalog
//!
//! Routes are kept in a single sorted vector. Two comparators exist:
//!
//! - pattern against pattern ([`compare_keys`]): `{name}` segments and a trailing `*`
//!   on either side act as wildcards. Two stored routes comparing equal overlap, so
//!   the second one is rejected.
//! - request against pattern ([`compare_query`]): the request path is always literal,
//!   only the stored route's wildcards apply. Equal means the route matches.
//!
//! Storage uses a strict total order (literal segments sort before `{name}`, which
//! sorts before a trailing `*`) so binary search stays valid with wildcards present.
//! Binary search finds the connector/scheme/host band and exact literal hits in
//! O(log n). A request that only a `{name}` or `*` route matches costs a linear
//! scan over the wildcard routes of its band, and so does the conflict check on
//! insert: the pattern comparator is not transitive, so it cannot drive a search.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

/// Final path segment matching one or more remaining request segments
pub const CATCH_ALL_SEGMENT: &str = "*";

/// Split a URL path into decoded segments.
///
/// Leading slashes are dropped; the empty path and `/` both produce no segments.
/// A trailing slash yields a trailing empty segment, so `/a/` and `/a` differ.
pub fn split_path(path: &str) -> Vec<String> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('/').map(decode_segment).collect()
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// `{name}` segment matching any single request segment
pub fn is_param_segment(segment: &str) -> bool {
    segment.len() >= 2 && segment.starts_with('{') && segment.ends_with('}')
}

/// Which wildcard rules apply to the left operand of [`compare_paths`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    /// Both sides are stored patterns
    Patterns,
    /// Left side is a live request path, always literal
    Request,
}

/// Segment-wise path comparison shared by conflict detection and resolution.
pub fn compare_paths<L, R>(left: &[L], right: &[R], mode: PathMode) -> Ordering
where
    L: AsRef<str>,
    R: AsRef<str>,
{
    let left_is_pattern = mode == PathMode::Patterns;
    let common = left.len().min(right.len());

    for index in 0..common {
        let l = left[index].as_ref();
        let r = right[index].as_ref();

        if left_is_pattern && index + 1 == left.len() && l == CATCH_ALL_SEGMENT {
            return Ordering::Equal;
        }
        if index + 1 == right.len() && r == CATCH_ALL_SEGMENT {
            return Ordering::Equal;
        }
        if (left_is_pattern && is_param_segment(l)) || is_param_segment(r) {
            continue;
        }

        match l.cmp(r) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    left.len().cmp(&right.len())
}

/// Identifies one routing rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub connector: String,
    pub scheme: String,
    pub host: String,
    pub path: Vec<String>,
    pub method: String,
}

impl RouteKey {
    pub fn new(connector: &str, scheme: &str, host: &str, path: &str, method: &str) -> Self {
        Self {
            connector: connector.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            path: split_path(path),
            method: method.to_string(),
        }
    }

    /// Build a key from an absolute rule URL
    pub fn from_url(connector: &str, url: &Url, method: &str) -> Self {
        Self::new(connector, url.scheme(), &url_authority(url), url.path(), method)
    }

    /// Whether any segment is a `{name}` or trailing `*` wildcard
    pub fn has_wildcards(&self) -> bool {
        let last = self.path.len().saturating_sub(1);
        self.path
            .iter()
            .enumerate()
            .any(|(i, s)| is_param_segment(s) || (i == last && s == CATCH_ALL_SEGMENT))
    }

    pub fn path_string(&self) -> String {
        let mut out = String::new();
        for segment in &self.path {
            out.push('/');
            out.push_str(segment);
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    fn band(&self) -> (&str, &str, &str) {
        (&self.connector, &self.scheme, &self.host)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}://{}{}",
            self.connector,
            self.method,
            self.scheme,
            self.host,
            self.path_string()
        )
    }
}

/// Host plus explicit port, as it appears in a Host header
pub fn url_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// A live request reduced to the fields routing looks at.
///
/// Scheme and host are lowercased the same way [`RouteKey::new`] does.
#[derive(Debug, Clone)]
pub struct RouteQuery<'a> {
    pub connector: &'a str,
    pub scheme: String,
    pub host: String,
    pub segments: Vec<String>,
    pub method: &'a str,
}

impl<'a> RouteQuery<'a> {
    pub fn new(connector: &'a str, scheme: &str, host: &str, path: &str, method: &'a str) -> Self {
        Self {
            connector,
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            segments: split_path(path),
            method,
        }
    }
}

/// Pattern against pattern; `Equal` means the two routes overlap
pub fn compare_keys(a: &RouteKey, b: &RouteKey) -> Ordering {
    a.connector
        .cmp(&b.connector)
        .then_with(|| a.scheme.cmp(&b.scheme))
        .then_with(|| a.host.cmp(&b.host))
        .then_with(|| compare_paths(&a.path, &b.path, PathMode::Patterns))
        .then_with(|| a.method.cmp(&b.method))
}

/// Request against pattern; `Equal` means the route matches the request
pub fn compare_query(query: &RouteQuery<'_>, key: &RouteKey) -> Ordering {
    query
        .connector
        .cmp(key.connector.as_str())
        .then_with(|| query.scheme.as_str().cmp(key.scheme.as_str()))
        .then_with(|| query.host.as_str().cmp(key.host.as_str()))
        .then_with(|| compare_paths(&query.segments, &key.path, PathMode::Request))
        .then_with(|| query.method.cmp(key.method.as_str()))
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SegmentRank<'a> {
    Literal(&'a str),
    Param,
    CatchAll,
}

fn rank(segment: &str, is_last: bool) -> SegmentRank<'_> {
    if is_last && segment == CATCH_ALL_SEGMENT {
        SegmentRank::CatchAll
    } else if is_param_segment(segment) {
        SegmentRank::Param
    } else {
        SegmentRank::Literal(segment)
    }
}

fn ranked_paths_order<'a, 'b>(
    left: impl ExactSizeIterator<Item = SegmentRank<'a>>,
    right: impl ExactSizeIterator<Item = SegmentRank<'b>>,
) -> Ordering {
    let (left_len, right_len) = (left.len(), right.len());
    for (l, r) in left.zip(right) {
        let ordering = match (&l, &r) {
            (SegmentRank::Literal(a), SegmentRank::Literal(b)) => a.cmp(b),
            _ => l.discriminant().cmp(&r.discriminant()),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left_len.cmp(&right_len)
}

impl SegmentRank<'_> {
    fn discriminant(&self) -> u8 {
        match self {
            SegmentRank::Literal(_) => 0,
            SegmentRank::Param => 1,
            SegmentRank::CatchAll => 2,
        }
    }
}

fn ranks(path: &[String]) -> impl ExactSizeIterator<Item = SegmentRank<'_>> {
    let last = path.len().saturating_sub(1);
    path.iter().enumerate().map(move |(i, s)| rank(s, i == last))
}

/// Strict total order used to keep the catalog sorted
fn storage_order(a: &RouteKey, b: &RouteKey) -> Ordering {
    a.band()
        .cmp(&b.band())
        .then_with(|| ranked_paths_order(ranks(&a.path), ranks(&b.path)))
        .then_with(|| a.method.cmp(&b.method))
        .then_with(|| a.path.cmp(&b.path))
}

/// Storage order of a stored key against a request treated as an all-literal key
fn literal_search_order(stored: &RouteKey, segments: &[String], method: &str) -> Ordering {
    let wanted = segments.iter().map(|s| SegmentRank::Literal(s.as_str()));
    ranked_paths_order(ranks(&stored.path), wanted).then_with(|| stored.method.as_str().cmp(method))
}

/// What happens to a request matching a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// Invoke the handler declared for an endpoint slot
    ServerEndpoint { tenant_id: String, slot: String },
    /// Forward to an absolute upstream URL after stripping the matched prefix
    ReverseProxy {
        tenant_id: String,
        strip_prefix: String,
        target: Url,
    },
    /// Serve files below a root directory after stripping the matched prefix
    FileServer {
        tenant_id: String,
        strip_prefix: String,
        root_dir: PathBuf,
        dir_listing: bool,
    },
}

impl RouteAction {
    pub fn tenant_id(&self) -> &str {
        match self {
            RouteAction::ServerEndpoint { tenant_id, .. }
            | RouteAction::ReverseProxy { tenant_id, .. }
            | RouteAction::FileServer { tenant_id, .. } => tenant_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RouteAction::ServerEndpoint { .. } => "server_endpoint",
            RouteAction::ReverseProxy { .. } => "reverse_proxy",
            RouteAction::FileServer { .. } => "file_server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub key: RouteKey,
    pub action: RouteAction,
}

impl RouteEntry {
    pub fn new(key: RouteKey, action: RouteAction) -> Self {
        Self { key, action }
    }
}

/// Rejected insertion; the catalog is left unchanged
#[derive(Debug, Clone, Error)]
#[error("route {} conflicts with existing route {}", .rejected.key, .existing.key)]
pub struct RouteConflict {
    pub existing: RouteEntry,
    pub rejected: RouteEntry,
}

/// Sorted collection of routes with at most one match per request
#[derive(Debug, Clone, Default)]
pub struct RouteCatalog {
    entries: Vec<RouteEntry>,
}

impl RouteCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter()
    }

    /// Index range of entries sharing connector, scheme and host
    fn band(&self, connector: &str, scheme: &str, host: &str) -> Range<usize> {
        let target = (connector, scheme, host);
        let start = self.entries.partition_point(|e| e.key.band() < target);
        let len = self.entries[start..].partition_point(|e| e.key.band() == target);
        start..start + len
    }

    /// First stored route overlapping `key`
    pub fn find_conflict(&self, key: &RouteKey) -> Option<&RouteEntry> {
        let range = self.band(&key.connector, &key.scheme, &key.host);
        self.entries[range]
            .iter()
            .find(|e| compare_keys(key, &e.key) == Ordering::Equal)
    }

    pub fn insert(&mut self, entry: RouteEntry) -> Result<(), RouteConflict> {
        if let Some(existing) = self.find_conflict(&entry.key) {
            return Err(RouteConflict {
                existing: existing.clone(),
                rejected: entry,
            });
        }

        let position = self
            .entries
            .partition_point(|e| storage_order(&e.key, &entry.key) == Ordering::Less);
        self.entries.insert(position, entry);
        Ok(())
    }

    /// Remove every entry matching `predicate`, returning how many were removed
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&RouteEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|e| !predicate(e));
        before - self.entries.len()
    }

    pub fn resolve(
        &self,
        connector: &str,
        scheme: &str,
        host: &str,
        path: &str,
        method: &str,
    ) -> Option<&RouteEntry> {
        self.resolve_query(&RouteQuery::new(connector, scheme, host, path, method))
    }

    pub fn resolve_query(&self, query: &RouteQuery<'_>) -> Option<&RouteEntry> {
        let band = &self.entries[self.band(query.connector, &query.scheme, &query.host)];

        if let Ok(index) =
            band.binary_search_by(|e| literal_search_order(&e.key, &query.segments, query.method))
        {
            return Some(&band[index]);
        }

        // Overlaps are rejected on insert, so at most one wildcard route can match
        band.iter()
            .filter(|e| e.key.has_wildcards())
            .find(|e| compare_query(query, &e.key) == Ordering::Equal)
    }
}
