//! Property tests for route catalog ordering and resolution

use proptest::prelude::*;
use std::cmp::Ordering;
use tenantgate::catalog::{
    compare_keys, compare_query, split_path, RouteAction, RouteCatalog, RouteEntry, RouteKey,
    RouteQuery,
};

fn action(tag: usize) -> RouteAction {
    RouteAction::ServerEndpoint {
        tenant_id: format!("t{}", tag),
        slot: "slot".to_string(),
    }
}

fn path_of(segments: &[&str]) -> String {
    format!("/{}", segments.join("/"))
}

fn literal_segment() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["a", "b", "c"])
}

fn pattern_segment() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["a", "b", "c", "{id}", "{name}", "*"])
}

fn host() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["x.test", "y.test"])
}

fn method() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["GET", "POST"])
}

prop_compose! {
    fn literal_key()(
        host in host(),
        method in method(),
        segments in prop::collection::vec(literal_segment(), 0..4),
    ) -> RouteKey {
        RouteKey::new("c1", "http", host, &path_of(&segments), method)
    }
}

prop_compose! {
    fn pattern_key()(
        host in host(),
        method in method(),
        segments in prop::collection::vec(pattern_segment(), 0..4),
    ) -> RouteKey {
        RouteKey::new("c1", "http", host, &path_of(&segments), method)
    }
}

prop_compose! {
    fn request()(
        host in host(),
        method in method(),
        segments in prop::collection::vec(literal_segment(), 0..5),
    ) -> (&'static str, String, &'static str) {
        (host, path_of(&segments), method)
    }
}

/// Insert every key, ignoring rejected ones
fn build_catalog(keys: &[RouteKey]) -> RouteCatalog {
    let mut catalog = RouteCatalog::new();
    for (i, key) in keys.iter().enumerate() {
        let _ = catalog.insert(RouteEntry::new(key.clone(), action(i)));
    }
    catalog
}

fn brute_force<'a>(catalog: &'a RouteCatalog, query: &RouteQuery<'_>) -> Vec<&'a RouteEntry> {
    catalog
        .iter()
        .filter(|e| compare_query(query, &e.key) == Ordering::Equal)
        .collect()
}

proptest! {
    #[test]
    fn test_literal_order_is_antisymmetric(a in literal_key(), b in literal_key()) {
        prop_assert_eq!(compare_keys(&a, &b), compare_keys(&b, &a).reverse());
        prop_assert_eq!(compare_keys(&a, &b) == Ordering::Equal, a == b);
    }

    #[test]
    fn test_literal_order_is_transitive(
        a in literal_key(),
        b in literal_key(),
        c in literal_key(),
    ) {
        let mut keys = vec![a, b, c];
        keys.sort_by(compare_keys);
        prop_assert_ne!(compare_keys(&keys[0], &keys[1]), Ordering::Greater);
        prop_assert_ne!(compare_keys(&keys[1], &keys[2]), Ordering::Greater);
        prop_assert_ne!(compare_keys(&keys[0], &keys[2]), Ordering::Greater);
    }

    #[test]
    fn test_inserted_literal_routes_resolve_to_themselves(
        keys in prop::collection::vec(literal_key(), 0..20),
    ) {
        let catalog = build_catalog(&keys);

        for key in &keys {
            let entry = catalog
                .resolve("c1", "http", &key.host, &key.path_string(), &key.method)
                .expect("inserted route resolves");
            prop_assert_eq!(&entry.key, key);
        }
    }

    #[test]
    fn test_stored_routes_never_overlap(keys in prop::collection::vec(pattern_key(), 0..20)) {
        let catalog = build_catalog(&keys);
        let stored: Vec<&RouteEntry> = catalog.iter().collect();

        for (i, a) in stored.iter().enumerate() {
            for b in &stored[i + 1..] {
                prop_assert_ne!(compare_keys(&a.key, &b.key), Ordering::Equal);
            }
        }
    }

    #[test]
    fn test_rejected_insert_leaves_catalog_unchanged(
        keys in prop::collection::vec(pattern_key(), 1..20),
        extra in pattern_key(),
    ) {
        let mut catalog = build_catalog(&keys);
        let before: Vec<RouteEntry> = catalog.iter().cloned().collect();

        match catalog.insert(RouteEntry::new(extra.clone(), action(999))) {
            Ok(()) => prop_assert_eq!(catalog.len(), before.len() + 1),
            Err(conflict) => {
                prop_assert_eq!(compare_keys(&extra, &conflict.existing.key), Ordering::Equal);
                let after: Vec<RouteEntry> = catalog.iter().cloned().collect();
                prop_assert_eq!(after, before);
            }
        }
    }

    #[test]
    fn test_resolve_agrees_with_linear_scan(
        keys in prop::collection::vec(pattern_key(), 0..20),
        requests in prop::collection::vec(request(), 1..20),
    ) {
        let catalog = build_catalog(&keys);

        for (host, path, method) in &requests {
            let query = RouteQuery::new("c1", "http", host, path, method);
            let matches = brute_force(&catalog, &query);
            prop_assert!(matches.len() <= 1, "request {} {} matched {:?}", host, path, matches);
            prop_assert_eq!(catalog.resolve_query(&query), matches.first().copied());
        }
    }

    #[test]
    fn test_resolve_after_removal(
        keys in prop::collection::vec(pattern_key(), 0..20),
        requests in prop::collection::vec(request(), 1..20),
    ) {
        let mut catalog = build_catalog(&keys);
        catalog.remove_where(|e| e.key.method == "POST");

        prop_assert!(catalog.iter().all(|e| e.key.method == "GET"));
        for (host, path, method) in &requests {
            let query = RouteQuery::new("c1", "http", host, path, method);
            let matches = brute_force(&catalog, &query);
            prop_assert_eq!(catalog.resolve_query(&query), matches.first().copied());
        }
    }

    #[test]
    fn test_named_segment_matches_any_value(value in "[a-z0-9]{1,8}") {
        let mut catalog = RouteCatalog::new();
        catalog
            .insert(RouteEntry::new(
                RouteKey::new("c1", "http", "x.test", "/users/{id}/profile", "GET"),
                action(1),
            ))
            .unwrap();

        let path = format!("/users/{}/profile", value);
        prop_assert!(catalog.resolve("c1", "http", "x.test", &path, "GET").is_some());
        let longer = format!("/users/{}/profile/extra", value);
        prop_assert!(catalog.resolve("c1", "http", "x.test", &longer, "GET").is_none());
    }

    #[test]
    fn test_catch_all_matches_deeper_paths(
        tail in prop::collection::vec("[a-z]{1,5}", 1..4),
    ) {
        let mut catalog = RouteCatalog::new();
        catalog
            .insert(RouteEntry::new(
                RouteKey::new("c1", "http", "x.test", "/static/*", "GET"),
                action(1),
            ))
            .unwrap();

        let path = format!("/static/{}", tail.join("/"));
        prop_assert!(catalog.resolve("c1", "http", "x.test", &path, "GET").is_some());
        prop_assert!(catalog.resolve("c1", "http", "x.test", "/static", "GET").is_none());
        prop_assert!(catalog.resolve("c1", "http", "y.test", &path, "GET").is_none());
    }
}

/// Segments for both patterns and requests, including the awkward ones
const OVERLAP_ALPHABET: &[&str] = &["a", "b", "", "*", "{x}", "{y}"];

fn overlap_pattern() -> impl Strategy<Value = RouteKey> {
    prop::collection::vec(prop::sample::select(OVERLAP_ALPHABET.to_vec()), 0..4)
        .prop_map(|segments| RouteKey::new("c1", "http", "x.test", &path_of(&segments), "GET"))
}

/// Whether a literal request path is matched by a pattern, written out directly:
/// `{name}` takes any one segment, a final `*` takes one or more.
fn pattern_matches(pattern: &[String], request: &[String]) -> bool {
    let segment_matches = |p: &String, r: &String| {
        (p.len() >= 2 && p.starts_with('{') && p.ends_with('}')) || p == r
    };
    match pattern.split_last() {
        Some((last, head)) if last == "*" => {
            request.len() > head.len()
                && head.iter().zip(request).all(|(p, r)| segment_matches(p, r))
        }
        _ => {
            pattern.len() == request.len()
                && pattern.iter().zip(request).all(|(p, r)| segment_matches(p, r))
        }
    }
}

/// Every request path of up to four segments over the alphabet plus one outsider
fn all_requests() -> Vec<Vec<String>> {
    let alphabet: Vec<&str> = OVERLAP_ALPHABET.iter().copied().chain(["z"]).collect();
    let mut out = vec![Vec::new()];
    let mut frontier: Vec<Vec<&str>> = vec![Vec::new()];
    for _ in 0..4 {
        let mut next = Vec::new();
        for prefix in &frontier {
            for segment in &alphabet {
                let mut request = prefix.clone();
                request.push(*segment);
                // segments as routing sees them once the path is split again
                out.push(split_path(&path_of(&request)));
                next.push(request);
            }
        }
        frontier = next;
    }
    out.sort();
    out.dedup();
    out
}

fn some_request_matches_both(a: &RouteKey, b: &RouteKey, requests: &[Vec<String>]) -> bool {
    requests
        .iter()
        .any(|r| pattern_matches(&a.path, r) && pattern_matches(&b.path, r))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_conflict_means_a_request_matches_both(a in overlap_pattern(), b in overlap_pattern()) {
        let requests = all_requests();
        let mut catalog = RouteCatalog::new();
        catalog.insert(RouteEntry::new(a.clone(), action(1))).unwrap();

        let rejected = catalog.insert(RouteEntry::new(b.clone(), action(2))).is_err();
        prop_assert_eq!(
            rejected,
            some_request_matches_both(&a, &b, &requests),
            "{} then {}", a, b
        );
    }

    #[test]
    fn test_resolve_matches_direct_pattern_semantics(
        patterns in prop::collection::vec(overlap_pattern(), 0..12),
    ) {
        let catalog = build_catalog(&patterns);

        for request in all_requests() {
            let path = format!("/{}", request.join("/"));
            let expected: Vec<&RouteEntry> = catalog
                .iter()
                .filter(|e| pattern_matches(&e.key.path, &request))
                .collect();
            prop_assert!(expected.len() <= 1, "{} matched {:?}", path, expected);
            prop_assert_eq!(
                catalog.resolve("c1", "http", "x.test", &path, "GET"),
                expected.first().copied(),
                "{}", path
            );
        }
    }
}
