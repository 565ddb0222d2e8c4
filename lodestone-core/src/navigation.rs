//! URL construction and canonicalization.
//!
//! Resource identity is keyed on the fully resolved URL with query
//! parameters in canonical alphabetical order, so every navigation helper
//! funnels through [`canonical`].

use url::Url;

/// Canonical form of a URL: query pairs sorted by key, then value, and
/// re-serialized consistently. Two call paths that describe the same
/// logical resource produce byte-identical URLs.
pub fn canonical(mut url: Url) -> Url {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    set_sorted_query(&mut url, pairs);
    url
}

fn set_sorted_query(url: &mut Url, mut pairs: Vec<(String, String)>) {
    if pairs.is_empty() {
        url.set_query(None);
        return;
    }
    pairs.sort();
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (k, v) in &pairs {
        serializer.append_pair(k, v);
    }
    let query = serializer.finish();
    url.set_query(Some(&query));
}

/// Append one path segment, preserving the query.
pub fn child(url: &Url, segment: &str) -> Url {
    let mut out = url.clone();
    if let Ok(mut segments) = out.path_segments_mut() {
        segments.pop_if_empty().push(segment);
    }
    canonical(out)
}

/// Resolve `href` as a relative reference against `url` (RFC 3986: supports
/// `..`, absolute paths, and scheme changes).
pub fn relative(url: &Url, href: &str) -> Result<Url, url::ParseError> {
    url.join(href).map(canonical)
}

/// Set or remove one query parameter, keeping canonical ordering.
///
/// `None` removes the parameter entirely.
pub fn with_param(url: &Url, key: &str, value: Option<&str>) -> Url {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if let Some(value) = value {
        pairs.push((key.to_owned(), value.to_owned()));
    }
    let mut out = url.clone();
    set_sorted_query(&mut out, pairs);
    out
}

/// Append a path (possibly several segments, optionally with a query) to a
/// base URL.
///
/// This is plain segment concatenation, not RFC reference resolution:
/// `append_path("https://x/api", "/users")` is `https://x/api/users`.
pub fn append_path(base: &Url, path: &str) -> Url {
    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    let mut out = base.clone();
    if let Ok(mut segments) = out.path_segments_mut() {
        segments.pop_if_empty();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            segments.push(segment);
        }
    }
    if query.is_some() {
        out.set_query(query);
    }
    canonical(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn canonical_sorts_query_parameters() {
        assert_eq!(
            canonical(url("https://x/a?zeta=1&alpha=2")).as_str(),
            "https://x/a?alpha=2&zeta=1"
        );
        assert_eq!(canonical(url("https://x/a?")).as_str(), "https://x/a");
    }

    #[test]
    fn canonical_unifies_equivalent_encodings() {
        // "+", "%20" and a literal space all mean the same query value
        let a = canonical(url("https://x/a?q=b+c"));
        let b = canonical(url("https://x/a?q=b%20c"));
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn child_appends_one_segment() {
        assert_eq!(child(&url("https://x/api"), "users").as_str(), "https://x/api/users");
        assert_eq!(
            child(&url("https://x/api/"), "users").as_str(),
            "https://x/api/users"
        );
    }

    #[test]
    fn relative_resolves_like_an_href() {
        let base = url("https://x/api/users/3");
        assert_eq!(relative(&base, "4").unwrap().as_str(), "https://x/api/users/4");
        assert_eq!(
            relative(&base, "../groups").unwrap().as_str(),
            "https://x/api/groups"
        );
        assert_eq!(relative(&base, "/root").unwrap().as_str(), "https://x/root");
        assert_eq!(
            relative(&base, "ftp://other/x").unwrap().as_str(),
            "ftp://other/x"
        );
    }

    #[test]
    fn with_param_sets_removes_and_orders() {
        let base = url("https://x/a?m=1");
        let added = with_param(&base, "b", Some("2"));
        assert_eq!(added.as_str(), "https://x/a?b=2&m=1");
        let replaced = with_param(&added, "m", Some("9"));
        assert_eq!(replaced.as_str(), "https://x/a?b=2&m=9");
        let removed = with_param(&replaced, "b", None);
        assert_eq!(removed.as_str(), "https://x/a?m=9");
        let empty = with_param(&url("https://x/a?only=1"), "only", None);
        assert_eq!(empty.as_str(), "https://x/a");
    }

    #[test]
    fn param_order_is_stable_across_call_paths() {
        let one = with_param(&with_param(&url("https://x/a"), "b", Some("2")), "a", Some("1"));
        let two = with_param(&with_param(&url("https://x/a"), "a", Some("1")), "b", Some("2"));
        assert_eq!(one.as_str(), two.as_str());
    }

    #[test]
    fn append_path_concatenates_segments() {
        assert_eq!(
            append_path(&url("https://x/api"), "/users/3/").as_str(),
            "https://x/api/users/3"
        );
        assert_eq!(
            append_path(&url("https://x/api/"), "users").as_str(),
            "https://x/api/users"
        );
    }

    #[test]
    fn append_path_keeps_queries_canonical() {
        assert_eq!(
            append_path(&url("https://x/api"), "/items?b=2&a=1").as_str(),
            "https://x/api/items?a=1&b=2"
        );
    }
}
