//! URL canonicalization.
//!
//! The canonical form is the dedup key everywhere: lowercased scheme/host,
//! no fragment, no tracking parameters, no trailing slash except at the
//! root path. Raw URLs are retained on categories for debugging.

use url::Url;

/// Tracking query parameters stripped during canonicalization.
/// Pagination parameters are deliberately preserved.
fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_")
        || matches!(
            name,
            "gclid" | "fbclid" | "msclkid" | "mc_cid" | "mc_eid" | "ref" | "referrer"
        )
}

fn canonicalize(mut url: Url) -> Option<String> {
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()?;

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.set_query(None);
    if !kept.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
    }

    let path = url.path().to_string();
    if path != "/" && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        url.set_path(if trimmed.is_empty() { "/" } else { trimmed });
    }

    Some(url.to_string())
}

/// Canonicalize a raw link found on a page, resolving relative references
/// against `base`. Returns `None` for unparsable or non-http(s) input.
pub fn normalize_link(href: &str, base: &Url) -> Option<String> {
    let trimmed = href.trim();
    if trimmed.is_empty() {
        return None;
    }
    let resolved = base.join(trimmed).ok()?;
    canonicalize(resolved)
}

/// Canonicalize an already-absolute URL string.
pub fn normalize_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    canonicalize(parsed)
}

/// Host of a canonical URL, if any.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_string)
}

/// Registrable domain by label heuristic: the last two labels, or three
/// when the host uses a `co.uk`-style second-level suffix.
pub fn registrable_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host.to_ascii_lowercase();
    }
    let tld = labels[labels.len() - 1];
    let second = labels[labels.len() - 2];
    let take = if tld.len() == 2 && matches!(second, "co" | "com" | "org" | "net" | "ac" | "gov" | "edu") {
        3
    } else {
        2
    };
    labels[labels.len() - take..].join(".").to_ascii_lowercase()
}

/// Whether two URLs belong to the same site.
pub fn same_site(a: &str, b: &str) -> bool {
    match (host_of(a), host_of(b)) {
        (Some(ha), Some(hb)) => registrable_domain(&ha) == registrable_domain(&hb),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn base() -> Url {
        Url::parse("https://shop.example.com/home").unwrap()
    }

    #[test]
    fn resolves_relative_links() {
        assert_eq!(
            normalize_link("/c/shoes", &base()).unwrap(),
            "https://shop.example.com/c/shoes"
        );
        assert_eq!(
            normalize_link("shoes/boots", &base()).unwrap(),
            "https://shop.example.com/shoes/boots"
        );
    }

    #[test]
    fn lowercases_scheme_and_host() {
        assert_eq!(
            normalize_url("HTTPS://Shop.Example.COM/Shoes").unwrap(),
            "https://shop.example.com/Shoes"
        );
    }

    #[test]
    fn strips_fragment_and_trailing_slash() {
        assert_eq!(
            normalize_url("https://x.com/shoes/#top").unwrap(),
            "https://x.com/shoes"
        );
        // Root keeps its slash.
        assert_eq!(normalize_url("https://x.com/").unwrap(), "https://x.com/");
    }

    #[test]
    fn drops_tracking_params_keeps_pagination() {
        assert_eq!(
            normalize_url("https://x.com/c?utm_source=mail&page=2&gclid=abc&fbclid=z").unwrap(),
            "https://x.com/c?page=2"
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert_eq!(normalize_link("javascript:void(0)", &base()), None);
        assert_eq!(normalize_link("mailto:a@b.com", &base()), None);
        assert_eq!(normalize_link("", &base()), None);
    }

    #[test]
    fn registrable_domain_heuristic() {
        assert_eq!(registrable_domain("www.shop.example.com"), "example.com");
        assert_eq!(registrable_domain("www.harrods.co.uk"), "harrods.co.uk");
        assert_eq!(registrable_domain("example.com"), "example.com");
    }

    #[test]
    fn same_site_across_subdomains() {
        assert!(same_site(
            "https://www.example.com/a",
            "https://m.example.com/b"
        ));
        assert!(!same_site("https://example.com", "https://example.org"));
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(s in "\\PC{0,80}") {
            if let Some(once) = normalize_url(&s) {
                let twice = normalize_url(&once).expect("canonical form must reparse");
                prop_assert_eq!(once, twice);
            }
        }

        #[test]
        fn canonical_links_are_idempotent(path in "[a-z0-9/._-]{0,40}", query in "[a-z0-9=&_+]{0,30}") {
            let href = format!("/{}?{}", path, query);
            if let Some(once) = normalize_link(&href, &base()) {
                let twice = normalize_url(&once).expect("canonical form must reparse");
                prop_assert_eq!(once, twice);
            }
        }
    }
}
