//! Per-category and whole-tree invariant checks, plus the navigation
//! noise filter.

use std::collections::{HashMap, HashSet};

use url::Url;

use crate::category::Category;
use crate::error::{Error, Result};

/// Utility-link tokens that are never product-group categories.
const NOISE_TOKENS: &[&str] = &[
    "login",
    "log in",
    "sign in",
    "sign up",
    "register",
    "account",
    "my account",
    "cart",
    "basket",
    "checkout",
    "stores",
    "store locator",
    "find a store",
    "rewards",
    "loyalty",
    "menu",
    "help",
    "support",
    "contact",
    "faq",
    "wishlist",
    "wish list",
    "track order",
    "order status",
    "gift card",
    "gift cards",
    "careers",
    "about us",
    "blog",
    "search",
];

/// Whether an anchor name is navigation noise rather than a category.
pub fn looks_like_noise(name: &str) -> bool {
    let lowered = name.trim().to_lowercase();
    if lowered.is_empty() {
        return true;
    }
    NOISE_TOKENS.iter().any(|t| lowered == *t)
}

/// Check a single category's field invariants.
pub fn validate_category(category: &Category) -> Result<()> {
    if category.name.trim().is_empty() {
        return Err(Error::Validation(format!(
            "category {} has an empty name",
            category.local_id
        )));
    }
    let parsed = Url::parse(&category.url)
        .map_err(|e| Error::Validation(format!("category '{}' has an invalid URL: {e}", category.name)))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(Error::Validation(format!(
            "category '{}' URL is missing scheme or host: {}",
            category.name, category.url
        )));
    }
    Ok(())
}

/// Check hierarchy invariants across a whole run's categories:
/// resolvable parents, acyclic parent chains, depth consistency, and
/// at most one owner per canonical URL.
pub fn validate_hierarchy(categories: &[Category]) -> Result<()> {
    let by_id: HashMap<u32, &Category> = categories.iter().map(|c| (c.local_id, c)).collect();

    for category in categories {
        if let Some(parent_id) = category.parent_local_id {
            let parent = by_id.get(&parent_id).ok_or_else(|| {
                Error::Validation(format!(
                    "category '{}' references missing parent {parent_id}",
                    category.name
                ))
            })?;
            if category.depth != parent.depth + 1 {
                return Err(Error::Validation(format!(
                    "category '{}' depth {} does not follow parent depth {}",
                    category.name, category.depth, parent.depth
                )));
            }
        } else if category.depth != 0 {
            return Err(Error::Validation(format!(
                "root category '{}' has non-zero depth {}",
                category.name, category.depth
            )));
        }

        // Parent-chain walk; any repeat of a visited id is a cycle.
        let mut walked = HashSet::new();
        let mut cursor = category.parent_local_id;
        while let Some(id) = cursor {
            if !walked.insert(id) || id == category.local_id {
                return Err(Error::Validation(format!(
                    "cycle detected in parent chain of '{}'",
                    category.name
                )));
            }
            cursor = by_id.get(&id).and_then(|p| p.parent_local_id);
        }
    }

    let mut seen: HashMap<&str, &Category> = HashMap::new();
    for category in categories {
        if let Some(first) = seen.get(category.url.as_str()) {
            // A link appearing in two menus is allowed once per run;
            // first-seen wins, so a second owner is an invariant break.
            if first.local_id != category.local_id {
                return Err(Error::Validation(format!(
                    "canonical URL {} owned by both {} and {}",
                    category.url, first.local_id, category.local_id
                )));
            }
        } else {
            seen.insert(category.url.as_str(), category);
        }
    }

    Ok(())
}
