//! Prompt construction for page analysis.

use crate::strategy::{NavigationType, Selectors};

/// The analysis prompt: states the taxonomy goal, enumerates the allowed
/// navigation types and selector keys, and demands a JSON object in the
/// strategy shape. The screenshot rides along as an image attachment.
pub fn analysis_prompt(url: &str, pruned_dom: &str) -> String {
    let types = NavigationType::all()
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let keys = Selectors::recognized_keys().join(", ");

    format!(
        "You are analyzing the navigation structure of an e-commerce page.\n\
         Page URL: {url}\n\n\
         Goal: identify product-group navigation (not individual products, \
         not utility links such as login, cart or store locators).\n\n\
         Classify the navigation pattern as one of: {types}.\n\
         Report CSS selectors using only these keys (omit unused keys): {keys}.\n\
         If revealing the menu requires interaction, list the steps as \
         objects with fields action (hover|click|scroll|wait|reveal_trigger), \
         target (a selector or a selector key), wait_for, timeout_ms and \
         optional.\n\n\
         Respond with a single JSON object:\n\
         {{\"navigation_type\": ..., \"selectors\": {{...}}, \
         \"interactions\": [...], \"confidence\": 0.0-1.0, \
         \"notes\": [...], \"url_pattern\": null}}\n\
         Output JSON only, no prose.\n\n\
         A screenshot of the viewport is attached. Relevant DOM excerpt:\n\
         {pruned_dom}"
    )
}

/// Stricter follow-up naming the selector keys the first answer omitted.
pub fn reprompt_with_missing(original_prompt: &str, missing: &[&str]) -> String {
    format!(
        "{original_prompt}\n\n\
         Your previous answer was missing required selector keys: {}.\n\
         Answer again with every one of those keys present and non-empty, \
         or choose a different navigation_type whose requirements you can \
         meet. JSON only.",
        missing.join(", ")
    )
}
