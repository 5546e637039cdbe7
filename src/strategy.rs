//! Extraction strategies: the analyzer's output and the extractor's input.

use serde::{Deserialize, Serialize};

/// DOM navigation patterns the extractor knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationType {
    HoverMenu,
    Sidebar,
    Accordion,
    MegaMenu,
    Grid,
    Sitemap,
    GenericLinks,
}

impl NavigationType {
    /// All variants, in the order presented to the model.
    pub fn all() -> &'static [NavigationType] {
        &[
            Self::HoverMenu,
            Self::Sidebar,
            Self::Accordion,
            Self::MegaMenu,
            Self::Grid,
            Self::Sitemap,
            Self::GenericLinks,
        ]
    }

    /// Selector keys a strategy of this type must provide.
    pub fn required_selectors(&self) -> &'static [&'static str] {
        match self {
            Self::HoverMenu | Self::MegaMenu => {
                &["nav_container", "top_level_items", "category_link"]
            }
            Self::Sidebar | Self::Accordion => &["nav_container", "top_level_items"],
            Self::Grid => &["category_card", "category_link"],
            Self::Sitemap | Self::GenericLinks => &["category_link"],
        }
    }
}

impl std::fmt::Display for NavigationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HoverMenu => "hover_menu",
            Self::Sidebar => "sidebar",
            Self::Accordion => "accordion",
            Self::MegaMenu => "mega_menu",
            Self::Grid => "grid",
            Self::Sitemap => "sitemap",
            Self::GenericLinks => "generic_links",
        };
        write!(f, "{s}")
    }
}

/// Recognized selector slots. A missing slot means "not used".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selectors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nav_container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_level_items: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_level_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flyout_panel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory_items: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_more_button: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand_toggle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_card: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_next: Option<String>,
}

impl Selectors {
    /// Look up a slot by its wire name.
    pub fn get(&self, key: &str) -> Option<&str> {
        let slot = match key {
            "nav_container" => &self.nav_container,
            "top_level_items" => &self.top_level_items,
            "top_level_link" => &self.top_level_link,
            "flyout_panel" => &self.flyout_panel,
            "subcategory_items" => &self.subcategory_items,
            "subcategory_link" => &self.subcategory_link,
            "show_more_button" => &self.show_more_button,
            "expand_toggle" => &self.expand_toggle,
            "category_card" => &self.category_card,
            "category_name" => &self.category_name,
            "category_link" => &self.category_link,
            "pagination_next" => &self.pagination_next,
            _ => return None,
        };
        slot.as_deref()
    }

    /// All recognized wire names, for prompts and validation messages.
    pub fn recognized_keys() -> &'static [&'static str] {
        &[
            "nav_container",
            "top_level_items",
            "top_level_link",
            "flyout_panel",
            "subcategory_items",
            "subcategory_link",
            "show_more_button",
            "expand_toggle",
            "category_card",
            "category_name",
            "category_link",
            "pagination_next",
        ]
    }
}

/// Interaction verbs the extractor can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionAction {
    Hover,
    Click,
    Scroll,
    Wait,
    RevealTrigger,
}

fn default_step_timeout() -> u64 {
    10_000
}

/// One ordered step of a strategy's interaction script. `target` is either
/// a raw selector or the name of a selector slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionStep {
    pub action: InteractionAction,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
    #[serde(default = "default_step_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub optional: bool,
}

impl InteractionStep {
    pub fn new(action: InteractionAction, target: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
            wait_for: None,
            timeout_ms: default_step_timeout(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn waiting_for(mut self, selector: impl Into<String>) -> Self {
        self.wait_for = Some(selector.into());
        self
    }
}

fn default_confidence() -> f64 {
    0.5
}

/// An extraction plan for a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub navigation_type: NavigationType,
    #[serde(default)]
    pub selectors: Selectors,
    #[serde(default)]
    pub interactions: Vec<InteractionStep>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
}

/// Selector used by the last-resort strategy.
pub const GENERIC_LINKS_SELECTOR: &str = "nav a, aside a, header a";

impl Strategy {
    /// Last-resort strategy over common navigation containers.
    pub fn generic_links() -> Self {
        Self {
            navigation_type: NavigationType::GenericLinks,
            selectors: Selectors {
                category_link: Some(GENERIC_LINKS_SELECTOR.to_string()),
                ..Selectors::default()
            },
            interactions: Vec::new(),
            confidence: 0.2,
            notes: vec!["generic link scan over nav, aside and header".to_string()],
            url_pattern: None,
        }
    }

    /// Required selector keys missing for the declared navigation type.
    pub fn missing_required(&self) -> Vec<&'static str> {
        self.navigation_type
            .required_selectors()
            .iter()
            .copied()
            .filter(|key| self.selectors.get(key).is_none())
            .collect()
    }

    /// Resolve an interaction target: selector-slot names map through the
    /// selector table, anything else is taken as a raw selector.
    pub fn resolve_target<'a>(&'a self, target: &'a str) -> &'a str {
        self.selectors.get(target).unwrap_or(target)
    }

    /// Reduced variant for child pages: menu-wide hover scripts are
    /// replaced by a plain link scan over the subcategory selectors, since
    /// the global nav on a child page only re-yields already-seen links.
    pub fn reduce_for_child(&self) -> Strategy {
        match self.navigation_type {
            NavigationType::HoverMenu | NavigationType::MegaMenu => {
                let link = self
                    .selectors
                    .subcategory_link
                    .clone()
                    .or_else(|| self.selectors.category_link.clone())
                    .unwrap_or_else(|| GENERIC_LINKS_SELECTOR.to_string());
                Strategy {
                    navigation_type: NavigationType::GenericLinks,
                    selectors: Selectors {
                        category_link: Some(link),
                        ..Selectors::default()
                    },
                    interactions: Vec::new(),
                    confidence: self.confidence,
                    notes: vec!["reduced from a menu strategy for child pages".to_string()],
                    url_pattern: self.url_pattern.clone(),
                }
            }
            _ => self.clone(),
        }
    }

    /// Whether a URL matches the declared shape, when one is declared.
    pub fn matches_url_pattern(&self, url: &str) -> bool {
        match &self.url_pattern {
            Some(pattern) => glob::Pattern::new(pattern)
                .map(|p| p.matches(url))
                .unwrap_or(true),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn serde_round_trip_uses_wire_names() {
        let strategy = Strategy {
            navigation_type: NavigationType::HoverMenu,
            selectors: Selectors {
                nav_container: Some("nav.main".into()),
                top_level_items: Some("nav.main > ul > li".into()),
                category_link: Some("a".into()),
                flyout_panel: Some(".flyout".into()),
                ..Selectors::default()
            },
            interactions: vec![InteractionStep::new(InteractionAction::Hover, "top_level_items")
                .waiting_for(".flyout")],
            confidence: 0.9,
            notes: vec![],
            url_pattern: Some("https://x.com/c/*".into()),
        };

        let json = serde_json::to_value(&strategy).unwrap();
        assert_eq!(json["navigation_type"], "hover_menu");
        assert_eq!(json["selectors"]["flyout_panel"], ".flyout");
        assert_eq!(json["interactions"][0]["action"], "hover");

        let back: Strategy = serde_json::from_value(json).unwrap();
        assert_eq!(back, strategy);
    }

    #[test]
    fn missing_required_reports_gaps() {
        let strategy = Strategy {
            navigation_type: NavigationType::HoverMenu,
            selectors: Selectors {
                nav_container: Some("nav".into()),
                ..Selectors::default()
            },
            interactions: vec![],
            confidence: 0.5,
            notes: vec![],
            url_pattern: None,
        };
        assert_eq!(
            strategy.missing_required(),
            vec!["top_level_items", "category_link"]
        );
        assert!(Strategy::generic_links().missing_required().is_empty());
    }

    #[test]
    fn target_resolution_prefers_selector_slots() {
        let strategy = Strategy {
            navigation_type: NavigationType::Sidebar,
            selectors: Selectors {
                nav_container: Some("aside.nav".into()),
                top_level_items: Some("aside.nav li".into()),
                ..Selectors::default()
            },
            interactions: vec![],
            confidence: 0.5,
            notes: vec![],
            url_pattern: None,
        };
        assert_eq!(strategy.resolve_target("nav_container"), "aside.nav");
        assert_eq!(strategy.resolve_target("button.menu"), "button.menu");
    }

    #[test]
    fn child_reduction_flattens_menu_strategies() {
        let mut strategy = Strategy::generic_links();
        strategy.navigation_type = NavigationType::HoverMenu;
        strategy.selectors.subcategory_link = Some(".flyout a".into());
        let reduced = strategy.reduce_for_child();
        assert_eq!(reduced.navigation_type, NavigationType::GenericLinks);
        assert_eq!(reduced.selectors.category_link.as_deref(), Some(".flyout a"));

        let grid = Strategy {
            navigation_type: NavigationType::Grid,
            ..Strategy::generic_links()
        };
        assert_eq!(grid.reduce_for_child().navigation_type, NavigationType::Grid);
    }

    #[test]
    fn url_pattern_glob() {
        let mut strategy = Strategy::generic_links();
        strategy.url_pattern = Some("https://x.com/c/*".into());
        assert!(strategy.matches_url_pattern("https://x.com/c/shoes"));
        assert!(!strategy.matches_url_pattern("https://x.com/p/123"));
        strategy.url_pattern = None;
        assert!(strategy.matches_url_pattern("anything"));
    }
}
