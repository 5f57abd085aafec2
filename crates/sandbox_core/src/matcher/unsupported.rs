use super::{Matcher, MatchingResult};
use sandbox_api::{Access, BehaviorStructure, UnitStructure, STEALTH_ANNOTATION};

/// Name prefixes of the sandbox's own units.
const SANDBOX_UNIT_PREFIXES: &[&str] = &[
    "sandbox_api::",
    "sandbox_spy::",
    "sandbox_core::",
    "sandbox_agent::",
];

/// Name fragments of units generated at runtime (closures, proxies).
const GENERATED_UNIT_MARKERS: &[&str] = &["{{closure}}", "$$Lambda", "$$Proxy", "$$Enhancer"];

/// Rejects units and behaviors the augmentation layer cannot safely rewrite.
///
/// Bootstrap units are only eligible when unsafe augmentation is enabled.
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedMatcher {
    enable_unsafe: bool,
}

impl UnsupportedMatcher {
    pub fn new(enable_unsafe: bool) -> Self {
        Self { enable_unsafe }
    }

    fn unit_rejection(&self, structure: &UnitStructure) -> Option<&'static str> {
        if SANDBOX_UNIT_PREFIXES
            .iter()
            .any(|prefix| structure.name.starts_with(prefix))
        {
            return Some("sandbox unit");
        }
        if GENERATED_UNIT_MARKERS
            .iter()
            .any(|marker| structure.name.contains(marker))
        {
            return Some("generated unit");
        }
        if structure.has_annotation(STEALTH_ANNOTATION) {
            return Some("stealth unit");
        }
        match &structure.loader {
            None if !self.enable_unsafe => Some("bootstrap unit while unsafe is disabled"),
            Some(loader) if loader.stealth => Some("unit from stealth loader"),
            _ => None,
        }
    }

    fn is_supported_behavior(behavior: &BehaviorStructure) -> bool {
        !behavior
            .access
            .intersects(Access::ABSTRACT | Access::NATIVE)
            && !behavior
                .annotations
                .iter()
                .any(|annotation| annotation == STEALTH_ANNOTATION)
    }
}

impl Matcher for UnsupportedMatcher {
    fn matching(&self, structure: &UnitStructure) -> MatchingResult {
        if let Some(reason) = self.unit_rejection(structure) {
            return MatchingResult::rejected(format!("{}: {reason}", structure.name));
        }
        MatchingResult::matched(
            structure
                .behaviors
                .iter()
                .filter(|behavior| Self::is_supported_behavior(behavior))
                .map(|behavior| behavior.sign_code(&structure.name)),
        )
    }
}
