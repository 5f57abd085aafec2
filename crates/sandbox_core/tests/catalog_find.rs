use sandbox_api::{
    Access, BehaviorStructure, Filter, Instrumentation, IntrospectionError, LoadedUnit, LoaderRef,
    UnitRef, UnitStructure,
};
use sandbox_core::{LoadedUnitCatalog, Matcher, MatchingResult};
use std::io;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug)]
enum FakeUnit {
    App(&'static str),
    Bootstrap(&'static str),
    /// Its defining scope was disposed; describing it fails.
    Poisoned(&'static str),
}

impl LoadedUnit for FakeUnit {
    fn name(&self) -> &str {
        match self {
            Self::App(name) | Self::Bootstrap(name) | Self::Poisoned(name) => name,
        }
    }

    fn structure(&self) -> Result<UnitStructure, IntrospectionError> {
        let mut structure = UnitStructure::new(self.name());
        match self {
            Self::App(_) => {
                structure.loader = Some(LoaderRef {
                    id: 42,
                    name: "AppScope".to_string(),
                    stealth: false,
                });
            }
            Self::Bootstrap(_) => {}
            Self::Poisoned(name) => {
                return Err(IntrospectionError::new(*name, "dependent unit was unloaded"));
            }
        }
        structure.behaviors = vec![
            BehaviorStructure::new("handle", Access::PUBLIC),
            BehaviorStructure::new("native_hash", Access::PUBLIC | Access::NATIVE),
        ];
        Ok(structure)
    }
}

struct FakeRuntime {
    units: Vec<UnitRef>,
    frozen: &'static [&'static str],
}

impl Instrumentation for FakeRuntime {
    fn all_loaded_units(&self) -> Vec<UnitRef> {
        self.units.clone()
    }

    fn is_modifiable_unit(&self, unit: &dyn LoadedUnit) -> bool {
        !self.frozen.iter().any(|frozen| *frozen == unit.name())
    }

    fn append_to_bootstrap_search(&self, _archive: &Path) -> io::Result<()> {
        Ok(())
    }
}

struct ByPrefix(&'static str);

impl Matcher for ByPrefix {
    fn matching(&self, structure: &UnitStructure) -> MatchingResult {
        if !structure.name.starts_with(self.0) {
            return MatchingResult::rejected("prefix mismatch");
        }
        MatchingResult::matched(
            structure
                .behaviors
                .iter()
                .map(|behavior| behavior.sign_code(&structure.name)),
        )
    }
}

fn names(units: &[UnitRef]) -> Vec<&str> {
    units.iter().map(|unit| unit.name()).collect()
}

fn catalog(units: Vec<UnitRef>, enable_unsafe: bool) -> LoadedUnitCatalog {
    LoadedUnitCatalog::new(
        Arc::new(FakeRuntime {
            units,
            frozen: &["shop::Frozen"],
        }),
        enable_unsafe,
    )
}

#[test]
fn poisoned_unit_only_removes_itself() {
    let healthy = catalog(
        vec![
            Arc::new(FakeUnit::App("shop::Cart")),
            Arc::new(FakeUnit::App("shop::Order")),
        ],
        false,
    );
    let poisoned = catalog(
        vec![
            Arc::new(FakeUnit::App("shop::Cart")),
            Arc::new(FakeUnit::Poisoned("shop::Ghost")),
            Arc::new(FakeUnit::App("shop::Order")),
        ],
        false,
    );

    for filter_unsupported in [false, true] {
        let expected = healthy.find(&ByPrefix("shop::"), filter_unsupported);
        let found = poisoned.find(&ByPrefix("shop::"), filter_unsupported);
        assert_eq!(names(&found), names(&expected));
        assert_eq!(names(&found), vec!["shop::Cart", "shop::Order"]);
    }
}

#[test]
fn retransform_never_returns_unmodifiable_or_unsupported_units() {
    let catalog = catalog(
        vec![
            Arc::new(FakeUnit::App("shop::Frozen")),
            Arc::new(FakeUnit::App("shop::Cart")),
            Arc::new(FakeUnit::Bootstrap("shop::Intrinsic")),
            Arc::new(FakeUnit::App("sandbox_core::server::ProxyCoreServer")),
        ],
        false,
    );

    let found = catalog.find_for_retransform(&ByPrefix(""));
    assert_eq!(names(&found), vec!["shop::Cart"]);

    let unguarded = catalog.find(&ByPrefix(""), false);
    assert_eq!(unguarded.len(), 4);
}

#[test]
fn unsafe_mode_admits_bootstrap_units() {
    let catalog = catalog(vec![Arc::new(FakeUnit::Bootstrap("shop::Intrinsic"))], true);
    assert_eq!(catalog.find_for_retransform(&ByPrefix("shop::")).len(), 1);
}

struct HandleOnly;

impl Filter for HandleOnly {
    fn do_unit_filter(
        &self,
        _access: Access,
        unit_name: &str,
        _super_name: Option<&str>,
        _interfaces: &[String],
        _annotations: &[String],
    ) -> bool {
        unit_name.starts_with("shop::")
    }

    fn do_behavior_filter(
        &self,
        _access: Access,
        behavior_name: &str,
        _parameter_types: &[String],
        _exception_types: &[String],
        _annotations: &[String],
    ) -> bool {
        behavior_name == "handle"
    }
}

#[test]
fn find_by_filter_deduplicates_and_skips_bootstrap() {
    let cart: UnitRef = Arc::new(FakeUnit::App("shop::Cart"));
    let catalog = catalog(
        vec![
            cart.clone(),
            Arc::new(FakeUnit::Bootstrap("shop::Intrinsic")),
            Arc::new(FakeUnit::Poisoned("shop::Ghost")),
            cart,
            Arc::new(FakeUnit::App("shop::Frozen")),
        ],
        false,
    );

    let found = catalog.find_by_filter(&HandleOnly);
    assert_eq!(names(&found), vec!["shop::Cart", "shop::Frozen"]);
}
