//! Detection order validation.

use std::collections::{HashMap, HashSet};

use crate::config::BuilderConfig;
use crate::diagnostics::Diagnostics;
use crate::module::{ModuleKind, ModuleReference, OrderEntry};

/// Declared versions of each module, built once per configuration.
struct Declared<'a> {
    versions: HashMap<(ModuleKind, &'a str), Vec<Option<&'a str>>>,
}

impl<'a> Declared<'a> {
    fn new(modules: impl Iterator<Item = &'a ModuleReference>) -> Self {
        let mut versions: HashMap<_, Vec<_>> = HashMap::new();
        for module in modules {
            versions
                .entry((module.kind, module.id.as_str()))
                .or_default()
                .push(module.version.as_deref());
        }
        Self { versions }
    }

    fn get<'b>(&'b self, kind: ModuleKind, id: &'b str) -> Option<&'b [Option<&'a str>]> {
        self.versions.get(&(kind, id)).map(Vec::as_slice)
    }
}

/// Checks order groups against declared modules.
///
/// Pure: performs no I/O and never fails. Unmatched references are recorded
/// as errors; the caller decides whether to abort.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderValidator;

impl OrderValidator {
    /// Validate a configuration.
    #[must_use]
    pub fn validate(config: &BuilderConfig) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        let declared = Declared::new(config.modules());

        if is_empty(&config.order) {
            diagnostics.warn("builder configuration: empty 'order' definition");
        }
        if !config.extensions.is_empty() && is_empty(&config.order_extensions) {
            diagnostics.warn("builder configuration: empty 'order-extensions' definition");
        }

        check_order(&declared, ModuleKind::Buildpack, &config.order, &mut diagnostics);
        check_order(
            &declared,
            ModuleKind::Extension,
            &config.order_extensions,
            &mut diagnostics,
        );

        let mut seen = HashSet::new();
        for module in config.modules() {
            if !seen.insert((module.kind, module.id.as_str(), module.version.as_deref())) {
                diagnostics.warn_about(
                    module.id.as_str(),
                    format!("builder configuration: {module} is declared more than once"),
                );
            }
        }

        diagnostics
    }
}

fn is_empty(order: &[OrderEntry]) -> bool {
    order.iter().all(|entry| entry.group.is_empty())
}

fn check_order(
    declared: &Declared<'_>,
    kind: ModuleKind,
    order: &[OrderEntry],
    diagnostics: &mut Diagnostics,
) {
    for element in order.iter().flat_map(|entry| &entry.group) {
        let Some(versions) = declared.get(kind, &element.id) else {
            diagnostics.error(
                &element.id,
                format!(
                    "builder configuration: order references {kind} '{}' which is not declared",
                    element.id
                ),
            );
            continue;
        };

        let Some(wanted) = element.version.as_deref() else {
            continue;
        };
        // An unversioned declaration matches any requested version.
        let matched = versions.iter().any(|v| v.is_none_or(|v| v == wanted));
        if !matched {
            diagnostics.error(
                &element.id,
                format!(
                    "builder configuration: order references {kind} '{}@{wanted}' but only {} declared",
                    element.id,
                    versions
                        .iter()
                        .flatten()
                        .map(|v| format!("'{v}'"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            );
        }
    }
}
