use std::collections::HashSet;

use thiserror::Error;

use crate::registry::CapabilityRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unresolved dependency: {0}")]
    UnresolvedDependency(String),
    #[error("circular dependency involving {0}")]
    CircularDependency(String),
}

/// Compute the dependency-ordered load plan for one capability.
///
/// Depth-first post-order over `dependencies`, substituting a provider
/// id when a dependency name is not itself registered but is claimed in
/// some manifest's `provides`. The returned plan lists every capability
/// after all of its transitive dependencies, each at most once, ending
/// with `id` itself.
pub fn resolve(registry: &CapabilityRegistry, id: &str) -> Result<Vec<String>, ResolveError> {
    let mut plan = Vec::new();
    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();
    visit(registry, id, &mut visiting, &mut visited, &mut plan)?;
    Ok(plan)
}

/// Concatenate per-id plans into a single topologically valid order,
/// de-duplicating while preserving first occurrence.
pub fn resolve_all<I, S>(registry: &CapabilityRegistry, ids: I) -> Result<Vec<String>, ResolveError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut plan = Vec::new();
    let mut seen = HashSet::new();
    for id in ids {
        for step in resolve(registry, id.as_ref())? {
            if seen.insert(step.clone()) {
                plan.push(step);
            }
        }
    }
    Ok(plan)
}

fn visit(
    registry: &CapabilityRegistry,
    name: &str,
    visiting: &mut HashSet<String>,
    visited: &mut HashSet<String>,
    plan: &mut Vec<String>,
) -> Result<(), ResolveError> {
    let id = registry
        .find_provider(name)
        .ok_or_else(|| ResolveError::UnresolvedDependency(name.to_string()))?;

    if visited.contains(&id) {
        return Ok(());
    }
    if !visiting.insert(id.clone()) {
        return Err(ResolveError::CircularDependency(id));
    }

    let manifest = registry
        .get(&id)
        .ok_or_else(|| ResolveError::UnresolvedDependency(id.clone()))?;
    for dependency in &manifest.dependencies {
        visit(registry, dependency, visiting, visited, plan)?;
    }

    visiting.remove(&id);
    visited.insert(id.clone());
    plan.push(id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::build_manifest;
    use crate::manifest::CapabilityKind;

    fn register(registry: &CapabilityRegistry, id: &str, deps: &[&str], provides: &[&str]) {
        registry.register(build_manifest(
            id,
            id,
            CapabilityKind::Plugin,
            &format!("unit = \"{id}\""),
            deps.iter().map(|s| s.to_string()).collect(),
            provides.iter().map(|s| s.to_string()).collect(),
            vec![],
            "",
        ));
    }

    #[test]
    fn plan_is_postorder() {
        let registry = CapabilityRegistry::new();
        register(&registry, "a", &["b", "c"], &[]);
        register(&registry, "b", &["d"], &[]);
        register(&registry, "c", &["d"], &[]);
        register(&registry, "d", &[], &[]);

        let plan = resolve(&registry, "a").unwrap();
        assert_eq!(plan, vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn every_dependency_precedes_its_dependent() {
        let registry = CapabilityRegistry::new();
        register(&registry, "a", &["b"], &[]);
        register(&registry, "b", &["c"], &[]);
        register(&registry, "c", &[], &[]);

        let plan = resolve(&registry, "a").unwrap();
        let pos = |id: &str| plan.iter().position(|p| p == id).unwrap();
        assert!(pos("c") < pos("b"));
        assert!(pos("b") < pos("a"));
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn abstract_names_substitute_providers() {
        let registry = CapabilityRegistry::new();
        register(&registry, "app", &["sandbox"], &[]);
        register(&registry, "plugin.sandbox", &[], &["sandbox"]);

        let plan = resolve(&registry, "app").unwrap();
        assert_eq!(plan, vec!["plugin.sandbox", "app"]);
    }

    #[test]
    fn missing_dependency_fails_by_name() {
        let registry = CapabilityRegistry::new();
        register(&registry, "a", &["ghost"], &[]);

        let err = resolve(&registry, "a").unwrap_err();
        assert_eq!(err, ResolveError::UnresolvedDependency("ghost".to_string()));
    }

    #[test]
    fn cycle_is_detected_with_no_partial_plan() {
        let registry = CapabilityRegistry::new();
        register(&registry, "a", &["b"], &[]);
        register(&registry, "b", &["a"], &[]);

        let err = resolve(&registry, "a").unwrap_err();
        assert!(matches!(err, ResolveError::CircularDependency(_)));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let registry = CapabilityRegistry::new();
        register(&registry, "a", &["a"], &[]);
        assert!(matches!(
            resolve(&registry, "a").unwrap_err(),
            ResolveError::CircularDependency(_)
        ));
    }

    #[test]
    fn diamond_appears_once() {
        let registry = CapabilityRegistry::new();
        register(&registry, "top", &["left", "right"], &[]);
        register(&registry, "left", &["base"], &[]);
        register(&registry, "right", &["base"], &[]);
        register(&registry, "base", &[], &[]);

        let plan = resolve(&registry, "top").unwrap();
        assert_eq!(plan.iter().filter(|p| *p == "base").count(), 1);
    }

    #[test]
    fn resolve_all_deduplicates_preserving_first_occurrence() {
        let registry = CapabilityRegistry::new();
        register(&registry, "a", &["shared"], &[]);
        register(&registry, "b", &["shared"], &[]);
        register(&registry, "shared", &[], &[]);

        let plan = resolve_all(&registry, ["a", "b"]).unwrap();
        assert_eq!(plan, vec!["shared", "a", "b"]);
    }
}
