//! Registry of compiled routes and static dependency graph checks.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ErrorKind, RouteError, Stage};
use crate::route::{DependencyMode, RouteDefinition};

/// Compiled routes keyed by id.
#[derive(Debug, Default, Clone)]
pub struct RouteRegistry {
    routes: BTreeMap<String, Arc<RouteDefinition>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a route after checking it in isolation.
    pub fn register(&mut self, route: RouteDefinition) -> Result<Arc<RouteDefinition>, RouteError> {
        route.validate()?;
        let route = Arc::new(route);
        self.routes.insert(route.id.clone(), Arc::clone(&route));
        Ok(route)
    }

    pub fn get(&self, route_id: &str) -> Option<Arc<RouteDefinition>> {
        self.routes.get(route_id).cloned()
    }

    pub fn route_ids(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Checks every registered route and the whole dependency graph.
    pub fn validate(&self) -> Result<(), RouteError> {
        for route in self.routes.values() {
            route.validate()?;
            self.check_graph(route)?;
        }
        Ok(())
    }

    /// Checks the dependency graph reachable from `root`.
    ///
    /// Reports unknown targets, unknown target parameters, invariant
    /// filters combined with materialized-path dependencies on
    /// invariant-filtered routes, and cycles (with the cycle path).
    pub fn check_graph(&self, root: &RouteDefinition) -> Result<(), RouteError> {
        let mut path = vec![root.id.clone()];
        self.visit(root, &mut path)
    }

    fn visit(&self, route: &RouteDefinition, path: &mut Vec<String>) -> Result<(), RouteError> {
        for dependency in &route.dependencies {
            let config_error = |message: String| {
                RouteError::static_check(ErrorKind::Configuration, &route.id, Stage::Validate, message)
            };
            let target = self.get(&dependency.target).ok_or_else(|| {
                config_error(format!(
                    "dependency `{}` targets unknown route `{}`",
                    dependency.alias, dependency.target
                ))
            })?;
            if let Some(arg) = dependency
                .args
                .iter()
                .find(|arg| target.param_spec(&arg.param).is_none())
            {
                return Err(config_error(format!(
                    "dependency `{}` passes `{}`, which route `{}` does not declare",
                    dependency.alias, arg.param, target.id
                )));
            }
            if dependency.mode == DependencyMode::MaterializedPath
                && route.cache.has_invariants()
                && target.cache.has_invariants()
            {
                return Err(config_error(format!(
                    "route with invariant filters cannot read invariant-filtered route `{}` through materialized-path dependency `{}`",
                    target.id, dependency.alias
                )));
            }
            if path.iter().any(|id| *id == target.id) {
                let cycle = path
                    .iter()
                    .skip_while(|id| **id != target.id)
                    .chain(std::iter::once(&target.id))
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" -> ");
                return Err(RouteError::static_check(
                    ErrorKind::Recursion,
                    &route.id,
                    Stage::Validate,
                    format!("dependency cycle {cycle}"),
                ));
            }
            path.push(target.id.clone());
            let visited = self.visit(&target, path);
            path.pop();
            visited?;
        }
        Ok(())
    }
}
