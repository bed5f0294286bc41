//! Dependency resolution: runs upstream routes and exposes their results as
//! table aliases for the parent query.

use std::sync::Arc;
use std::time::Instant;

use datafusion::catalog::memory::MemTable;
use datafusion::catalog::TableProvider;
use route_store::{EntryKey, HitSource, InvariantTokens};
use tracing::debug;

use crate::binder::{CanonicalParameters, RawParams};
use crate::error::{ErrorKind, RouteError, Stage, StageFailure};
use crate::executor::{CallRecord, Invocation, RouteExecutor, RouteOutput};
use crate::provider::CachedPageTable;
use crate::route::{ArgSource, Dependency, DependencyMode, RouteDefinition};
use crate::value::Value;

/// Route ids currently being resolved, outermost first.
///
/// Threaded by value through every nested call so sibling dependencies
/// never observe each other's frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack(Vec<String>);

impl CallStack {
    pub fn root(route_id: impl Into<String>) -> Self {
        Self(vec![route_id.into()])
    }

    /// Nesting depth of the innermost frame; the root is depth 0.
    pub fn depth(&self) -> usize {
        self.0.len().saturating_sub(1)
    }

    pub fn frames(&self) -> &[String] {
        &self.0
    }

    /// Pushes `route_id`, or returns the cycle path if it is already in flight.
    pub fn enter(&self, route_id: &str) -> Result<Self, String> {
        if let Some(start) = self.0.iter().position(|frame| frame == route_id) {
            let mut cycle = self.0[start..].to_vec();
            cycle.push(route_id.to_string());
            return Err(cycle.join(" -> "));
        }
        let mut next = self.0.clone();
        next.push(route_id.to_string());
        Ok(Self(next))
    }
}

/// Table handles produced for one route's dependencies.
pub(crate) struct ResolvedDependencies {
    pub aliases: Vec<(String, Arc<dyn TableProvider>)>,
    pub call_sequence: Vec<CallRecord>,
}

/// Builds the raw parameters handed to a dependency route.
pub(crate) fn dependency_args(dependency: &Dependency, params: &CanonicalParameters) -> RawParams {
    let mut args = RawParams::new();
    for mapping in &dependency.args {
        let value = match &mapping.source {
            ArgSource::PassThrough => params.get(&mapping.param).map(Value::to_json),
            ArgSource::Rename(from) => params.get(from).map(Value::to_json),
            ArgSource::Literal(value) => Some(value.clone()),
        };
        if let Some(value) = value.filter(|value| !value.is_null()) {
            args.insert(mapping.param.clone(), value);
        }
    }
    args
}

impl RouteExecutor {
    /// Resolves every dependency of `route` in declaration order.
    pub(crate) async fn resolve_dependencies(
        &self,
        route: &RouteDefinition,
        params: &CanonicalParameters,
        call: &Invocation,
        started: Instant,
    ) -> Result<ResolvedDependencies, RouteError> {
        let fail = |failure: StageFailure| {
            RouteError::from_failure(
                failure,
                &route.id,
                Stage::ResolveDependencies,
                started.elapsed(),
                params.redacted_summary(),
            )
        };

        let mut resolved = ResolvedDependencies {
            aliases: Vec::with_capacity(route.dependencies.len()),
            call_sequence: Vec::new(),
        };
        for dependency in &route.dependencies {
            let target = self.registry.get(&dependency.target).ok_or_else(|| {
                fail(StageFailure::new(
                    ErrorKind::Configuration,
                    format!(
                        "dependency `{}` targets unknown route `{}`",
                        dependency.alias, dependency.target
                    ),
                ))
            })?;
            if dependency.mode == DependencyMode::MaterializedPath
                && route.cache.has_invariants()
                && target.cache.has_invariants()
            {
                return Err(fail(StageFailure::new(
                    ErrorKind::Configuration,
                    format!(
                        "route with invariant filters cannot read invariant-filtered route `{}` through materialized-path dependency `{}`",
                        target.id, dependency.alias
                    ),
                )));
            }
            let stack = call.stack.enter(&target.id).map_err(|cycle| {
                fail(StageFailure::new(
                    ErrorKind::Recursion,
                    format!("dependency cycle {cycle}"),
                ))
            })?;

            let child = call.nested(stack, dependency);
            let output = self
                .run_route(
                    Arc::clone(&target),
                    dependency_args(dependency, params),
                    None,
                    child,
                )
                .await?;
            let table = match dependency.mode {
                DependencyMode::Relation => relation_table(&output).map_err(fail)?,
                DependencyMode::MaterializedPath => self
                    .materialized_table(&target, &output, call)
                    .await
                    .map_err(fail)?,
            };
            debug!(
                route_id = %route.id,
                alias = %dependency.alias,
                target = %target.id,
                mode = dependency.mode.as_str(),
                rows = output.total_rows,
                cache_hit = output.cache_hit,
                "dependency resolved"
            );
            resolved.call_sequence.extend(output.call_sequence);
            resolved.aliases.push((dependency.alias.clone(), table));
        }
        Ok(resolved)
    }

    /// Exposes the target's exact page set, persisting one if the rows came from elsewhere.
    async fn materialized_table(
        &self,
        target: &RouteDefinition,
        output: &RouteOutput,
        call: &Invocation,
    ) -> Result<Arc<dyn TableProvider>, StageFailure> {
        let Some((entry, tokens)) = output.cache_entry.clone() else {
            return relation_table(output);
        };
        if !matches!(output.hit_source, Some(HitSource::Exact)) && output.persisted.is_none() {
            // Served by filtering a superset or combining shards: no page set matches exactly.
            self.persist(target, entry.clone(), tokens.clone(), output.rows.clone(), call)
                .await?;
        }
        match self.exact_page_set(entry, tokens).await? {
            Some(handle) => Ok(Arc::new(
                CachedPageTable::new(target.id.clone(), handle).with_fallback(output.rows.clone()),
            )),
            None => {
                debug!(
                    route_id = %target.id,
                    "no exact page set for materialized dependency; using in-memory rows"
                );
                relation_table(output)
            }
        }
    }

    async fn exact_page_set(
        &self,
        entry: EntryKey,
        tokens: InvariantTokens,
    ) -> Result<Option<route_store::PageSetHandle>, StageFailure> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.page_set(&entry, &tokens))
            .await
            .map_err(|err| {
                StageFailure::new(ErrorKind::Resource, "cache page set lookup did not complete")
                    .with_detail(err.to_string())
            })?
            .map_err(|err| StageFailure::store("locate dependency pages", &err))
    }
}

fn relation_table(output: &RouteOutput) -> Result<Arc<dyn TableProvider>, StageFailure> {
    let table = MemTable::try_new(Arc::clone(&output.schema), vec![vec![output.rows.clone()]])
        .map_err(|err| {
            StageFailure::new(ErrorKind::Engine, "register dependency rows")
                .with_detail(err.to_string())
        })?;
    Ok(Arc::new(table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_stack_reports_cycle_path() {
        let stack = CallStack::root("a").enter("b").expect("b");
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.enter("a").expect_err("cycle"), "a -> b -> a");
        assert_eq!(stack.enter("b").expect_err("self"), "b -> b");
        // Siblings do not see each other.
        let left = stack.enter("c").expect("c");
        assert_eq!(left.frames().len(), 3);
        assert!(stack.enter("c").is_ok());
    }

    #[test]
    fn arguments_map_by_pass_rename_and_literal() {
        let mut params = CanonicalParameters::default();
        params.declared.insert("day".into(), Value::Int(3));
        params.declared.insert("region".into(), Value::String("eu".into()));
        params.declared.insert("unused".into(), Value::Null);
        let dependency = Dependency::relation("up", "base")
            .pass("day")
            .rename("area", "region")
            .literal("mode", json!("fast"))
            .pass("unused");
        let args = dependency_args(&dependency, &params);
        assert_eq!(args.get("day"), Some(&json!(3)));
        assert_eq!(args.get("area"), Some(&json!("eu")));
        assert_eq!(args.get("mode"), Some(&json!("fast")));
        assert!(!args.contains_key("unused"));
    }
}
