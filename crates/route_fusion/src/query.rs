//! Query templating: wraps a route body with invariant filters and ordering,
//! and collects the bound parameter values the final SQL references.

use std::collections::BTreeSet;

use datafusion::common::ScalarValue;
use route_store::{InvariantTokens, SortKey};

use crate::binder::CanonicalParameters;
use crate::error::{ErrorKind, StageFailure};
use crate::route::RouteDefinition;

/// Prefix of generated invariant placeholders.
const INVARIANT_PLACEHOLDER_PREFIX: &str = "__inv_";

/// Final SQL and its bound values.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub sql: String,
    pub bindings: Vec<(String, ScalarValue)>,
}

/// Named `$placeholders` referenced outside string literals and quoted identifiers.
pub fn referenced_placeholders(sql: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut chars = sql.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        match ch {
            '\'' | '"' => {
                // Doubled quotes escape themselves, so skipping to the next quote works.
                for (_, inner) in chars.by_ref() {
                    if inner == ch {
                        break;
                    }
                }
            }
            '-' if chars.peek().is_some_and(|(_, next)| *next == '-') => {
                for (_, inner) in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '$' => {
                let mut name = String::new();
                while let Some((_, next)) = chars.peek() {
                    let valid = if name.is_empty() {
                        next.is_ascii_alphabetic() || *next == '_'
                    } else {
                        next.is_ascii_alphanumeric() || *next == '_'
                    };
                    if !valid {
                        break;
                    }
                    name.push(*next);
                    chars.next();
                }
                if !name.is_empty() {
                    names.insert(name);
                }
            }
            _ => {}
        }
    }
    names
}

/// Double-quotes an identifier for SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn order_clause(order_by: &[SortKey]) -> String {
    order_by
        .iter()
        .map(|key| {
            format!(
                "{} {} NULLS {}",
                quote_ident(&key.column),
                if key.descending { "DESC" } else { "ASC" },
                if key.nulls_first { "FIRST" } else { "LAST" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds the SQL executed for `route` with `params` restricted to `tokens`.
pub(crate) fn build_query(
    route: &RouteDefinition,
    params: &CanonicalParameters,
    tokens: &InvariantTokens,
) -> Result<QueryPlan, StageFailure> {
    let body = route.body.trim().trim_end_matches(';').trim_end();
    let mut invariant_bindings = Vec::new();
    let mut predicates = Vec::new();
    for (filter_idx, filter) in route.cache.invariant_filters.iter().enumerate() {
        let Some(values) = tokens.get(&filter.param) else {
            continue;
        };
        let column = format!("trim(CAST({} AS VARCHAR))", quote_ident(&filter.column));
        let column = if filter.case_insensitive {
            format!("lower({column})")
        } else {
            column
        };
        let mut placeholders = Vec::with_capacity(values.len());
        for (value_idx, value) in values.iter().enumerate() {
            let name = format!("{INVARIANT_PLACEHOLDER_PREFIX}{filter_idx}_{value_idx}");
            placeholders.push(format!("${name}"));
            invariant_bindings.push((name, ScalarValue::Utf8(Some(value.clone()))));
        }
        predicates.push(format!("{column} IN ({})", placeholders.join(", ")));
    }

    let mut sql = format!("SELECT * FROM ({body}) AS route_body");
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    if !route.cache.order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_clause(&route.cache.order_by));
    }

    let mut bindings = Vec::new();
    for name in referenced_placeholders(&sql) {
        if let Some(position) = invariant_bindings
            .iter()
            .position(|(candidate, _)| *candidate == name)
        {
            bindings.push(invariant_bindings.swap_remove(position));
            continue;
        }
        match params.get(&name) {
            Some(value) => bindings.push((name, value.to_scalar())),
            None => {
                return Err(StageFailure::new(
                    ErrorKind::Validation,
                    format!("query references parameter `${name}` that was not supplied"),
                ));
            }
        }
    }
    Ok(QueryPlan { sql, bindings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{CachePolicy, InvariantFilter, ParamSpec, ParamType};
    use crate::value::Value;

    #[test]
    fn placeholders_skip_literals_and_comments() {
        let names = referenced_placeholders(
            "SELECT '$nope', \"$col\" FROM t -- $comment\nWHERE a = $min AND b < $max_1 AND c = $1",
        );
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["max_1".to_string(), "min".to_string()]
        );
    }

    #[test]
    fn wraps_body_with_filters_and_order() {
        let route = RouteDefinition::new("r", "1", "SELECT * FROM sales WHERE amount > $min;")
            .param(ParamSpec::new("min", ParamType::Int))
            .cache(
                CachePolicy::enabled(vec![SortKey::asc("day"), SortKey::desc("id")])
                    .invariant(InvariantFilter::new("category", "category").case_insensitive()),
            );
        let mut params = CanonicalParameters::default();
        params.declared.insert("min".to_string(), Value::Int(5));
        params.passthrough.insert("unused".to_string(), Value::Int(1));
        let tokens = InvariantTokens::new().with("category", ["a", "b"]);

        let plan = build_query(&route, &params, &tokens).expect("plan");
        assert_eq!(
            plan.sql,
            "SELECT * FROM (SELECT * FROM sales WHERE amount > $min) AS route_body \
             WHERE lower(trim(CAST(\"category\" AS VARCHAR))) IN ($__inv_0_0, $__inv_0_1) \
             ORDER BY \"day\" ASC NULLS LAST, \"id\" DESC NULLS LAST"
        );
        let names = plan
            .bindings
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["__inv_0_0", "__inv_0_1", "min"]);
    }

    #[test]
    fn unsupplied_placeholder_is_a_validation_error() {
        let route = RouteDefinition::new("r", "1", "SELECT * FROM t WHERE a = $ghost");
        let err = build_query(&route, &CanonicalParameters::default(), &InvariantTokens::new())
            .expect_err("unknown placeholder");
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
