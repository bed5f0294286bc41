//! Parameter binding: defaults, required checks, type coercion and guards.
//!
//! Binding is pure. Error messages name parameters and expected types but
//! never echo the offending value; the value only appears in the detail.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;

use crate::error::{ErrorKind, StageFailure};
use crate::route::{is_identifier, ParamSpec, ParamType, RouteDefinition};
use crate::value::{normalize_float, Value};

/// Raw request parameters as received from the request layer.
pub type RawParams = serde_json::Map<String, JsonValue>;

/// Default separator for list parameters supplied as a single string.
const DEFAULT_LIST_SEPARATOR: &str = ",";

/// Request parameters after binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalParameters {
    /// Declared parameters, each present (absent optional ones are `Null`).
    pub declared: BTreeMap<String, Value>,
    /// Undeclared parameters, inferred from their JSON shape.
    pub passthrough: BTreeMap<String, Value>,
}

impl CanonicalParameters {
    /// Looks a parameter up, declared first.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.declared
            .get(name)
            .or_else(|| self.passthrough.get(name))
    }

    /// `name=shape` pairs for error messages; values are never included.
    pub fn redacted_summary(&self) -> String {
        self.declared
            .iter()
            .chain(self.passthrough.iter())
            .map(|(name, value)| format!("{name}={}", value.shape()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Redacted summary of raw parameters for failures before binding finished.
pub fn redact_raw(raw: &RawParams) -> String {
    raw.iter()
        .map(|(name, value)| format!("{name}={}", Value::from_json(value).shape()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Binds `raw` against the route's parameter schema.
pub(crate) fn bind(
    route: &RouteDefinition,
    raw: &RawParams,
) -> Result<CanonicalParameters, StageFailure> {
    let mut bound = CanonicalParameters::default();
    for spec in &route.params {
        let supplied = raw.get(&spec.name).filter(|value| !value.is_null());
        let value = match (supplied, &spec.default) {
            (Some(value), _) => coerce(spec, value)?,
            (None, Some(default)) => coerce(spec, default)?,
            (None, None) if spec.required => {
                return Err(StageFailure::new(
                    ErrorKind::Validation,
                    format!("missing required parameter `{}`", spec.name),
                ));
            }
            (None, None) => Value::Null,
        };
        check_allowed(spec, &value)?;
        bound.declared.insert(spec.name.clone(), value);
    }
    for (name, value) in raw {
        if route.param_spec(name).is_some() || value.is_null() {
            continue;
        }
        bound.passthrough.insert(name.clone(), Value::from_json(value));
    }
    Ok(bound)
}

fn invalid(spec: &ParamSpec, expected: &str, raw: &JsonValue) -> StageFailure {
    StageFailure::new(
        ErrorKind::Validation,
        format!("parameter `{}` is not a valid {expected}", spec.name),
    )
    .with_detail(format!(
        "parameter `{}` is not a valid {expected}: got {raw}",
        spec.name
    ))
}

fn coerce(spec: &ParamSpec, raw: &JsonValue) -> Result<Value, StageFailure> {
    match &spec.ty {
        ParamType::List { element } => {
            let items = match raw {
                JsonValue::Array(items) => items.clone(),
                JsonValue::String(text) => {
                    let separator = spec.separator.as_deref().unwrap_or(DEFAULT_LIST_SEPARATOR);
                    text.split(separator)
                        .map(str::trim)
                        .filter(|item| !item.is_empty())
                        .map(|item| JsonValue::String(item.to_string()))
                        .collect()
                }
                scalar => vec![scalar.clone()],
            };
            items
                .iter()
                .filter(|item| !item.is_null())
                .map(|item| coerce_scalar(spec, element, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List)
        }
        scalar => coerce_scalar(spec, scalar, raw),
    }
}

fn coerce_scalar(spec: &ParamSpec, ty: &ParamType, raw: &JsonValue) -> Result<Value, StageFailure> {
    let text = raw.as_str().map(str::trim);
    match ty {
        ParamType::String => match raw {
            JsonValue::String(text) => Ok(Value::String(text.clone())),
            JsonValue::Number(number) => Ok(Value::String(number.to_string())),
            JsonValue::Bool(flag) => Ok(Value::String(flag.to_string())),
            other => Err(invalid(spec, "string", other)),
        },
        ParamType::Int => {
            let parsed = match raw {
                JsonValue::Number(number) => number.as_i64().or_else(|| {
                    number
                        .as_f64()
                        .filter(|float| float.fract() == 0.0 && float.abs() < 9.0e15)
                        .map(|float| float as i64)
                }),
                JsonValue::String(_) => text.and_then(|text| {
                    text.parse::<i64>().ok().or_else(|| {
                        text.parse::<f64>()
                            .ok()
                            .filter(|float| float.fract() == 0.0 && float.abs() < 9.0e15)
                            .map(|float| float as i64)
                    })
                }),
                _ => None,
            };
            parsed.map(Value::Int).ok_or_else(|| invalid(spec, "int", raw))
        }
        ParamType::Float => {
            let parsed = match raw {
                JsonValue::Number(number) => number.as_f64(),
                JsonValue::String(_) => text.and_then(|text| text.parse::<f64>().ok()),
                _ => None,
            };
            parsed
                .filter(|float| float.is_finite())
                .map(|float| Value::Float(normalize_float(float)))
                .ok_or_else(|| invalid(spec, "float", raw))
        }
        ParamType::Bool => {
            let parsed = match raw {
                JsonValue::Bool(flag) => Some(*flag),
                JsonValue::Number(number) => match number.as_i64() {
                    Some(0) => Some(false),
                    Some(1) => Some(true),
                    _ => None,
                },
                JsonValue::String(_) => match text.map(str::to_ascii_lowercase).as_deref() {
                    Some("true" | "1" | "yes" | "on") => Some(true),
                    Some("false" | "0" | "no" | "off") => Some(false),
                    _ => None,
                },
                _ => None,
            };
            parsed.map(Value::Bool).ok_or_else(|| invalid(spec, "bool", raw))
        }
        ParamType::Date => text
            .and_then(|text| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok())
            .map(Value::Date)
            .ok_or_else(|| invalid(spec, "date", raw)),
        ParamType::Timestamp => text
            .and_then(parse_timestamp)
            .map(Value::Timestamp)
            .ok_or_else(|| invalid(spec, "timestamp", raw)),
        ParamType::Identifier => {
            let text = text.ok_or_else(|| invalid(spec, "identifier", raw))?;
            if is_identifier(text) {
                Ok(Value::String(text.to_string()))
            } else {
                Err(StageFailure::new(
                    ErrorKind::Guard,
                    format!("parameter `{}` is not a plain identifier", spec.name),
                )
                .with_detail(format!(
                    "parameter `{}` is not a plain identifier: got {raw}",
                    spec.name
                )))
            }
        }
        ParamType::Path { root } => {
            let text = text.ok_or_else(|| invalid(spec, "path", raw))?;
            guard_path(root, text)
                .map(|path| Value::String(path.to_string_lossy().into_owned()))
                .ok_or_else(|| {
                    StageFailure::new(
                        ErrorKind::Guard,
                        format!("parameter `{}` escapes its allowed root", spec.name),
                    )
                    .with_detail(format!(
                        "parameter `{}` escapes {}: got {raw}",
                        spec.name,
                        root.display()
                    ))
                })
        }
        ParamType::List { .. } => Err(invalid(spec, "scalar list element", raw)),
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

/// Lexically resolves `candidate` under `root`; `None` if it escapes.
fn guard_path(root: &Path, candidate: &str) -> Option<PathBuf> {
    let candidate = Path::new(candidate);
    let relative = if candidate.is_absolute() {
        candidate.strip_prefix(root).ok()?
    } else {
        candidate
    };
    let mut resolved = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    let mut path = root.to_path_buf();
    path.extend(resolved);
    Some(path)
}

fn check_allowed(spec: &ParamSpec, value: &Value) -> Result<(), StageFailure> {
    let Some(allowed) = &spec.allowed_values else {
        return Ok(());
    };
    let permitted = |value: &Value| {
        matches!(value, Value::Null) || allowed.iter().any(|candidate| *candidate == value.raw_text())
    };
    let ok = match value {
        Value::List(items) => items.iter().all(permitted),
        scalar => permitted(scalar),
    };
    if ok {
        Ok(())
    } else {
        Err(StageFailure::new(
            ErrorKind::Validation,
            format!("parameter `{}` is not one of the allowed values", spec.name),
        )
        .with_detail(format!(
            "parameter `{}` = {value:?} is not one of {allowed:?}",
            spec.name
        )))
    }
}
