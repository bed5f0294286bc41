//! Typed parameter values resolved once at bind time.

use std::fmt::Write as _;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use datafusion::arrow::array::{Array, StringArray};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::DataType;
use datafusion::common::ScalarValue;
use serde_json::Value as JsonValue;

/// Days between 0001-01-01 (CE day 1) and the Unix epoch.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Canonical request parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    List(Vec<Value>),
}

impl Value {
    /// Short type label used in redacted summaries and messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::String(_) => "string",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Date(_) => "date",
            Self::Timestamp(_) => "timestamp",
            Self::List(_) => "list",
        }
    }

    /// Value shape without its contents, e.g. `list<string>[3]`.
    pub fn shape(&self) -> String {
        match self {
            Self::List(items) => {
                let element = items
                    .iter()
                    .find(|item| !matches!(item, Self::Null))
                    .map_or("null", Self::type_name);
                format!("list<{element}>[{}]", items.len())
            }
            other => other.type_name().to_string(),
        }
    }

    /// Infers a value from an untyped JSON request value.
    ///
    /// Mixed-type arrays degrade to lists of strings so they stay bindable.
    pub fn from_json(raw: &JsonValue) -> Self {
        match raw {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(flag) => Self::Bool(*flag),
            JsonValue::Number(number) => match number.as_i64() {
                Some(int) => Self::Int(int),
                None => Self::Float(normalize_float(number.as_f64().unwrap_or(f64::NAN))),
            },
            JsonValue::String(text) => Self::String(text.clone()),
            JsonValue::Array(items) => {
                let items = items.iter().map(Self::from_json).collect::<Vec<_>>();
                let homogeneous = items
                    .iter()
                    .filter(|item| !matches!(item, Self::Null))
                    .map(Self::type_name)
                    .collect::<std::collections::BTreeSet<_>>()
                    .len()
                    <= 1;
                if homogeneous {
                    Self::List(items)
                } else {
                    Self::List(
                        items
                            .into_iter()
                            .map(|item| match item {
                                Self::Null => Self::Null,
                                Self::String(text) => Self::String(text),
                                other => Self::String(other.raw_text()),
                            })
                            .collect(),
                    )
                }
            }
            JsonValue::Object(_) => Self::String(raw.to_string()),
        }
    }

    /// JSON form used when passing values on to dependency routes.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::String(text) => JsonValue::String(text.clone()),
            Self::Int(int) => JsonValue::from(*int),
            Self::Float(float) => serde_json::Number::from_f64(*float)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Bool(flag) => JsonValue::Bool(*flag),
            Self::Date(date) => JsonValue::String(date.format("%Y-%m-%d").to_string()),
            Self::Timestamp(ts) => {
                JsonValue::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
            Self::List(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
        }
    }

    /// Plain text of a scalar as compared against result columns.
    ///
    /// Numbers use the canonical decimal form so `2`, `2.0` and `-0.0`
    /// spelled differently in requests agree.
    pub fn raw_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::String(text) => text.clone(),
            Self::Int(int) => int.to_string(),
            Self::Float(float) => canonical_float(*float),
            Self::Bool(flag) => flag.to_string(),
            Self::Date(date) => date.format("%Y-%m-%d").to_string(),
            Self::Timestamp(ts) => ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            Self::List(items) => items
                .iter()
                .map(Self::raw_text)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Text of a scalar as a matching result column reads once cast to `Utf8`.
    ///
    /// Invariant tokens are compared against cast column text, so floats
    /// follow Arrow's rendering and an integral float keeps its fraction.
    pub fn column_text(&self) -> String {
        match self {
            Self::Float(float) => cast_to_text(ScalarValue::Float64(Some(*float)))
                .unwrap_or_else(|| format!("{float:?}")),
            other => other.raw_text(),
        }
    }

    /// Type-tagged canonical encoding hashed into cache keys.
    ///
    /// Integers and floats share the numeric tag so an integral float and
    /// the equal integer collide. Lists are sorted and deduplicated unless
    /// `order_sensitive` is set.
    pub fn canonical(&self, order_sensitive: bool) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out, order_sensitive);
        out
    }

    fn write_canonical(&self, out: &mut String, order_sensitive: bool) {
        match self {
            Self::Null => out.push('~'),
            Self::String(text) => {
                let _ = write!(out, "s{}:{text}", text.len());
            }
            Self::Int(int) => {
                let _ = write!(out, "n:{int}");
            }
            Self::Float(float) => {
                let _ = write!(out, "n:{}", canonical_float(*float));
            }
            Self::Bool(flag) => {
                let _ = write!(out, "b:{flag}");
            }
            Self::Date(date) => {
                let _ = write!(out, "d:{}", date.format("%Y-%m-%d"));
            }
            Self::Timestamp(ts) => {
                let _ = write!(out, "t:{}", ts.format("%Y-%m-%dT%H:%M:%S%.f"));
            }
            Self::List(items) => {
                let mut encoded = items
                    .iter()
                    .map(|item| item.canonical(order_sensitive))
                    .collect::<Vec<_>>();
                if !order_sensitive {
                    encoded.sort();
                    encoded.dedup();
                }
                let _ = write!(out, "l{}[", encoded.len());
                for item in encoded {
                    out.push_str(&item);
                    out.push(';');
                }
                out.push(']');
            }
        }
    }

    /// Converts the value into a DataFusion scalar for placeholder binding.
    pub fn to_scalar(&self) -> ScalarValue {
        match self {
            Self::Null => ScalarValue::Null,
            Self::String(text) => ScalarValue::Utf8(Some(text.clone())),
            Self::Int(int) => ScalarValue::Int64(Some(*int)),
            Self::Float(float) => ScalarValue::Float64(Some(*float)),
            Self::Bool(flag) => ScalarValue::Boolean(Some(*flag)),
            Self::Date(date) => {
                ScalarValue::Date32(Some(date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE))
            }
            Self::Timestamp(ts) => {
                ScalarValue::TimestampMicrosecond(Some(ts.and_utc().timestamp_micros()), None)
            }
            Self::List(items) => {
                let scalars = items.iter().map(Self::to_scalar).collect::<Vec<_>>();
                let element_type = scalars
                    .iter()
                    .find(|scalar| !scalar.is_null())
                    .map_or(DataType::Utf8, ScalarValue::data_type);
                let scalars = scalars
                    .into_iter()
                    .map(|scalar| {
                        if scalar.is_null() {
                            ScalarValue::try_from(&element_type).unwrap_or(ScalarValue::Null)
                        } else {
                            scalar
                        }
                    })
                    .collect::<Vec<_>>();
                ScalarValue::List(ScalarValue::new_list_nullable(&scalars, &element_type))
            }
        }
    }
}

/// Folds `-0.0` into `0.0`.
pub fn normalize_float(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

fn cast_to_text(scalar: ScalarValue) -> Option<String> {
    let array = scalar.to_array().ok()?;
    let text = cast(array.as_ref(), &DataType::Utf8).ok()?;
    let text = text.as_any().downcast_ref::<StringArray>()?;
    (!text.is_null(0)).then(|| text.value(0).to_string())
}

/// Shortest round-trip decimal form; integral floats print without a fraction.
fn canonical_float(value: f64) -> String {
    format!("{}", normalize_float(value))
}
