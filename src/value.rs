//! Configuration values, schemas and directory entries.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ConfError, ConfResult};

/// The type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Int,
    Float,
    Bool,
    Schema,
    List,
    Pair,
}

impl ValueType {
    /// Primitive types may appear inside lists and pairs.
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            ValueType::String | ValueType::Int | ValueType::Float | ValueType::Bool
        )
    }

    /// Lowercase name used in messages and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::Schema => "schema",
            ValueType::List => "list",
            ValueType::Pair => "pair",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata describing the expected type and default of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_type: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub car_type: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdr_type: Option<ValueType>,
    /// Locale of the descriptions; `None` is locale-independent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Box<Value>>,
}

impl Schema {
    /// A schema for `value_type` with no default.
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            list_type: None,
            car_type: None,
            cdr_type: None,
            locale: None,
            owner: None,
            short_desc: None,
            long_desc: None,
            default_value: None,
        }
    }

    /// Set the default value.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(Box::new(value));
        self
    }

    /// Set the locale.
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// Check that `value` has the shape this schema declares.
    pub fn check(&self, value: &Value) -> ConfResult<()> {
        if value.value_type() != self.value_type {
            return Err(ConfError::TypeMismatch(format!(
                "expected {}, got {}",
                self.value_type,
                value.value_type()
            )));
        }
        match value {
            Value::List { list_type, .. } => {
                if let Some(expected) = self.list_type {
                    if *list_type != expected {
                        return Err(ConfError::TypeMismatch(format!(
                            "expected list of {}, got list of {}",
                            expected, list_type
                        )));
                    }
                }
            }
            Value::Pair(car, cdr) => {
                for (expected, got) in [(self.car_type, car), (self.cdr_type, cdr)] {
                    if let Some(expected) = expected {
                        if got.value_type() != expected {
                            return Err(ConfError::TypeMismatch(format!(
                                "expected pair member of type {}, got {}",
                                expected,
                                got.value_type()
                            )));
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// A configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Schema(Box<Schema>),
    List {
        list_type: ValueType,
        items: Vec<Value>,
    },
    Pair(Box<Value>, Box<Value>),
}

impl Value {
    /// The type tag of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Bool(_) => ValueType::Bool,
            Value::Schema(_) => ValueType::Schema,
            Value::List { .. } => ValueType::List,
            Value::Pair(..) => ValueType::Pair,
        }
    }

    /// Build a list, checking every item against `list_type`.
    pub fn list(list_type: ValueType, items: Vec<Value>) -> ConfResult<Self> {
        let value = Value::List { list_type, items };
        value.validate()?;
        Ok(value)
    }

    /// Build a pair of primitive values.
    pub fn pair(car: Value, cdr: Value) -> ConfResult<Self> {
        let value = Value::Pair(Box::new(car), Box::new(cdr));
        value.validate()?;
        Ok(value)
    }

    /// Check structural invariants: list items and pair members are primitive
    /// and lists are homogeneous.
    pub fn validate(&self) -> ConfResult<()> {
        match self {
            Value::List { list_type, items } => {
                if !list_type.is_primitive() {
                    return Err(ConfError::TypeMismatch(format!(
                        "lists may not contain {} values",
                        list_type
                    )));
                }
                if let Some(bad) = items.iter().find(|v| v.value_type() != *list_type) {
                    return Err(ConfError::TypeMismatch(format!(
                        "list of {} contains a {}",
                        list_type,
                        bad.value_type()
                    )));
                }
                Ok(())
            }
            Value::Pair(car, cdr) => {
                if !car.value_type().is_primitive() || !cdr.value_type().is_primitive() {
                    return Err(ConfError::TypeMismatch(
                        "pair members must be primitive values".to_string(),
                    ));
                }
                Ok(())
            }
            Value::Schema(schema) => match schema.default_value.as_deref() {
                Some(default) => default.validate(),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Parse a primitive value from its command-line form.
    pub fn parse_primitive(value_type: ValueType, raw: &str) -> ConfResult<Self> {
        match value_type {
            ValueType::String => Ok(Value::String(raw.to_string())),
            ValueType::Int => raw
                .trim()
                .parse()
                .map(Value::Int)
                .map_err(|e| ConfError::ParseError(format!("`{}` is not an int: {}", raw, e))),
            ValueType::Float => raw
                .trim()
                .parse()
                .map(Value::Float)
                .map_err(|e| ConfError::ParseError(format!("`{}` is not a float: {}", raw, e))),
            ValueType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                other => Err(ConfError::ParseError(format!("`{}` is not a bool", other))),
            },
            other => Err(ConfError::ParseError(format!(
                "cannot parse a {} value from text",
                other
            ))),
        }
    }

    /// The schema payload, if this is a schema value.
    pub fn as_schema(&self) -> Option<&Schema> {
        match self {
            Value::Schema(schema) => Some(schema),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Schema(s) => write!(f, "<schema of {}>", s.value_type),
            Value::List { items, .. } => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Pair(car, cdr) => write!(f, "({},{})", car, cdr),
        }
    }
}

/// The result of looking up a single key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lookup {
    pub value: Option<Value>,
    pub is_default: bool,
    pub is_writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
}

/// One key inside a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Key name relative to the listed directory.
    pub key: String,
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub is_default: bool,
    pub is_writable: bool,
}
