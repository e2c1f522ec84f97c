//! Binding decoded column values into caller-owned variables.
//!
//! ```rust
//! use pg_stream::postgres::{ChangeSet, FieldBinding};
//!
//! let set = ChangeSet::from_slice(br#"{"change":[{"kind":"insert","schema":"public",
//!     "table":"t","columnnames":["id","name"],"columntypes":["integer","text"],
//!     "columnvalues":[7,"foo"]}]}"#)?;
//!
//! let (mut id, mut name) = (0i64, String::new());
//! set.changes[0].bind_fields(FieldBinding::new().bind("id", &mut id).bind("name", &mut name))?;
//! assert_eq!((id, name.as_str()), (7, "foo"));
//! # Ok::<(), pg_stream::Error>(())
//! ```

use serde_json::Value;
use std::collections::HashMap;

use super::decoder::DataField;
use crate::{Error, Result};

/// Conversion from a wal2json value.
///
/// `Ok(None)` means the value is `null` and the destination should be left
/// alone; `Option<T>` turns `null` into `None` instead.
pub trait FromFieldValue: Sized {
    fn from_field_value(value: &Value) -> std::result::Result<Option<Self>, String>;
}

/// A destination a field value can be written into.
pub trait BindTarget {
    fn assign(&mut self, value: &Value) -> std::result::Result<(), String>;
}

impl<T: FromFieldValue> BindTarget for T {
    fn assign(&mut self, value: &Value) -> std::result::Result<(), String> {
        if let Some(converted) = T::from_field_value(value)? {
            *self = converted;
        }
        Ok(())
    }
}

/// Column-name to destination mapping applied by
/// [`ChangeRecord::bind_fields`](super::ChangeRecord::bind_fields).
#[derive(Default)]
pub struct FieldBinding<'a> {
    targets: Vec<(&'a str, &'a mut dyn BindTarget)>,
}

impl<'a> FieldBinding<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<T: BindTarget + 'a>(mut self, name: &'a str, target: &'a mut T) -> Self {
        let target: &'a mut dyn BindTarget = target;
        self.targets.push((name, target));
        self
    }

    pub(crate) fn apply(self, fields: &HashMap<String, DataField>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        for (name, target) in self.targets {
            if let Some(field) = fields.get(name) {
                target.assign(&field.value).map_err(|message| Error::Bind {
                    field: name.to_string(),
                    message,
                })?;
            }
        }
        Ok(())
    }
}

fn mismatch<T>(value: &Value) -> String {
    format!("cannot convert {} into {}", value, std::any::type_name::<T>())
}

fn number_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.trim().to_string()),
        _ => None,
    }
}

macro_rules! numeric_field_value {
    ($($ty:ty),*) => {
        $(
            impl FromFieldValue for $ty {
                fn from_field_value(value: &Value) -> std::result::Result<Option<Self>, String> {
                    if value.is_null() {
                        return Ok(None);
                    }
                    number_text(value)
                        .and_then(|text| text.parse::<$ty>().ok())
                        .map(Some)
                        .ok_or_else(|| mismatch::<$ty>(value))
                }
            }
        )*
    };
}

numeric_field_value!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

impl FromFieldValue for bool {
    fn from_field_value(value: &Value) -> std::result::Result<Option<Self>, String> {
        match value {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(*b)),
            Value::String(s) => match s.as_str() {
                "t" | "true" => Ok(Some(true)),
                "f" | "false" => Ok(Some(false)),
                _ => Err(mismatch::<bool>(value)),
            },
            _ => Err(mismatch::<bool>(value)),
        }
    }
}

impl FromFieldValue for String {
    fn from_field_value(value: &Value) -> std::result::Result<Option<Self>, String> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            other => Ok(Some(other.to_string())),
        }
    }
}

impl FromFieldValue for Value {
    fn from_field_value(value: &Value) -> std::result::Result<Option<Self>, String> {
        Ok(Some(value.clone()))
    }
}

impl<T: FromFieldValue> FromFieldValue for Option<T> {
    fn from_field_value(value: &Value) -> std::result::Result<Option<Self>, String> {
        if value.is_null() {
            return Ok(Some(None));
        }
        Ok(T::from_field_value(value)?.map(Some))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(values: &[(&str, Value)]) -> HashMap<String, DataField> {
        values
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    DataField {
                        name: name.to_string(),
                        type_name: "text".to_string(),
                        value: value.clone(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_scalar_coercions() {
        assert_eq!(i64::from_field_value(&json!(42)).unwrap(), Some(42));
        assert_eq!(i32::from_field_value(&json!("17")).unwrap(), Some(17));
        assert_eq!(f64::from_field_value(&json!(1.5)).unwrap(), Some(1.5));
        assert_eq!(bool::from_field_value(&json!("t")).unwrap(), Some(true));
        assert_eq!(bool::from_field_value(&json!(false)).unwrap(), Some(false));
        assert_eq!(String::from_field_value(&json!(12)).unwrap(), Some("12".to_string()));
        assert_eq!(i64::from_field_value(&Value::Null).unwrap(), None);
        assert_eq!(Option::<i64>::from_field_value(&Value::Null).unwrap(), Some(None));
    }

    #[test]
    fn test_coercion_failures() {
        assert!(i64::from_field_value(&json!("abc")).is_err());
        assert!(u8::from_field_value(&json!(300)).is_err());
        assert!(bool::from_field_value(&json!(1)).is_err());
    }

    #[test]
    fn test_bind_leaves_unmatched_destinations_alone() {
        let source = fields(&[("id", json!(5)), ("extra", json!("ignored"))]);

        let mut id = 0i64;
        let mut name = "keep".to_string();
        FieldBinding::new()
            .bind("id", &mut id)
            .bind("name", &mut name)
            .apply(&source)
            .unwrap();

        assert_eq!(id, 5);
        assert_eq!(name, "keep");
    }

    #[test]
    fn test_null_handling() {
        let source = fields(&[("note", Value::Null), ("count", Value::Null)]);

        let mut note = Some("old".to_string());
        let mut count = 9i32;
        FieldBinding::new()
            .bind("note", &mut note)
            .bind("count", &mut count)
            .apply(&source)
            .unwrap();

        assert_eq!(note, None);
        assert_eq!(count, 9);
    }

    #[test]
    fn test_bind_error_names_field() {
        let source = fields(&[("age", json!("old"))]);
        let mut age = 0u32;
        let err = FieldBinding::new()
            .bind("age", &mut age)
            .apply(&source)
            .unwrap_err();

        match err {
            Error::Bind { field, .. } => assert_eq!(field, "age"),
            other => panic!("Expected bind error, got {:?}", other),
        }
    }
}
