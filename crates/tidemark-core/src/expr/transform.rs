//! Declarative per-item transforms.

use super::{Expression, ExpressionError};
use crate::backend::Item;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A per-item transform as written in a migration spec.
///
/// ```json
/// {"set": {"fullName": "first || ' ' || last"}, "rename": {"old": "new"}, "remove": ["tmp"]}
/// ```
///
/// Every `set` expression sees the item as it was before the transform.
/// Renames run next, then removals, then the computed fields are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemTransform {
    /// Fields to assign, keyed by target field, valued by expression.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    /// Fields to rename, old name to new name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rename: BTreeMap<String, String>,
    /// Fields to drop.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

impl ItemTransform {
    /// Whether the transform leaves items unchanged.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.rename.is_empty() && self.remove.is_empty()
    }

    /// Parse every expression.
    pub fn compile(&self) -> Result<CompiledTransform, ExpressionError> {
        let set = self
            .set
            .iter()
            .map(|(field, source)| {
                Expression::parse(source)
                    .map(|expr| (field.clone(), expr))
                    .map_err(|e| ExpressionError::in_field(field, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledTransform {
            set,
            rename: self
                .rename
                .iter()
                .map(|(from, to)| (from.clone(), to.clone()))
                .collect(),
            remove: self.remove.clone(),
        })
    }
}

/// An [`ItemTransform`] with its expressions parsed.
#[derive(Debug, Clone)]
pub struct CompiledTransform {
    set: Vec<(String, Expression)>,
    rename: Vec<(String, String)>,
    remove: Vec<String>,
}

impl CompiledTransform {
    /// Produce the transformed copy of `item`.
    pub fn apply(&self, item: &Item) -> Result<Item, ExpressionError> {
        let computed = self
            .set
            .iter()
            .map(|(field, expr)| {
                expr.evaluate(item)
                    .map(|value| (field.clone(), value))
                    .map_err(|e| ExpressionError::in_field(field, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut output = item.clone();
        for (from, to) in &self.rename {
            if let Some(value) = output.remove(from) {
                output.insert(to.clone(), value);
            }
        }
        for field in &self.remove {
            output.remove(field);
        }
        output.extend(computed);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn make_item(value: Value) -> Item {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_apply_transform() {
        let transform: ItemTransform = serde_json::from_value(json!({
            "set": {"fullName": "first || ' ' || last", "total": "price * qty"},
            "rename": {"first": "givenName"},
            "remove": ["tmp"]
        }))
        .unwrap();

        let item = make_item(json!({
            "id": "u1", "first": "Ada", "last": "Lovelace",
            "price": 3, "qty": 4, "tmp": true
        }));
        let output = transform.compile().unwrap().apply(&item).unwrap();

        assert_eq!(
            Value::Object(output),
            json!({
                "id": "u1", "givenName": "Ada", "last": "Lovelace",
                "price": 3, "qty": 4, "fullName": "Ada Lovelace", "total": 12
            })
        );
    }

    #[test]
    fn test_compile_reports_field() {
        let transform = ItemTransform {
            set: BTreeMap::from([("total".to_string(), "price *".to_string())]),
            ..Default::default()
        };
        let err = transform.compile().unwrap_err();
        assert!(err.to_string().starts_with("field 'total': syntax error"));
    }

    #[test]
    fn test_apply_reports_runtime_error() {
        let transform = ItemTransform {
            set: BTreeMap::from([("ratio".to_string(), "a / b".to_string())]),
            ..Default::default()
        };
        let item = make_item(json!({"a": 1, "b": 0}));
        let err = transform.compile().unwrap().apply(&item).unwrap_err();
        assert!(matches!(err, ExpressionError::InField { ref field, .. } if field == "ratio"));
    }
}
