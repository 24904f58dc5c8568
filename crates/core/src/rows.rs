//! Row sets returned by the domain store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One result row: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// An ordered set of rows. Zero rows is a valid, empty result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowSet(pub Vec<Row>);

impl RowSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self(rows)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn rows(&self) -> &[Row] {
        &self.0
    }

    /// Compact JSON, the form inlined into prompts and measured against budgets.
    pub fn to_compact_json(&self) -> String {
        // Serializing a Vec of JSON maps cannot fail.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    /// Indented JSON, the form uploaded as an external file.
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| "[]".to_string())
    }
}

impl From<Vec<Row>> for RowSet {
    fn from(rows: Vec<Row>) -> Self {
        Self(rows)
    }
}

/// A small reference table loaded once per resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticTable {
    pub name: String,
    pub rows: RowSet,
}

/// Static tables in configured order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticTables(pub Vec<StaticTable>);

impl StaticTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, rows: RowSet) {
        self.0.push(StaticTable {
            name: name.into(),
            rows,
        });
    }

    pub fn get(&self, name: &str) -> Option<&RowSet> {
        self.0.iter().find(|t| t.name == name).map(|t| &t.rows)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StaticTable> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn compact_json_has_no_whitespace() {
        let rows = RowSet::new(vec![row(json!({"id": 1, "name": "Inca"}))]);
        assert_eq!(rows.to_compact_json(), r#"[{"id":1,"name":"Inca"}]"#);
        assert!(rows.to_pretty_json().contains('\n'));
    }

    #[test]
    fn empty_rowset_serializes_as_empty_array() {
        assert_eq!(RowSet::empty().to_compact_json(), "[]");
        assert!(RowSet::empty().is_empty());
    }

    #[test]
    fn static_tables_keep_insertion_order() {
        let mut tables = StaticTables::new();
        tables.push("roles", RowSet::new(vec![row(json!({"id": 1}))]));
        tables.push("families", RowSet::empty());
        tables.push("models", RowSet::empty());

        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["roles", "families", "models"]);
        assert_eq!(tables.get("roles").map(RowSet::len), Some(1));
        assert!(tables.get("missing").is_none());
    }
}
