//! Delegates: per-component behavior overridable at server construction.
//!
//! Most kinds need no behavior beyond their record, so the base trait is a
//! passive holder. Tables are the exception: their delegate owns row storage
//! and the row-level operations, and each operation reports what changed so
//! the runtime can broadcast it.

use std::collections::{BTreeMap, HashMap};

use serde_cbor::Value;

use crate::components::{ColumnType, Selection, TableColumnInfo, TableInitData};
use crate::ids::{ComponentId, ComponentKind};
use crate::protocol::MethodException;

/// Behavior attached to a live component instance.
pub trait ComponentDelegate: Send {
    /// Row-level capability, for kinds that have one (tables).
    fn table_ops(&mut self) -> Option<&mut dyn TableOps> {
        None
    }
}

/// Constructs the delegate for a freshly created component.
pub type DelegateFactory = Box<dyn Fn(ComponentId) -> Box<dyn ComponentDelegate> + Send + Sync>;

/// Per-kind delegate overrides; kinds without an entry use the built-in
/// default.
pub type DelegateMap = HashMap<ComponentKind, DelegateFactory>;

/// What a table operation changed; drives the broadcast that follows it.
#[derive(Debug, Clone, PartialEq)]
pub enum TableChange {
    Updated { keys: Vec<i64>, rows: Vec<Vec<Value>> },
    RowsRemoved { keys: Vec<i64> },
    Reset,
    SelectionUpdated { selection: Selection },
}

impl TableChange {
    /// The value returned to the invoking client.
    pub fn reply_value(&self) -> Value {
        match self {
            TableChange::Updated { keys, .. } | TableChange::RowsRemoved { keys } => {
                Value::Array(keys.iter().map(|&k| Value::Integer(k as i128)).collect())
            }
            TableChange::Reset | TableChange::SelectionUpdated { .. } => Value::Null,
        }
    }
}

/// Row-level table operations.
pub trait TableOps: Send {
    /// Current full contents, served to subscribing clients.
    fn init_data(&self) -> TableInitData;

    /// Append rows; returns the assigned keys.
    fn handle_insert(&mut self, rows: Vec<Vec<Value>>) -> Result<TableChange, MethodException>;

    /// Overwrite rows by key.
    fn handle_update(
        &mut self,
        keys: Vec<i64>,
        rows: Vec<Vec<Value>>,
    ) -> Result<TableChange, MethodException>;

    /// Delete rows by key.
    fn handle_remove(&mut self, keys: Vec<i64>) -> Result<TableChange, MethodException>;

    /// Drop all rows and selections.
    fn handle_clear(&mut self) -> Result<TableChange, MethodException>;

    /// Store or replace a named selection.
    fn handle_update_selection(
        &mut self,
        selection: Selection,
    ) -> Result<TableChange, MethodException>;
}

/// Passive delegate used for kinds with no behavior.
pub struct PassiveDelegate;

impl ComponentDelegate for PassiveDelegate {}

/// Default table delegate: in-memory rows with sequentially assigned integer
/// keys.
pub struct ServerTableDelegate {
    columns: Vec<TableColumnInfo>,
    rows: BTreeMap<i64, Vec<Value>>,
    selections: BTreeMap<String, Selection>,
    next_key: i64,
}

impl ServerTableDelegate {
    pub fn new(columns: Vec<TableColumnInfo>) -> Self {
        Self {
            columns,
            rows: BTreeMap::new(),
            selections: BTreeMap::new(),
            next_key: 0,
        }
    }

    /// No declared columns; row widths go unchecked.
    pub fn unnamed() -> Self {
        Self::new(Vec::new())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn check_row_widths(&self, rows: &[Vec<Value>]) -> Result<(), MethodException> {
        if self.columns.is_empty() {
            return Ok(());
        }
        for row in rows {
            if row.len() != self.columns.len() {
                return Err(MethodException::invalid_parameters(format!(
                    "expected {} columns, row has {}",
                    self.columns.len(),
                    row.len()
                )));
            }
        }
        Ok(())
    }
}

impl ComponentDelegate for ServerTableDelegate {
    fn table_ops(&mut self) -> Option<&mut dyn TableOps> {
        Some(self)
    }
}

impl TableOps for ServerTableDelegate {
    fn init_data(&self) -> TableInitData {
        TableInitData {
            columns: self.columns.clone(),
            keys: self.rows.keys().copied().collect(),
            data: self.rows.values().cloned().collect(),
            selections: if self.selections.is_empty() {
                None
            } else {
                Some(self.selections.values().cloned().collect())
            },
        }
    }

    fn handle_insert(&mut self, rows: Vec<Vec<Value>>) -> Result<TableChange, MethodException> {
        self.check_row_widths(&rows)?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            let key = self.next_key;
            self.next_key += 1;
            self.rows.insert(key, row.clone());
            keys.push(key);
        }
        Ok(TableChange::Updated { keys, rows })
    }

    fn handle_update(
        &mut self,
        keys: Vec<i64>,
        rows: Vec<Vec<Value>>,
    ) -> Result<TableChange, MethodException> {
        if keys.len() != rows.len() {
            return Err(MethodException::invalid_parameters(
                "key and row counts differ",
            ));
        }
        self.check_row_widths(&rows)?;
        for key in &keys {
            if !self.rows.contains_key(key) {
                return Err(MethodException::invalid_parameters(format!(
                    "no row with key {key}"
                )));
            }
        }
        for (key, row) in keys.iter().zip(rows.iter()) {
            self.rows.insert(*key, row.clone());
        }
        Ok(TableChange::Updated { keys, rows })
    }

    fn handle_remove(&mut self, keys: Vec<i64>) -> Result<TableChange, MethodException> {
        let removed: Vec<i64> = keys
            .into_iter()
            .filter(|key| self.rows.remove(key).is_some())
            .collect();
        Ok(TableChange::RowsRemoved { keys: removed })
    }

    fn handle_clear(&mut self) -> Result<TableChange, MethodException> {
        self.rows.clear();
        self.selections.clear();
        self.next_key = 0;
        Ok(TableChange::Reset)
    }

    fn handle_update_selection(
        &mut self,
        selection: Selection,
    ) -> Result<TableChange, MethodException> {
        self.selections
            .insert(selection.name.clone(), selection.clone());
        Ok(TableChange::SelectionUpdated { selection })
    }
}

/// Column helper for the common text/real/integer table shapes.
pub fn column(name: impl Into<String>, col_type: ColumnType) -> TableColumnInfo {
    TableColumnInfo {
        name: name.into(),
        col_type,
    }
}
