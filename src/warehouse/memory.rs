use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use super::{
    BRAND_COLUMN, ColumnSpec, RowRejection, TableId, TableInfo, Warehouse, WarehouseError,
    WarehouseRow,
};

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<ColumnSpec>,
    rows: Vec<WarehouseRow>,
}

#[derive(Debug, Default)]
struct MemoryState {
    datasets: BTreeSet<String>,
    tables: BTreeMap<TableId, MemoryTable>,
}

/// A process-local warehouse behind a single mutex.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row of a table, sentinel included, in insertion order.
    pub fn rows(&self, id: &TableId) -> Result<Vec<WarehouseRow>, WarehouseError> {
        let state = self.lock()?;
        Ok(table(&state, id)?.rows.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, WarehouseError> {
        self.state
            .lock()
            .map_err(|_| WarehouseError::Backend("memory warehouse lock poisoned".to_string()))
    }
}

fn table<'a>(state: &'a MemoryState, id: &TableId) -> Result<&'a MemoryTable, WarehouseError> {
    state
        .tables
        .get(id)
        .ok_or_else(|| WarehouseError::NotFound(format!("table {id}")))
}

fn table_mut<'a>(
    state: &'a mut MemoryState,
    id: &TableId,
) -> Result<&'a mut MemoryTable, WarehouseError> {
    state
        .tables
        .get_mut(id)
        .ok_or_else(|| WarehouseError::NotFound(format!("table {id}")))
}

fn info(id: &TableId, table: &MemoryTable) -> TableInfo {
    TableInfo {
        id: id.clone(),
        columns: table.columns.clone(),
    }
}

fn is_brand(row: &WarehouseRow, brand_code: &str) -> bool {
    row.get(BRAND_COLUMN).is_some_and(|b| b == brand_code)
}

impl Warehouse for MemoryWarehouse {
    fn dataset_exists(&self, dataset: &str) -> Result<bool, WarehouseError> {
        Ok(self.lock()?.datasets.contains(dataset))
    }

    fn create_dataset(&self, dataset: &str) -> Result<(), WarehouseError> {
        if self.lock()?.datasets.insert(dataset.to_string()) {
            Ok(())
        } else {
            Err(WarehouseError::Conflict(format!("dataset {dataset}")))
        }
    }

    fn get_table(&self, id: &TableId) -> Result<TableInfo, WarehouseError> {
        let state = self.lock()?;
        table(&state, id).map(|t| info(id, t))
    }

    fn create_table(&self, id: &TableId, columns: &[ColumnSpec]) -> Result<TableInfo, WarehouseError> {
        let mut state = self.lock()?;
        if !state.datasets.contains(&id.dataset) {
            return Err(WarehouseError::NotFound(format!("dataset {}", id.dataset)));
        }
        if state.tables.contains_key(id) {
            return Err(WarehouseError::Conflict(format!("table {id}")));
        }
        let created = MemoryTable {
            columns: columns.to_vec(),
            rows: Vec::new(),
        };
        let result = info(id, &created);
        state.tables.insert(id.clone(), created);
        Ok(result)
    }

    fn add_columns(&self, id: &TableId, columns: &[ColumnSpec]) -> Result<TableInfo, WarehouseError> {
        let mut state = self.lock()?;
        let table = table_mut(&mut state, id)?;
        for column in columns {
            if !table.columns.iter().any(|c| c.name == column.name) {
                table.columns.push(ColumnSpec::nullable(column.name.clone()));
            }
        }
        Ok(info(id, table))
    }

    fn delete_brand(&self, id: &TableId, brand_code: &str) -> Result<usize, WarehouseError> {
        let mut state = self.lock()?;
        let table = table_mut(&mut state, id)?;
        let before = table.rows.len();
        table.rows.retain(|row| !is_brand(row, brand_code));
        Ok(before - table.rows.len())
    }

    fn count_brand(&self, id: &TableId, brand_code: &str) -> Result<usize, WarehouseError> {
        let state = self.lock()?;
        Ok(table(&state, id)?
            .rows
            .iter()
            .filter(|row| is_brand(row, brand_code))
            .count())
    }

    fn brand_rows(&self, id: &TableId, brand_code: &str) -> Result<Vec<WarehouseRow>, WarehouseError> {
        let state = self.lock()?;
        Ok(table(&state, id)?
            .rows
            .iter()
            .filter(|row| is_brand(row, brand_code))
            .cloned()
            .collect())
    }

    fn insert_rows(&self, id: &TableId, rows: &[WarehouseRow]) -> Result<Vec<RowRejection>, WarehouseError> {
        let mut state = self.lock()?;
        let table = table_mut(&mut state, id)?;
        let schema = info(id, table);
        let mut rejections = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            match schema.reject_reason(row) {
                Some(message) => rejections.push(RowRejection { index, message }),
                None => table.rows.push(row.clone()),
            }
        }
        Ok(rejections)
    }
}
