//! Destination provisioning.
//!
//! Makes sure the dataset and table exist with at least the requested
//! columns, tolerating other callers creating the same table at the same
//! time. The per-table lookup/create cycle is the explicit [`TableState`]
//! machine; the surrounding conflict backoff is the shared [`RetryPolicy`].

use std::mem;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::Settings;
use crate::load::LoadError;
use crate::retry::{RetryError, RetryPolicy};
use crate::warehouse::{ColumnSpec, TableId, TableInfo, Warehouse, WarehouseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableState {
    Unknown,
    Exists(TableInfo),
    NotFound,
    Conflict,
}

/// What the warehouse reported for the last step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Found(TableInfo),
    Missing,
    Created(TableInfo),
    AlreadyExists,
    BackoffElapsed,
}

impl TableState {
    /// `UNKNOWN -> {EXISTS, NOT_FOUND}`, `NOT_FOUND -> {EXISTS, CONFLICT}`,
    /// `CONFLICT -> UNKNOWN` once the backoff has elapsed. Any other pairing
    /// leaves the state as it was.
    pub fn advance(self, observation: Observation) -> TableState {
        match (self, observation) {
            (TableState::Unknown, Observation::Found(info)) => TableState::Exists(info),
            (TableState::Unknown, Observation::Missing) => TableState::NotFound,
            (TableState::NotFound, Observation::Created(info)) => TableState::Exists(info),
            (TableState::NotFound, Observation::AlreadyExists) => TableState::Conflict,
            (TableState::Conflict, Observation::BackoffElapsed) => TableState::Unknown,
            (state, observation) => {
                debug!("Ignoring {observation:?} in state {state:?}");
                state
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, TableState::Exists(_))
    }
}

#[derive(Debug, Error)]
enum CycleError {
    #[error("lost the creation race")]
    Conflict,
    #[error(transparent)]
    Failed(WarehouseError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub table: TableInfo,
    /// This caller created the table.
    pub created: bool,
    pub columns_added: usize,
}

pub struct Provisioner<'a> {
    warehouse: &'a dyn Warehouse,
    policy: RetryPolicy,
    settle: Duration,
    final_lookup_wait: Duration,
}

impl<'a> Provisioner<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, settings: &Settings) -> Self {
        Self {
            warehouse,
            policy: settings.retry_policy(),
            settle: settings.table_settle,
            final_lookup_wait: settings.final_lookup_wait,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn ensure_dataset(&self, dataset: &str) -> Result<(), LoadError> {
        let provision_err = |source| LoadError::Provision {
            table: dataset.to_string(),
            source,
        };
        if self.warehouse.dataset_exists(dataset).map_err(provision_err)? {
            return Ok(());
        }
        match self.warehouse.create_dataset(dataset) {
            Ok(()) => {
                info!("Created dataset {dataset}");
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                debug!("Dataset {dataset} was created concurrently");
                Ok(())
            }
            Err(err) => Err(provision_err(err)),
        }
    }

    /// Returns the table once it exists with every column in `columns`.
    pub fn ensure_table(&self, id: &TableId, columns: &[ColumnSpec]) -> Result<Provisioned, LoadError> {
        let mut state = TableState::Unknown;
        let mut created = false;
        let outcome = self.policy.run(
            &format!("Provisioning {id}"),
            |err| matches!(err, CycleError::Conflict),
            |_| self.cycle(id, columns, &mut state, &mut created),
        );

        let table = match outcome {
            Ok(table) => table,
            Err(RetryError::Exhausted { attempts, .. }) => {
                warn!("Provisioning {id}: still conflicting after {attempts} attempt(s); final lookup");
                if !self.final_lookup_wait.is_zero() {
                    thread::sleep(self.final_lookup_wait);
                }
                self.warehouse
                    .get_table(id)
                    .map_err(|source| LoadError::Provision {
                        table: id.to_string(),
                        source,
                    })?
            }
            Err(RetryError::Aborted(CycleError::Failed(source))) => {
                return Err(LoadError::Provision {
                    table: id.to_string(),
                    source,
                });
            }
            Err(RetryError::Aborted(CycleError::Conflict)) => {
                return Err(LoadError::Provision {
                    table: id.to_string(),
                    source: WarehouseError::Conflict(format!("table {id}")),
                });
            }
        };

        if created && !self.settle.is_zero() {
            debug!("Waiting {}ms for {id} to settle", self.settle.as_millis());
            thread::sleep(self.settle);
        }

        let missing: Vec<ColumnSpec> = table.missing(columns).into_iter().cloned().collect();
        if missing.is_empty() {
            return Ok(Provisioned {
                table,
                created,
                columns_added: 0,
            });
        }
        info!("Adding {} column(s) to {id}", missing.len());
        let table = self
            .warehouse
            .add_columns(id, &missing)
            .map_err(|source| LoadError::Provision {
                table: id.to_string(),
                source,
            })?;
        Ok(Provisioned {
            table,
            created,
            columns_added: missing.len(),
        })
    }

    /// One pass of the state machine: lookup, then create if missing. A pass
    /// that starts in `Conflict` follows a backoff and looks up again.
    fn cycle(
        &self,
        id: &TableId,
        columns: &[ColumnSpec],
        state: &mut TableState,
        created: &mut bool,
    ) -> Result<TableInfo, CycleError> {
        if *state == TableState::Conflict {
            *state = mem::replace(state, TableState::Unknown).advance(Observation::BackoffElapsed);
        }
        loop {
            let observation = match &*state {
                TableState::Exists(info) => return Ok(info.clone()),
                TableState::Conflict => return Err(CycleError::Conflict),
                TableState::Unknown => match self.warehouse.get_table(id) {
                    Ok(info) => Observation::Found(info),
                    Err(err) if err.is_not_found() => Observation::Missing,
                    Err(err) => return Err(CycleError::Failed(err)),
                },
                TableState::NotFound => match self.warehouse.create_table(id, columns) {
                    Ok(info) => {
                        info!("Created table {id} with {} column(s)", columns.len());
                        *created = true;
                        Observation::Created(info)
                    }
                    Err(err) if err.is_conflict() => Observation::AlreadyExists,
                    Err(err) => return Err(CycleError::Failed(err)),
                },
            };
            *state = mem::replace(state, TableState::Unknown).advance(observation);
        }
    }
}
