mod common;

use std::sync::atomic::Ordering;
use std::thread;

use marketload::provision::Provisioner;
use marketload::warehouse::{BRAND_COLUMN, ColumnSpec, MemoryWarehouse, TableId, Warehouse};

use common::{FlakyWarehouse, RaceWarehouse, quick_settings};

fn columns(names: &[&str]) -> Vec<ColumnSpec> {
    let mut specs = vec![ColumnSpec::required(BRAND_COLUMN)];
    specs.extend(names.iter().map(|n| ColumnSpec::nullable(*n)));
    specs
}

#[test]
fn concurrent_creators_converge_on_one_table() {
    let settings = quick_settings();
    let warehouse = RaceWarehouse::new(2);
    warehouse.create_dataset("imports").unwrap();
    let id = TableId::new("imports", "ba_produk");

    let outcomes: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = [columns(&["A", "B"]), columns(&["A", "B", "C"])]
            .into_iter()
            .map(|wanted| {
                let warehouse = &warehouse;
                let settings = &settings;
                let id = &id;
                scope.spawn(move || Provisioner::new(warehouse, settings).ensure_table(id, &wanted))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(outcomes.iter().all(Result::is_ok), "{outcomes:?}");
    let created: Vec<bool> = outcomes
        .iter()
        .map(|o| o.as_ref().map(|p| p.created).unwrap_or(false))
        .collect();
    assert_eq!(created.iter().filter(|c| **c).count(), 1);
    assert_eq!(warehouse.creates.load(Ordering::SeqCst), 2);

    let table = warehouse.inner.get_table(&id).unwrap();
    assert_eq!(table.column_names(), [BRAND_COLUMN, "A", "B", "C"]);
}

#[test]
fn existing_tables_only_gain_missing_columns() {
    let settings = quick_settings();
    let warehouse = MemoryWarehouse::new();
    warehouse.create_dataset("imports").unwrap();
    let id = TableId::new("imports", "penjualan");
    warehouse.create_table(&id, &columns(&["A", "B"])).unwrap();

    let provisioner = Provisioner::new(&warehouse, &settings);
    let grown = provisioner.ensure_table(&id, &columns(&["A", "B", "C", "D"])).unwrap();
    assert!(!grown.created);
    assert_eq!(grown.columns_added, 2);
    assert_eq!(grown.table.column_names(), [BRAND_COLUMN, "A", "B", "C", "D"]);

    // A narrower request never drops anything.
    let again = provisioner.ensure_table(&id, &columns(&["A"])).unwrap();
    assert_eq!(again.columns_added, 0);
    assert_eq!(again.table.columns.len(), 5);
}

#[test]
fn phantom_conflicts_are_retried_until_create_succeeds() {
    let settings = quick_settings();
    let warehouse = FlakyWarehouse::new().with_phantom_conflicts(2);
    warehouse.create_dataset("imports").unwrap();
    let id = TableId::new("imports", "t");

    let provisioned = Provisioner::new(&warehouse, &settings)
        .ensure_table(&id, &columns(&["A"]))
        .unwrap();
    assert!(provisioned.created);
    assert_eq!(warehouse.lookup_calls.load(Ordering::SeqCst), 3);
}

#[test]
fn exhausted_conflicts_end_with_one_final_lookup() {
    let settings = quick_settings();
    let warehouse = FlakyWarehouse::new().with_phantom_conflicts(usize::MAX);
    warehouse.create_dataset("imports").unwrap();
    let id = TableId::new("imports", "t");

    let err = Provisioner::new(&warehouse, &settings)
        .ensure_table(&id, &columns(&["A"]))
        .unwrap_err();
    assert_eq!(err.reason(), "PROVISION_FAILED");
    // One lookup per attempt plus the final one.
    assert_eq!(
        warehouse.lookup_calls.load(Ordering::SeqCst),
        settings.max_retries as usize + 1
    );
}

#[test]
fn datasets_are_created_once_and_tolerate_races() {
    let settings = quick_settings();
    let warehouse = MemoryWarehouse::new();
    let provisioner = Provisioner::new(&warehouse, &settings);
    provisioner.ensure_dataset("imports").unwrap();
    provisioner.ensure_dataset("imports").unwrap();
    assert!(warehouse.dataset_exists("imports").unwrap());
}

#[test]
fn non_conflict_failures_are_not_retried() {
    let settings = quick_settings();
    let warehouse = FlakyWarehouse::new();
    let id = TableId::new("missing_dataset", "t");
    let err = Provisioner::new(&warehouse, &settings)
        .ensure_table(&id, &columns(&["A"]))
        .unwrap_err();
    assert_eq!(err.reason(), "PROVISION_FAILED");
    assert_eq!(warehouse.lookup_calls.load(Ordering::SeqCst), 1);
}
