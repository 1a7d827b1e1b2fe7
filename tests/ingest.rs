mod common;

use marketload::config::{Catalog, CategoryConfig};
use marketload::ingest::{IngestError, ingest_file};

use common::{csv_bytes, fixture_bytes, fixture_path, snapshot_category};

fn catalog() -> Catalog {
    Catalog::load(&fixture_path("catalog.yaml")).expect("fixture catalog")
}

#[test]
fn product_export_is_mapped_to_canonical_and_variant_headers() {
    let catalog = catalog();
    let category = catalog.find("BA Produk SHO").expect("category");
    let result = ingest_file(
        "ba_produk_sho.csv",
        &fixture_bytes("ba_produk_sho.csv"),
        Some(category),
    )
    .expect("ingest");

    assert!(result.is_valid());
    assert!(result.column_mapped);
    assert_eq!(
        result.headers(),
        [
            "SKU",
            "Nama Produk",
            "Harga",
            "Total Stok",
            "Foto Panduan Ukuran",
            "Nama Variasi 1",
            "Foto Variasi 1",
            "Nama Variasi 2",
        ]
    );
    assert_eq!(result.total_rows, 4);
    assert_eq!(result.skipped_rows, 1);
    assert!(result.errors.is_empty());

    let record = &result.record;
    assert_eq!(record.len(), 3);
    assert_eq!(record.value(0, "Nama Produk"), Some("Kaos Polos"));
    assert_eq!(record.value(0, "Harga"), Some("Rp 45.000"));
    assert_eq!(record.value(1, "Nama Produk"), Some("Celana Chino"));
    assert_eq!(record.value(1, "Harga"), Some("1.250.000,50"));
    assert_eq!(record.value(1, "Nama Variasi 2"), Some(""));
    assert_eq!(record.value(2, "Foto Panduan Ukuran"), Some(""));

    let stock: Vec<_> = record
        .records()
        .map(|row| row.get("Total Stok").unwrap_or_default())
        .collect();
    assert_eq!(stock, ["15", "7", ""]);
}

#[test]
fn header_offsets_skip_report_preamble() {
    let catalog = catalog();
    let category = catalog.find("penjualan harian").expect("case-insensitive lookup");
    assert_eq!((category.header_row, category.data_start_row), (2, 3));

    let result = ingest_file(
        "penjualan_harian.tsv",
        &fixture_bytes("penjualan_harian.tsv"),
        Some(category),
    )
    .expect("ingest");
    assert_eq!(result.headers(), ["Tanggal", "SKU", "Qty", "Omzet"]);
    assert_eq!(
        result.record.rows(),
        [
            ["2024-01-15", "KX-01", "3", "135.000"],
            ["2024-01-15", "KX-02", "1", "1.250.000"],
        ]
    );
    assert_eq!(result.total_rows, 3);
    assert_eq!(result.skipped_rows, 1);
}

#[test]
fn legacy_encoded_text_falls_back_to_windows_1252() {
    let result = ingest_file(
        "latin1_products.csv",
        &fixture_bytes("latin1_products.csv"),
        None,
    )
    .expect("ingest");
    assert!(!result.column_mapped);
    assert!(!result.is_valid(), "no category means nothing to load");
    assert_eq!(result.headers(), ["SKU", "Nama", "Harga"]);
    assert_eq!(result.record.value(0, "Nama"), Some("Caf\u{e9} Latte"));
    assert_eq!(result.record.value(1, "Nama"), Some("Cr\u{e8}me"));
}

#[test]
fn spreadsheet_cells_are_read_and_summed() {
    let category = snapshot_category();
    let bytes = fixture_bytes("ba_produk_small.xlsx");
    let result = ingest_file("ba_produk_small.xlsx", &bytes, Some(&category)).expect("ingest");

    assert_eq!(result.headers(), ["SKU", "Nama Produk", "Total Stok"]);
    assert_eq!(result.total_rows, 3);
    assert_eq!(result.skipped_rows, 1);
    assert_eq!(
        result.record.rows(),
        [["KX-01", "Kaos", "12.5"], ["KX-02", "Topi", "3"]]
    );

    let raw = ingest_file("ba_produk_small.xlsx", &bytes, None).expect("ingest raw");
    assert_eq!(raw.headers(), ["SKU", "Product Name", "Stok A", "Stok B"]);
    assert_eq!(raw.record.rows()[0], ["KX-01", "Kaos", "10", "2.5"]);
    assert_eq!(raw.record.rows()[1], ["KX-02", "Topi", "3", "-"]);
}

#[test]
fn unknown_extension_probes_workbook_then_text() {
    let category = snapshot_category();
    let workbook = ingest_file(
        "export",
        &fixture_bytes("ba_produk_small.xlsx"),
        Some(&category),
    )
    .expect("workbook without extension");
    assert_eq!(workbook.record.len(), 2);

    let text = ingest_file("export", &csv_bytes(&["SKU,Stok A", "A1,4"]), Some(&category))
        .expect("text without extension");
    assert_eq!(text.record.rows(), [["A1", "", "4"]]);
}

#[test]
fn unreadable_inputs_are_reported() {
    let garbage = b"\x00\x01\x02 not a workbook".to_vec();
    assert!(matches!(
        ingest_file("export.bin", &garbage, None),
        Err(IngestError::Unsupported { .. })
    ));
    assert!(matches!(
        ingest_file("broken.xlsx", b"SKU,Nama", None),
        Err(IngestError::Workbook(_))
    ));
    assert!(matches!(
        ingest_file("binary.csv", &garbage, None),
        Err(IngestError::Decode(_))
    ));
}

#[test]
fn missing_header_row_is_an_error() {
    let category = CategoryConfig::new("Produk", vec!["SKU".into()]).with_offsets(3, 4);
    let err = ingest_file("short.csv", &csv_bytes(&["SKU", "A1"]), Some(&category)).unwrap_err();
    assert!(matches!(err, IngestError::NoHeaders { .. }));

    let blank_header = csv_bytes(&[",,", "A1,B,C"]);
    assert!(matches!(
        ingest_file("blank.csv", &blank_header, None),
        Err(IngestError::NoHeaders { .. })
    ));
}

#[test]
fn malformed_rules_fall_back_to_source_headers() {
    let category = CategoryConfig::new("Produk", vec!["SKU".into(), "Harga".into()])
        .with_aliases("Harga", &["*"]);
    let result = ingest_file(
        "produk.csv",
        &csv_bytes(&["SKU,Price", "A1,100"]),
        Some(&category),
    )
    .expect("ingest");
    assert!(!result.column_mapped);
    assert_eq!(result.headers(), ["SKU", "Price"]);
    assert_eq!(result.record.rows(), [["A1", "100"]]);
}

#[test]
fn pass_through_names_blank_headers_and_dedupes() {
    let result = ingest_file(
        "raw.csv",
        &csv_bytes(&["SKU,,sku,Qty", "A1,x,A2,3,extra"]),
        None,
    )
    .expect("ingest");
    assert_eq!(result.headers(), ["SKU", "column_1", "sku_1", "Qty"]);
    assert_eq!(result.record.rows(), [["A1", "x", "A2", "3"]]);
    assert_eq!(
        result.errors,
        ["Row 2: 1 value(s) beyond the last header were ignored"]
    );
}

#[test]
fn header_only_file_is_not_valid() {
    let catalog = catalog();
    let category = catalog.find("BA Produk SHO").expect("category");
    let result = ingest_file("empty.csv", &csv_bytes(&["SKU,Product Name"]), Some(category))
        .expect("ingest");
    assert!(result.record.is_empty());
    assert!(!result.is_valid());
    assert_eq!(result.total_rows, 0);
}
