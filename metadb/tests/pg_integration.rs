//! Store integration tests. They need a live Postgres reachable through
//! `FACTORKEEPER_TEST_DATABASE_URL` and are ignored by default:
//!
//! ```sh
//! FACTORKEEPER_TEST_DATABASE_URL=postgres://localhost/fk_test \
//!     cargo test -p factorkeeper-metadb -- --ignored
//! ```

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use factorkeeper_lib::config::{FACTOR_LENGTH, INIT_VERSION, TICK_LENGTH};
use factorkeeper_lib::{ErrorKind, ResultFrame};
use factorkeeper_metadb::MetaDb;

fn test_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
}

fn frame_of(columns: &[(&str, f64)], rows: usize) -> ResultFrame {
    let start = test_day().and_time(NaiveTime::from_hms_opt(9, 30, 3).unwrap());
    let datetime = (0..rows)
        .map(|i| start + chrono::Duration::seconds(3 * i as i64))
        .collect();
    let date = vec![test_day(); rows];
    let columns: BTreeMap<String, Vec<f64>> = columns
        .iter()
        .map(|(name, value)| (name.to_string(), vec![*value; rows]))
        .collect();
    ResultFrame::from_columns(datetime, date, columns).unwrap()
}

async fn connect() -> MetaDb {
    let url = std::env::var("FACTORKEEPER_TEST_DATABASE_URL")
        .expect("FACTORKEEPER_TEST_DATABASE_URL must point at a test database");
    let db = MetaDb::connect(&url, 4).await.expect("connect");
    db.bootstrap().await.expect("bootstrap");
    db
}

/// Register an empty source table so the stock counts as available.
async fn seed_source_stock(db: &MetaDb, stock: &str) {
    sqlx::raw_sql(&format!(
        r#"
        CREATE SCHEMA IF NOT EXISTS "fk_tick_source";
        CREATE TABLE IF NOT EXISTS "fk_tick_source"."{stock}" (
            "datetime" timestamp without time zone NOT NULL,
            "date" date NOT NULL,
            "last" double precision
        )
        "#
    ))
    .execute(db.pool())
    .await
    .expect("seed source table");
}

fn unique(prefix: &str) -> String {
    format!(
        "{prefix}_{}",
        chrono::Utc::now().timestamp_micros() as u64 % 1_000_000_000
    )
}

#[ignore]
#[tokio::test]
async fn test_factor_day_write_is_idempotent() {
    let db = connect().await;
    let factor = unique("itest_f");
    let stock = unique("ITEST.SZ");
    seed_source_stock(&db, &stock).await;

    db.register_factor(&factor, b"generator").await.unwrap();
    db.create_linkage(&factor, INIT_VERSION, &stock).await.unwrap();
    let linkage_id = db.get_linkage_id(&factor, INIT_VERSION, &stock).await.unwrap();
    db.create_result_table(&factor, linkage_id).await.unwrap();

    let frame = frame_of(&[(factor.as_str(), 1.5)], FACTOR_LENGTH);

    // deliver the same day twice: the second delivery must fully replace
    // the first, not double it
    db.ingest_factor_frame(&factor, INIT_VERSION, &stock, test_day(), &frame)
        .await
        .unwrap();
    db.ingest_factor_frame(&factor, INIT_VERSION, &stock, test_day(), &frame)
        .await
        .unwrap();

    let loaded = db
        .load_factor_result(&factor, INIT_VERSION, &stock, test_day())
        .await
        .unwrap();
    assert_eq!(loaded.row_count(), FACTOR_LENGTH);

    let updated = db
        .list_updated_dates(&factor, INIT_VERSION, &stock)
        .await
        .unwrap();
    assert_eq!(updated, vec![test_day()]);
}

#[ignore]
#[tokio::test]
async fn test_group_frame_missing_member_rejected() {
    let db = connect().await;
    let member_a = unique("itest_ga");
    let member_b = unique("itest_gb");
    let stock = unique("ITEST.SZ");
    seed_source_stock(&db, &stock).await;

    let group = db
        .register_group_factor(&[member_a.clone(), member_b.clone()], b"generator")
        .await
        .unwrap();
    db.create_linkage(&group, INIT_VERSION, &stock).await.unwrap();
    let linkage_id = db.get_linkage_id(&group, INIT_VERSION, &stock).await.unwrap();
    db.create_group_result_table(&[member_a.clone(), member_b.clone()], linkage_id)
        .await
        .unwrap();

    let partial = frame_of(&[(member_a.as_str(), 1.0)], FACTOR_LENGTH);
    let err = db
        .ingest_factor_frame(&group, INIT_VERSION, &stock, test_day(), &partial)
        .await
        .unwrap_err();
    assert_eq!(err, ErrorKind::GroupFactorSignatureNotMatched);

    // nothing became visible
    assert!(db
        .list_updated_dates(&group, INIT_VERSION, &stock)
        .await
        .unwrap()
        .is_empty());
}

#[ignore]
#[tokio::test]
async fn test_view_day_composes_member_columns() {
    let db = connect().await;
    let stock_a = unique("IVA.SZ");
    let stock_b = unique("IVB.SZ");
    let view = format!("{}.VIEW", unique("IV"));
    seed_source_stock(&db, &stock_a).await;
    seed_source_stock(&db, &stock_b).await;

    for stock in [&stock_a, &stock_b] {
        db.create_tick_table(stock).await.unwrap();
        let full = frame_of(&[("last", 10.0), ("volume", 5.0)], TICK_LENGTH);
        db.ingest_tick_frame(stock, test_day(), &full).await.unwrap();
    }

    let relation: BTreeMap<String, Vec<String>> = [
        (stock_a.clone(), vec!["last".to_string()]),
        (stock_b.clone(), vec!["last".to_string(), "volume".to_string()]),
    ]
    .into_iter()
    .collect();
    db.create_stock_view(&view, &relation).await.unwrap();

    let composed = db.compose_view_day(&view, &relation, test_day()).await.unwrap();
    assert_eq!(composed.row_count(), TICK_LENGTH);
    let mut columns = composed.factor_columns();
    columns.sort_unstable();
    let mut expected = vec![
        format!("last_{stock_a}"),
        format!("last_{stock_b}"),
        format!("volume_{stock_b}"),
    ];
    expected.sort_unstable();
    assert_eq!(
        columns,
        expected.iter().map(String::as_str).collect::<Vec<_>>()
    );
}

#[ignore]
#[tokio::test]
async fn test_tick_day_write_round_trip() {
    let db = connect().await;
    let stock = unique("ITICK.SZ");
    seed_source_stock(&db, &stock).await;
    db.create_tick_table(&stock).await.unwrap();

    let short = frame_of(&[("last", 10.0)], 100);
    assert_eq!(
        db.ingest_tick_frame(&stock, test_day(), &short)
            .await
            .unwrap_err(),
        ErrorKind::TickResultIncorrect
    );

    let full = frame_of(&[("last", 10.0)], TICK_LENGTH);
    db.ingest_tick_frame(&stock, test_day(), &full).await.unwrap();
    db.ingest_tick_frame(&stock, test_day(), &full).await.unwrap();

    let loaded = db
        .load_tick_day(&stock, test_day(), Some(&["last".to_string()]))
        .await
        .unwrap();
    assert_eq!(loaded.row_count(), TICK_LENGTH);
    assert_eq!(db.list_tick_updated_dates(&stock).await.unwrap(), vec![test_day()]);
}
