// Live Postgres tests: `ATPG_TEST_DATABASE_URL=... cargo test -- --ignored`

use std::sync::Arc;

use atpg_core::{FieldMapping, FieldSet, TableName};
use atpg_storage::{PgRecordStore, RecordStore, RecordStoreBackend, StoreSession};
use serde_json::json;
use sqlx::PgPool;

async fn scratch_table(pool: &PgPool, name: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS \"{name}\""))
        .execute(pool)
        .await
        .expect("drop scratch table");
    sqlx::query(&format!(
        "CREATE TABLE \"{name}\" (
            airtable_id text PRIMARY KEY,
            record_id text,
            \"Startup name\" text,
            \"PH1_Constitution_Location\" text,
            date_sourced date
        )"
    ))
    .execute(pool)
    .await
    .expect("create scratch table");
}

async fn row_count(pool: &PgPool, name: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{name}\""))
        .fetch_one(pool)
        .await
        .expect("count rows")
}

fn fields(value: serde_json::Value) -> FieldSet {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
#[ignore = "Requires ATPG_TEST_DATABASE_URL"]
async fn upsert_round_trip_against_postgres() {
    let url = std::env::var("ATPG_TEST_DATABASE_URL").expect("ATPG_TEST_DATABASE_URL");
    let pool = PgPool::connect(&url).await.expect("connect");
    let name = format!("atpg_it_{}", std::process::id());
    scratch_table(&pool, &name).await;

    let mapping = Arc::new(FieldMapping::default());
    let store = PgRecordStore::new(pool.clone(), &TableName::parse(&name).unwrap(), mapping);
    let queries = store.queries().await.unwrap();
    assert!(queries.insert.contains("CAST($5 AS date)"));

    let mut session = store.begin().await.unwrap();
    assert!(session.find_by_identifier("rec1").await.unwrap().is_none());
    let created = fields(json!({"Startup name": "Acme", "date_sourced": "2024-01-01", "Extra": 1}));
    session.create("rec1", &created).await.unwrap();
    session.commit().await.unwrap();
    assert_eq!(row_count(&pool, &name).await, 1);

    let mut session = store.begin().await.unwrap();
    let row = session.find_by_identifier("rec1").await.unwrap().unwrap();
    assert_eq!(row.get("Startup name"), Some("Acme"));
    assert_eq!(row.get("date_sourced"), Some("2024-01-01"));
    assert_eq!(row.get("PH1_Constitution_Location"), None);

    let affected = session
        .update("rec1", &fields(json!({"Startup name": "Acme Labs"})))
        .await
        .unwrap();
    assert_eq!(affected, 1);
    assert_eq!(session.update("missing", &FieldSet::new()).await.unwrap(), 0);
    session.commit().await.unwrap();

    let mut session = store.begin().await.unwrap();
    let row = session.find_by_identifier("rec1").await.unwrap().unwrap();
    assert_eq!(row.get("Startup name"), Some("Acme Labs"));
    assert_eq!(row.get("date_sourced"), None);

    assert!(session.create("rec1", &FieldSet::new()).await.is_err());
    session.rollback().await.unwrap();

    let mut session = store.begin().await.unwrap();
    session.create("rec2", &FieldSet::new()).await.unwrap();
    session.rollback().await.unwrap();
    assert_eq!(row_count(&pool, &name).await, 1);

    sqlx::query(&format!("DROP TABLE \"{name}\""))
        .execute(&pool)
        .await
        .expect("drop scratch table");
}

#[tokio::test]
#[ignore = "Requires ATPG_TEST_DATABASE_URL"]
async fn missing_table_is_reported_on_begin() {
    let url = std::env::var("ATPG_TEST_DATABASE_URL").expect("ATPG_TEST_DATABASE_URL");
    let pool = PgPool::connect(&url).await.expect("connect");
    let table = TableName::parse("atpg_no_such_table").unwrap();
    let store = PgRecordStore::new(pool, &table, Arc::new(FieldMapping::default()));

    let err = store.begin().await.err().unwrap();
    assert_eq!(err.to_string(), "table atpg_no_such_table does not exist");
}
