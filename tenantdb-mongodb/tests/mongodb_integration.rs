//! Tests against a live MongoDB deployment.
//!
//! Set `TENANTDB_TEST_MONGODB_URL` (e.g. `mongodb://localhost:27017/tdb_it`)
//! to run them; without it every test returns early.

use serde_json::json;
use tenantdb_core::{
    DatabaseConfig, DatabaseLevelConfig, RowLevelConfig, StrategyKind, TenantDatabase, TenantId,
};
use tenantdb_mongodb::MongoAdapter;

fn server_url() -> Option<String> {
    std::env::var("TENANTDB_TEST_MONGODB_URL").ok().filter(|u| !u.is_empty())
}

#[tokio::test]
async fn test_row_level_isolation() {
    let Some(url) = server_url() else { return };

    let config = DatabaseConfig::new(url.clone())
        .with_strategy(StrategyKind::Row)
        .with_row_config(RowLevelConfig::new("tenant_id").table("tdb_it_orders"));
    let db = TenantDatabase::with_adapter(config, MongoAdapter::from_url(&url).unwrap()).unwrap();

    let acme = db.get_connection("acme").await.unwrap();
    let globex = db.get_connection("globex").await.unwrap();

    for conn in [&acme, &globex] {
        let _ = db
            .execute(conn, r#"{"op": "delete", "collection": "tdb_it_orders"}"#, &[])
            .await;
    }

    let insert = r#"{"op": "insert", "collection": "tdb_it_orders", "documents": [{"n": "$1"}]}"#;
    db.execute(&acme, insert, &[json!(1)]).await.unwrap();
    db.execute(&acme, insert, &[json!(2)]).await.unwrap();
    db.execute(&globex, insert, &[json!(3)]).await.unwrap();

    let count = db
        .execute(&acme, r#"{"op": "count", "collection": "tdb_it_orders"}"#, &[])
        .await
        .unwrap();
    assert_eq!(count.rows, vec![json!({"count": 2})]);

    let updated = db
        .execute(
            &globex,
            r#"{"op": "update", "collection": "tdb_it_orders", "filter": {}, "set": {"n": 30}}"#,
            &[],
        )
        .await
        .unwrap();
    assert_eq!(updated.rows_affected, 1);

    let mut tenants = db.list_tenants().await.unwrap();
    tenants.sort();
    assert_eq!(tenants, vec![TenantId::new("acme").unwrap(), TenantId::new("globex").unwrap()]);

    db.delete_tenant("acme").await.unwrap();
    let values = db
        .execute(
            &globex,
            r#"{"op": "distinct", "collection": "tdb_it_orders", "field": "n"}"#,
            &[],
        )
        .await
        .unwrap();
    assert_eq!(values.rows, vec![json!(30)]);

    db.delete_tenant("globex").await.unwrap();
    db.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_database_level_lifecycle() {
    let Some(url) = server_url() else { return };

    let config = DatabaseConfig::new(url.clone())
        .with_strategy(StrategyKind::Database)
        .with_database_config(DatabaseLevelConfig::default().with_prefix("tdb_it_"));
    let db = TenantDatabase::with_adapter(config, MongoAdapter::from_url(&url).unwrap()).unwrap();

    let _ = db.delete_tenant("acme").await;
    db.create_tenant("acme").await.unwrap();
    assert!(db.tenant_exists("acme").await.unwrap());
    assert!(db.create_tenant("acme").await.unwrap_err().is_already_exists());

    let conn = db.get_connection("acme").await.unwrap();
    assert_eq!(conn.database(), "tdb_it_acme");
    db.execute(
        &conn,
        r#"{"op": "insert", "collection": "users", "documents": [{"name": "Ada"}]}"#,
        &[],
    )
    .await
    .unwrap();
    let found = db
        .execute(&conn, r#"{"op": "find", "collection": "users", "filter": {"name": "Ada"}}"#, &[])
        .await
        .unwrap();
    assert_eq!(found.rows.len(), 1);
    assert_eq!(found.rows[0]["name"], json!("Ada"));
    drop(conn);

    db.delete_tenant("acme").await.unwrap();
    assert!(!db.tenant_exists("acme").await.unwrap());

    db.disconnect().await.unwrap();
}
