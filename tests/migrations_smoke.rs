use sqlx::Row;

fn database_url() -> Option<String> {
    dotenvy::dotenv().ok();

    std::env::var("SCANBRIDGE_TEST_DATABASE_URL").ok().filter(|url| !url.trim().is_empty())
}

#[tokio::test]
async fn migrations_apply_and_tables_exist() -> anyhow::Result<()> {
    let Some(database_url) = database_url() else {
        eprintln!("SCANBRIDGE_TEST_DATABASE_URL not set; skipping migration smoke test");
        return Ok(());
    };

    let pool =
        sqlx::postgres::PgPoolOptions::new().max_connections(1).connect(&database_url).await?;

    let migrations_dir =
        std::env::var("SCANBRIDGE_MIGRATIONS_DIR").unwrap_or_else(|_| "migrations".to_string());
    let migrator = sqlx::migrate::Migrator::new(std::path::Path::new(&migrations_dir)).await?;
    migrator.run(&pool).await?;

    let relations = [
        "artifacts",
        "artifacts_active_identity_key",
        "subject_mappings",
        "submission_requests",
        "submission_requests_single_flight_key",
        "audit_events",
    ];

    for relation in relations {
        let row =
            sqlx::query("SELECT to_regclass($1)::text").bind(relation).fetch_one(&pool).await?;
        let regclass: Option<String> = row.try_get(0)?;
        assert!(regclass.is_some(), "expected {relation} to exist after migrations");
    }

    Ok(())
}

#[tokio::test]
async fn audit_events_reject_updates_and_deletes() -> anyhow::Result<()> {
    let Some(database_url) = database_url() else {
        return Ok(());
    };

    let pool =
        sqlx::postgres::PgPoolOptions::new().max_connections(1).connect(&database_url).await?;
    let migrator = sqlx::migrate::Migrator::new(std::path::Path::new("migrations")).await?;
    migrator.run(&pool).await?;

    let id: i64 = sqlx::query_scalar(
        "INSERT INTO audit_events (occurred_at, actor_ref, entity_ref, event_type, detail) \
         VALUES (NOW(), 'system', 'artifact:smoke', 'smoke_test', '{}'::jsonb) RETURNING id",
    )
    .fetch_one(&pool)
    .await?;

    let update = sqlx::query("UPDATE audit_events SET event_type = 'tampered' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await;
    assert!(update.is_err(), "audit rows must be immutable");

    let delete = sqlx::query("DELETE FROM audit_events WHERE id = $1").bind(id).execute(&pool).await;
    assert!(delete.is_err(), "audit rows must not be deleted");

    Ok(())
}
