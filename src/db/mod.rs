use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::PathBuf;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Open (or create) the engine database inside `workspace_dir` and bring the
/// schema up to date. The settings row is not seeded here; it is created on
/// first read.
pub fn init_db(workspace_dir: PathBuf) -> Result<DbPool> {
    std::fs::create_dir_all(&workspace_dir)?;
    let db_path = workspace_dir.join("helpdesk_ai.db");
    let mgr = SqliteConnectionManager::file(&db_path);
    let pool = Pool::new(mgr)?;
    {
        let conn = pool.get()?;
        apply_migrations(&conn)?;
    }
    Ok(pool)
}

pub(crate) fn apply_migrations(conn: &Connection) -> Result<()> {
    let migrations: &[(&str, &str)] = &[
        (
            "0001_ai_settings.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/migrations/0001_ai_settings.sql"
            )),
        ),
        (
            "0002_ai_usage_log.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/migrations/0002_ai_usage_log.sql"
            )),
        ),
        (
            "0003_event_log.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/migrations/0003_event_log.sql"
            )),
        ),
    ];

    for (name, sql) in migrations {
        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {name}"))?;
    }
    Ok(())
}
