//! Database migrations.
//!
//! Schema version stored in `PRAGMA user_version`. [`up`] applies every
//! pending migration; [`down`] reverts the latest one.

use rusqlite::Connection;

use crate::{schema, DbError, Result, SCHEMA_VERSION};

fn current_version(conn: &Connection) -> Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(DbError::Sqlite)
}

/// Run all pending migrations.
pub fn run(conn: &Connection) -> Result<()> {
    up(conn).map(|_| ())
}

/// Apply pending migrations, returning how many ran.
pub fn up(conn: &Connection) -> Result<u32> {
    let current = current_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(DbError::Migration(format!(
            "database version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        tracing::info!(version, "applying migration");
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration_up(version)?)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }
    Ok(SCHEMA_VERSION - current)
}

/// Revert the latest applied migration. Returns the new version.
pub fn down(conn: &Connection) -> Result<u32> {
    let current = current_version(conn)?;
    if current == 0 {
        tracing::info!("no migrations to revert");
        return Ok(0);
    }
    tracing::info!(version = current, "reverting migration");
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(migration_down(current)?)?;
    tx.pragma_update(None, "user_version", current - 1)?;
    tx.commit()?;
    Ok(current - 1)
}

fn migration_up(version: u32) -> Result<&'static str> {
    match version {
        1 => Ok(schema::SCHEMA_V1),
        _ => Err(DbError::Migration(format!("unknown migration version: {version}"))),
    }
}

fn migration_down(version: u32) -> Result<&'static str> {
    match version {
        1 => Ok(schema::DROP_V1),
        _ => Err(DbError::Migration(format!("unknown migration version: {version}"))),
    }
}
