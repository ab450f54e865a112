//! `service migrate up|down`.

use std::path::Path;

use tracing::info;

use super::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

pub fn run(database: &Path, direction: Direction) -> anyhow::Result<Outcome> {
    let conn = tss_db::open_unmigrated(database)?;
    match direction {
        Direction::Up => {
            let applied = tss_db::migrations::up(&conn)?;
            info!(applied, path = %database.display(), "migrations applied");
        }
        Direction::Down => {
            let version = tss_db::migrations::down(&conn)?;
            info!(version, path = %database.display(), "migration reverted");
        }
    }
    Ok(Outcome::Success)
}
