//! Deposit query functions.

use num_bigint::BigUint;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use tss_types::{Deposit, DepositIdentifier, WithdrawalStatus};

use crate::{DbError, Result};

const COLUMNS: &str = "id, chain_id, tx_hash, tx_nonce, depositor, deposit_amount, \
     withdrawal_amount, deposit_token, withdrawal_token, receiver, deposit_block, \
     is_wrapped_token, withdrawal_chain_id, withdrawal_status, signature, withdrawal_tx_hash";

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Deposit> {
    let deposit_amount: String = row.get(5)?;
    let withdrawal_amount: String = row.get(6)?;
    let status: String = row.get(13)?;
    let tx_nonce: i64 = row.get(3)?;
    let deposit_block: i64 = row.get(10)?;
    Ok(Deposit {
        id: row.get(0)?,
        identifier: DepositIdentifier {
            chain_id: row.get(1)?,
            tx_hash: row.get(2)?,
            tx_nonce: tx_nonce as u64,
        },
        depositor: row.get(4)?,
        deposit_amount: deposit_amount
            .parse::<BigUint>()
            .map_err(|e| conversion_error(5, e))?,
        withdrawal_amount: withdrawal_amount
            .parse::<BigUint>()
            .map_err(|e| conversion_error(6, e))?,
        deposit_token: row.get(7)?,
        withdrawal_token: row.get(8)?,
        receiver: row.get(9)?,
        deposit_block: deposit_block as u64,
        is_wrapped_token: row.get(11)?,
        withdrawal_chain_id: row.get(12)?,
        withdrawal_status: status
            .parse::<WithdrawalStatus>()
            .map_err(|e| conversion_error(13, e))?,
        signature: row.get(14)?,
        withdrawal_tx_hash: row.get(15)?,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Insert a deposit and return its row id.
pub fn insert(conn: &Connection, deposit: &Deposit) -> Result<i64> {
    let id = &deposit.identifier;
    let result = conn.execute(
        "INSERT INTO deposits (chain_id, tx_hash, tx_nonce, depositor, deposit_amount,
             withdrawal_amount, deposit_token, withdrawal_token, receiver, deposit_block,
             is_wrapped_token, withdrawal_chain_id, withdrawal_status, signature,
             withdrawal_tx_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        rusqlite::params![
            id.chain_id,
            id.tx_hash,
            id.tx_nonce as i64,
            deposit.depositor,
            deposit.deposit_amount.to_string(),
            deposit.withdrawal_amount.to_string(),
            deposit.deposit_token,
            deposit.withdrawal_token,
            deposit.receiver,
            deposit.deposit_block as i64,
            deposit.is_wrapped_token,
            deposit.withdrawal_chain_id,
            deposit.withdrawal_status.as_str(),
            deposit.signature,
            deposit.withdrawal_tx_hash,
        ],
    );
    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => Err(DbError::Duplicate(id.clone())),
        Err(e) => Err(DbError::Sqlite(e)),
    }
}

/// Get a deposit by its identifier.
pub fn get(conn: &Connection, id: &DepositIdentifier) -> Result<Deposit> {
    conn.query_row(
        &format!(
            "SELECT {COLUMNS} FROM deposits WHERE chain_id = ?1 AND tx_hash = ?2 AND tx_nonce = ?3"
        ),
        rusqlite::params![id.chain_id, id.tx_hash, id.tx_nonce as i64],
        from_row,
    )
    .optional()?
    .ok_or_else(|| DbError::NotFound(format!("deposit {id}")))
}

/// The oldest pending deposit withdrawing to `withdrawal_chain_id`.
pub fn oldest_pending(conn: &Connection, withdrawal_chain_id: &str) -> Result<Option<Deposit>> {
    let deposit = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM deposits
                 WHERE withdrawal_chain_id = ?1 AND withdrawal_status = 'PENDING'
                 ORDER BY id ASC LIMIT 1"
            ),
            [withdrawal_chain_id],
            from_row,
        )
        .optional()?;
    Ok(deposit)
}

/// Record the withdrawal signature and mark the deposit processed.
pub fn mark_processed(
    conn: &Connection,
    id: &DepositIdentifier,
    signature: &str,
    withdrawal_tx_hash: Option<&str>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE deposits
         SET withdrawal_status = 'PROCESSED', signature = ?4,
             withdrawal_tx_hash = COALESCE(?5, withdrawal_tx_hash)
         WHERE chain_id = ?1 AND tx_hash = ?2 AND tx_nonce = ?3",
        rusqlite::params![
            id.chain_id,
            id.tx_hash,
            id.tx_nonce as i64,
            signature,
            withdrawal_tx_hash
        ],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("deposit {id}")));
    }
    Ok(())
}

/// Overwrite the withdrawal status.
pub fn set_status(conn: &Connection, id: &DepositIdentifier, status: WithdrawalStatus) -> Result<()> {
    let updated = conn.execute(
        "UPDATE deposits SET withdrawal_status = ?4
         WHERE chain_id = ?1 AND tx_hash = ?2 AND tx_nonce = ?3",
        rusqlite::params![id.chain_id, id.tx_hash, id.tx_nonce as i64, status.as_str()],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("deposit {id}")));
    }
    Ok(())
}

pub fn count_by_status(conn: &Connection, status: WithdrawalStatus) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM deposits WHERE withdrawal_status = ?1",
        [status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}
