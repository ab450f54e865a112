//! SQL schema definitions.

/// Schema version 1.
pub const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS deposits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chain_id TEXT NOT NULL,
    tx_hash TEXT NOT NULL,
    tx_nonce INTEGER NOT NULL,
    depositor TEXT,
    deposit_amount TEXT NOT NULL,
    withdrawal_amount TEXT NOT NULL,
    deposit_token TEXT NOT NULL,
    withdrawal_token TEXT NOT NULL,
    receiver TEXT NOT NULL,
    deposit_block INTEGER NOT NULL,
    is_wrapped_token INTEGER NOT NULL DEFAULT 0,
    withdrawal_chain_id TEXT NOT NULL,
    withdrawal_status TEXT NOT NULL DEFAULT 'PENDING'
        CHECK (withdrawal_status IN ('PENDING', 'PROCESSED', 'INVALID', 'FAILED')),
    signature TEXT,
    withdrawal_tx_hash TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_deposits_identifier
    ON deposits(chain_id, tx_hash, tx_nonce);

CREATE INDEX IF NOT EXISTS idx_deposits_pending
    ON deposits(withdrawal_chain_id, withdrawal_status, id);
"#;

/// Reverts [`SCHEMA_V1`].
pub const DROP_V1: &str = r#"
DROP INDEX IF EXISTS idx_deposits_pending;
DROP INDEX IF EXISTS idx_deposits_identifier;
DROP TABLE IF EXISTS deposits;
"#;
