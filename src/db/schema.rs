use sqlx::PgPool;

/// Create the ledger tables if they do not exist yet
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    tracing::info!("Initializing ledger schema...");

    for (name, ddl) in [
        ("accounts", CREATE_ACCOUNTS_TABLE),
        ("entries", CREATE_ENTRIES_TABLE),
        ("transfers", CREATE_TRANSFERS_TABLE),
    ] {
        sqlx::query(ddl).execute(pool).await?;
        tracing::debug!(table = name, "Table ready");
    }

    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    tracing::info!("Ledger schema initialized");
    Ok(())
}

const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id          BIGSERIAL PRIMARY KEY,
    owner       VARCHAR NOT NULL,
    balance     BIGINT NOT NULL,
    currency    VARCHAR NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

// Entries are signed: negative = debit, positive = credit
const CREATE_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id          BIGSERIAL PRIMARY KEY,
    account_id  BIGINT NOT NULL REFERENCES accounts (id),
    amount      BIGINT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_TRANSFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id               BIGSERIAL PRIMARY KEY,
    from_account_id  BIGINT NOT NULL REFERENCES accounts (id),
    to_account_id    BIGINT NOT NULL REFERENCES accounts (id),
    amount           BIGINT NOT NULL CHECK (amount > 0),
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const INDEXES: [&str; 5] = [
    "CREATE INDEX IF NOT EXISTS accounts_owner_idx ON accounts (owner)",
    "CREATE INDEX IF NOT EXISTS entries_account_id_idx ON entries (account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_from_account_id_idx ON transfers (from_account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_to_account_id_idx ON transfers (to_account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_from_to_idx ON transfers (from_account_id, to_account_id)",
];
