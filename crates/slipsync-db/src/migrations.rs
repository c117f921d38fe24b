//! Forward-only schema migrations for Slipsync
//!
//! Migrations are numbered and applied in order inside one transaction per
//! migration. The applied set is tracked in syncv3_migrations.

use sqlx::PgPool;
use tracing::{debug, info, instrument};

use slipsync_core::{Result, SlipsyncError};

/// One numbered migration
struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
    CREATE SEQUENCE IF NOT EXISTS syncv3_event_nids_seq;
    CREATE SEQUENCE IF NOT EXISTS syncv3_snapshots_seq;
    CREATE SEQUENCE IF NOT EXISTS syncv3_to_device_seq;
    CREATE SEQUENCE IF NOT EXISTS syncv3_typing_seq;

    CREATE TABLE IF NOT EXISTS syncv3_events (
        event_nid BIGINT PRIMARY KEY DEFAULT nextval('syncv3_event_nids_seq'),
        event_id TEXT NOT NULL UNIQUE,
        room_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        state_key TEXT,
        sender TEXT NOT NULL DEFAULT '',
        origin_server_ts BIGINT NOT NULL DEFAULT 0,
        event JSONB NOT NULL,
        is_state BOOLEAN NOT NULL DEFAULT FALSE,
        missing_previous BOOLEAN NOT NULL DEFAULT FALSE,
        prev_batch TEXT
    );
    CREATE INDEX IF NOT EXISTS syncv3_events_room_nid_idx ON syncv3_events (room_id, event_nid);
    CREATE INDEX IF NOT EXISTS syncv3_events_type_skey_idx ON syncv3_events (event_type, state_key, event_nid);

    CREATE TABLE IF NOT EXISTS syncv3_snapshots (
        snapshot_id BIGINT PRIMARY KEY DEFAULT nextval('syncv3_snapshots_seq'),
        room_id TEXT NOT NULL,
        membership_events BIGINT[] NOT NULL,
        other_events BIGINT[] NOT NULL
    );
    CREATE INDEX IF NOT EXISTS syncv3_snapshots_room_idx ON syncv3_snapshots (room_id, snapshot_id);

    CREATE TABLE IF NOT EXISTS syncv3_rooms (
        room_id TEXT PRIMARY KEY,
        current_after_snapshot_id BIGINT NOT NULL DEFAULT 0,
        last_prev_batch TEXT
    );

    CREATE TABLE IF NOT EXISTS syncv3_devices (
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        since TEXT NOT NULL DEFAULT '',
        since_updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, device_id)
    );

    CREATE TABLE IF NOT EXISTS syncv3_tokens (
        token TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        last_seen TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    CREATE INDEX IF NOT EXISTS syncv3_tokens_device_idx ON syncv3_tokens (user_id, device_id);

    CREATE TABLE IF NOT EXISTS syncv3_to_device_messages (
        position BIGINT PRIMARY KEY DEFAULT nextval('syncv3_to_device_seq'),
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        message JSONB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS syncv3_to_device_device_idx ON syncv3_to_device_messages (user_id, device_id, position);

    CREATE TABLE IF NOT EXISTS syncv3_account_data (
        user_id TEXT NOT NULL,
        room_id TEXT NOT NULL DEFAULT '',
        type TEXT NOT NULL,
        content JSONB NOT NULL,
        PRIMARY KEY (user_id, room_id, type)
    );

    CREATE TABLE IF NOT EXISTS syncv3_invites (
        user_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        invite_state JSONB NOT NULL,
        PRIMARY KEY (user_id, room_id)
    );

    CREATE TABLE IF NOT EXISTS syncv3_device_data (
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        data JSONB NOT NULL,
        PRIMARY KEY (user_id, device_id)
    );

    CREATE TABLE IF NOT EXISTS syncv3_typing (
        room_id TEXT PRIMARY KEY,
        stream_id BIGINT NOT NULL,
        user_ids TEXT[] NOT NULL
    );

    CREATE TABLE IF NOT EXISTS syncv3_unread (
        user_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        notification_count BIGINT NOT NULL DEFAULT 0,
        highlight_count BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, room_id)
    );

    CREATE TABLE IF NOT EXISTS syncv3_receipts (
        room_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        receipt_type TEXT NOT NULL,
        event_id TEXT NOT NULL,
        data JSONB NOT NULL,
        PRIMARY KEY (room_id, user_id, receipt_type)
    );
    "#,
}];

/// Apply all pending migrations
#[instrument(level = "debug", skip(pool))]
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    debug!("🔧 Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS syncv3_migrations (
            version INT PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| SlipsyncError::Database(e.to_string()))?;

    let applied: Option<i32> = sqlx::query_scalar("SELECT max(version) FROM syncv3_migrations")
        .fetch_one(pool)
        .await
        .map_err(|e| SlipsyncError::Database(e.to_string()))?;
    let applied = applied.unwrap_or(0);

    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        let mut txn = pool
            .begin()
            .await
            .map_err(|e| SlipsyncError::Database(e.to_string()))?;

        sqlx::raw_sql(migration.sql)
            .execute(&mut *txn)
            .await
            .map_err(|e| SlipsyncError::Database(e.to_string()))?;

        sqlx::query("INSERT INTO syncv3_migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *txn)
            .await
            .map_err(|e| SlipsyncError::Database(e.to_string()))?;

        txn.commit()
            .await
            .map_err(|e| SlipsyncError::Database(e.to_string()))?;
        info!("✅ Applied migration {} ({})", migration.version, migration.name);
    }

    Ok(())
}
