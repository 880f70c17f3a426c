//! Schema setup. Run once per pool on open; every statement is `IF NOT
//! EXISTS` so opening an already-initialized database is a no-op.

use sqlx::SqlitePool;

pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tickets (
            reference_no TEXT PRIMARY KEY,
            booking_date TEXT NOT NULL,
            pax_a INTEGER NOT NULL DEFAULT 0,
            used_a INTEGER NOT NULL DEFAULT 0,
            pax_b INTEGER NOT NULL DEFAULT 0,
            used_b INTEGER NOT NULL DEFAULT 0,
            pax_c INTEGER NOT NULL DEFAULT 0,
            used_c INTEGER NOT NULL DEFAULT 0,
            is_synced INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_scan TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tickets_booking_date ON tickets(booking_date)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tickets_is_synced ON tickets(is_synced)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS scan_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_ref TEXT NOT NULL,
            scan_time TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            result TEXT NOT NULL,
            reason TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scan_history_ticket_ref ON scan_history(ticket_ref)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scan_history_scan_time ON scan_history(scan_time)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
