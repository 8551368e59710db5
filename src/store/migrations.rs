use rusqlite::Connection;

/// Bring the schema up to date. Each step is idempotent.
pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
         INSERT INTO schema_version SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version);",
    )?;

    let version = schema_version(conn)?;

    if version < 1 {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settings (
                id                INTEGER PRIMARY KEY CHECK (id = 1),
                image_root        TEXT NOT NULL,
                thumb_root        TEXT NOT NULL,
                resolution        TEXT NOT NULL,
                interval_ms       INTEGER NOT NULL,
                order_mode        TEXT NOT NULL DEFAULT 'added',
                slideshow_enabled INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS images (
                id            INTEGER PRIMARY KEY,
                filename      TEXT NOT NULL UNIQUE,
                original_name TEXT NOT NULL DEFAULT '',
                title         TEXT NOT NULL DEFAULT '',
                description   TEXT NOT NULL DEFAULT '',
                metadata_json TEXT NOT NULL DEFAULT '{}',
                width         INTEGER NOT NULL DEFAULT 0,
                height        INTEGER NOT NULL DEFAULT 0,
                enabled       INTEGER NOT NULL DEFAULT 1,
                sort_order    INTEGER NOT NULL DEFAULT 0,
                times_shown   INTEGER NOT NULL DEFAULT 0,
                last_shown_at TEXT,
                created_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_images_enabled ON images(enabled);
            UPDATE schema_version SET version = 1;
            ",
        )?;
    }

    if version < 2 {
        conn.execute_batch(
            "
            ALTER TABLE images ADD COLUMN crop_x REAL NOT NULL DEFAULT 0;
            ALTER TABLE images ADD COLUMN crop_y REAL NOT NULL DEFAULT 0;
            ALTER TABLE images ADD COLUMN crop_width REAL NOT NULL DEFAULT 100;
            ALTER TABLE images ADD COLUMN crop_height REAL NOT NULL DEFAULT 100;
            UPDATE schema_version SET version = 2;
            ",
        )?;
    }

    if version < 3 {
        // existing images keep crop-and-fill
        conn.execute_batch(
            "
            ALTER TABLE images ADD COLUMN preserve_aspect_ratio INTEGER NOT NULL DEFAULT 0;
            UPDATE schema_version SET version = 3;
            ",
        )?;
    }

    Ok(())
}

pub fn schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))
}
