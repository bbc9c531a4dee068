//! Table definitions and the schema-version bootstrap.
//!
//! The version lives in `sync_state` under `schema_version`. There is a
//! single schema revision so far; `migrate` creates everything on a fresh
//! database and refuses to open one written by a newer build.

use rusqlite::{params, Connection, OptionalExtension};

use super::DbError;

const VERSION_KEY: &str = "schema_version";
const CURRENT_VERSION: i64 = 1;

/// Bring the database up to the current schema. Idempotent.
pub fn migrate(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )?;

    match stored_version(conn)? {
        Some(version) if version > CURRENT_VERSION => Err(DbError::Config(format!(
            "database schema version {version} is newer than supported version {CURRENT_VERSION}"
        ))),
        Some(_) => Ok(()),
        None => {
            create_schema(conn)?;
            conn.execute(
                r#"
                INSERT INTO sync_state (key, value, updated_at)
                VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![VERSION_KEY, CURRENT_VERSION.to_string()],
            )?;
            Ok(())
        }
    }
}

fn stored_version(conn: &Connection) -> Result<Option<i64>, DbError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1 LIMIT 1",
            params![VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        None => Ok(None),
        Some(value) => value
            .parse::<i64>()
            .map(Some)
            .map_err(|_| DbError::Config(format!("invalid schema version in database: {value}"))),
    }
}

fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS mail_accounts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            email_address TEXT NOT NULL,
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            scope TEXT,
            token_expires_at TEXT,
            history_id TEXT,
            watch_active BOOLEAN NOT NULL DEFAULT false,
            watch_expires_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS notion_accounts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            workspace_name TEXT,
            access_token TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mappings (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            mail_account_id TEXT REFERENCES mail_accounts(id) ON DELETE CASCADE,
            notion_account_id TEXT REFERENCES notion_accounts(id) ON DELETE SET NULL,
            notion_database_id TEXT NOT NULL,
            labels TEXT,
            label_ids TEXT,
            enabled BOOLEAN NOT NULL DEFAULT true
        );

        CREATE TABLE IF NOT EXISTS links (
            gmail_message_id TEXT PRIMARY KEY,
            gmail_thread_id TEXT NOT NULL DEFAULT '',
            notion_page_id TEXT NOT NULL,
            checksum TEXT NOT NULL,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            mail_account_id TEXT NOT NULL REFERENCES mail_accounts(id) ON DELETE CASCADE,
            mapping_id TEXT REFERENCES mappings(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_mail_accounts_user_id ON mail_accounts(user_id);
        CREATE INDEX IF NOT EXISTS idx_mail_accounts_email ON mail_accounts(email_address);
        CREATE INDEX IF NOT EXISTS idx_mappings_user_id ON mappings(user_id);
        CREATE INDEX IF NOT EXISTS idx_links_mail_account_id ON links(mail_account_id);
        CREATE INDEX IF NOT EXISTS idx_links_mapping_id ON links(mapping_id);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rusqlite::{params, Connection};
    use uuid::Uuid;

    use super::{migrate, stored_version, CURRENT_VERSION, VERSION_KEY};

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("mailsink-schema-{}.db", Uuid::new_v4()))
    }

    #[test]
    fn fresh_database_is_stamped_with_current_version() {
        let path = temp_db_path();
        let conn = Connection::open(&path).expect("open");

        migrate(&conn).expect("migrate");
        assert_eq!(stored_version(&conn).expect("version"), Some(CURRENT_VERSION));

        // A second run is a no-op, not an error.
        migrate(&conn).expect("migrate again");
        assert_eq!(stored_version(&conn).expect("version"), Some(CURRENT_VERSION));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn newer_schema_version_is_refused() {
        let path = temp_db_path();
        let conn = Connection::open(&path).expect("open");
        migrate(&conn).expect("migrate");

        conn.execute(
            "UPDATE sync_state SET value = ?1 WHERE key = ?2",
            params!["99", VERSION_KEY],
        )
        .expect("bump version");

        let error = migrate(&conn).expect_err("newer version must be refused");
        assert!(error.to_string().contains("newer than supported"));

        let _ = std::fs::remove_file(path);
    }
}
