//! Persistent sync state: connected accounts, mapping rules, and the link
//! table that makes ingestion idempotent.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use self::models::{Link, MailAccount, Mapping, NotionAccount, User, WatchState, WatchStatePatch};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub mod models;
pub mod schema;

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_users: i64,
    pub total_mail_accounts: i64,
    pub total_notion_accounts: i64,
    pub total_mappings: i64,
    pub total_links: i64,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

const MAIL_ACCOUNT_COLUMNS: &str = "id, user_id, email_address, access_token, refresh_token, \
     scope, token_expires_at, history_id, watch_active, watch_expires_at";

const MAPPING_COLUMNS: &str = "id, user_id, mail_account_id, notion_account_id, \
     notion_database_id, labels, label_ids, enabled";

const LINK_COLUMNS: &str = "gmail_message_id, gmail_thread_id, notion_page_id, checksum, \
     user_id, mail_account_id, mapping_id";

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let mut db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        schema::migrate(&self.conn)
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".mailsink").join("mailsink.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- users ---

    /// Find-or-create by email; every core call is scoped to a user id.
    pub fn upsert_user(&self, email: &str) -> Result<User, DbError> {
        if let Some(user) = self.find_user(email)? {
            return Ok(user);
        }
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
        };
        self.conn.execute(
            "INSERT INTO users (id, email) VALUES (?, ?)",
            params![user.id, user.email],
        )?;
        Ok(user)
    }

    pub fn find_user(&self, email: &str) -> Result<Option<User>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, email FROM users WHERE email = ? LIMIT 1")?;
        let mut rows = stmt.query([email])?;
        if let Some(row) = rows.next()? {
            Ok(Some(User::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, email FROM users WHERE id = ? LIMIT 1")?;
        let mut rows = stmt.query([user_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(User::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn remove_user(&self, user_id: &str) -> Result<usize, DbError> {
        Ok(self
            .conn
            .execute("DELETE FROM users WHERE id = ?", [user_id])?)
    }

    // --- mail accounts ---

    pub fn insert_mail_account(&self, account: &MailAccount) -> Result<(), DbError> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO mail_accounts ({MAIL_ACCOUNT_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                account.id,
                account.user_id,
                account.email_address,
                account.access_token,
                account.refresh_token,
                account.scope,
                account.token_expires_at,
                account.history_id,
                account.watch_active,
                account.watch_expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_mail_account(&self, id: &str) -> Result<Option<MailAccount>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MAIL_ACCOUNT_COLUMNS} FROM mail_accounts WHERE id = ? LIMIT 1"
        ))?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(MailAccount::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Push notifications identify the mailbox only by its address.
    pub fn find_mail_account_by_email(&self, email: &str) -> Result<Option<MailAccount>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MAIL_ACCOUNT_COLUMNS} FROM mail_accounts WHERE email_address = ? LIMIT 1"
        ))?;
        let mut rows = stmt.query([email])?;
        if let Some(row) = rows.next()? {
            Ok(Some(MailAccount::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_mail_accounts(&self, user_id: &str) -> Result<Vec<MailAccount>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MAIL_ACCOUNT_COLUMNS} FROM mail_accounts WHERE user_id = ? \
             ORDER BY email_address ASC"
        ))?;
        let accounts = stmt
            .query_map([user_id], MailAccount::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    pub fn remove_mail_account(&self, id: &str) -> Result<usize, DbError> {
        Ok(self
            .conn
            .execute("DELETE FROM mail_accounts WHERE id = ?", [id])?)
    }

    /// Persist a refreshed credential immediately so concurrent and
    /// subsequent calls reuse it.
    pub fn update_mail_account_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        scope: Option<&str>,
        token_expires_at: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            UPDATE mail_accounts SET
                access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                scope = COALESCE(?, scope),
                token_expires_at = COALESCE(?, token_expires_at)
            WHERE id = ?
            "#,
            params![access_token, refresh_token, scope, token_expires_at, id],
        )?;
        Ok(())
    }

    pub fn watch_state(&self, account_id: &str) -> Result<Option<WatchState>, DbError> {
        Ok(self
            .get_mail_account(account_id)?
            .map(|account| account.watch_state()))
    }

    /// Field-level patch of the cursor/watch columns: only `Some` fields in
    /// the patch are written.
    pub fn patch_watch_state(
        &self,
        account_id: &str,
        patch: WatchStatePatch,
    ) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            UPDATE mail_accounts SET
                history_id = COALESCE(?, history_id),
                watch_active = COALESCE(?, watch_active),
                watch_expires_at = COALESCE(?, watch_expires_at)
            WHERE id = ?
            "#,
            params![
                patch.history_id,
                patch.watch_active,
                patch.watch_expires_at,
                account_id
            ],
        )?;
        Ok(())
    }

    // --- notion accounts ---

    pub fn insert_notion_account(&self, account: &NotionAccount) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO notion_accounts (id, user_id, workspace_name, access_token) \
             VALUES (?, ?, ?, ?)",
            params![
                account.id,
                account.user_id,
                account.workspace_name,
                account.access_token
            ],
        )?;
        Ok(())
    }

    pub fn get_notion_account(&self, id: &str) -> Result<Option<NotionAccount>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, workspace_name, access_token FROM notion_accounts \
             WHERE id = ? LIMIT 1",
        )?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(NotionAccount::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_notion_accounts(&self, user_id: &str) -> Result<Vec<NotionAccount>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, workspace_name, access_token FROM notion_accounts \
             WHERE user_id = ? ORDER BY id ASC",
        )?;
        let accounts = stmt
            .query_map([user_id], NotionAccount::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    /// First Notion account for the user, used when a mapping does not pin
    /// one explicitly.
    pub fn default_notion_account(&self, user_id: &str) -> Result<Option<NotionAccount>, DbError> {
        Ok(self.list_notion_accounts(user_id)?.into_iter().next())
    }

    pub fn remove_notion_account(&self, id: &str) -> Result<usize, DbError> {
        Ok(self
            .conn
            .execute("DELETE FROM notion_accounts WHERE id = ?", [id])?)
    }

    // --- mappings ---

    pub fn insert_mapping(&self, mapping: &Mapping) -> Result<(), DbError> {
        let labels = serde_json::to_string(&mapping.labels)?;
        let label_ids = serde_json::to_string(&mapping.label_ids)?;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO mappings ({MAPPING_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                mapping.id,
                mapping.user_id,
                mapping.mail_account_id,
                mapping.notion_account_id,
                mapping.notion_database_id,
                labels,
                label_ids,
                mapping.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn get_mapping(&self, id: &str) -> Result<Option<Mapping>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM mappings WHERE id = ? LIMIT 1"
        ))?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Mapping::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_mappings(&self, user_id: &str) -> Result<Vec<Mapping>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM mappings WHERE user_id = ? ORDER BY id ASC"
        ))?;
        let mappings = stmt
            .query_map([user_id], Mapping::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mappings)
    }

    /// Enabled mappings that bind the given mail account or no account at all.
    pub fn enabled_mappings_for_account(
        &self,
        user_id: &str,
        mail_account_id: &str,
    ) -> Result<Vec<Mapping>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM mappings \
             WHERE user_id = ? AND enabled = true \
               AND (mail_account_id = ? OR mail_account_id IS NULL) \
             ORDER BY id ASC"
        ))?;
        let mappings = stmt
            .query_map([user_id, mail_account_id], Mapping::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mappings)
    }

    pub fn set_mapping_enabled(&self, id: &str, enabled: bool) -> Result<usize, DbError> {
        Ok(self.conn.execute(
            "UPDATE mappings SET enabled = ? WHERE id = ?",
            params![enabled, id],
        )?)
    }

    pub fn remove_mapping(&self, id: &str) -> Result<usize, DbError> {
        Ok(self
            .conn
            .execute("DELETE FROM mappings WHERE id = ?", [id])?)
    }

    // --- links ---

    pub fn find_link_by_message_id(&self, message_id: &str) -> Result<Option<Link>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE gmail_message_id = ? LIMIT 1"
        ))?;
        let mut rows = stmt.query([message_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Link::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Plain INSERT: the message-id primary key enforces the one-message,
    /// one-page invariant and surfaces races as constraint errors.
    pub fn create_link(&self, link: &Link) -> Result<(), DbError> {
        self.conn.execute(
            &format!("INSERT INTO links ({LINK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            params![
                link.gmail_message_id,
                link.gmail_thread_id,
                link.notion_page_id,
                link.checksum,
                link.user_id,
                link.mail_account_id,
                link.mapping_id,
            ],
        )?;
        Ok(())
    }

    pub fn count_links_for_account(&self, mail_account_id: &str) -> Result<i64, DbError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM links WHERE mail_account_id = ?",
            [mail_account_id],
            |row| row.get(0),
        )?)
    }

    // --- stats ---

    pub fn get_stats(&self) -> Result<DatabaseStats, DbError> {
        let count = |sql: &str| -> Result<i64, DbError> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(DatabaseStats {
            total_users: count("SELECT COUNT(*) FROM users")?,
            total_mail_accounts: count("SELECT COUNT(*) FROM mail_accounts")?,
            total_notion_accounts: count("SELECT COUNT(*) FROM notion_accounts")?,
            total_mappings: count("SELECT COUNT(*) FROM mappings")?,
            total_links: count("SELECT COUNT(*) FROM links")?,
        })
    }

    pub fn get_sync_state(&self, key: &str) -> Result<Option<String>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ? LIMIT 1",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_sync_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::models::{Link, MailAccount, Mapping, WatchStatePatch};
    use super::Database;

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("mailsink-test-{}.db", Uuid::new_v4()));
        path
    }

    fn mail_account(id: &str, user_id: &str) -> MailAccount {
        MailAccount {
            id: id.to_string(),
            user_id: user_id.to_string(),
            email_address: format!("{id}@gmail.com"),
            access_token: "tok".to_string(),
            refresh_token: Some("refresh".to_string()),
            scope: None,
            token_expires_at: None,
            history_id: None,
            watch_active: false,
            watch_expires_at: None,
        }
    }

    #[test]
    fn user_upsert_is_find_or_create() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        let first = db.upsert_user("a@example.com").expect("create user");
        let second = db.upsert_user("a@example.com").expect("find user");
        assert_eq!(first.id, second.id);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn watch_state_patch_only_writes_set_fields() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let user = db.upsert_user("a@example.com").expect("user");
        db.insert_mail_account(&mail_account("acc-1", &user.id))
            .expect("insert account");

        db.patch_watch_state(
            "acc-1",
            WatchStatePatch {
                history_id: Some("100".to_string()),
                watch_active: Some(true),
                watch_expires_at: Some(1_700_000_000_000),
            },
        )
        .expect("patch full");

        // A partial patch must leave the other fields intact.
        db.patch_watch_state(
            "acc-1",
            WatchStatePatch {
                history_id: Some("200".to_string()),
                ..WatchStatePatch::default()
            },
        )
        .expect("patch partial");

        let state = db
            .watch_state("acc-1")
            .expect("watch state")
            .expect("account exists");
        assert_eq!(state.history_id.as_deref(), Some("200"));
        assert!(state.watch_active);
        assert_eq!(state.watch_expires_at, Some(1_700_000_000_000));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn enabled_mappings_include_account_bound_and_unbound() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let user = db.upsert_user("a@example.com").expect("user");
        db.insert_mail_account(&mail_account("acc-1", &user.id))
            .expect("account");
        db.insert_mail_account(&mail_account("acc-2", &user.id))
            .expect("account");

        let mapping = |id: &str, account: Option<&str>, enabled: bool| Mapping {
            id: id.to_string(),
            user_id: user.id.clone(),
            mail_account_id: account.map(str::to_string),
            notion_account_id: None,
            notion_database_id: "db-1".to_string(),
            labels: vec![],
            label_ids: vec![],
            enabled,
        };
        db.insert_mapping(&mapping("m-any", None, true)).expect("m");
        db.insert_mapping(&mapping("m-acc1", Some("acc-1"), true))
            .expect("m");
        db.insert_mapping(&mapping("m-acc2", Some("acc-2"), true))
            .expect("m");
        db.insert_mapping(&mapping("m-off", Some("acc-1"), false))
            .expect("m");

        let found = db
            .enabled_mappings_for_account(&user.id, "acc-1")
            .expect("query");
        let ids: Vec<&str> = found.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-acc1", "m-any"]);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn duplicate_link_insert_is_rejected() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let user = db.upsert_user("a@example.com").expect("user");
        db.insert_mail_account(&mail_account("acc-1", &user.id))
            .expect("account");

        let link = Link {
            gmail_message_id: "msg-1".to_string(),
            gmail_thread_id: "thread-1".to_string(),
            notion_page_id: "page-1".to_string(),
            checksum: "abc".to_string(),
            user_id: user.id.clone(),
            mail_account_id: "acc-1".to_string(),
            mapping_id: None,
        };
        db.create_link(&link).expect("first insert");
        assert!(db.create_link(&link).is_err());

        let found = db
            .find_link_by_message_id("msg-1")
            .expect("lookup")
            .expect("exists");
        assert_eq!(found.notion_page_id, "page-1");

        let _ = std::fs::remove_file(path);
    }
}
