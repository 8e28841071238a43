use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use parley_core::error::ParleyError;

/// A registered admin user, identified by pubkey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub id: i64,
    pub pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRow {
    pub id: i64,
    pub name: String,
    pub nwc: String,
    pub user_id: i64,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertRow {
    pub pubkey: String,
    pub wallet_id: Option<i64>,
    #[serde(rename = "type")]
    pub expert_type: String,
    pub nickname: String,
    pub env: String,
    pub docstores: String,
    #[serde(skip_serializing, default)]
    pub privkey: String,
    pub disabled: bool,
    pub user_id: i64,
}

fn storage_err(e: rusqlite::Error) -> ParleyError {
    match &e {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ParleyError::UniquenessViolation(e.to_string())
        }
        _ => ParleyError::Storage(e.to_string()),
    }
}

/// Admin database (`askexperts.db`): users, wallets, experts.
#[derive(Clone)]
pub struct AdminDb {
    conn: Arc<Mutex<Connection>>,
}

impl AdminDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ParleyError> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ParleyError> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ParleyError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id     INTEGER PRIMARY KEY AUTOINCREMENT,
                pubkey TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS wallets (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                name       TEXT NOT NULL,
                nwc        TEXT NOT NULL,
                user_id    INTEGER NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, name)
            );
            CREATE TABLE IF NOT EXISTS experts (
                pubkey    TEXT PRIMARY KEY,
                wallet_id INTEGER,
                type      TEXT NOT NULL DEFAULT '',
                nickname  TEXT NOT NULL DEFAULT '',
                env       TEXT NOT NULL DEFAULT '',
                docstores TEXT NOT NULL DEFAULT '',
                privkey   TEXT NOT NULL DEFAULT '',
                disabled  INTEGER NOT NULL DEFAULT 0,
                user_id   INTEGER NOT NULL
            );",
        )
        .map_err(storage_err)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    // ── Users ────────────────────────────────────────────────────────────────

    /// Fetch-or-create the user for an authenticated pubkey.
    pub fn ensure_user(&self, pubkey: &str) -> Result<UserRow, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        conn.execute("INSERT OR IGNORE INTO users (pubkey) VALUES (?1)", params![pubkey])
            .map_err(storage_err)?;
        conn.query_row(
            "SELECT id, pubkey FROM users WHERE pubkey = ?1",
            params![pubkey],
            |row| Ok(UserRow { id: row.get(0)?, pubkey: row.get(1)? }),
        )
        .map_err(storage_err)
    }

    // ── Wallets ──────────────────────────────────────────────────────────────

    pub fn add_wallet(
        &self,
        user_id: i64,
        name: &str,
        nwc: &str,
        is_default: bool,
    ) -> Result<WalletRow, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        if is_default {
            conn.execute(
                "UPDATE wallets SET is_default = 0 WHERE user_id = ?1",
                params![user_id],
            )
            .map_err(storage_err)?;
        }
        conn.execute(
            "INSERT INTO wallets (name, nwc, user_id, is_default) VALUES (?1, ?2, ?3, ?4)",
            params![name, nwc, user_id, is_default],
        )
        .map_err(storage_err)?;
        let id = conn.last_insert_rowid();
        Ok(WalletRow {
            id,
            name: name.to_string(),
            nwc: nwc.to_string(),
            user_id,
            is_default,
        })
    }

    pub fn get_wallet(&self, user_id: i64, id: i64) -> Result<Option<WalletRow>, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        conn.query_row(
            "SELECT id, name, nwc, user_id, is_default FROM wallets
             WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
            row_to_wallet,
        )
        .optional()
        .map_err(storage_err)
    }

    pub fn get_wallet_by_name(
        &self,
        user_id: i64,
        name: &str,
    ) -> Result<Option<WalletRow>, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        conn.query_row(
            "SELECT id, name, nwc, user_id, is_default FROM wallets
             WHERE name = ?1 AND user_id = ?2",
            params![name, user_id],
            row_to_wallet,
        )
        .optional()
        .map_err(storage_err)
    }

    pub fn default_wallet(&self, user_id: i64) -> Result<Option<WalletRow>, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        conn.query_row(
            "SELECT id, name, nwc, user_id, is_default FROM wallets
             WHERE user_id = ?1 AND is_default = 1",
            params![user_id],
            row_to_wallet,
        )
        .optional()
        .map_err(storage_err)
    }

    /// List wallets, optionally constrained to an id set (permissions hook).
    pub fn list_wallets(
        &self,
        user_id: i64,
        only_ids: Option<&[i64]>,
    ) -> Result<Vec<WalletRow>, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, name, nwc, user_id, is_default FROM wallets
                 WHERE user_id = ?1 ORDER BY id",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![user_id], row_to_wallet)
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        Ok(match only_ids {
            Some(ids) => rows.into_iter().filter(|w| ids.contains(&w.id)).collect(),
            None => rows,
        })
    }

    pub fn update_wallet(&self, wallet: &WalletRow) -> Result<bool, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        if wallet.is_default {
            conn.execute(
                "UPDATE wallets SET is_default = 0 WHERE user_id = ?1",
                params![wallet.user_id],
            )
            .map_err(storage_err)?;
        }
        let n = conn
            .execute(
                "UPDATE wallets SET name = ?1, nwc = ?2, is_default = ?3
                 WHERE id = ?4 AND user_id = ?5",
                params![wallet.name, wallet.nwc, wallet.is_default, wallet.id, wallet.user_id],
            )
            .map_err(storage_err)?;
        Ok(n > 0)
    }

    pub fn delete_wallet(&self, user_id: i64, id: i64) -> Result<bool, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        let n = conn
            .execute(
                "DELETE FROM wallets WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .map_err(storage_err)?;
        Ok(n > 0)
    }

    // ── Experts ──────────────────────────────────────────────────────────────

    pub fn upsert_expert(&self, expert: &ExpertRow) -> Result<(), ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO experts
                 (pubkey, wallet_id, type, nickname, env, docstores, privkey, disabled, user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                expert.pubkey,
                expert.wallet_id,
                expert.expert_type,
                expert.nickname,
                expert.env,
                expert.docstores,
                expert.privkey,
                expert.disabled,
                expert.user_id
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_expert(&self, user_id: i64, pubkey: &str) -> Result<Option<ExpertRow>, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        conn.query_row(
            "SELECT pubkey, wallet_id, type, nickname, env, docstores, privkey, disabled, user_id
             FROM experts WHERE pubkey = ?1 AND user_id = ?2",
            params![pubkey, user_id],
            row_to_expert,
        )
        .optional()
        .map_err(storage_err)
    }

    pub fn list_experts(&self, user_id: i64) -> Result<Vec<ExpertRow>, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT pubkey, wallet_id, type, nickname, env, docstores, privkey, disabled, user_id
                 FROM experts WHERE user_id = ?1 ORDER BY nickname",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![user_id], row_to_expert)
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err);
        rows
    }

    pub fn set_expert_disabled(
        &self,
        user_id: i64,
        pubkey: &str,
        disabled: bool,
    ) -> Result<bool, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        let n = conn
            .execute(
                "UPDATE experts SET disabled = ?1 WHERE pubkey = ?2 AND user_id = ?3",
                params![disabled, pubkey, user_id],
            )
            .map_err(storage_err)?;
        Ok(n > 0)
    }

    pub fn delete_expert(&self, user_id: i64, pubkey: &str) -> Result<bool, ParleyError> {
        let conn = self.conn.lock().expect("admin db mutex poisoned");
        let n = conn
            .execute(
                "DELETE FROM experts WHERE pubkey = ?1 AND user_id = ?2",
                params![pubkey, user_id],
            )
            .map_err(storage_err)?;
        Ok(n > 0)
    }
}

fn row_to_wallet(row: &rusqlite::Row<'_>) -> rusqlite::Result<WalletRow> {
    Ok(WalletRow {
        id: row.get(0)?,
        name: row.get(1)?,
        nwc: row.get(2)?,
        user_id: row.get(3)?,
        is_default: row.get(4)?,
    })
}

fn row_to_expert(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExpertRow> {
    Ok(ExpertRow {
        pubkey: row.get(0)?,
        wallet_id: row.get(1)?,
        expert_type: row.get(2)?,
        nickname: row.get(3)?,
        env: row.get(4)?,
        docstores: row.get(5)?,
        privkey: row.get(6)?,
        disabled: row.get(7)?,
        user_id: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_user_is_idempotent() {
        let db = AdminDb::open_in_memory().unwrap();
        let a = db.ensure_user("aa").unwrap();
        let b = db.ensure_user("aa").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn default_wallet_is_exclusive_per_user() {
        let db = AdminDb::open_in_memory().unwrap();
        let user = db.ensure_user("aa").unwrap();
        let w1 = db.add_wallet(user.id, "main", "nwc://1", true).unwrap();
        let w2 = db.add_wallet(user.id, "spare", "nwc://2", true).unwrap();

        let default = db.default_wallet(user.id).unwrap().unwrap();
        assert_eq!(default.id, w2.id);
        assert_ne!(default.id, w1.id);
    }

    #[test]
    fn wallet_names_are_unique_per_user() {
        let db = AdminDb::open_in_memory().unwrap();
        let user = db.ensure_user("aa").unwrap();
        db.add_wallet(user.id, "main", "nwc://1", false).unwrap();
        let err = db.add_wallet(user.id, "main", "nwc://2", false).unwrap_err();
        assert_eq!(err.code(), "uniqueness-violation");

        // Another user can reuse the name.
        let other = db.ensure_user("bb").unwrap();
        assert!(db.add_wallet(other.id, "main", "nwc://3", false).is_ok());
    }

    #[test]
    fn experts_round_trip_and_disable() {
        let db = AdminDb::open_in_memory().unwrap();
        let user = db.ensure_user("aa").unwrap();
        let expert = ExpertRow {
            pubkey: "ee".into(),
            wallet_id: None,
            expert_type: "rag".into(),
            nickname: "atlas".into(),
            env: "{}".into(),
            docstores: String::new(),
            privkey: "ff".into(),
            disabled: false,
            user_id: user.id,
        };
        db.upsert_expert(&expert).unwrap();

        assert!(db.set_expert_disabled(user.id, "ee", true).unwrap());
        let got = db.get_expert(user.id, "ee").unwrap().unwrap();
        assert!(got.disabled);

        // Users only see their own experts.
        let other = db.ensure_user("bb").unwrap();
        assert!(db.get_expert(other.id, "ee").unwrap().is_none());
    }
}
