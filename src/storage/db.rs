//! Identity ledger — the durable record of who already registered.
//!
//! One row per originating identity (Telegram id or web IP), created the
//! moment an account is provisioned and never deleted automatically; only
//! an admin command removes rows. `record_registration` is insert-if-absent
//! at the SQL level, so two interleaved attempts from the same identity
//! cannot both succeed even if both passed the `has_registered` pre-check.
//!
//! The same database carries the ban list: identities admins barred from
//! registering, checked before any attempt is processed.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::core::error::{AppError, AppResult};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// A completed registration as stored in the ledger.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    /// Opaque identity key, e.g. `tg:123456` or `web:203.0.113.7`.
    pub identity: String,
    /// TeamTalk username the identity registered.
    pub username: String,
    /// UTC timestamp of the provisioning.
    pub created_at: String,
}

/// Create a connection pool and ensure the schema exists.
pub fn create_pool(database_path: &str) -> AppResult<DbPool> {
    let manager = SqliteConnectionManager::file(database_path);
    let pool = Pool::builder().max_size(10).build(manager)?;

    let conn = pool.get()?;
    migrate_schema(&conn)?;
    Ok(pool)
}

/// Get a connection from the pool.
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    pool.get()
}

fn migrate_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS registrations (
            identity   TEXT PRIMARY KEY,
            username   TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
        );
        CREATE INDEX IF NOT EXISTS idx_registrations_username ON registrations(username);
        CREATE TABLE IF NOT EXISTS bans (
            identity  TEXT PRIMARY KEY,
            reason    TEXT,
            banned_by TEXT NOT NULL,
            banned_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
        );",
    )
}

/// Whether the identity already completed a registration.
pub fn has_registered(conn: &DbConnection, identity: &str) -> AppResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM registrations WHERE identity = ?1",
        params![identity],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Record a completed registration.
///
/// Atomic insert-if-absent: if a row for the identity already exists the
/// insert changes nothing and this returns [`AppError::AlreadyRegistered`],
/// closing the check-then-write race between the two front-ends.
pub fn record_registration(conn: &DbConnection, identity: &str, username: &str) -> AppResult<()> {
    let changed = conn.execute(
        "INSERT INTO registrations (identity, username) VALUES (?1, ?2)
         ON CONFLICT(identity) DO NOTHING",
        params![identity, username],
    )?;
    if changed == 0 {
        log::warn!("Ledger insert raced for identity {identity}: record already present");
        return Err(AppError::AlreadyRegistered);
    }
    log::info!("Ledger: recorded identity {identity} -> username '{username}'");
    Ok(())
}

/// Username linked to an identity, if any.
pub fn username_for_identity(conn: &DbConnection, identity: &str) -> AppResult<Option<String>> {
    let mut stmt = conn.prepare("SELECT username FROM registrations WHERE identity = ?1")?;
    let mut rows = stmt.query(params![identity])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Remove a ledger row by identity key or by registered username.
/// Admin-only operation; returns true when a row was deleted.
pub fn remove_registration(conn: &DbConnection, identifier: &str) -> AppResult<bool> {
    let changed = conn.execute(
        "DELETE FROM registrations WHERE identity = ?1 OR username = ?1",
        params![identifier],
    )?;
    if changed > 0 {
        log::info!("Ledger: removed registration for '{identifier}'");
    }
    Ok(changed > 0)
}

/// An identity barred from registering, as stored in the ban list.
#[derive(Debug, Clone)]
pub struct BanRecord {
    pub identity: String,
    pub reason: Option<String>,
    pub banned_by: String,
    pub banned_at: String,
}

/// Whether the identity is on the ban list.
pub fn is_banned(conn: &DbConnection, identity: &str) -> AppResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bans WHERE identity = ?1",
        params![identity],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Put an identity on the ban list. Re-banning updates the reason and the
/// timestamp rather than failing.
pub fn ban_identity(
    conn: &DbConnection,
    identity: &str,
    reason: Option<&str>,
    banned_by: &str,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO bans (identity, reason, banned_by) VALUES (?1, ?2, ?3)
         ON CONFLICT(identity) DO UPDATE SET
             reason = excluded.reason,
             banned_by = excluded.banned_by,
             banned_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')",
        params![identity, reason, banned_by],
    )?;
    log::info!("Ban list: added {identity} (by {banned_by})");
    Ok(())
}

/// Take an identity off the ban list; returns true when a row was deleted.
pub fn unban_identity(conn: &DbConnection, identity: &str) -> AppResult<bool> {
    let changed = conn.execute("DELETE FROM bans WHERE identity = ?1", params![identity])?;
    if changed > 0 {
        log::info!("Ban list: removed {identity}");
    }
    Ok(changed > 0)
}

/// All ban rows, newest first.
pub fn list_bans(conn: &DbConnection) -> AppResult<Vec<BanRecord>> {
    let mut stmt = conn.prepare(
        "SELECT identity, reason, banned_by, banned_at FROM bans ORDER BY banned_at DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(BanRecord {
            identity: row.get(0)?,
            reason: row.get(1)?,
            banned_by: row.get(2)?,
            banned_at: row.get(3)?,
        })
    })?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

/// All ledger rows, newest first.
pub fn list_registrations(conn: &DbConnection) -> AppResult<Vec<IdentityRecord>> {
    let mut stmt = conn.prepare(
        "SELECT identity, username, created_at FROM registrations ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(IdentityRecord {
            identity: row.get(0)?,
            username: row.get(1)?,
            created_at: row.get(2)?,
        })
    })?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> DbPool {
        let dir = tempfile::tempdir().unwrap();
        // Leak the tempdir so the file outlives the test body.
        let path = dir.into_path().join("ledger.sqlite");
        create_pool(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn record_then_lookup() {
        let pool = test_pool();
        let conn = get_connection(&pool).unwrap();

        assert!(!has_registered(&conn, "tg:1").unwrap());
        record_registration(&conn, "tg:1", "alice").unwrap();
        assert!(has_registered(&conn, "tg:1").unwrap());
        assert_eq!(username_for_identity(&conn, "tg:1").unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn second_record_for_same_identity_is_rejected() {
        let pool = test_pool();
        let conn = get_connection(&pool).unwrap();

        record_registration(&conn, "tg:2", "alice").unwrap();
        let err = record_registration(&conn, "tg:2", "bob").unwrap_err();
        assert!(matches!(err, AppError::AlreadyRegistered));
        // First write wins; the row is untouched.
        assert_eq!(username_for_identity(&conn, "tg:2").unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn remove_by_identity_or_username() {
        let pool = test_pool();
        let conn = get_connection(&pool).unwrap();

        record_registration(&conn, "tg:3", "carol").unwrap();
        assert!(remove_registration(&conn, "carol").unwrap());
        assert!(!has_registered(&conn, "tg:3").unwrap());
        assert!(!remove_registration(&conn, "carol").unwrap());

        record_registration(&conn, "web:10.0.0.1", "dave").unwrap();
        assert!(remove_registration(&conn, "web:10.0.0.1").unwrap());
    }

    #[test]
    fn ban_then_unban() {
        let pool = test_pool();
        let conn = get_connection(&pool).unwrap();

        assert!(!is_banned(&conn, "tg:9").unwrap());
        ban_identity(&conn, "tg:9", Some("spam"), "admin").unwrap();
        assert!(is_banned(&conn, "tg:9").unwrap());

        // Re-banning is an update, not an error.
        ban_identity(&conn, "tg:9", None, "other admin").unwrap();
        let bans = list_bans(&conn).unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].banned_by, "other admin");

        assert!(unban_identity(&conn, "tg:9").unwrap());
        assert!(!is_banned(&conn, "tg:9").unwrap());
        assert!(!unban_identity(&conn, "tg:9").unwrap());
    }

    #[test]
    fn list_returns_all_rows() {
        let pool = test_pool();
        let conn = get_connection(&pool).unwrap();

        record_registration(&conn, "tg:4", "erin").unwrap();
        record_registration(&conn, "web:10.0.0.2", "frank").unwrap();
        let all = list_registrations(&conn).unwrap();
        assert_eq!(all.len(), 2);
    }
}
