//! SQLite persistence for OAuth state.
//!
//! Client registrations and token sets survive restarts. Pending
//! authorizations are transient: the table is wiped every time the store is
//! opened, so a state token from a previous process can never be redeemed.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::errors::OAuthError;
use super::{ClientRegistration, PendingAuthorization, TokenSet};

// ─── CredentialStore ─────────────────────────────────────────────────────────

/// SQLite handle for OAuth credentials.
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, OAuthError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| OAuthError::Store {
                reason: format!("failed to create {}: {e}", parent.display()),
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// In-memory store (tests, or when no data directory is available).
    pub fn open_in_memory() -> Result<Self, OAuthError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, OAuthError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        let cleared = store
            .conn()
            .execute("DELETE FROM pending_authorizations", [])?;
        if cleared > 0 {
            tracing::debug!(cleared, "discarded pending authorizations from a previous run");
        }
        Ok(store)
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), OAuthError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS client_registrations (
                server_id TEXT NOT NULL,
                redirect_uri TEXT NOT NULL,
                client_id TEXT NOT NULL,
                client_secret TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (server_id, redirect_uri)
            );

            CREATE TABLE IF NOT EXISTS tokens (
                server_id TEXT PRIMARY KEY,
                token_set TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS pending_authorizations (
                state TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                server_url TEXT NOT NULL,
                code_verifier TEXT NOT NULL,
                port INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pending_server
                ON pending_authorizations(server_id);
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─── Client Registrations ────────────────────────────────────────

    pub fn save_registration(
        &self,
        server_id: &str,
        registration: &ClientRegistration,
    ) -> Result<(), OAuthError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO client_registrations
                (server_id, redirect_uri, client_id, client_secret, created_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))",
            params![
                server_id,
                registration.redirect_uri,
                registration.client_id,
                registration.client_secret
            ],
        )?;
        Ok(())
    }

    pub fn load_registration(
        &self,
        server_id: &str,
        redirect_uri: &str,
    ) -> Result<Option<ClientRegistration>, OAuthError> {
        let result = self
            .conn()
            .query_row(
                "SELECT client_id, client_secret, redirect_uri FROM client_registrations
                 WHERE server_id = ?1 AND redirect_uri = ?2",
                params![server_id, redirect_uri],
                |row| {
                    Ok(ClientRegistration {
                        client_id: row.get(0)?,
                        client_secret: row.get(1)?,
                        redirect_uri: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    /// Most recent registration for a server, whatever its redirect URI.
    pub fn latest_registration(
        &self,
        server_id: &str,
    ) -> Result<Option<ClientRegistration>, OAuthError> {
        let result = self
            .conn()
            .query_row(
                "SELECT client_id, client_secret, redirect_uri FROM client_registrations
                 WHERE server_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![server_id],
                |row| {
                    Ok(ClientRegistration {
                        client_id: row.get(0)?,
                        client_secret: row.get(1)?,
                        redirect_uri: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    /// The registration that issued `client_id`, if it is still stored.
    pub fn registration_for_client(
        &self,
        server_id: &str,
        client_id: &str,
    ) -> Result<Option<ClientRegistration>, OAuthError> {
        let result = self
            .conn()
            .query_row(
                "SELECT client_id, client_secret, redirect_uri FROM client_registrations
                 WHERE server_id = ?1 AND client_id = ?2 LIMIT 1",
                params![server_id, client_id],
                |row| {
                    Ok(ClientRegistration {
                        client_id: row.get(0)?,
                        client_secret: row.get(1)?,
                        redirect_uri: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    // ─── Tokens ──────────────────────────────────────────────────────

    pub fn save_tokens(&self, server_id: &str, tokens: &TokenSet) -> Result<(), OAuthError> {
        let json = serde_json::to_string(tokens)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO tokens (server_id, token_set, updated_at)
             VALUES (?1, ?2, datetime('now'))",
            params![server_id, json],
        )?;
        Ok(())
    }

    pub fn load_tokens(&self, server_id: &str) -> Result<Option<TokenSet>, OAuthError> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT token_set FROM tokens WHERE server_id = ?1",
                params![server_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Forget a server's tokens. Returns whether any were stored.
    pub fn delete_tokens(&self, server_id: &str) -> Result<bool, OAuthError> {
        let n = self
            .conn()
            .execute("DELETE FROM tokens WHERE server_id = ?1", params![server_id])?;
        Ok(n > 0)
    }

    // ─── Pending Authorizations ──────────────────────────────────────

    pub fn insert_pending(&self, pending: &PendingAuthorization) -> Result<(), OAuthError> {
        self.conn().execute(
            "INSERT INTO pending_authorizations
                (state, server_id, server_url, code_verifier, port)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pending.state,
                pending.server_id,
                pending.server_url,
                pending.code_verifier,
                pending.port
            ],
        )?;
        Ok(())
    }

    /// Remove and return the record for `state`. A second call for the same
    /// state returns `None`.
    pub fn take_pending(&self, state: &str) -> Result<Option<PendingAuthorization>, OAuthError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let record = tx
            .query_row(
                "SELECT state, server_id, server_url, code_verifier, port
                 FROM pending_authorizations WHERE state = ?1",
                params![state],
                |row| {
                    Ok(PendingAuthorization {
                        state: row.get(0)?,
                        server_id: row.get(1)?,
                        server_url: row.get(2)?,
                        code_verifier: row.get(3)?,
                        port: row.get(4)?,
                    })
                },
            )
            .optional()?;
        if record.is_some() {
            tx.execute(
                "DELETE FROM pending_authorizations WHERE state = ?1",
                params![state],
            )?;
        }
        tx.commit()?;
        Ok(record)
    }

    /// Drop every pending record for a server (superseded flows).
    pub fn delete_pending_for_server(&self, server_id: &str) -> Result<usize, OAuthError> {
        let n = self.conn().execute(
            "DELETE FROM pending_authorizations WHERE server_id = ?1",
            params![server_id],
        )?;
        Ok(n)
    }

    /// Drop one pending record without returning it.
    pub fn delete_pending(&self, state: &str) -> Result<(), OAuthError> {
        self.conn().execute(
            "DELETE FROM pending_authorizations WHERE state = ?1",
            params![state],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self, server_id: &str) -> usize {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM pending_authorizations WHERE server_id = ?1",
                params![server_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .unwrap_or(0)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
