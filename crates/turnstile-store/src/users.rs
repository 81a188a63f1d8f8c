use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::instrument;
use turnstile_core::{Identity, Right};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_ts};

#[derive(Clone)]
pub struct UserRepo {
    db: Database,
}

/// Hex SHA-256 of a clear-text password.
pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a user. Guests cannot be stored.
    #[instrument(skip(self, password))]
    pub fn create(
        &self,
        user_id: &str,
        nickname: Option<&str>,
        password: &str,
        right: Right,
    ) -> Result<Identity, StoreError> {
        if right == Right::Guest {
            return Err(StoreError::Conflict("guest identities are not persisted".into()));
        }
        if user_id.trim().is_empty() {
            return Err(StoreError::Conflict("empty user id".into()));
        }

        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (user_id, nickname, password_hash, right_flag, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    user_id,
                    nickname,
                    hash_password(password),
                    right.as_flag(),
                    format_ts(Utc::now()),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("user {user_id} already exists")));
            }
            Ok(Identity::new(user_id, nickname.unwrap_or(user_id), right))
        })
    }

    /// Identity for matching credentials, `None` on mismatch or unknown user.
    #[instrument(skip(self, password))]
    pub fn login(&self, user_id: &str, password: &str) -> Result<Option<Identity>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, nickname, right_flag FROM users WHERE user_id = ?1 AND password_hash = ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![user_id, hash_password(password)])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_identity(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn get(&self, user_id: &str) -> Result<Identity, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id, nickname, right_flag FROM users WHERE user_id = ?1")?;
            let mut rows = stmt.query([user_id])?;
            match rows.next()? {
                Some(row) => row_to_identity(row),
                None => Err(StoreError::NotFound(format!("user {user_id}"))),
            }
        })
    }

    #[instrument(skip(self))]
    pub fn change_nickname(&self, user_id: &str, nickname: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE users SET nickname = ?1 WHERE user_id = ?2",
                rusqlite::params![nickname, user_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("user {user_id}")));
            }
            Ok(())
        })
    }

    /// All users ordered by id.
    pub fn list(&self) -> Result<Vec<Identity>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id, nickname, right_flag FROM users ORDER BY user_id")?;
            let mut rows = stmt.query([])?;
            let mut users = Vec::new();
            while let Some(row) = rows.next()? {
                users.push(row_to_identity(row)?);
            }
            Ok(users)
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?))
    }
}

pub(crate) fn row_to_identity(row: &rusqlite::Row<'_>) -> Result<Identity, StoreError> {
    let user_id: String = row_helpers::get(row, 0, "users", "user_id")?;
    let nickname: Option<String> = row_helpers::get(row, 1, "users", "nickname")?;
    let flag: u8 = row_helpers::get(row, 2, "users", "right_flag")?;
    Ok(Identity {
        nickname: nickname.unwrap_or_else(|| user_id.clone()),
        user_id,
        right: row_helpers::parse_right(flag, "users")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> UserRepo {
        UserRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn password_hash_is_stable_hex() {
        let h = hash_password("secret");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_password("secret"));
        assert_ne!(h, hash_password("Secret"));
    }

    #[test]
    fn create_then_login() {
        let repo = repo();
        repo.create("alex", Some("Alex"), "pw", Right::User).unwrap();

        let identity = repo.login("alex", "pw").unwrap().unwrap();
        assert_eq!(identity, Identity::new("alex", "Alex", Right::User));
        assert!(repo.login("alex", "wrong").unwrap().is_none());
        assert!(repo.login("nobody", "pw").unwrap().is_none());
    }

    #[test]
    fn nickname_defaults_to_user_id() {
        let repo = repo();
        repo.create("kim", None, "pw", Right::Admin).unwrap();
        let identity = repo.get("kim").unwrap();
        assert_eq!(identity.nickname, "kim");
        assert!(identity.is_admin());
    }

    #[test]
    fn duplicate_and_guest_users_rejected() {
        let repo = repo();
        repo.create("alex", None, "pw", Right::User).unwrap();
        assert!(matches!(
            repo.create("alex", None, "pw2", Right::User),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            repo.create("guest1", None, "pw", Right::Guest),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn change_nickname_list_and_count() {
        let repo = repo();
        repo.create("b", None, "pw", Right::User).unwrap();
        repo.create("a", None, "pw", Right::User).unwrap();
        repo.change_nickname("a", "Ann").unwrap();
        assert!(matches!(repo.change_nickname("zz", "x"), Err(StoreError::NotFound(_))));

        let users = repo.list().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].nickname, "Ann");
        assert_eq!(repo.count().unwrap(), 2);
    }
}
