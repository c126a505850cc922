use std::{collections::HashMap, sync::Mutex};

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::password::HashedPassword;
use crate::auth::repo_types::{normalize_identifier, NewUser, User};
use crate::error::AuthError;

/// Persistence for user credentials and the single live refresh token.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Find a user whose username or email equals `identifier`.
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<User>, AuthError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError>;

    /// Insert a new user. Fails with [`AuthError::Conflict`] on a taken
    /// username or email.
    async fn create(&self, new_user: NewUser) -> Result<User, AuthError>;

    /// Overwrite (or clear) the stored refresh token.
    async fn update_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), AuthError>;

    /// Replace the stored refresh token with `next` only while it still equals
    /// `expected`. Returns `false` when another writer got there first.
    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected: &str,
        next: &str,
    ) -> Result<bool, AuthError>;

    async fn update_password(&self, id: Uuid, password: HashedPassword) -> Result<(), AuthError>;
}

pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<User>, AuthError> {
        let identifier = normalize_identifier(identifier);
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, user_name, email, full_name, avatar, cover_image, watch_history,
                   password_hash, refresh_token, created_at, updated_at
            FROM users
            WHERE user_name = $1 OR email = $1
            "#,
        )
        .bind(identifier)
        .fetch_optional(&self.db)
        .await
        .context("find user by identifier")?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, user_name, email, full_name, avatar, cover_image, watch_history,
                   password_hash, refresh_token, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(user)
    }

    async fn create(&self, new_user: NewUser) -> Result<User, AuthError> {
        // No existence pre-check: the unique constraints decide.
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, user_name, email, full_name, avatar, cover_image, password_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, user_name, email, full_name, avatar, cover_image, watch_history,
                      password_hash, refresh_token, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_user.user_name)
        .bind(&new_user.email)
        .bind(&new_user.full_name)
        .bind(&new_user.avatar)
        .bind(&new_user.cover_image)
        .bind(new_user.password.as_str())
        .fetch_one(&self.db)
        .await
        .map_err(conflict_or_internal)
    }

    async fn update_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), AuthError> {
        sqlx::query(
            r#"UPDATE users SET refresh_token = $2, updated_at = now() WHERE id = $1"#,
        )
        .bind(id)
        .bind(token)
        .execute(&self.db)
        .await
        .context("update refresh token")?;
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected: &str,
        next: &str,
    ) -> Result<bool, AuthError> {
        let res = sqlx::query(
            r#"
            UPDATE users
            SET refresh_token = $3, updated_at = now()
            WHERE id = $1 AND refresh_token = $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .execute(&self.db)
        .await
        .context("rotate refresh token")?;
        Ok(res.rows_affected() == 1)
    }

    async fn update_password(&self, id: Uuid, password: HashedPassword) -> Result<(), AuthError> {
        sqlx::query(
            r#"UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1"#,
        )
        .bind(id)
        .bind(password.into_inner())
        .execute(&self.db)
        .await
        .context("update password")?;
        Ok(())
    }
}

fn conflict_or_internal(e: sqlx::Error) -> AuthError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            let field = match db_err.constraint() {
                Some("users_email_key") => "email",
                _ => "userName",
            };
            return AuthError::Conflict(format!("User with this {field} already exists"));
        }
    }
    AuthError::Internal(anyhow::Error::new(e).context("insert user"))
}

/// Map-backed store. Each method holds the lock for its whole read-modify-write,
/// which gives the same per-user atomicity as the single-statement SQL above.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, User>>, AuthError> {
        self.users
            .lock()
            .map_err(|_| AuthError::Internal(anyhow::anyhow!("user map lock poisoned")))
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<User>, AuthError> {
        let identifier = normalize_identifier(identifier);
        let users = self.lock()?;
        Ok(users
            .values()
            .find(|u| u.user_name == identifier || u.email == identifier)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn create(&self, new_user: NewUser) -> Result<User, AuthError> {
        let mut users = self.lock()?;
        if users.values().any(|u| u.user_name == new_user.user_name) {
            return Err(AuthError::Conflict(
                "User with this userName already exists".into(),
            ));
        }
        if users.values().any(|u| u.email == new_user.email) {
            return Err(AuthError::Conflict("User with this email already exists".into()));
        }

        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            user_name: new_user.user_name,
            email: new_user.email,
            full_name: new_user.full_name,
            avatar: new_user.avatar,
            cover_image: new_user.cover_image,
            watch_history: Vec::new(),
            password_hash: new_user.password.into_inner(),
            refresh_token: None,
            created_at: now,
            updated_at: now,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), AuthError> {
        if let Some(user) = self.lock()?.get_mut(&id) {
            user.refresh_token = token.map(str::to_string);
            user.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected: &str,
        next: &str,
    ) -> Result<bool, AuthError> {
        let mut users = self.lock()?;
        match users.get_mut(&id) {
            Some(user) if user.refresh_token.as_deref() == Some(expected) => {
                user.refresh_token = Some(next.to_string());
                user.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_password(&self, id: Uuid, password: HashedPassword) -> Result<(), AuthError> {
        if let Some(user) = self.lock()?.get_mut(&id) {
            user.password_hash = password.into_inner();
            user.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::hash_password;

    fn new_user(user_name: &str, email: &str) -> NewUser {
        NewUser {
            user_name: user_name.into(),
            email: email.into(),
            full_name: "Test User".into(),
            password: hash_password("secret123").unwrap(),
            avatar: "https://cdn.local/avatar.png".into(),
            cover_image: None,
        }
    }

    #[tokio::test]
    async fn create_then_find_by_either_identifier() {
        let store = InMemoryUserStore::new();
        let created = store.create(new_user("alice", "a@x.com")).await.unwrap();

        let by_name = store.find_by_identifier(" ALICE ").await.unwrap().unwrap();
        let by_email = store.find_by_identifier("a@x.com").await.unwrap().unwrap();
        assert_eq!(by_name.id, created.id);
        assert_eq!(by_email.id, created.id);
        assert!(created.refresh_token.is_none());
        assert!(store.find_by_identifier("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_username_or_email_conflicts() {
        let store = InMemoryUserStore::new();
        let first = store.create(new_user("alice", "a@x.com")).await.unwrap();

        let err = store.create(new_user("alice", "other@x.com")).await.unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));
        let err = store.create(new_user("other", "a@x.com")).await.unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));

        let still = store.find_by_id(first.id).await.unwrap().unwrap();
        assert_eq!(still.email, "a@x.com");
        assert_eq!(still.password_hash, first.password_hash);
    }

    #[tokio::test]
    async fn rotate_only_succeeds_against_current_value() {
        let store = InMemoryUserStore::new();
        let user = store.create(new_user("alice", "a@x.com")).await.unwrap();
        store.update_refresh_token(user.id, Some("t1")).await.unwrap();

        assert!(store.rotate_refresh_token(user.id, "t1", "t2").await.unwrap());
        assert!(!store.rotate_refresh_token(user.id, "t1", "t3").await.unwrap());

        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn rotate_fails_once_cleared() {
        let store = InMemoryUserStore::new();
        let user = store.create(new_user("alice", "a@x.com")).await.unwrap();
        store.update_refresh_token(user.id, Some("t1")).await.unwrap();
        store.update_refresh_token(user.id, None).await.unwrap();

        assert!(!store.rotate_refresh_token(user.id, "t1", "t2").await.unwrap());
        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.refresh_token.is_none());
    }

    #[tokio::test]
    async fn stored_password_verifies_and_is_not_plaintext() {
        let store = InMemoryUserStore::new();
        let user = store.create(new_user("alice", "a@x.com")).await.unwrap();
        assert_ne!(user.password_hash, "secret123");
        assert!(user.verify_password("secret123").await.unwrap());
        assert!(!user.verify_password("nope").await.unwrap());
    }
}
