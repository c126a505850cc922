use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::password::{self, HashedPassword};

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub user_name: String,                // lowercased, unique
    pub email: String,                    // lowercased, unique
    pub full_name: String,
    pub avatar: String,                   // avatar URL
    pub cover_image: Option<String>,      // cover image URL
    pub watch_history: Vec<Uuid>,
    #[serde(skip_serializing)]
    pub password_hash: String,            // Argon2 hash, not exposed in JSON
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,    // the one live refresh token
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl User {
    /// Checks `plain` against the stored hash without ever recovering it.
    pub async fn verify_password(&self, plain: &str) -> anyhow::Result<bool> {
        password::verify_password_blocking(plain.to_string(), self.password_hash.clone()).await
    }

    pub fn public(&self) -> PublicUser {
        PublicUser::from(self.clone())
    }
}

/// Everything needed to create a user. Identity fields are already normalized.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub user_name: String,
    pub email: String,
    pub full_name: String,
    pub password: HashedPassword,
    pub avatar: String,
    pub cover_image: Option<String>,
}

/// Redacted user view: no password hash, no refresh token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub user_name: String,
    pub email: String,
    pub full_name: String,
    pub avatar: String,
    pub cover_image: Option<String>,
    pub watch_history: Vec<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            user_name: u.user_name,
            email: u.email,
            full_name: u.full_name,
            avatar: u.avatar,
            cover_image: u.cover_image,
            watch_history: u.watch_history,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

/// Usernames and emails are matched case-insensitively.
pub fn normalize_identifier(raw: &str) -> String {
    raw.trim().to_lowercase()
}
