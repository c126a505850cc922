use std::sync::Arc;

use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::jwt::{JwtKeys, TokenError, TokenPair};
use crate::auth::password::hash_password_blocking;
use crate::auth::repo::UserStore;
use crate::auth::repo_types::{normalize_identifier, NewUser, PublicUser, User};
use crate::error::AuthError;
use crate::state::AppState;

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    // Dot-separated runs of [a-z0-9_-]: no leading, trailing or doubled dots.
    static ref USER_NAME_RE: Regex = Regex::new(r"^[a-z0-9_-]+(\.[a-z0-9_-]+)*$").unwrap();
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Usernames end up in object keys and URLs, so only URL-safe characters pass.
pub(crate) fn is_valid_user_name(user_name: &str) -> bool {
    user_name.len() <= 64 && USER_NAME_RE.is_match(user_name)
}

/// Registration fields after trimming, case normalization and validation.
#[derive(Debug, Clone)]
pub struct RegisterInput {
    pub user_name: String,
    pub email: String,
    pub full_name: String,
    pub password: String,
}

impl RegisterInput {
    pub fn parse(
        user_name: Option<&str>,
        email: Option<&str>,
        full_name: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, AuthError> {
        let required = |v: Option<&str>| match v {
            Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
            _ => Err(AuthError::Validation("All fields are required".into())),
        };
        let user_name = normalize_identifier(&required(user_name)?);
        let email = normalize_identifier(&required(email)?);
        let full_name = required(full_name)?.trim().to_string();
        let password = required(password)?;

        if !is_valid_email(&email) {
            return Err(AuthError::Validation("Invalid email".into()));
        }
        if !is_valid_user_name(&user_name) {
            return Err(AuthError::Validation(
                "userName may only contain letters, digits, '_', '-' and single dots".into(),
            ));
        }

        Ok(Self {
            user_name,
            email,
            full_name,
            password,
        })
    }
}

/// Outcome of checking a presented refresh token against the store.
#[derive(Debug)]
pub enum RefreshSubject {
    Valid(User),
    Expired,
    Malformed,
    UserMissing,
}

#[derive(Debug)]
pub struct LoginOutcome {
    pub tokens: TokenPair,
    pub user: PublicUser,
}

/// Issues, persists and rotates session tokens on top of a [`UserStore`].
#[derive(Clone)]
pub struct TokenService {
    users: Arc<dyn UserStore>,
    keys: JwtKeys,
}

impl FromRef<AppState> for TokenService {
    fn from_ref(state: &AppState) -> Self {
        TokenService::new(state.users.clone(), JwtKeys::from_ref(state))
    }
}

impl TokenService {
    pub fn new(users: Arc<dyn UserStore>, keys: JwtKeys) -> Self {
        Self { users, keys }
    }

    pub fn keys(&self) -> &JwtKeys {
        &self.keys
    }

    pub fn issue_token_pair(&self, user: &User) -> Result<TokenPair, AuthError> {
        Ok(self.keys.issue_pair(user)?)
    }

    #[instrument(skip(self, input), fields(user_name = %input.user_name))]
    pub async fn register(
        &self,
        input: RegisterInput,
        avatar_url: String,
        cover_url: Option<String>,
    ) -> Result<PublicUser, AuthError> {
        let password = hash_password_blocking(input.password).await?;
        let user = self
            .users
            .create(NewUser {
                user_name: input.user_name,
                email: input.email,
                full_name: input.full_name,
                password,
                avatar: avatar_url,
                cover_image: cover_url,
            })
            .await?;
        info!(user_id = %user.id, "user registered");
        Ok(user.public())
    }

    pub async fn login(&self, identifier: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        self.login_any(&[identifier], password).await
    }

    /// Log in the first user matched by any of `identifiers`, each of which may
    /// be a username or an email.
    #[instrument(skip(self, password))]
    pub async fn login_any(
        &self,
        identifiers: &[&str],
        password: &str,
    ) -> Result<LoginOutcome, AuthError> {
        let mut found = None;
        for identifier in identifiers {
            if let Some(user) = self.users.find_by_identifier(identifier).await? {
                found = Some(user);
                break;
            }
        }
        let user = found.ok_or_else(|| AuthError::NotFound("User not found".into()))?;

        if !user.verify_password(password).await? {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthError::InvalidCredentials);
        }

        let tokens = self.issue_token_pair(&user)?;
        self.users
            .update_refresh_token(user.id, Some(&tokens.refresh_token))
            .await?;

        info!(user_id = %user.id, "user logged in");
        Ok(LoginOutcome {
            tokens,
            user: user.public(),
        })
    }

    #[instrument(skip(self))]
    pub async fn logout(&self, user_id: Uuid) -> Result<(), AuthError> {
        self.users.update_refresh_token(user_id, None).await?;
        info!(%user_id, "user logged out");
        Ok(())
    }

    /// Verify a refresh token and load the user it names.
    pub async fn resolve_refresh_token(&self, token: &str) -> Result<RefreshSubject, AuthError> {
        let claims = match self.keys.verify_refresh(token) {
            Ok(c) => c,
            Err(TokenError::Expired) => return Ok(RefreshSubject::Expired),
            Err(TokenError::Malformed | TokenError::WrongKind) => {
                return Ok(RefreshSubject::Malformed)
            }
        };
        Ok(match self.users.find_by_id(claims.sub).await? {
            Some(user) => RefreshSubject::Valid(user),
            None => RefreshSubject::UserMissing,
        })
    }

    #[instrument(skip_all)]
    pub async fn refresh(&self, presented: Option<&str>) -> Result<TokenPair, AuthError> {
        let presented = presented
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Unauthorized)?;

        let user = match self.resolve_refresh_token(presented).await? {
            RefreshSubject::Valid(user) => user,
            other => {
                warn!(outcome = ?other, "refresh token rejected");
                return Err(AuthError::InvalidToken);
            }
        };

        if user.refresh_token.as_deref() != Some(presented) {
            warn!(user_id = %user.id, "superseded refresh token presented");
            return Err(AuthError::TokenReuse);
        }

        let tokens = self.issue_token_pair(&user)?;
        let rotated = self
            .users
            .rotate_refresh_token(user.id, presented, &tokens.refresh_token)
            .await?;
        if !rotated {
            warn!(user_id = %user.id, "refresh token rotated concurrently");
            return Err(AuthError::TokenReuse);
        }

        info!(user_id = %user.id, "tokens refreshed");
        Ok(tokens)
    }

    pub async fn current_user(&self, user_id: Uuid) -> Result<PublicUser, AuthError> {
        self.users
            .find_by_id(user_id)
            .await?
            .map(|u| u.public())
            .ok_or_else(|| AuthError::NotFound("User not found".into()))
    }

    #[instrument(skip(self, old_password, new_password))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        if new_password.trim().is_empty() {
            return Err(AuthError::Validation("New password is required".into()));
        }
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("User not found".into()))?;

        if !user.verify_password(old_password).await? {
            return Err(AuthError::InvalidCredentials);
        }

        let hash = hash_password_blocking(new_password.to_string()).await?;
        self.users.update_password(user.id, hash).await?;
        info!(%user_id, "password changed");
        Ok(())
    }
}
