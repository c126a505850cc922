//! Runs against a real Postgres server. Each test creates its own database on
//! the server named by `DATABASE_URL` and skips when the variable is unset.

use std::sync::Arc;

use sqlx::{Connection, Executor, PgConnection, PgPool};
use uuid::Uuid;
use vidtube_auth::{
    auth::{
        jwt::JwtKeys,
        password::hash_password,
        repo::{PgUserStore, UserStore},
        repo_types::NewUser,
        services::TokenService,
    },
    error::AuthError,
    state::AppState,
};

async fn configure_database() -> Option<PgPool> {
    let Ok(server_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping Postgres store test");
        return None;
    };
    let server_url = server_url.trim_end_matches('/').to_string();
    let db_name = format!("vidtube_test_{}", Uuid::new_v4().simple());

    let mut connection = PgConnection::connect(&server_url)
        .await
        .expect("Failed to connect to Postgres");
    connection
        .execute(&*format!(r#"CREATE DATABASE "{}";"#, db_name))
        .await
        .expect("Failed to create database.");

    let pool = PgPool::connect(&format!("{}/{}", server_url, db_name))
        .await
        .expect("Failed to connect to Postgres.");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to migrate the database.");
    Some(pool)
}

fn new_user(user_name: &str, email: &str) -> NewUser {
    NewUser {
        user_name: user_name.into(),
        email: email.into(),
        full_name: "Test User".into(),
        password: hash_password("secret123").expect("hash"),
        avatar: "https://cdn.local/avatar.png".into(),
        cover_image: None,
    }
}

#[tokio::test]
async fn duplicate_user_name_or_email_is_a_conflict() {
    let Some(pool) = configure_database().await else {
        return;
    };
    let store = PgUserStore::new(pool);
    let first = store.create(new_user("alice", "a@x.com")).await.unwrap();

    let err = store.create(new_user("alice", "other@x.com")).await.unwrap_err();
    assert!(matches!(err, AuthError::Conflict(ref m) if m.contains("userName")));
    let err = store.create(new_user("other", "a@x.com")).await.unwrap_err();
    assert!(matches!(err, AuthError::Conflict(ref m) if m.contains("email")));

    let still = store.find_by_id(first.id).await.unwrap().unwrap();
    assert_eq!(still.user_name, "alice");
    assert_eq!(still.email, "a@x.com");
    assert_eq!(still.password_hash, first.password_hash);
}

#[tokio::test]
async fn finds_by_user_name_or_email() {
    let Some(pool) = configure_database().await else {
        return;
    };
    let store = PgUserStore::new(pool);
    let created = store.create(new_user("alice", "a@x.com")).await.unwrap();

    let by_name = store.find_by_identifier(" Alice ").await.unwrap().unwrap();
    let by_email = store.find_by_identifier("A@X.COM").await.unwrap().unwrap();
    assert_eq!(by_name.id, created.id);
    assert_eq!(by_email.id, created.id);
    assert!(store.find_by_identifier("bob").await.unwrap().is_none());
    assert!(created.verify_password("secret123").await.unwrap());
}

#[tokio::test]
async fn rotate_with_stale_value_writes_nothing() {
    let Some(pool) = configure_database().await else {
        return;
    };
    let store = PgUserStore::new(pool);
    let user = store.create(new_user("alice", "a@x.com")).await.unwrap();
    store.update_refresh_token(user.id, Some("t1")).await.unwrap();

    assert!(store.rotate_refresh_token(user.id, "t1", "t2").await.unwrap());
    assert!(!store.rotate_refresh_token(user.id, "t1", "t3").await.unwrap());
    let stored = store.find_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(stored.refresh_token.as_deref(), Some("t2"));

    store.update_refresh_token(user.id, None).await.unwrap();
    assert!(!store.rotate_refresh_token(user.id, "t2", "t4").await.unwrap());
    let stored = store.find_by_id(user.id).await.unwrap().unwrap();
    assert!(stored.refresh_token.is_none());
}

#[tokio::test]
async fn concurrent_refresh_has_exactly_one_winner() {
    let Some(pool) = configure_database().await else {
        return;
    };
    let store: Arc<dyn UserStore> = Arc::new(PgUserStore::new(pool));
    store.create(new_user("alice", "a@x.com")).await.unwrap();
    let keys = JwtKeys::from_config(&AppState::fake().config.jwt);
    let service = TokenService::new(store.clone(), keys);

    let tokens = service.login("alice", "secret123").await.unwrap().tokens;
    let (a, b) = tokio::join!(
        service.refresh(Some(&tokens.refresh_token)),
        service.refresh(Some(&tokens.refresh_token))
    );
    let (winner, loser) = match (a, b) {
        (Ok(t), Err(e)) | (Err(e), Ok(t)) => (t, e),
        (a, b) => panic!("expected one winner, got {:?} and {:?}", a.is_ok(), b.is_ok()),
    };
    assert!(matches!(loser, AuthError::TokenReuse));

    let user = store.find_by_identifier("alice").await.unwrap().unwrap();
    assert_eq!(user.refresh_token.as_deref(), Some(winner.refresh_token.as_str()));
}
