use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRef, Multipart, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{instrument, warn};

use crate::{
    auth::{
        cookies::{cleared_cookies, read_cookie, session_cookies, REFRESH_COOKIE},
        dto::{ApiResponse, ChangePasswordRequest, LoginRequest, LoginResponse, RefreshRequest},
        extractors::AuthUser,
        jwt::TokenPair,
        repo_types::PublicUser,
        services::{RegisterInput, TokenService},
    },
    error::AuthError,
    images::services::{
        discard_images, ext_from_mime, upload_profile_image, ImageSlot, UploadItem,
    },
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/users/register",
            post(register).layer(DefaultBodyLimit::max(10 * 1024 * 1024)),
        )
        .route("/users/login", post(login))
        .route("/users/refresh-token", post(refresh))
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/users/logout", post(logout))
        .route("/users/current-user", get(current_user))
        .route("/users/change-password", post(change_password))
        .route("/users/reset-password", post(change_password))
}

fn bad_body(e: JsonRejection) -> AuthError {
    AuthError::Validation(format!("Invalid request body: {}", e.body_text()))
}

#[derive(Default)]
struct RegisterForm {
    user_name: Option<String>,
    email: Option<String>,
    full_name: Option<String>,
    password: Option<String>,
    avatar: Option<UploadItem>,
    cover_image: Option<UploadItem>,
}

async fn read_register_form(mut mp: Multipart) -> Result<RegisterForm, AuthError> {
    let mut form = RegisterForm::default();
    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| AuthError::Validation(format!("Invalid multipart body: {}", e.body_text())))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "avatar" | "coverImage" => {
                let content_type = field
                    .content_type()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "application/octet-stream".into());
                if ext_from_mime(&content_type).is_none() {
                    return Err(AuthError::Validation(format!("{name} must be an image")));
                }
                let body = field.bytes().await.map_err(|e| {
                    AuthError::Validation(format!("Invalid multipart body: {}", e.body_text()))
                })?;
                if body.is_empty() {
                    continue;
                }
                let item = UploadItem { body, content_type };
                if name == "avatar" {
                    form.avatar = Some(item);
                } else {
                    form.cover_image = Some(item);
                }
            }
            "userName" | "email" | "fullName" | "password" => {
                let text = field.text().await.map_err(|e| {
                    AuthError::Validation(format!("Invalid multipart body: {}", e.body_text()))
                })?;
                let slot = match name.as_str() {
                    "userName" => &mut form.user_name,
                    "email" => &mut form.email,
                    "fullName" => &mut form.full_name,
                    _ => &mut form.password,
                };
                *slot = Some(text);
            }
            _ => {}
        }
    }
    Ok(form)
}

/// POST /users/register (multipart)
/// Text fields: userName, email, fullName, password. Files: avatar (required), coverImage.
#[instrument(skip(state, mp))]
pub async fn register(
    State(state): State<AppState>,
    mp: Multipart,
) -> Result<(StatusCode, Json<ApiResponse<PublicUser>>), AuthError> {
    let form = read_register_form(mp).await?;
    let input = RegisterInput::parse(
        form.user_name.as_deref(),
        form.email.as_deref(),
        form.full_name.as_deref(),
        form.password.as_deref(),
    )?;
    let avatar = form
        .avatar
        .ok_or_else(|| AuthError::Validation("Avatar is required".into()))?;

    let storage = state.storage.as_ref();
    let mut uploaded = Vec::with_capacity(2);
    let avatar = upload_profile_image(storage, &input.user_name, ImageSlot::Avatar, avatar).await?;
    uploaded.push(avatar.clone());
    let cover = match form.cover_image {
        Some(item) => {
            match upload_profile_image(storage, &input.user_name, ImageSlot::Cover, item).await {
                Ok(img) => {
                    uploaded.push(img.clone());
                    Some(img)
                }
                Err(e) => {
                    discard_images(storage, &uploaded).await;
                    return Err(e.into());
                }
            }
        }
        None => None,
    };

    let service = TokenService::from_ref(&state);
    match service
        .register(input, avatar.url, cover.map(|c| c.url))
        .await
    {
        Ok(user) => Ok((
            StatusCode::CREATED,
            Json(ApiResponse::new("User registered successfully", user)),
        )),
        Err(e) => {
            warn!(error = %e, "registration failed, removing uploaded images");
            discard_images(storage, &uploaded).await;
            Err(e)
        }
    }
}

#[instrument(skip(state, service, payload))]
pub async fn login(
    State(state): State<AppState>,
    State(service): State<TokenService>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<ApiResponse<LoginResponse>>), AuthError> {
    let Json(payload) = payload.map_err(bad_body)?;
    let identifiers = payload.identifiers();
    if identifiers.is_empty() {
        return Err(AuthError::Validation("Username or email is required".into()));
    }
    let password = payload
        .password
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AuthError::Validation("Password is required".into()))?;

    let outcome = service.login_any(&identifiers, password).await?;
    let headers = session_cookies(&outcome.tokens, service.keys(), state.config.cookie_secure)?;

    Ok((
        headers,
        Json(ApiResponse::new(
            "User logged in successfully",
            LoginResponse {
                user: outcome.user,
                access_token: outcome.tokens.access_token,
                refresh_token: outcome.tokens.refresh_token,
            },
        )),
    ))
}

#[instrument(skip(state, service))]
pub async fn logout(
    State(state): State<AppState>,
    State(service): State<TokenService>,
    AuthUser(user_id): AuthUser,
) -> Result<(HeaderMap, Json<ApiResponse<serde_json::Value>>), AuthError> {
    service.logout(user_id).await?;
    let headers = cleared_cookies(state.config.cookie_secure)?;
    Ok((headers, Json(ApiResponse::new("User logged out", json!({})))))
}

#[instrument(skip_all)]
pub async fn refresh(
    State(state): State<AppState>,
    State(service): State<TokenService>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Result<(HeaderMap, Json<ApiResponse<TokenPair>>), AuthError> {
    let presented = read_cookie(&headers, REFRESH_COOKIE)
        .or_else(|| body.and_then(|Json(b)| b.refresh_token));

    let tokens = service.refresh(presented.as_deref()).await?;
    let cookies = session_cookies(&tokens, service.keys(), state.config.cookie_secure)?;
    Ok((cookies, Json(ApiResponse::new("Access token refreshed", tokens))))
}

#[instrument(skip(service))]
pub async fn current_user(
    State(service): State<TokenService>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<ApiResponse<PublicUser>>, AuthError> {
    let user = service.current_user(user_id).await?;
    Ok(Json(ApiResponse::new("Current user fetched", user)))
}

#[instrument(skip(service, payload))]
pub async fn change_password(
    State(service): State<TokenService>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AuthError> {
    let Json(payload) = payload.map_err(bad_body)?;
    let (Some(old_password), Some(new_password)) = (payload.old_password, payload.new_password)
    else {
        return Err(AuthError::Validation(
            "oldPassword and newPassword are required".into(),
        ));
    };
    service
        .change_password(user_id, &old_password, &new_password)
        .await?;
    Ok(Json(ApiResponse::new("Password changed successfully", json!({}))))
}
