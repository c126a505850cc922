use std::time::Duration;

use anyhow::Context;
use axum::http::{
    header::{COOKIE, SET_COOKIE},
    HeaderMap, HeaderValue,
};

use crate::auth::jwt::{JwtKeys, TokenPair};
use crate::error::AuthError;

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

fn set_cookie(name: &str, value: &str, max_age: Duration, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}",
        name,
        value,
        max_age.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn append(headers: &mut HeaderMap, cookie: String) -> Result<(), AuthError> {
    let value = HeaderValue::from_str(&cookie).context("build Set-Cookie header")?;
    headers.append(SET_COOKIE, value);
    Ok(())
}

/// `Set-Cookie` headers carrying a fresh token pair.
pub fn session_cookies(
    tokens: &TokenPair,
    keys: &JwtKeys,
    secure: bool,
) -> Result<HeaderMap, AuthError> {
    let mut headers = HeaderMap::new();
    append(
        &mut headers,
        set_cookie(ACCESS_COOKIE, &tokens.access_token, keys.access_ttl(), secure),
    )?;
    append(
        &mut headers,
        set_cookie(REFRESH_COOKIE, &tokens.refresh_token, keys.refresh_ttl(), secure),
    )?;
    Ok(headers)
}

/// `Set-Cookie` headers that expire both session cookies.
pub fn cleared_cookies(secure: bool) -> Result<HeaderMap, AuthError> {
    let mut headers = HeaderMap::new();
    append(&mut headers, set_cookie(ACCESS_COOKIE, "", Duration::ZERO, secure))?;
    append(&mut headers, set_cookie(REFRESH_COOKIE, "", Duration::ZERO, secure))?;
    Ok(headers)
}

/// Value of the named cookie from the request's `Cookie` headers.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use axum::extract::FromRef;

    #[test]
    fn session_cookies_are_http_only() {
        let keys = JwtKeys::from_ref(&AppState::fake());
        let tokens = TokenPair {
            access_token: "aaa".into(),
            refresh_token: "rrr".into(),
        };
        let headers = session_cookies(&tokens, &keys, true).unwrap();
        let values: Vec<_> = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(values.len(), 2);
        assert!(values[0].starts_with("accessToken=aaa;"));
        assert!(values[0].contains("Max-Age=300"));
        assert!(values[1].starts_with("refreshToken=rrr;"));
        assert!(values.iter().all(|v| v.contains("HttpOnly") && v.contains("Secure")));
    }

    #[test]
    fn cleared_cookies_expire_immediately() {
        let headers = cleared_cookies(false).unwrap();
        for v in headers.get_all(SET_COOKIE) {
            let v = v.to_str().unwrap();
            assert!(v.contains("Max-Age=0"));
            assert!(!v.contains("Secure"));
        }
    }

    #[test]
    fn reads_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; refreshToken=abc.def.ghi; accessToken="),
        );
        assert_eq!(read_cookie(&headers, REFRESH_COOKIE).as_deref(), Some("abc.def.ghi"));
        assert_eq!(read_cookie(&headers, ACCESS_COOKIE), None);
        assert_eq!(read_cookie(&headers, "missing"), None);
    }
}
