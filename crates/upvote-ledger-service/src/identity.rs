//! Anonymous browser identity carried in the `userId` cookie.
//!
//! The identifier is unauthenticated: whoever presents the cookie is treated
//! as that voter. It only exists so one browser cannot upvote the same project
//! twice.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use time::Duration;
use upvote_ledger_core::{now_utc, UserId};

pub const USER_ID_COOKIE: &str = "userId";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookiePolicy {
    pub secure: bool,
    pub max_age: Duration,
}

impl CookiePolicy {
    #[must_use]
    pub fn new(secure: bool) -> Self {
        Self { secure, max_age: Duration::days(365) }
    }
}

/// Returns the caller's identity and the jar to send back.
///
/// A missing or malformed cookie yields a fresh identifier plus a `Set-Cookie`
/// for it. The identifier is valid for the current request whether or not the
/// browser keeps the cookie; a browser that drops it simply gets a new one on
/// its next request.
pub fn resolve_user_id(jar: CookieJar, policy: &CookiePolicy) -> (UserId, CookieJar) {
    if let Some(cookie) = jar.get(USER_ID_COOKIE) {
        match UserId::parse(cookie.value()) {
            Ok(user_id) => return (user_id, jar),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed userId cookie");
            }
        }
    }

    let user_id = UserId::generate();
    let cookie = issue_cookie(&user_id, policy);
    tracing::debug!(user_id = %user_id, "issued anonymous identity");
    (user_id, jar.add(cookie))
}

fn issue_cookie(user_id: &UserId, policy: &CookiePolicy) -> Cookie<'static> {
    Cookie::build((USER_ID_COOKIE, user_id.to_string()))
        .path("/")
        .max_age(policy.max_age)
        .expires(now_utc() + policy.max_age)
        .same_site(SameSite::Strict)
        .http_only(true)
        .secure(policy.secure)
        .build()
}
