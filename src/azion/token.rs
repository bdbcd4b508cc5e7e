// Credentials and token lifecycle types for the Azion API
//
// The token endpoint answers with timestamps in a fixed, non-ISO format
// ("2019-03-10 21:04:51"), which are always UTC.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::fmt;

/// Exact format of `created_at` / `expires_at` in token responses
pub const API_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Account credentials exchanged for a token
#[derive(Clone)]
pub struct Credentials {
    email: String,
    password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"****")
            .finish()
    }
}

/// Bearer token issued by `POST /tokens`
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Token {
    pub fn new(value: impl Into<String>, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Token {
            value: value.into(),
            issued_at,
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// A token is valid strictly before its expiry instant.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"****")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Raw body of a successful `POST /tokens`
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub token: String,
    pub created_at: String,
    pub expires_at: String,
}

impl TokenResponse {
    pub(crate) fn into_token(self) -> Result<Token, String> {
        if self.token.is_empty() {
            return Err("token response carries an empty token".to_string());
        }
        let issued_at = parse_api_datetime(&self.created_at)
            .map_err(|e| format!("invalid created_at '{}': {}", self.created_at, e))?;
        let expires_at = parse_api_datetime(&self.expires_at)
            .map_err(|e| format!("invalid expires_at '{}': {}", self.expires_at, e))?;
        Ok(Token::new(self.token, issued_at, expires_at))
    }
}

/// Parses `YYYY-MM-DD HH:MM:SS` as a UTC instant.
pub fn parse_api_datetime(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, API_DATETIME_FORMAT).map(|naive| Utc.from_utc_datetime(&naive))
}

/// Formats a UTC instant the way the token endpoint does.
#[cfg(test)]
pub fn format_api_datetime(at: DateTime<Utc>) -> String {
    at.format(API_DATETIME_FORMAT).to_string()
}

/// Source of the current time for token validity checks
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[cfg(test)]
pub(crate) struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(start: DateTime<Utc>) -> Self {
        ManualClock(std::sync::Mutex::new(start))
    }

    pub(crate) fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}
