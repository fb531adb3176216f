use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The authenticated principal, as issued by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }
}

/// OAuth 提供方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthProvider {
    Google,
    Github,
    Gitlab,
    Azure,
    Discord,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Github => "github",
            OAuthProvider::Gitlab => "gitlab",
            OAuthProvider::Azure => "azure",
            OAuthProvider::Discord => "discord",
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OAuthProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(OAuthProvider::Google),
            "github" => Ok(OAuthProvider::Github),
            "gitlab" => Ok(OAuthProvider::Gitlab),
            "azure" => Ok(OAuthProvider::Azure),
            "discord" => Ok(OAuthProvider::Discord),
            other => Err(anyhow::anyhow!("unsupported OAuth provider '{}'", other)),
        }
    }
}

/// JWT claims carried by a platform access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Bearer credentials of the signed-in principal.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub identity: Identity,
}

// Tokens stay out of logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

impl Session {
    /// Expired, or expiring within `leeway`.
    pub fn is_expired(&self, leeway: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - leeway <= Utc::now(),
            None => false,
        }
    }
}

/// Token set returned to the redirect target after an OAuth sign-in, or by
/// the token endpoint on refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "crate::utils::serde_helpers::lenient_i64::deserialize")]
    pub expires_in: Option<i64>,
    #[serde(default, deserialize_with = "crate::utils::serde_helpers::lenient_i64::deserialize")]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenGrant {
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        if let Some(at) = self.expires_at {
            return DateTime::<Utc>::from_timestamp(at, 0);
        }
        self.expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs))
    }

    pub fn into_session(self, identity: Identity) -> Session {
        let expires_at = self.expiry();
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            identity,
        }
    }
}
