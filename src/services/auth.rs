use crate::{
    config::Config,
    error::{AppError, Result},
    models::identity::{Claims, Identity, OAuthProvider, Session, TokenGrant},
    services::supabase::SupabaseClient,
    utils::validation::validate_redirect_target,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

/// Refresh this long before the access token actually expires.
const EXPIRY_LEEWAY_SECS: i64 = 10;

/// 认证提供方接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The identity of the ambient session, if any.
    async fn current_identity(&self) -> Result<Option<Identity>>;

    /// URL the host must open to start the provider's OAuth flow.
    async fn sign_in(&self, provider: OAuthProvider, redirect_to: &str) -> Result<Url>;

    /// Establishes the session from the redirect the OAuth flow came back with.
    async fn complete_sign_in(&self, redirect: &str) -> Result<Identity>;

    async fn sign_out(&self) -> Result<()>;
}

/// The ambient session, shared by the auth, store and change-feed clients of
/// one platform connection.
#[derive(Clone, Default)]
pub struct SessionHandle {
    slot: Arc<RwLock<Option<Session>>>,
    file: Option<Arc<PathBuf>>,
    /// Token of a signed-out session the server has not confirmed revoking.
    pending_revocation: Arc<RwLock<Option<String>>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session backed by a JSON file; a missing or unreadable file starts
    /// signed out.
    pub async fn persisted(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let session = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Session>(&bytes) {
                Ok(session) => {
                    debug!("Loaded persisted session for user: {}", session.identity.id);
                    Some(session)
                }
                Err(e) => {
                    warn!("Ignoring unreadable session file {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read session file {}: {}", path.display(), e);
                None
            }
        };

        Self {
            slot: Arc::new(RwLock::new(session)),
            file: Some(Arc::new(path)),
            pending_revocation: Arc::default(),
        }
    }

    pub fn get(&self) -> Option<Session> {
        self.slot.read().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.slot.read().as_ref().map(|s| s.identity.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.slot.read().as_ref().map(|s| s.access_token.clone())
    }

    pub async fn set(&self, session: Session) -> Result<()> {
        *self.slot.write() = Some(session);
        self.persist().await
    }

    pub async fn clear(&self) -> Result<()> {
        self.slot.write().take();
        self.persist().await
    }

    /// Remembers a token whose remote sign-out failed, so a later sign-out
    /// can revoke it.
    pub fn defer_revocation(&self, access_token: String) {
        *self.pending_revocation.write() = Some(access_token);
    }

    pub fn take_pending_revocation(&self) -> Option<String> {
        self.pending_revocation.write().take()
    }

    pub fn has_pending_revocation(&self) -> bool {
        self.pending_revocation.read().is_some()
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = self.file.as_deref() else {
            return Ok(());
        };

        let snapshot = self.get();
        match snapshot {
            Some(session) => {
                let bytes = serde_json::to_vec_pretty(&session)?;
                tokio::fs::write(path, bytes).await?;
            }
            None => match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }
}

/// Decodes the claims of an access token without checking its signature.
/// The platform verifies signatures; locally the claims only drive expiry
/// and identity hints.
pub fn decode_claims(token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;

    let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims)
}

#[derive(Debug, Deserialize)]
struct PlatformUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl From<PlatformUser> for Identity {
    fn from(user: PlatformUser) -> Self {
        Identity {
            id: user.id,
            email: user.email.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(flatten)]
    grant: TokenGrant,
    #[serde(default)]
    user: Option<PlatformUser>,
}

/// Redirect error parameters, as returned by GoTrue when the user declines.
#[derive(Debug, Deserialize)]
struct RedirectError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Supabase Auth (GoTrue) 客户端
#[derive(Clone)]
pub struct SupabaseAuth {
    client: SupabaseClient,
    session: SessionHandle,
}

impl SupabaseAuth {
    pub fn new(config: &Config, session: SessionHandle) -> Result<Self> {
        Ok(Self::with_client(SupabaseClient::new(config)?, session))
    }

    pub fn with_client(client: SupabaseClient, session: SessionHandle) -> Self {
        Self { client, session }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    async fn fetch_user(&self, access_token: &str) -> Result<Identity> {
        let url = self.client.endpoint("auth/v1/user")?;
        let response = self
            .client
            .request(Method::GET, url, Some(access_token))
            .send()
            .await
            .map_err(|e| {
                error!("Failed to fetch user from auth service: {}", e);
                AppError::from(e)
            })?;

        let user: PlatformUser = SupabaseClient::check(response).await?.json().await?;
        Ok(user.into())
    }

    async fn refresh(&self, session: &Session) -> Result<Session> {
        let refresh_token = session
            .refresh_token
            .as_deref()
            .ok_or_else(|| AppError::unauthorized("Session expired and has no refresh token"))?;

        let mut url = self.client.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "refresh_token");

        let response = self
            .client
            .request(Method::POST, url, None)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        let body: RefreshResponse = SupabaseClient::check(response).await?.json().await?;
        let identity = match body.user {
            Some(user) => user.into(),
            None => session.identity.clone(),
        };

        let mut refreshed = body.grant.into_session(identity);
        if refreshed.expires_at.is_none() {
            refreshed.expires_at = token_expiry(&refreshed.access_token);
        }
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = session.refresh_token.clone();
        }

        info!("Refreshed session for user: {}", refreshed.identity.id);
        Ok(refreshed)
    }
}

impl SupabaseAuth {
    async fn revoke(&self, access_token: &str) -> Result<()> {
        let url = self.client.endpoint("auth/v1/logout")?;
        let response = self
            .client
            .request(Method::POST, url, Some(access_token))
            .send()
            .await?;
        SupabaseClient::check(response).await?;
        Ok(())
    }
}

fn token_expiry(access_token: &str) -> Option<DateTime<Utc>> {
    decode_claims(access_token)
        .ok()
        .and_then(|claims| DateTime::<Utc>::from_timestamp(claims.exp, 0))
}

/// Token parameters from the fragment (implicit flow) or, failing that, the
/// query string of the redirect URL.
fn redirect_params(redirect: &Url) -> Option<&str> {
    redirect
        .fragment()
        .filter(|f| !f.is_empty())
        .or_else(|| redirect.query().filter(|q| !q.is_empty()))
}

#[async_trait]
impl AuthProvider for SupabaseAuth {
    async fn current_identity(&self) -> Result<Option<Identity>> {
        let Some(mut session) = self.session.get() else {
            debug!("No ambient session");
            return Ok(None);
        };

        if session.is_expired(Duration::seconds(EXPIRY_LEEWAY_SECS)) {
            match self.refresh(&session).await {
                Ok(refreshed) => {
                    self.session.set(refreshed.clone()).await?;
                    session = refreshed;
                }
                Err(AppError::Authentication(msg)) | Err(AppError::BadRequest(msg)) => {
                    warn!("Session could not be refreshed, signing out locally: {}", msg);
                    self.session.clear().await?;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        match self.fetch_user(&session.access_token).await {
            Ok(identity) => Ok(Some(identity)),
            Err(AppError::Authentication(msg)) => {
                warn!("Auth service rejected the stored session: {}", msg);
                self.session.clear().await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn sign_in(&self, provider: OAuthProvider, redirect_to: &str) -> Result<Url> {
        let redirect = validate_redirect_target(redirect_to)?;
        let mut url = self.client.endpoint("auth/v1/authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider.as_str())
            .append_pair("redirect_to", redirect.as_str());

        info!("Starting {} sign-in, redirecting back to {}", provider, redirect);
        Ok(url)
    }

    async fn complete_sign_in(&self, redirect: &str) -> Result<Identity> {
        let redirect = Url::parse(redirect.trim())?;
        let params = redirect_params(&redirect)
            .ok_or_else(|| AppError::unauthorized("Redirect carries no session parameters"))?;

        if let Ok(err) = serde_urlencoded::from_str::<RedirectError>(params) {
            let detail = err.error_description.unwrap_or(err.error);
            warn!("OAuth provider reported an error: {}", detail);
            return Err(AppError::Authentication(detail));
        }

        let grant: TokenGrant = serde_urlencoded::from_str(params)
            .map_err(|e| AppError::Parse(format!("Invalid sign-in redirect: {}", e)))?;

        let identity = self.fetch_user(&grant.access_token).await?;
        let mut session = grant.into_session(identity.clone());
        if session.expires_at.is_none() {
            session.expires_at = token_expiry(&session.access_token);
        }
        self.session.set(session).await?;

        info!("Signed in as user: {}", identity.id);
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<()> {
        // Local session goes first so a failed logout call never leaves us signed in.
        let access_token = match self.session.get() {
            Some(session) => {
                self.session.clear().await?;
                info!("Signing out user: {}", session.identity.id);
                session.access_token
            }
            None => match self.session.take_pending_revocation() {
                Some(token) => {
                    debug!("Retrying revocation of a previous session");
                    token
                }
                None => return Ok(()),
            },
        };

        match self.revoke(&access_token).await {
            Ok(()) => Ok(()),
            // The token was already invalid server-side.
            Err(AppError::Authentication(_)) | Err(AppError::NotFound(_)) => Ok(()),
            Err(e) => {
                self.session.defer_revocation(access_token);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(sub: &str, exp: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp,
            iat: Some(exp - 3600),
            email: Some(format!("{}@example.com", sub)),
            session_id: None,
            role: Some("authenticated".into()),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"not-the-platform-secret"),
        )
        .unwrap()
    }

    #[test]
    fn decodes_claims_without_the_signing_secret() {
        let exp = Utc::now().timestamp() + 3600;
        let claims = decode_claims(&token("u1", exp)).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.exp, exp);
        assert_eq!(claims.email.as_deref(), Some("u1@example.com"));
    }

    #[test]
    fn expired_tokens_still_decode() {
        let exp = Utc::now().timestamp() - 60;
        assert_eq!(token_expiry(&token("u1", exp)).unwrap().timestamp(), exp);
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(decode_claims("not.a.jwt").is_err());
    }

    #[test]
    fn redirect_params_prefer_fragment() {
        let url = Url::parse("http://localhost:3000/?code=abc#access_token=t&expires_in=3600").unwrap();
        assert_eq!(redirect_params(&url), Some("access_token=t&expires_in=3600"));

        let url = Url::parse("http://localhost:3000/?error=access_denied").unwrap();
        assert_eq!(redirect_params(&url), Some("error=access_denied"));

        let url = Url::parse("http://localhost:3000/").unwrap();
        assert_eq!(redirect_params(&url), None);
    }

    #[tokio::test]
    async fn session_handle_persists_and_clears() {
        let dir = std::env::temp_dir().join(format!("smart-bookmarks-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("session.json");

        let handle = SessionHandle::persisted(&path).await;
        assert!(handle.get().is_none());

        handle
            .set(Session {
                access_token: "t".into(),
                refresh_token: Some("r".into()),
                expires_at: None,
                identity: Identity::new("u1", "u1@example.com"),
            })
            .await
            .unwrap();

        let reloaded = SessionHandle::persisted(&path).await;
        assert_eq!(reloaded.identity(), Some(Identity::new("u1", "u1@example.com")));
        assert_eq!(reloaded.access_token().as_deref(), Some("t"));

        reloaded.clear().await.unwrap();
        assert!(!path.exists());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
