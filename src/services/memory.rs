//! In-process managed platform.
//!
//! Plays the role of the hosted auth/data/realtime services for tests and
//! the demo backend. Access policy mirrors a row-level-security setup where
//! `user_id = auth.uid()` guards select, insert and delete.

use crate::{
    error::{AppError, Result},
    models::{
        bookmark::{Bookmark, NewBookmark},
        identity::{Identity, OAuthProvider, Session},
        realtime::{ChangeEvent, ChangeFilter, ChangeKind, RowFilter, SubscriptionId},
    },
    services::{
        auth::{AuthProvider, SessionHandle},
        database::{BookmarkQuery, BookmarkStore},
        realtime::{ChangeFeed, Subscription},
    },
    utils::validation::validate_redirect_target,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Resolve,
    Query,
    Insert,
    Delete,
    SignOut,
    Subscribe,
}

struct FeedSubscriber {
    principal: Option<String>,
    filter: ChangeFilter,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

struct PlatformState {
    schema: String,
    table: String,
    /// access token -> identity
    accounts: DashMap<String, Identity>,
    rows: RwLock<Vec<Bookmark>>,
    next_id: AtomicU64,
    last_created_at: Mutex<Option<DateTime<Utc>>>,
    subscribers: DashMap<SubscriptionId, FeedSubscriber>,
    faults: Mutex<HashMap<Fault, usize>>,
    query_gate: Mutex<Option<Arc<Semaphore>>>,
}

/// 内存平台
#[derive(Clone)]
pub struct MemoryPlatform {
    state: Arc<PlatformState>,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new("public", "bookmarks")
    }
}

impl MemoryPlatform {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            state: Arc::new(PlatformState {
                schema: schema.to_string(),
                table: table.to_string(),
                accounts: DashMap::new(),
                rows: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                last_created_at: Mutex::new(None),
                subscribers: DashMap::new(),
                faults: Mutex::new(HashMap::new()),
                query_gate: Mutex::new(None),
            }),
        }
    }

    /// A new client connection with its own, initially signed-out, session.
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            platform: self.state.clone(),
            session: SessionHandle::new(),
        }
    }

    /// Issues an access token for `identity`.
    pub fn issue_token(&self, identity: &Identity) -> String {
        let token = format!("mem-{}", Uuid::new_v4());
        self.state.accounts.insert(token.clone(), identity.clone());
        token
    }

    /// Redirect URL the provider would send the user back to after signing in as `identity`.
    pub fn sign_in_redirect(&self, identity: &Identity, redirect_to: &str) -> String {
        let token = self.issue_token(identity);
        format!(
            "{}#access_token={}&token_type=bearer&expires_in=3600",
            redirect_to.trim_end_matches('#'),
            token
        )
    }

    /// Tokens the platform still accepts for `user_id`.
    pub fn live_sessions(&self, user_id: &str) -> usize {
        self.state
            .accounts
            .iter()
            .filter(|entry| entry.value().id == user_id)
            .count()
    }

    /// Invalidates every token issued for `user_id`.
    pub fn revoke(&self, user_id: &str) {
        self.state.accounts.retain(|_, identity| identity.id != user_id);
    }

    /// Makes the next `count` calls of `fault` fail with `ServiceUnavailable`.
    pub fn fail_next(&self, fault: Fault, count: usize) {
        *self.state.faults.lock().entry(fault).or_insert(0) += count;
    }

    /// Holds every query after it has captured its caller until permits are
    /// added to the returned semaphore.
    pub fn gate_queries(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.state.query_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn open_queries(&self) {
        if let Some(gate) = self.state.query_gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Every row, bypassing access policy. Test inspection only.
    pub fn all_rows(&self) -> Vec<Bookmark> {
        self.state.rows.read().clone()
    }

    /// Inserts a row on behalf of `owner` as if written by another client.
    pub fn seed(&self, owner: &Identity, title: &str, url: &str) -> Bookmark {
        let row = NewBookmark {
            title: title.to_string(),
            url: url.to_string(),
            owner_id: owner.id.clone(),
        };
        self.state.write_row(row)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.live_subscribers()
    }
}

impl PlatformState {
    fn take_fault(&self, fault: Fault) -> Result<()> {
        let mut faults = self.faults.lock();
        match faults.get_mut(&fault) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(AppError::ServiceUnavailable(format!(
                    "injected {:?} failure",
                    fault
                )))
            }
            _ => Ok(()),
        }
    }

    /// Strictly increasing, so newest-first order is total.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_created_at.lock();
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    fn write_row(&self, row: NewBookmark) -> Bookmark {
        let bookmark = Bookmark {
            id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
            title: row.title,
            url: row.url,
            owner_id: row.owner_id,
            created_at: self.next_timestamp(),
        };
        self.rows.write().push(bookmark.clone());
        self.publish(ChangeKind::Insert, &bookmark);
        bookmark
    }

    fn publish(&self, kind: ChangeKind, row: &Bookmark) {
        let event = ChangeEvent {
            schema: self.schema.clone(),
            table: self.table.clone(),
            kind,
            commit_timestamp: Some(Utc::now()),
        };

        self.subscribers.retain(|_, subscriber| !subscriber.tx.is_closed());
        for subscriber in self.subscribers.iter() {
            let visible = subscriber.principal.as_deref() == Some(row.owner_id.as_str());
            let wanted = subscriber.filter.matches(&event)
                && subscriber
                    .filter
                    .row_filter
                    .as_ref()
                    .map_or(true, |f| row_matches(row, f));
            if visible && wanted {
                let _ = subscriber.tx.send(event.clone());
            }
        }
    }

    fn live_subscribers(&self) -> usize {
        self.subscribers.retain(|_, subscriber| !subscriber.tx.is_closed());
        self.subscribers.len()
    }
}

fn row_matches(row: &Bookmark, filter: &RowFilter) -> bool {
    let field = match filter.column() {
        "id" => &row.id,
        "user_id" => &row.owner_id,
        "title" => &row.title,
        "url" => &row.url,
        _ => return false,
    };
    field == filter.value()
}

/// One client connection to a [`MemoryPlatform`].
#[derive(Clone)]
pub struct MemoryClient {
    platform: Arc<PlatformState>,
    session: SessionHandle,
}

impl MemoryClient {
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Establishes a session for `identity` without the redirect round trip.
    pub async fn sign_in_as(&self, identity: &Identity) -> Result<()> {
        let token = format!("mem-{}", Uuid::new_v4());
        self.platform.accounts.insert(token.clone(), identity.clone());
        self.session
            .set(Session {
                access_token: token,
                refresh_token: None,
                expires_at: None,
                identity: identity.clone(),
            })
            .await
    }

    /// The principal the platform sees for this connection right now.
    fn principal(&self) -> Option<Identity> {
        let token = self.session.access_token()?;
        self.platform.accounts.get(&token).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl AuthProvider for MemoryClient {
    async fn current_identity(&self) -> Result<Option<Identity>> {
        self.platform.take_fault(Fault::Resolve)?;
        Ok(self.principal())
    }

    async fn sign_in(&self, provider: OAuthProvider, redirect_to: &str) -> Result<Url> {
        let redirect = validate_redirect_target(redirect_to)?;
        let mut url = Url::parse("memory://auth/authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider.as_str())
            .append_pair("redirect_to", redirect.as_str());
        Ok(url)
    }

    async fn complete_sign_in(&self, redirect: &str) -> Result<Identity> {
        let redirect = Url::parse(redirect.trim())?;
        let token = redirect
            .fragment()
            .and_then(|fragment| {
                url::form_urlencoded::parse(fragment.as_bytes())
                    .find(|(key, _)| key == "access_token")
                    .map(|(_, value)| value.into_owned())
            })
            .ok_or_else(|| AppError::unauthorized("Redirect carries no access token"))?;

        let identity = self
            .platform
            .accounts
            .get(&token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::unauthorized("Unknown or revoked access token"))?;

        self.session
            .set(Session {
                access_token: token,
                refresh_token: None,
                expires_at: None,
                identity: identity.clone(),
            })
            .await?;

        info!("Memory platform signed in user: {}", identity.id);
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<()> {
        let token = match self.session.access_token() {
            Some(token) => {
                self.session.clear().await?;
                token
            }
            None => match self.session.take_pending_revocation() {
                Some(token) => token,
                None => return Ok(()),
            },
        };

        if let Err(e) = self.platform.take_fault(Fault::SignOut) {
            self.session.defer_revocation(token);
            return Err(e);
        }
        self.platform.accounts.remove(&token);
        Ok(())
    }
}

#[async_trait]
impl BookmarkStore for MemoryClient {
    async fn query(&self, query: &BookmarkQuery) -> Result<Vec<Bookmark>> {
        // The caller is fixed when the request is issued, as with a bearer token.
        let principal = self.principal();

        let gate = self.platform.query_gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.platform.take_fault(Fault::Query)?;

        let Some(principal) = principal else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<Bookmark> = self
            .platform
            .rows
            .read()
            .iter()
            .filter(|row| row.owner_id == principal.id)
            .filter(|row| query.filter.as_ref().map_or(true, |f| row_matches(row, f)))
            .cloned()
            .collect();

        match query.order.column.as_str() {
            "title" => rows.sort_by(|a, b| a.title.cmp(&b.title)),
            "url" => rows.sort_by(|a, b| a.url.cmp(&b.url)),
            _ => rows.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        }
        if query.order.descending {
            rows.reverse();
        }

        debug!("Memory platform returned {} rows to {}", rows.len(), principal.id);
        Ok(rows)
    }

    async fn insert(&self, row: NewBookmark) -> Result<Bookmark> {
        self.platform.take_fault(Fault::Insert)?;

        let principal = self
            .principal()
            .ok_or_else(|| AppError::unauthorized("Insert requires a signed-in session"))?;
        if principal.id != row.owner_id {
            return Err(AppError::forbidden(
                "new row violates row-level security policy for table",
            ));
        }

        Ok(self.platform.write_row(row))
    }

    async fn delete(&self, filter: &RowFilter) -> Result<()> {
        self.platform.take_fault(Fault::Delete)?;

        let Some(principal) = self.principal() else {
            return Ok(());
        };

        let removed: Vec<Bookmark> = {
            let mut rows = self.platform.rows.write();
            let (gone, kept): (Vec<_>, Vec<_>) = rows
                .drain(..)
                .partition(|row| row.owner_id == principal.id && row_matches(row, filter));
            *rows = kept;
            gone
        };

        for row in &removed {
            self.platform.publish(ChangeKind::Delete, row);
        }
        debug!("Memory platform deleted {} rows for {}", removed.len(), principal.id);
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryClient {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription> {
        self.platform.take_fault(Fault::Subscribe)?;

        let id = SubscriptionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.platform.subscribers.insert(
            id.clone(),
            FeedSubscriber {
                principal: self.principal().map(|identity| identity.id),
                filter,
                tx,
            },
        );

        debug!("Memory platform opened subscription {}", id);
        Ok(Subscription::new(id, rx))
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        if self.platform.subscribers.remove(id).is_some() {
            debug!("Memory platform closed subscription {}", id);
        }
        Ok(())
    }

    fn active_subscriptions(&self) -> usize {
        self.platform.live_subscribers()
    }
}
