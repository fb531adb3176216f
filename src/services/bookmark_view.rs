//! The bookmark page: who is signed in, their bookmarks, the add form, and
//! the live subscription that keeps the list in step with the store.

use crate::{
    config::Config,
    error::{AppError, Result},
    models::{
        bookmark::{sort_newest_first, Bookmark, DraftBookmark},
        identity::{Identity, OAuthProvider},
        realtime::{ChangeFilter, RowFilter, SubscriptionId},
        view::{FailedOperation, ViewError, ViewPhase, ViewSnapshot},
    },
    services::{database::BookmarkQuery, realtime::Subscription},
    state::Platform,
    utils::validation::validate_bookmark_id,
};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::{
    sync::{watch, Mutex, OnceCell},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use url::Url;

/// 页面配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewOptions {
    pub schema: String,
    pub table: String,
    /// Column holding the owning user's id.
    pub owner_column: String,
    pub provider: OAuthProvider,
    pub redirect_to: String,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: "bookmarks".to_string(),
            owner_column: "user_id".to_string(),
            provider: OAuthProvider::Google,
            redirect_to: "http://localhost:3000".to_string(),
        }
    }
}

impl ViewOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            schema: config.bookmarks_schema.clone(),
            table: config.bookmarks_table.clone(),
            owner_column: "user_id".to_string(),
            provider: config.oauth_provider,
            redirect_to: config.auth_redirect_url.clone(),
        }
    }
}

#[derive(Debug)]
struct ViewState {
    phase: ViewPhase,
    identity: Option<Identity>,
    /// Bumped on every identity transition; results started under an older
    /// epoch are dropped.
    epoch: u64,
    draft: DraftBookmark,
    bookmarks: Vec<Bookmark>,
    /// Sequence number of the reload whose rows are on screen.
    applied_reload: u64,
    error: Option<ViewError>,
}

impl ViewState {
    fn new() -> Self {
        Self {
            phase: ViewPhase::Loading,
            identity: None,
            epoch: 0,
            draft: DraftBookmark::default(),
            bookmarks: Vec::new(),
            applied_reload: 0,
            error: None,
        }
    }

    fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            phase: self.phase,
            identity: self.identity.clone(),
            draft: self.draft.clone(),
            bookmarks: self.bookmarks.clone(),
            error: self.error.clone(),
        }
    }

    fn record(&mut self, operation: FailedOperation, err: &AppError) {
        self.error = Some(ViewError {
            operation,
            code: err.code().to_string(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        });
    }

    fn clear_error_if(&mut self, pred: impl Fn(&FailedOperation) -> bool) {
        if self.error.as_ref().map_or(false, |e| pred(&e.operation)) {
            self.error = None;
        }
    }
}

struct LiveSubscription {
    id: SubscriptionId,
    owner_id: String,
    listener: JoinHandle<()>,
}

struct ViewInner {
    platform: Platform,
    options: ViewOptions,
    state: RwLock<ViewState>,
    snapshots: watch::Sender<ViewSnapshot>,
    resolved: OnceCell<()>,
    reload_seq: AtomicU64,
    live: Mutex<Option<LiveSubscription>>,
}

impl ViewInner {
    /// Publishes the state while the write lock is still held, so snapshots
    /// are observed in the order they were made.
    fn commit(&self, state: &ViewState) {
        self.snapshots.send_replace(state.snapshot());
    }
}

impl Drop for ViewInner {
    fn drop(&mut self) {
        if let Some(live) = self.live.get_mut().take() {
            live.listener.abort();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let feed = self.platform.feed.clone();
                let id = live.id;
                handle.spawn(async move {
                    if let Err(e) = feed.unsubscribe(&id).await {
                        warn!("Failed to release subscription {} on drop: {}", id, e);
                    }
                });
            }
        }
    }
}

/// 书签页面
///
/// Cheap to clone; clones share one page. The subscription is released
/// when the last clone is dropped or on [`BookmarkView::close`].
#[derive(Clone)]
pub struct BookmarkView {
    inner: Arc<ViewInner>,
}

impl BookmarkView {
    pub fn new(platform: Platform, options: ViewOptions) -> Self {
        let (snapshots, _) = watch::channel(ViewSnapshot::loading());
        Self {
            inner: Arc::new(ViewInner {
                platform,
                options,
                state: RwLock::new(ViewState::new()),
                snapshots,
                resolved: OnceCell::new(),
                reload_seq: AtomicU64::new(0),
                live: Mutex::new(None),
            }),
        }
    }

    /// Creates the page and resolves the ambient identity.
    pub async fn open(platform: Platform, options: ViewOptions) -> Self {
        let view = Self::new(platform, options);
        view.resolve_identity().await;
        view
    }

    pub fn options(&self) -> &ViewOptions {
        &self.inner.options
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.inner.state.read().snapshot()
    }

    /// Receives every snapshot published from now on.
    pub fn watch(&self) -> watch::Receiver<ViewSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.state.read().identity.clone()
    }

    pub fn bookmarks(&self) -> Vec<Bookmark> {
        self.inner.state.read().bookmarks.clone()
    }

    pub async fn subscription_id(&self) -> Option<SubscriptionId> {
        self.inner.live.lock().await.as_ref().map(|live| live.id.clone())
    }

    /// Asks the auth service who is signed in. Runs once per page; later
    /// calls return the current identity.
    ///
    /// A failed lookup is treated as signed out.
    pub async fn resolve_identity(&self) -> Option<Identity> {
        self.inner
            .resolved
            .get_or_init(|| async {
                match self.inner.platform.auth.current_identity().await {
                    Ok(Some(identity)) => {
                        info!("Resolved identity: {}", identity.id);
                        self.enter_signed_in(identity).await;
                    }
                    Ok(None) => {
                        debug!("No signed-in user");
                        self.enter_signed_out();
                    }
                    Err(e) => {
                        warn!("Identity resolution failed, treating as signed out: {}", e);
                        self.enter_signed_out();
                    }
                }
            })
            .await;

        self.identity()
    }

    fn enter_signed_out(&self) {
        let mut state = self.inner.state.write();
        state.epoch += 1;
        state.phase = ViewPhase::SignedOut;
        state.identity = None;
        state.bookmarks.clear();
        state.error = None;
        self.inner.commit(&state);
    }

    async fn enter_signed_in(&self, identity: Identity) {
        {
            let mut state = self.inner.state.write();
            state.epoch += 1;
            state.phase = ViewPhase::SignedIn;
            state.identity = Some(identity);
            state.bookmarks.clear();
            state.error = None;
            self.inner.commit(&state);
        }

        // Subscribe first so no change between the load and the subscription is missed.
        if let Err(e) = self.subscribe_to_changes().await {
            error!("Change subscription failed: {}", e);
        }
        if let Err(e) = self.load_bookmarks().await {
            error!("Initial bookmark load failed: {}", e);
        }
    }

    /// Replaces the list with the store's current rows for the signed-in user.
    ///
    /// A reload that finishes after the identity changed, or after a newer
    /// reload has already landed, is discarded. Signed out, the list is empty
    /// and nothing is queried.
    pub async fn load_bookmarks(&self) -> Result<Vec<Bookmark>> {
        let (epoch, signed_in) = {
            let state = self.inner.state.read();
            (state.epoch, state.identity.is_some())
        };
        if !signed_in {
            return Ok(Vec::new());
        }

        let seq = self.inner.reload_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self
            .inner
            .platform
            .store
            .query(&BookmarkQuery::newest_first())
            .await;

        let mut state = self.inner.state.write();
        if state.epoch != epoch || seq < state.applied_reload {
            debug!("Discarding stale reload #{}", seq);
            return Ok(state.bookmarks.clone());
        }

        match result {
            Ok(mut rows) => {
                sort_newest_first(&mut rows);
                debug!("Reload #{} returned {} bookmarks", seq, rows.len());
                state.bookmarks = rows.clone();
                state.applied_reload = seq;
                state.clear_error_if(|op| matches!(op, FailedOperation::Reload));
                self.inner.commit(&state);
                Ok(rows)
            }
            Err(e) => {
                warn!("Reload #{} failed: {}", seq, e);
                // A pending subscribe failure stays on top; its retry reloads too.
                let subscribe_pending = state
                    .error
                    .as_ref()
                    .map_or(false, |pending| pending.operation == FailedOperation::Subscribe);
                if !subscribe_pending {
                    state.record(FailedOperation::Reload, &e);
                    self.inner.commit(&state);
                }
                Err(e)
            }
        }
    }

    /// Opens the change subscription for the signed-in user, replacing one
    /// held for a previous user. At most one is held at a time.
    pub async fn subscribe_to_changes(&self) -> Result<()> {
        let (epoch, identity) = {
            let state = self.inner.state.read();
            (state.epoch, state.identity.clone())
        };
        let Some(identity) = identity else {
            return Ok(());
        };

        let mut live = self.inner.live.lock().await;
        if let Some(current) = live.as_ref() {
            if current.owner_id == identity.id && !current.listener.is_finished() {
                return Ok(());
            }
        }
        if let Some(previous) = live.take() {
            self.release(previous).await;
        }

        let filter = ChangeFilter::table(&self.inner.options.schema, &self.inner.options.table)
            .with_row_filter(RowFilter::eq(&self.inner.options.owner_column, &identity.id));

        let subscription = match self.inner.platform.feed.subscribe(filter).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let mut state = self.inner.state.write();
                if state.epoch == epoch {
                    state.record(FailedOperation::Subscribe, &e);
                    self.inner.commit(&state);
                }
                return Err(e);
            }
        };

        let id = subscription.id().clone();
        let stale = self.inner.state.read().epoch != epoch;
        if stale {
            debug!("Identity changed while subscribing, releasing {}", id);
            drop(subscription);
            self.inner.platform.feed.unsubscribe(&id).await?;
            return Ok(());
        }

        info!("Subscribed to bookmark changes for {} ({})", identity.id, id);
        let listener = tokio::spawn(listen(Arc::downgrade(&self.inner), subscription));
        *live = Some(LiveSubscription {
            id,
            owner_id: identity.id,
            listener,
        });

        let mut state = self.inner.state.write();
        state.clear_error_if(|op| matches!(op, FailedOperation::Subscribe));
        self.inner.commit(&state);
        Ok(())
    }

    async fn release(&self, live: LiveSubscription) {
        live.listener.abort();
        match self.inner.platform.feed.unsubscribe(&live.id).await {
            Ok(()) => debug!("Released subscription {}", live.id),
            Err(e) => warn!("Failed to release subscription {}: {}", live.id, e),
        }
    }

    async fn release_subscription(&self) {
        let previous = self.inner.live.lock().await.take();
        if let Some(previous) = previous {
            self.release(previous).await;
        }
    }

    pub fn set_draft_title(&self, title: impl Into<String>) {
        let mut state = self.inner.state.write();
        state.draft.title = title.into();
        self.inner.commit(&state);
    }

    pub fn set_draft_url(&self, url: impl Into<String>) {
        let mut state = self.inner.state.write();
        state.draft.url = url.into();
        self.inner.commit(&state);
    }

    /// Inserts the draft for the signed-in user.
    ///
    /// Returns `Ok(None)` without contacting the store when signed out or
    /// when either field is empty. On success the draft is cleared; the list
    /// itself catches up through the change subscription.
    pub async fn create_bookmark(&self) -> Result<Option<Bookmark>> {
        let (identity, draft) = {
            let state = self.inner.state.read();
            (state.identity.clone(), state.draft.clone())
        };
        let Some(identity) = identity else {
            debug!("Create ignored: signed out");
            return Ok(None);
        };
        if !draft.is_submittable() {
            debug!("Create ignored: draft incomplete");
            return Ok(None);
        }

        match self
            .inner
            .platform
            .store
            .insert(draft.clone().into_row(&identity.id))
            .await
        {
            Ok(created) => {
                info!("Created bookmark {} for {}", created.id, identity.id);
                let mut state = self.inner.state.write();
                state.draft.clear();
                state.clear_error_if(|op| matches!(op, FailedOperation::Create { .. }));
                self.inner.commit(&state);
                Ok(Some(created))
            }
            Err(e) => {
                warn!("Create failed for {}: {}", identity.id, e);
                let mut state = self.inner.state.write();
                state.record(FailedOperation::Create { draft }, &e);
                self.inner.commit(&state);
                Err(e)
            }
        }
    }

    /// Deletes one bookmark by id. Rows the caller does not own, or any row
    /// when signed out, are left alone by the store, which still reports success.
    pub async fn delete_bookmark(&self, id: &str) -> Result<()> {
        validate_bookmark_id(id)?;

        match self
            .inner
            .platform
            .store
            .delete(&RowFilter::eq("id", id))
            .await
        {
            Ok(()) => {
                info!("Deleted bookmark {}", id);
                let mut state = self.inner.state.write();
                state.clear_error_if(|op| matches!(op, FailedOperation::Delete { id: failed } if failed == id));
                self.inner.commit(&state);
                Ok(())
            }
            Err(e) => {
                warn!("Delete of {} failed: {}", id, e);
                let mut state = self.inner.state.write();
                state.record(FailedOperation::Delete { id: id.to_string() }, &e);
                self.inner.commit(&state);
                Err(e)
            }
        }
    }

    /// Ends the session. The page shows signed out before the remote call is
    /// made, and stays signed out even if that call fails.
    pub async fn sign_out(&self) -> Result<()> {
        let previous = self.identity();
        self.enter_signed_out();
        let _ = self.inner.resolved.set(());
        self.release_subscription().await;

        match self.inner.platform.auth.sign_out().await {
            Ok(()) => {
                if let Some(identity) = previous {
                    info!("Signed out {}", identity.id);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Remote sign-out failed: {}", e);
                let mut state = self.inner.state.write();
                state.record(FailedOperation::SignOut, &e);
                self.inner.commit(&state);
                Err(e)
            }
        }
    }

    /// URL to open to start the OAuth flow. `None` uses the configured provider.
    pub async fn sign_in(&self, provider: Option<OAuthProvider>) -> Result<Url> {
        let provider = provider.unwrap_or(self.inner.options.provider);
        self.inner
            .platform
            .auth
            .sign_in(provider, &self.inner.options.redirect_to)
            .await
    }

    /// Finishes the OAuth flow from the redirect URL and shows that user's bookmarks.
    pub async fn complete_sign_in(&self, redirect: &str) -> Result<Identity> {
        let identity = self.inner.platform.auth.complete_sign_in(redirect).await?;
        let _ = self.inner.resolved.set(());

        if self.identity().as_ref() != Some(&identity) {
            self.release_subscription().await;
        }
        self.enter_signed_in(identity.clone()).await;
        Ok(identity)
    }

    pub fn dismiss_error(&self) {
        let mut state = self.inner.state.write();
        if state.error.take().is_some() {
            self.inner.commit(&state);
        }
    }

    /// Re-runs the operation behind the current error, if any.
    pub async fn retry(&self) -> Result<()> {
        let failed = {
            let mut state = self.inner.state.write();
            let failed = state.error.take();
            if failed.is_some() {
                self.inner.commit(&state);
            }
            failed
        };
        let Some(failed) = failed else {
            return Ok(());
        };

        debug!("Retrying {}", failed.operation.label());
        match failed.operation {
            FailedOperation::Reload => {
                let subscribed = self.inner.live.lock().await.is_some();
                if !subscribed {
                    self.subscribe_to_changes().await?;
                }
                self.load_bookmarks().await.map(|_| ())
            }
            FailedOperation::Create { draft } => {
                {
                    let mut state = self.inner.state.write();
                    if state.draft.is_empty() {
                        state.draft = draft;
                        self.inner.commit(&state);
                    }
                }
                self.create_bookmark().await.map(|_| ())
            }
            FailedOperation::Delete { id } => self.delete_bookmark(&id).await,
            FailedOperation::SignOut => self.sign_out().await,
            FailedOperation::Subscribe => {
                self.subscribe_to_changes().await?;
                self.load_bookmarks().await.map(|_| ())
            }
        }
    }

    /// Releases the change subscription. The page keeps its last state.
    pub async fn close(&self) {
        self.release_subscription().await;
    }
}

/// Reloads on every change notification until the subscription ends or the
/// page is gone. Notifications that pile up during a reload are coalesced.
async fn listen(view: Weak<ViewInner>, mut subscription: Subscription) {
    while let Some(event) = subscription.next().await {
        let mut coalesced = 0;
        while subscription.try_next().is_some() {
            coalesced += 1;
        }

        let Some(inner) = view.upgrade() else {
            break;
        };
        debug!(
            "{:?} on {}.{} (+{} coalesced), reloading",
            event.kind, event.schema, event.table, coalesced
        );
        let page = BookmarkView { inner };
        // Failures are recorded on the page.
        let _ = page.load_bookmarks().await;
    }
    debug!("Change listener for {} stopped", subscription.id());
}
