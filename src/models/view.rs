use serde::{Deserialize, Serialize};

use crate::models::{bookmark::{Bookmark, DraftBookmark}, identity::Identity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewPhase {
    /// Identity resolution has not completed yet.
    Loading,
    SignedOut,
    SignedIn,
}

/// The operation a [`ViewError`] came from, with what is needed to re-run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum FailedOperation {
    Reload,
    Create { draft: DraftBookmark },
    Delete { id: String },
    SignOut,
    /// The change subscription could not be opened.
    Subscribe,
}

impl FailedOperation {
    pub fn label(&self) -> &'static str {
        match self {
            FailedOperation::Reload => "reload",
            FailedOperation::Create { .. } => "create",
            FailedOperation::Delete { .. } => "delete",
            FailedOperation::SignOut => "sign out",
            FailedOperation::Subscribe => "subscribe",
        }
    }
}

/// 可恢复的界面错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewError {
    #[serde(flatten)]
    pub operation: FailedOperation,
    pub code: String,
    pub message: String,
    /// Retrying unchanged may succeed (timeouts, unavailable services).
    pub recoverable: bool,
}

/// Everything a renderer needs, published after each state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSnapshot {
    pub phase: ViewPhase,
    pub identity: Option<Identity>,
    pub draft: DraftBookmark,
    pub bookmarks: Vec<Bookmark>,
    pub error: Option<ViewError>,
}

impl ViewSnapshot {
    pub fn loading() -> Self {
        Self {
            phase: ViewPhase::Loading,
            identity: None,
            draft: DraftBookmark::default(),
            bookmarks: Vec::new(),
            error: None,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        self.phase == ViewPhase::SignedIn
    }
}
