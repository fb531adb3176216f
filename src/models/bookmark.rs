use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    #[serde(with = "crate::utils::serde_helpers::row_id")]
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

/// Row sent to the store on insert; id and created_at are assigned server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBookmark {
    pub title: String,
    pub url: String,
    #[serde(rename = "user_id")]
    pub owner_id: String,
}

/// 表单草稿
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DraftBookmark {
    #[validate(length(min = 1))]
    pub title: String,
    #[validate(length(min = 1))]
    pub url: String,
}

impl DraftBookmark {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
        }
    }

    /// Both fields filled in.
    pub fn is_submittable(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.url.is_empty()
    }

    pub fn clear(&mut self) {
        self.title.clear();
        self.url.clear();
    }

    pub fn into_row(self, owner_id: &str) -> NewBookmark {
        NewBookmark {
            title: self.title,
            url: self.url,
            owner_id: owner_id.to_string(),
        }
    }
}

/// Newest first. Stable, so rows sharing a timestamp keep store order.
pub fn sort_newest_first(bookmarks: &mut [Bookmark]) {
    bookmarks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
