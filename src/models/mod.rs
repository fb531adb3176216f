pub mod bookmark;
pub mod identity;
pub mod realtime;
pub mod view;

pub use bookmark::{Bookmark, DraftBookmark, NewBookmark};
pub use identity::{Identity, OAuthProvider, Session};
pub use realtime::{ChangeEvent, ChangeFilter, ChangeKind, EventFilter, RowFilter, SubscriptionId};
pub use view::{FailedOperation, ViewError, ViewPhase, ViewSnapshot};
