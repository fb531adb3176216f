pub mod auth;
pub mod bookmark_view;
pub mod database;
pub mod memory;
pub mod realtime;
pub mod supabase;

pub use auth::{AuthProvider, SessionHandle, SupabaseAuth};
pub use bookmark_view::{BookmarkView, ViewOptions};
pub use database::{BookmarkQuery, BookmarkStore, OrderBy, RestStore};
pub use memory::{Fault, MemoryClient, MemoryPlatform};
#[cfg(feature = "websocket")]
pub use realtime::RealtimeService;
pub use realtime::{ChangeFeed, Subscription};
pub use supabase::SupabaseClient;
