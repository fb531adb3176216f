#![allow(dead_code)]

use std::time::Duration;

use smart_bookmarks::{
    models::{identity::Identity, view::ViewSnapshot},
    services::{BookmarkView, MemoryPlatform, ViewOptions},
    state::Platform,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn alice() -> Identity {
    Identity::new("alice", "alice@example.com")
}

pub fn bob() -> Identity {
    Identity::new("bob", "bob@example.com")
}

/// A page on its own client of `platform`, signed in as `identity` if given.
pub async fn open_view(platform: &MemoryPlatform, identity: Option<&Identity>) -> BookmarkView {
    let client = platform.client();
    if let Some(identity) = identity {
        client.sign_in_as(identity).await.unwrap();
    }
    BookmarkView::open(Platform::memory(client), ViewOptions::default()).await
}

/// Waits until a published snapshot satisfies `done`, and returns it.
pub async fn wait_for(view: &BookmarkView, done: impl Fn(&ViewSnapshot) -> bool) -> ViewSnapshot {
    let mut updates = view.watch();
    tokio::time::timeout(WAIT, async {
        loop {
            let snapshot = view.snapshot();
            if done(&snapshot) {
                return snapshot;
            }
            updates.changed().await.expect("view dropped");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting, last snapshot: {:?}", view.snapshot()))
}

/// Polls `done` until it holds.
pub async fn wait_until(done: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

pub fn titles(snapshot: &ViewSnapshot) -> Vec<String> {
    snapshot.bookmarks.iter().map(|b| b.title.clone()).collect()
}
