mod common;

use std::time::Duration;

use common::{alice, bob, open_view, titles, wait_for};
use smart_bookmarks::{
    models::{realtime::RowFilter, NewBookmark},
    services::{BookmarkQuery, BookmarkStore, MemoryPlatform},
    AppError,
};

#[tokio::test]
async fn test_each_user_sees_only_their_rows() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "Alice's", "https://alice.example");
    platform.seed(&bob(), "Bob's", "https://bob.example");

    let alice_view = open_view(&platform, Some(&alice())).await;
    let bob_view = open_view(&platform, Some(&bob())).await;

    assert_eq!(titles(&alice_view.snapshot()), vec!["Alice's"]);
    assert_eq!(titles(&bob_view.snapshot()), vec!["Bob's"]);
}

#[tokio::test]
async fn test_other_users_changes_do_not_reach_page() {
    let platform = MemoryPlatform::default();
    let alice_view = open_view(&platform, Some(&alice())).await;
    let bob_view = open_view(&platform, Some(&bob())).await;

    bob_view.set_draft_title("Bob's");
    bob_view.set_draft_url("https://bob.example");
    bob_view.create_bookmark().await.unwrap().unwrap();
    wait_for(&bob_view, |s| s.bookmarks.len() == 1).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice_view.snapshot().bookmarks.is_empty());
}

#[tokio::test]
async fn test_delete_of_foreign_row_is_silent_and_harmless() {
    let platform = MemoryPlatform::default();
    let theirs = platform.seed(&alice(), "Alice's", "https://alice.example");

    let bob_view = open_view(&platform, Some(&bob())).await;
    bob_view.delete_bookmark(&theirs.id).await.unwrap();

    assert_eq!(platform.all_rows(), vec![theirs]);
    assert!(bob_view.snapshot().error.is_none());
}

#[tokio::test]
async fn test_insert_for_another_owner_is_rejected() {
    let platform = MemoryPlatform::default();
    let client = platform.client();
    client.sign_in_as(&bob()).await.unwrap();

    let err = client
        .insert(NewBookmark {
            title: "Forged".into(),
            url: "https://forged.example".into(),
            owner_id: "alice".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Authorization(_)));
    assert!(platform.all_rows().is_empty());
}

#[tokio::test]
async fn test_caller_filter_cannot_widen_visibility() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "Alice's", "https://alice.example");
    let client = platform.client();
    client.sign_in_as(&bob()).await.unwrap();

    let rows = client
        .query(&BookmarkQuery::newest_first().with_filter(RowFilter::eq("user_id", "alice")))
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_signed_out_client_sees_nothing() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "Alice's", "https://alice.example");
    let client = platform.client();

    let rows = client.query(&BookmarkQuery::newest_first()).await.unwrap();
    assert!(rows.is_empty());

    let err = client
        .insert(NewBookmark {
            title: "Anon".into(),
            url: "https://anon.example".into(),
            owner_id: "alice".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Authentication(_)));
}

#[tokio::test]
async fn test_revoked_session_is_signed_out_on_open() {
    let platform = MemoryPlatform::default();
    let client = platform.client();
    client.sign_in_as(&alice()).await.unwrap();
    platform.revoke("alice");

    let view = smart_bookmarks::BookmarkView::open(
        smart_bookmarks::Platform::memory(client),
        Default::default(),
    )
    .await;
    assert!(!view.snapshot().is_signed_in());
}
