mod common;

use std::time::Duration;

use common::{alice, bob, open_view, titles, wait_for, wait_until};
use smart_bookmarks::{
    models::{view::FailedOperation, DraftBookmark, ViewPhase},
    services::{BookmarkView, Fault, MemoryPlatform, ViewOptions},
    state::Platform,
};

#[tokio::test]
async fn test_signed_out_page_shows_nothing() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "Docs", "https://docs.rs");

    let view = open_view(&platform, None).await;
    let snapshot = view.snapshot();
    assert_eq!(snapshot.phase, ViewPhase::SignedOut);
    assert!(snapshot.identity.is_none());
    assert!(snapshot.bookmarks.is_empty());
    assert_eq!(platform.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_failed_resolution_is_signed_out() {
    let platform = MemoryPlatform::default();
    platform.fail_next(Fault::Resolve, 1);

    let view = open_view(&platform, Some(&alice())).await;
    assert_eq!(view.snapshot().phase, ViewPhase::SignedOut);
    assert_eq!(platform.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_initial_load_is_newest_first() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "A", "https://a.example");
    platform.seed(&alice(), "B", "https://b.example");

    let view = open_view(&platform, Some(&alice())).await;
    let snapshot = view.snapshot();
    assert!(snapshot.is_signed_in());
    assert_eq!(snapshot.identity, Some(alice()));
    assert_eq!(titles(&snapshot), vec!["B", "A"]);
    assert_eq!(platform.active_subscriptions(), 1);
}

#[tokio::test]
async fn test_create_converges_through_change_feed() {
    let platform = MemoryPlatform::default();
    let view = open_view(&platform, Some(&alice())).await;

    view.set_draft_title("Docs");
    view.set_draft_url("https://docs.rs");
    let created = view.create_bookmark().await.unwrap().unwrap();
    assert_eq!(created.owner_id, "alice");
    assert_eq!(view.snapshot().draft, DraftBookmark::default());

    let snapshot = wait_for(&view, |s| s.bookmarks.len() == 1).await;
    assert_eq!(snapshot.bookmarks[0].title, "Docs");
    assert_eq!(snapshot.bookmarks[0].url, "https://docs.rs");
}

#[tokio::test]
async fn test_change_from_another_client_reaches_page() {
    let platform = MemoryPlatform::default();
    let view = open_view(&platform, Some(&alice())).await;

    // same user, second device
    platform.seed(&alice(), "Elsewhere", "https://elsewhere.example");

    let snapshot = wait_for(&view, |s| !s.bookmarks.is_empty()).await;
    assert_eq!(titles(&snapshot), vec!["Elsewhere"]);
}

#[tokio::test]
async fn test_delete_leaves_remaining_rows() {
    let platform = MemoryPlatform::default();
    let a = platform.seed(&alice(), "A", "https://a.example");
    platform.seed(&alice(), "B", "https://b.example");

    let view = open_view(&platform, Some(&alice())).await;
    view.delete_bookmark(&a.id).await.unwrap();

    let snapshot = wait_for(&view, |s| s.bookmarks.len() == 1).await;
    assert_eq!(titles(&snapshot), vec!["B"]);
    assert_eq!(platform.all_rows().len(), 1);
}

#[tokio::test]
async fn test_delete_rejects_malformed_id() {
    let platform = MemoryPlatform::default();
    let view = open_view(&platform, Some(&alice())).await;

    assert!(view.delete_bookmark("").await.is_err());
    assert!(view.delete_bookmark("1,2").await.is_err());
}

#[tokio::test]
async fn test_incomplete_draft_is_a_noop() {
    let platform = MemoryPlatform::default();
    let view = open_view(&platform, Some(&alice())).await;

    view.set_draft_title("Only a title");
    assert_eq!(view.create_bookmark().await.unwrap(), None);

    view.set_draft_title("");
    view.set_draft_url("https://only-a-url.example");
    assert_eq!(view.create_bookmark().await.unwrap(), None);

    assert!(platform.all_rows().is_empty());
    assert_eq!(
        view.snapshot().draft,
        DraftBookmark::new("", "https://only-a-url.example")
    );
}

#[tokio::test]
async fn test_create_while_signed_out_is_a_noop() {
    let platform = MemoryPlatform::default();
    let view = open_view(&platform, None).await;

    view.set_draft_title("Docs");
    view.set_draft_url("https://docs.rs");
    assert_eq!(view.create_bookmark().await.unwrap(), None);
    assert!(platform.all_rows().is_empty());
}

#[tokio::test]
async fn test_sign_out_resets_page_immediately() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "A", "https://a.example");
    let view = open_view(&platform, Some(&alice())).await;
    view.set_draft_title("kept");

    view.sign_out().await.unwrap();

    let snapshot = view.snapshot();
    assert_eq!(snapshot.phase, ViewPhase::SignedOut);
    assert!(snapshot.identity.is_none());
    assert!(snapshot.bookmarks.is_empty());
    assert!(snapshot.error.is_none());
    assert_eq!(snapshot.draft.title, "kept");
    assert_eq!(platform.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_failed_remote_sign_out_stays_signed_out() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "A", "https://a.example");
    let view = open_view(&platform, Some(&alice())).await;
    platform.fail_next(Fault::SignOut, 1);

    assert!(view.sign_out().await.is_err());

    let snapshot = view.snapshot();
    assert_eq!(snapshot.phase, ViewPhase::SignedOut);
    assert!(snapshot.bookmarks.is_empty());
    assert_eq!(
        snapshot.error.map(|e| e.operation),
        Some(FailedOperation::SignOut)
    );

    assert_eq!(platform.live_sessions("alice"), 1);

    view.retry().await.unwrap();
    assert!(view.snapshot().error.is_none());
    assert_eq!(platform.live_sessions("alice"), 0);
}

#[tokio::test]
async fn test_one_subscription_across_identity_switch() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "Alice's", "https://alice.example");
    let view = open_view(&platform, Some(&alice())).await;
    let first = view.subscription_id().await.unwrap();
    assert_eq!(platform.active_subscriptions(), 1);

    view.sign_out().await.unwrap();
    assert_eq!(platform.active_subscriptions(), 0);
    assert!(view.subscription_id().await.is_none());

    let redirect = platform.sign_in_redirect(&bob(), &view.options().redirect_to);
    let identity = view.complete_sign_in(&redirect).await.unwrap();
    assert_eq!(identity, bob());
    assert_eq!(platform.active_subscriptions(), 1);
    assert_ne!(view.subscription_id().await.unwrap(), first);

    let snapshot = view.snapshot();
    assert_eq!(snapshot.identity, Some(bob()));
    assert!(snapshot.bookmarks.is_empty());

    // bob's subscription follows bob's rows only
    platform.seed(&bob(), "Bob's", "https://bob.example");
    let snapshot = wait_for(&view, |s| !s.bookmarks.is_empty()).await;
    assert_eq!(titles(&snapshot), vec!["Bob's"]);
}

#[tokio::test]
async fn test_repeated_subscribe_keeps_single_subscription() {
    let platform = MemoryPlatform::default();
    let view = open_view(&platform, Some(&alice())).await;
    let id = view.subscription_id().await.unwrap();

    view.subscribe_to_changes().await.unwrap();
    view.subscribe_to_changes().await.unwrap();

    assert_eq!(view.subscription_id().await, Some(id));
    assert_eq!(platform.active_subscriptions(), 1);
}

#[tokio::test]
async fn test_dropping_page_releases_subscription() {
    let platform = MemoryPlatform::default();
    let view = open_view(&platform, Some(&alice())).await;
    let clone = view.clone();
    assert_eq!(platform.active_subscriptions(), 1);

    drop(view);
    assert_eq!(platform.active_subscriptions(), 1);

    drop(clone);
    wait_until(|| platform.active_subscriptions() == 0).await;
}

#[tokio::test]
async fn test_close_releases_subscription() {
    let platform = MemoryPlatform::default();
    let view = open_view(&platform, Some(&alice())).await;

    view.close().await;
    assert_eq!(platform.active_subscriptions(), 0);
    assert!(view.snapshot().is_signed_in());
}

#[tokio::test]
async fn test_reload_started_before_sign_out_is_discarded() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "A", "https://a.example");
    let view = open_view(&platform, Some(&alice())).await;

    platform.gate_queries();
    let pending = tokio::spawn({
        let view = view.clone();
        async move { view.load_bookmarks().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    view.sign_out().await.unwrap();
    platform.open_queries();
    pending.await.unwrap().unwrap();

    let snapshot = view.snapshot();
    assert_eq!(snapshot.phase, ViewPhase::SignedOut);
    assert!(snapshot.bookmarks.is_empty());
}

#[tokio::test]
async fn test_reload_started_before_switch_never_shows_old_rows() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "A", "https://a.example");
    let view = open_view(&platform, Some(&alice())).await;

    platform.gate_queries();
    let pending = tokio::spawn({
        let view = view.clone();
        async move { view.load_bookmarks().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    view.sign_out().await.unwrap();
    let redirect = platform.sign_in_redirect(&bob(), &view.options().redirect_to);
    let switch = tokio::spawn({
        let view = view.clone();
        async move { view.complete_sign_in(&redirect).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    platform.open_queries();

    pending.await.unwrap().unwrap();
    switch.await.unwrap().unwrap();

    let snapshot = view.snapshot();
    assert_eq!(snapshot.identity, Some(bob()));
    assert!(snapshot.bookmarks.iter().all(|b| b.owner_id == "bob"));
    assert!(snapshot.bookmarks.is_empty());
}

#[tokio::test]
async fn test_failed_create_keeps_draft_and_retries() {
    let platform = MemoryPlatform::default();
    let view = open_view(&platform, Some(&alice())).await;
    platform.fail_next(Fault::Insert, 1);

    view.set_draft_title("Docs");
    view.set_draft_url("https://docs.rs");
    assert!(view.create_bookmark().await.is_err());

    let snapshot = view.snapshot();
    let error = snapshot.error.unwrap();
    assert_eq!(
        error.operation,
        FailedOperation::Create {
            draft: DraftBookmark::new("Docs", "https://docs.rs")
        }
    );
    assert_eq!(error.code, "SERVICE_UNAVAILABLE");
    assert!(error.recoverable);
    assert_eq!(snapshot.draft, DraftBookmark::new("Docs", "https://docs.rs"));

    view.retry().await.unwrap();
    let snapshot = wait_for(&view, |s| s.bookmarks.len() == 1).await;
    assert!(snapshot.error.is_none());
    assert_eq!(snapshot.draft, DraftBookmark::default());
}

#[tokio::test]
async fn test_failed_reload_recovers_on_retry() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "A", "https://a.example");
    platform.fail_next(Fault::Query, 1);

    let view = open_view(&platform, Some(&alice())).await;
    let snapshot = view.snapshot();
    assert!(snapshot.bookmarks.is_empty());
    assert_eq!(
        snapshot.error.map(|e| e.operation),
        Some(FailedOperation::Reload)
    );

    view.retry().await.unwrap();
    let snapshot = view.snapshot();
    assert!(snapshot.error.is_none());
    assert_eq!(titles(&snapshot), vec!["A"]);
}

#[tokio::test]
async fn test_failed_delete_is_recorded() {
    let platform = MemoryPlatform::default();
    let a = platform.seed(&alice(), "A", "https://a.example");
    let view = open_view(&platform, Some(&alice())).await;
    platform.fail_next(Fault::Delete, 1);

    assert!(view.delete_bookmark(&a.id).await.is_err());
    assert_eq!(
        view.snapshot().error.map(|e| e.operation),
        Some(FailedOperation::Delete { id: a.id.clone() })
    );

    view.retry().await.unwrap();
    let snapshot = wait_for(&view, |s| s.bookmarks.is_empty()).await;
    assert!(snapshot.error.is_none());
}

#[tokio::test]
async fn test_subscription_failure_is_recorded_and_retried() {
    let platform = MemoryPlatform::default();
    platform.fail_next(Fault::Subscribe, 1);

    let view = open_view(&platform, Some(&alice())).await;
    assert_eq!(
        view.snapshot().error.map(|e| e.operation),
        Some(FailedOperation::Subscribe)
    );
    assert_eq!(platform.active_subscriptions(), 0);

    view.retry().await.unwrap();
    assert_eq!(platform.active_subscriptions(), 1);

    platform.seed(&alice(), "A", "https://a.example");
    wait_for(&view, |s| s.bookmarks.len() == 1).await;
}

#[tokio::test]
async fn test_snapshots_are_published() {
    let platform = MemoryPlatform::default();
    let client = platform.client();
    client.sign_in_as(&alice()).await.unwrap();
    let view = BookmarkView::new(Platform::memory(client), ViewOptions::default());
    let mut updates = view.watch();
    assert_eq!(updates.borrow().phase, ViewPhase::Loading);

    view.resolve_identity().await;
    updates.changed().await.unwrap();
    assert!(updates.borrow().is_signed_in());
}

#[tokio::test]
async fn test_sign_in_url_targets_provider() {
    let platform = MemoryPlatform::default();
    let view = open_view(&platform, None).await;

    let url = view.sign_in(None).await.unwrap();
    assert!(url.as_str().contains("provider=google"));
    assert!(url.as_str().contains("redirect_to="));
}

#[tokio::test]
async fn test_retry_after_subscribe_and_load_both_fail() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "A", "https://a.example");
    platform.fail_next(Fault::Subscribe, 1);
    platform.fail_next(Fault::Query, 1);

    let view = open_view(&platform, Some(&alice())).await;
    let snapshot = view.snapshot();
    assert!(snapshot.bookmarks.is_empty());
    assert_eq!(
        snapshot.error.map(|e| e.operation),
        Some(FailedOperation::Subscribe)
    );
    assert_eq!(platform.active_subscriptions(), 0);

    view.retry().await.unwrap();
    let snapshot = view.snapshot();
    assert!(snapshot.error.is_none());
    assert_eq!(titles(&snapshot), vec!["A"]);
    assert_eq!(platform.active_subscriptions(), 1);

    platform.seed(&alice(), "B", "https://b.example");
    wait_for(&view, |s| s.bookmarks.len() == 2).await;
}

#[tokio::test]
async fn test_reload_retry_reopens_missing_subscription() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "A", "https://a.example");
    let view = open_view(&platform, Some(&alice())).await;

    view.close().await;
    platform.fail_next(Fault::Query, 1);
    assert!(view.load_bookmarks().await.is_err());
    assert_eq!(
        view.snapshot().error.map(|e| e.operation),
        Some(FailedOperation::Reload)
    );

    view.retry().await.unwrap();
    assert_eq!(platform.active_subscriptions(), 1);
    assert!(view.subscription_id().await.is_some());
    assert_eq!(titles(&view.snapshot()), vec!["A"]);
}

#[tokio::test]
async fn test_direct_switch_replaces_subscription() {
    let platform = MemoryPlatform::default();
    platform.seed(&alice(), "Alice's", "https://alice.example");
    let view = open_view(&platform, Some(&alice())).await;
    let first = view.subscription_id().await.unwrap();
    assert_eq!(titles(&view.snapshot()), vec!["Alice's"]);

    let redirect = platform.sign_in_redirect(&bob(), &view.options().redirect_to);
    view.complete_sign_in(&redirect).await.unwrap();

    assert_eq!(platform.active_subscriptions(), 1);
    assert_ne!(view.subscription_id().await.unwrap(), first);
    let snapshot = view.snapshot();
    assert_eq!(snapshot.identity, Some(bob()));
    assert!(snapshot.bookmarks.is_empty());

    platform.seed(&alice(), "Alice's second", "https://alice2.example");
    platform.seed(&bob(), "Bob's", "https://bob.example");
    let snapshot = wait_for(&view, |s| !s.bookmarks.is_empty()).await;
    assert_eq!(titles(&snapshot), vec!["Bob's"]);
    assert!(snapshot.bookmarks.iter().all(|b| b.owner_id == "bob"));
}

#[tokio::test]
async fn test_delete_while_signed_out_is_left_to_the_store() {
    let platform = MemoryPlatform::default();
    let a = platform.seed(&alice(), "A", "https://a.example");
    let view = open_view(&platform, None).await;

    view.delete_bookmark(&a.id).await.unwrap();

    assert_eq!(platform.all_rows(), vec![a]);
    assert!(view.snapshot().error.is_none());
}
