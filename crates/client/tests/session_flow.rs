mod support;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::future::join_all;
use inbox_client::shared::{
    AuthCause, FeedType, Identity, InboxError, MessagePatch, ServerEvent,
};
use inbox_client::{ClientConfig, ConnectionState, InboxEvent, SignInOutcome, Topic};
use support::*;

fn auth_causes(recorder: &Recorder) -> Vec<(AuthCause, Option<String>)> {
    recorder
        .snapshot()
        .into_iter()
        .filter_map(|event| match event {
            InboxEvent::Auth(auth) => Some((auth.cause, auth.identity.map(|i| i.user_id))),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn rapid_identical_sign_ins_open_one_connection() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let client = client(&backend, &connector);
    let auth = Recorder::new(&client, Topic::Auth);

    let outcomes = join_all((0..50).map(|_| client.sign_in(identity("alice")))).await;

    let signed_in = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(SignInOutcome::SignedIn)))
        .count();
    assert_eq!(signed_in, 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, Ok(SignInOutcome::SignedIn) | Ok(SignInOutcome::Coalesced))));
    assert_eq!(connector.attempts(), 1);
    assert_eq!(
        auth_causes(&auth),
        vec![(AuthCause::SignedIn, Some("alice".to_string()))]
    );
}

#[tokio::test]
async fn repeated_sign_in_is_a_no_op() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let client = client(&backend, &connector);
    let auth = Recorder::new(&client, Topic::Auth);

    for _ in 0..50 {
        client.sign_in(identity("alice")).await.unwrap();
    }

    assert_eq!(connector.attempts(), 1);
    assert_eq!(auth.len(), 1);
    assert_eq!(client.current_identity(), Some(identity("alice")));
}

#[tokio::test]
async fn superseded_sign_in_publishes_nothing() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::with_connect_delay(Duration::from_millis(60));
    let client = client(&backend, &connector);
    let auth = Recorder::new(&client, Topic::Auth);

    let first = client.sign_in(identity("alice"));
    let second = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.sign_in(identity("bob")).await
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap(), SignInOutcome::Superseded);
    assert_eq!(second.unwrap(), SignInOutcome::SignedIn);
    assert_eq!(
        auth_causes(&auth),
        vec![(AuthCause::SignedIn, Some("bob".to_string()))]
    );
    assert_eq!(client.current_identity().unwrap().user_id, "bob");
}

#[tokio::test]
async fn invalid_identity_is_rejected_before_any_work() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let client = client(&backend, &connector);
    let auth = Recorder::new(&client, Topic::Auth);

    let result = client.sign_in(Identity::new("", "token")).await;

    assert!(matches!(result, Err(InboxError::InvalidIdentity(_))));
    assert_eq!(connector.attempts(), 0);
    assert_eq!(auth.len(), 0);
    assert!(client.current_identity().is_none());
}

#[tokio::test]
async fn sign_in_load_push_sign_out() {
    let backend = FakeBackend::new();
    backend.set_page(
        FeedType::Inbox,
        None,
        page(vec![message("m1", 10), message("m2", 20), message("m3", 30)], None),
    );
    let connector = FakeConnector::new();
    let client = client(&backend, &connector);
    let auth = Recorder::new(&client, Topic::Auth);
    let inbox = Recorder::new(&client, Topic::Feed(FeedType::Inbox));

    client.sign_in(identity("alice")).await.unwrap();
    client.load_first_page(FeedType::Inbox).await.unwrap();
    assert_eq!(client.feed(&FeedType::Inbox).messages.len(), 3);

    connector.push(ServerEvent::MessageCreated {
        message: message("m4", 40),
    });
    assert!(wait_until(|| client.feed(&FeedType::Inbox).messages.len() == 4).await);

    let snapshot = client.feed(&FeedType::Inbox);
    assert_eq!(snapshot.messages[0].id, "m4");
    assert_eq!(snapshot.unread_count, 4);
    assert!(inbox.len() >= 2);

    assert!(client.sign_out());
    assert!(client.feed(&FeedType::Inbox).messages.is_empty());
    assert_eq!(client.unread_count(&FeedType::Inbox), 0);
    assert_eq!(
        auth_causes(&auth),
        vec![
            (AuthCause::SignedIn, Some("alice".to_string())),
            (AuthCause::SignedOut, None),
        ]
    );
    assert!(matches!(
        client.load_first_page(FeedType::Inbox).await,
        Err(InboxError::NotSignedIn)
    ));
}

#[tokio::test]
async fn read_push_then_sign_out_scenario() {
    let mut read = message("msg3", 30);
    read.read_at = Some(Utc.timestamp_opt(31, 0).unwrap());
    let backend = FakeBackend::new();
    backend.set_page(
        FeedType::Inbox,
        None,
        page(vec![message("msg1", 10), message("msg2", 20), read], None),
    );
    let connector = FakeConnector::new();
    let client = client(&backend, &connector);
    let auth = Recorder::new(&client, Topic::Auth);

    client.sign_in(Identity::new("u1", "t1")).await.unwrap();
    client.load_first_page(FeedType::Inbox).await.unwrap();
    assert_eq!(client.feed(&FeedType::Inbox).messages.len(), 3);
    assert_eq!(client.unread_count(&FeedType::Inbox), 2);

    client
        .apply_push_event(ServerEvent::MessageUpdated {
            id: "msg2".to_string(),
            patch: MessagePatch {
                read_at: Some(Some(Utc::now())),
                ..MessagePatch::default()
            },
        })
        .unwrap();
    assert_eq!(client.unread_count(&FeedType::Inbox), 1);

    assert!(client.sign_out());
    assert!(client.feed(&FeedType::Inbox).messages.is_empty());
    let signed_out = auth_causes(&auth)
        .into_iter()
        .filter(|(cause, _)| *cause == AuthCause::SignedOut)
        .count();
    assert_eq!(signed_out, 1);
}

#[tokio::test]
async fn sign_out_without_session_publishes_nothing() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let client = client(&backend, &connector);
    let auth = Recorder::new(&client, Topic::Auth);

    assert!(!client.sign_out());
    assert_eq!(auth.len(), 0);
}

#[tokio::test]
async fn switching_users_drops_previous_feeds() {
    let backend = FakeBackend::new();
    backend.set_page(FeedType::Inbox, None, page(vec![message("m1", 10)], None));
    let connector = FakeConnector::new();
    let client = client(&backend, &connector);
    let auth = Recorder::new(&client, Topic::Auth);

    client.sign_in(identity("alice")).await.unwrap();
    client.load_first_page(FeedType::Inbox).await.unwrap();
    client.sign_in(identity("bob")).await.unwrap();

    assert!(client.feed(&FeedType::Inbox).messages.is_empty());
    assert_eq!(connector.attempts(), 2);
    assert_eq!(
        auth_causes(&auth),
        vec![
            (AuthCause::SignedIn, Some("alice".to_string())),
            (AuthCause::SignedIn, Some("bob".to_string())),
        ]
    );
}

#[tokio::test]
async fn new_token_for_same_user_reauthenticates_in_place() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let client = client(&backend, &connector);
    let auth = Recorder::new(&client, Topic::Auth);

    client.sign_in(identity("alice")).await.unwrap();
    let refreshed = Identity::new("alice", "token-2");
    let outcome = client.sign_in(refreshed.clone()).await.unwrap();

    assert_eq!(outcome, SignInOutcome::TokenRefreshed);
    assert_eq!(connector.attempts(), 1);
    assert_eq!(client.current_identity(), Some(refreshed));
    assert_eq!(
        auth_causes(&auth).last().unwrap().0,
        AuthCause::TokenRefreshed
    );

    let mut frames = Vec::new();
    assert!(
        wait_until(|| {
            frames.extend(connector.written());
            frames.iter().any(|f| f.contains("reauthenticate"))
        })
        .await
    );
    assert!(frames[0].contains("subscribe"));
}

#[tokio::test]
async fn refresh_token_requires_a_session() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let client = client(&backend, &connector);

    assert!(matches!(
        client.refresh_token("token-2"),
        Err(InboxError::NotSignedIn)
    ));
}

#[tokio::test]
async fn realtime_url_carries_identity() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let client = client(&backend, &connector);

    client
        .sign_in(identity("alice").with_tenant("acme"))
        .await
        .unwrap();

    let urls = connector.urls.lock().unwrap().clone();
    assert_eq!(urls.len(), 1);
    assert!(urls[0].starts_with("ws://localhost:9/realtime?"));
    assert!(urls[0].contains("userId=alice"));
    assert!(urls[0].contains("tenantId=acme"));
}

#[tokio::test]
async fn connection_states_are_published() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let client = client(&backend, &connector);
    let connection = Recorder::new(&client, Topic::Connection);

    client.sign_in(identity("alice")).await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    connector.drop_links();
    assert!(
        wait_until(|| connection.snapshot().iter().any(|e| matches!(
            e,
            InboxEvent::Connection(ConnectionState::Reconnecting { .. })
        )))
        .await
    );
    assert!(wait_until(|| client.connection_state().is_connected()).await);
}

#[tokio::test]
async fn persisted_session_is_restored_and_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let config = || test_config().with_session_storage(dir.path());

    let first = client_with(config(), &backend, &connector);
    first.sign_in(identity("alice")).await.unwrap();
    drop(first);

    let second = client_with(config(), &backend, &connector);
    let outcome = second.restore_session().await.unwrap();
    assert_eq!(outcome, Some(SignInOutcome::SignedIn));
    assert_eq!(second.current_identity(), Some(identity("alice")));

    second.sign_out();
    let third = client_with(config(), &backend, &connector);
    assert_eq!(third.restore_session().await.unwrap(), None);
}

#[tokio::test]
async fn sign_in_loads_current_feed_when_enabled() {
    let backend = FakeBackend::new();
    backend.set_page(FeedType::Inbox, None, page(vec![message("m1", 10)], None));
    let connector = FakeConnector::new();
    let config = ClientConfig {
        load_on_sign_in: true,
        ..test_config()
    };
    let client = client_with(config, &backend, &connector);

    client.sign_in(identity("alice")).await.unwrap();

    assert_eq!(backend.fetches_for(&FeedType::Inbox), 1);
    assert_eq!(client.feed(&FeedType::Inbox).messages.len(), 1);
}
