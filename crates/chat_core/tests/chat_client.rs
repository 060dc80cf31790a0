mod common;

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use chat_core::{
    loopback::LoopbackProvider, ChatClient, ChatConfig, ConnectionEventKind, ConnectionState,
    GroupId, Identity,
};
use common::{
    collector, counter, eventually, identity, message_payload, settle, RejectingSigner,
    ScriptedProvider, SlowSigner, StallingProvider,
};
use serde_json::json;

#[tokio::test]
async fn first_subscription_opens_the_connection() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(identity("0xA11CE"), provider.clone(), ChatConfig::default());

    assert_eq!(client.connection_state(), ConnectionState::Uninitialized);
    assert!(!client.socket_initialized());
    assert_eq!(provider.initialization_count(), 0);

    let _subscription = client.subscribe_messages("table-1", |_message| Ok(()));
    eventually("client connects", || client.is_connected()).await;

    assert_eq!(provider.initialization_count(), 1);
    assert!(client.socket_initialized());
    assert!(!client.stream_initialized());
    assert_eq!(client.last_error(), None);
}

#[tokio::test]
async fn connecting_twice_announces_connected_once() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(identity("0xA11CE"), provider.clone(), ChatConfig::default());
    let (connected, bump) = counter();
    let _subscription = client.subscribe_connection(ConnectionEventKind::Connected, move |_| {
        bump();
        Ok(())
    });

    client.connect().await;
    client.connect().await;
    eventually("client connects", || client.is_connected()).await;
    client.connect().await;
    settle().await;

    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(provider.initialization_count(), 1);
}

#[tokio::test]
async fn sent_message_arrives_through_the_provider_round_trip() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(identity("0xA11CE"), provider.clone(), ChatConfig::default());
    let group = client
        .create_group("Table 1", "high stakes")
        .await
        .expect("create group");
    let (seen, on_message) = collector();
    let _subscription = client.subscribe_messages(group.clone(), on_message);
    eventually("client connects", || client.is_connected()).await;

    assert!(client.send_message(&group, "hi").await);
    eventually("echo delivered", || seen.lock().expect("seen").len() == 1).await;

    let seen = seen.lock().expect("seen");
    assert_eq!(seen[0].content, "hi");
    assert_eq!(seen[0].group_id, group);
    assert_eq!(&seen[0].sender, client.address());
    assert!(seen[0].message_id.is_some());
}

#[tokio::test]
async fn send_never_echoes_locally() {
    let provider = Arc::new(StallingProvider::default());
    let client = ChatClient::new(identity("0xA11CE"), provider.clone(), ChatConfig::default());
    let group = GroupId::new("table-1");
    let (seen, on_message) = collector();
    let _subscription = client.subscribe_messages(group.clone(), on_message);
    eventually("client connects", || client.is_connected()).await;

    assert!(client.send_message(&group, "hi").await);
    settle().await;

    assert_eq!(provider.sent.lock().expect("sent").len(), 1);
    assert!(seen.lock().expect("seen").is_empty());
}

#[tokio::test]
async fn stream_mirror_does_not_duplicate_messages() {
    let provider = Arc::new(LoopbackProvider::new().with_stream_mirroring());
    let client = ChatClient::new(identity("0xA11CE"), provider.clone(), ChatConfig::default());
    let group = client
        .create_group("Table 1", "")
        .await
        .expect("create group");
    let (seen, on_message) = collector();
    let _subscription = client.subscribe_messages(group.clone(), on_message);
    eventually("client connects", || client.is_connected()).await;
    assert!(client.stream_initialized());

    assert!(client.send_message(&group, "raise").await);
    assert!(client.send_message(&group, "call").await);
    eventually("both messages delivered", || seen.lock().expect("seen").len() == 2).await;
    settle().await;

    let contents: Vec<_> = seen
        .lock()
        .expect("seen")
        .iter()
        .map(|message| message.content.clone())
        .collect();
    assert_eq!(contents, vec!["raise".to_string(), "call".to_string()]);
}

#[tokio::test]
async fn busy_socket_does_not_hold_back_stream_messages() {
    let provider = Arc::new(ScriptedProvider::with_stream());
    let client = ChatClient::new(
        identity("0xA11CE"),
        provider.clone(),
        ChatConfig::default().with_event_buffer(512),
    );
    let (socket_seen, on_socket) = collector();
    let (stream_seen, on_stream) = collector();
    let _socket = client.subscribe_messages("table-1", on_socket);
    let _stream = client.subscribe_messages("table-2", on_stream);
    eventually("client connects", || client.is_connected()).await;
    assert!(client.stream_initialized());

    for round in 0..200 {
        provider.push_socket(message_payload("table-1", &format!("s-{round}"), "bet"));
        if round % 50 == 0 {
            provider.push_stream(message_payload("table-2", &format!("t-{round}"), "fold"));
        }
    }

    eventually("every message delivered", || {
        socket_seen.lock().expect("seen").len() == 200
            && stream_seen.lock().expect("seen").len() == 4
    })
    .await;
    let stream_ids: Vec<_> = stream_seen
        .lock()
        .expect("seen")
        .iter()
        .filter_map(|message| message.message_id.as_ref().map(|id| id.as_str().to_string()))
        .collect();
    assert_eq!(stream_ids, vec!["t-0", "t-50", "t-100", "t-150"]);
    assert!(client.is_connected());
}

#[tokio::test]
async fn closed_event_sources_disconnect_once_with_reason() {
    let provider = Arc::new(ScriptedProvider::default());
    let client = ChatClient::new(identity("0xA11CE"), provider.clone(), ChatConfig::default());
    let (disconnected, on_disconnected) = counter();
    let _down = client.subscribe_connection(ConnectionEventKind::Disconnected, move |_| {
        on_disconnected();
        Ok(())
    });
    client.connect().await;
    eventually("client connects", || client.is_connected()).await;

    provider.close_sources();
    eventually("client disconnects", || {
        client.connection_state() == ConnectionState::Disconnected
    })
    .await;
    settle().await;

    let reason = client.last_error().expect("last error recorded");
    assert!(reason.contains("event sources closed"), "unexpected reason: {reason}");
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cleanup_during_connect_closes_the_late_session() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(
        Identity::new("0xA11CE", Arc::new(SlowSigner(Duration::from_millis(100)))),
        provider.clone(),
        ChatConfig::default(),
    );
    let (disconnected, on_disconnected) = counter();
    let _down = client.subscribe_connection(ConnectionEventKind::Disconnected, move |_| {
        on_disconnected();
        Ok(())
    });
    let _subscription = client.subscribe_messages("table-1", |_message| Ok(()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.connection_state(), ConnectionState::Connecting);
    client.cleanup().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(provider.initialization_count(), 1);
    assert_eq!(provider.live_session_count(), 0);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(!client.socket_initialized());
    assert_eq!(client.last_error(), None);
    assert_eq!(disconnected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn messages_only_reach_their_own_table() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(identity("0xA11CE"), provider.clone(), ChatConfig::default());
    let table_one = client.create_group("Table 1", "").await.expect("table 1");
    let table_two = client.create_group("Table 2", "").await.expect("table 2");
    let (one_seen, on_one) = collector();
    let (two_seen, on_two) = collector();
    let _one = client.subscribe_messages(table_one.clone(), on_one);
    let _two = client.subscribe_messages(table_two.clone(), on_two);
    eventually("client connects", || client.is_connected()).await;

    assert!(client.send_message(&table_one, "only one").await);
    eventually("table 1 delivery", || one_seen.lock().expect("seen").len() == 1).await;
    settle().await;

    assert!(two_seen.lock().expect("seen").is_empty());
}

#[tokio::test]
async fn recovered_outage_reports_disconnect_then_connect() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(
        identity("0xA11CE"),
        provider.clone(),
        ChatConfig::default().with_reconnect_attempts(3),
    );
    let (connected, on_connected) = counter();
    let (disconnected, on_disconnected) = counter();
    let _up = client.subscribe_connection(ConnectionEventKind::Connected, move |_| {
        on_connected();
        Ok(())
    });
    let _down = client.subscribe_connection(ConnectionEventKind::Disconnected, move |_| {
        on_disconnected();
        Ok(())
    });
    eventually("client connects", || client.is_connected()).await;

    provider.simulate_outage(2);
    eventually("reconnect announced", || connected.load(Ordering::SeqCst) == 2).await;

    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    assert!(client.is_connected());
    assert_eq!(client.last_error(), None);
}

#[tokio::test]
async fn exhausted_reconnects_leave_client_disconnected_until_connect() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(
        identity("0xA11CE"),
        provider.clone(),
        ChatConfig::default().with_reconnect_attempts(2),
    );
    let (disconnected, on_disconnected) = counter();
    let _down = client.subscribe_connection(ConnectionEventKind::Disconnected, move |_| {
        on_disconnected();
        Ok(())
    });
    eventually("client connects", || client.is_connected()).await;

    provider.simulate_outage(2);
    eventually("give-up recorded", || {
        client
            .last_error()
            .is_some_and(|reason| reason.contains("gave up after 2"))
    })
    .await;

    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);

    client.connect().await;
    eventually("client reconnects", || client.is_connected()).await;
    assert_eq!(provider.initialization_count(), 2);
    assert_eq!(provider.live_session_count(), 1);
}

#[tokio::test]
async fn rejected_signature_leaves_client_disconnected_with_reason() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(
        Identity::new("0xB0B", Arc::new(RejectingSigner)),
        provider.clone(),
        ChatConfig::default(),
    );
    let (disconnected, on_disconnected) = counter();
    let _down = client.subscribe_connection(ConnectionEventKind::Disconnected, move |_| {
        on_disconnected();
        Ok(())
    });

    eventually("failure announced", || disconnected.load(Ordering::SeqCst) == 1).await;

    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(!client.socket_initialized());
    let reason = client.last_error().expect("last error recorded");
    assert!(reason.contains("signer rejected"), "unexpected reason: {reason}");
    assert_eq!(provider.initialization_count(), 0);
}

#[tokio::test]
async fn malformed_payloads_are_dropped_without_stopping_delivery() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(identity("0xA11CE"), provider.clone(), ChatConfig::default());
    let group = client.create_group("Table 1", "").await.expect("create group");
    let (seen, on_message) = collector();
    let _subscription = client.subscribe_messages(group.clone(), on_message);
    eventually("client connects", || client.is_connected()).await;

    provider.broadcast_raw(json!({ "event": "chat_message", "groupId": group.as_str() }));
    provider.broadcast_raw(json!("not even an object"));
    provider.inject(
        &group,
        json!({
            "event": "chat_message",
            "chatId": group.as_str(),
            "cid": "m-legacy",
            "fromDID": "0xDEALER",
            "messageContent": "legacy shape",
        }),
    );

    eventually("valid payload delivered", || seen.lock().expect("seen").len() == 1).await;
    let seen = seen.lock().expect("seen");
    assert_eq!(seen[0].content, "legacy shape");
    assert_eq!(seen[0].sender.as_str(), "0xdealer");
    assert!(client.is_connected());
}

#[tokio::test]
async fn unsubscribed_listener_stops_receiving() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(identity("0xA11CE"), provider.clone(), ChatConfig::default());
    let group = client.create_group("Table 1", "").await.expect("create group");
    let (first_seen, on_first) = collector();
    let (second_seen, on_second) = collector();
    let first = client.subscribe_messages(group.clone(), on_first);
    let _second = client.subscribe_messages(group.clone(), on_second);
    eventually("client connects", || client.is_connected()).await;

    first.unsubscribe();
    first.unsubscribe();
    assert_eq!(client.message_listener_count(&group), 1);

    assert!(client.send_message(&group, "after").await);
    eventually("second listener delivery", || {
        second_seen.lock().expect("seen").len() == 1
    })
    .await;
    assert!(first_seen.lock().expect("seen").is_empty());
}

#[tokio::test]
async fn cleanup_resets_the_client_for_reuse() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(identity("0xA11CE"), provider.clone(), ChatConfig::default());
    let group = client.create_group("Table 1", "").await.expect("create group");
    let (seen, on_message) = collector();
    let _subscription = client.subscribe_messages(group.clone(), on_message);
    eventually("client connects", || client.is_connected()).await;
    assert!(client.send_message(&group, "before").await);
    eventually("first delivery", || seen.lock().expect("seen").len() == 1).await;

    client.cleanup().await;
    client.cleanup().await;

    assert!(!client.is_connected());
    assert_eq!(client.listener_count(), 0);
    assert_eq!(provider.live_session_count(), 0);

    let (again_seen, on_again) = collector();
    let _again = client.subscribe_messages(group.clone(), on_again);
    eventually("client reconnects", || client.is_connected()).await;
    assert!(client.send_message(&group, "after").await);
    eventually("delivery after cleanup", || {
        again_seen.lock().expect("seen").len() == 1
    })
    .await;
    assert_eq!(seen.lock().expect("seen").len(), 1);
}

#[tokio::test]
async fn remove_all_for_group_keeps_other_tables() {
    let provider = Arc::new(LoopbackProvider::new());
    let client = ChatClient::new(identity("0xA11CE"), provider, ChatConfig::default());
    let table_one = GroupId::new("table-1");
    let table_two = GroupId::new("table-2");
    let _a = client.subscribe_messages(table_one.clone(), |_message| Ok(()));
    let _b = client.subscribe_messages(table_one.clone(), |_message| Ok(()));
    let _c = client.subscribe_messages(table_two.clone(), |_message| Ok(()));

    assert_eq!(client.remove_all_for_group(&table_one), 2);
    assert_eq!(client.message_listener_count(&table_one), 0);
    assert_eq!(client.message_listener_count(&table_two), 1);
}
