use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parlor_store::{MemoryStore, StoreClient};
use parlor_sync::{
    ChannelDirectory, ListenerKey, ListenerKind, ListenerRegistry, MembershipHealth,
    MembershipMirror, PresenceController, Session, SessionEvent, SyncConfig, SyncError,
    UnreadTracker, UserDirectory,
};
use parlor_types::{ChannelId, Role, RoomId, Uid, Updates, UserProfile};
use serde_json::json;

fn profile(uid: &'static str) -> UserProfile {
    UserProfile {
        uid: Uid::from_static(uid),
        display_name: uid.to_string(),
        email: format!("{}@example.com", uid),
        photo_url: String::new(),
        color: "#336699".into(),
    }
}

fn config() -> SyncConfig {
    SyncConfig {
        mirror_retry_backoff: Duration::from_millis(1),
        ..SyncConfig::default()
    }
}

struct Fixture {
    store: MemoryStore,
    client: Arc<dyn StoreClient>,
    mirror: MembershipMirror,
    channels: ChannelDirectory,
    users: UserDirectory,
    unread: UnreadTracker,
}

fn fixture() -> Fixture {
    let store = MemoryStore::new();
    let client: Arc<dyn StoreClient> = Arc::new(store.connect());
    let mirror = MembershipMirror::new(client.clone(), config());
    Fixture {
        channels: ChannelDirectory::new(client.clone(), mirror.clone()),
        users: UserDirectory::new(client.clone(), mirror.clone()),
        unread: UnreadTracker::new(client.clone()),
        mirror,
        client,
        store,
    }
}

/// A channel called "general" with rooms "welcome" and "rules".
async fn general_with_rooms(client: &Arc<dyn StoreClient>) -> ChannelId {
    let mut updates = Updates::new();
    updates
        .set("Channels/general/name", "general")
        .set("Channels/general/rooms/welcome/name", "welcome")
        .set("Channels/general/rooms/rules/name", "rules");
    client.write(updates).await.unwrap();
    ChannelId::from_static("general")
}

fn rooms(ids: &[&'static str]) -> BTreeSet<RoomId> {
    ids.iter().map(|id| RoomId::from_static(id)).collect()
}

#[tokio::test]
async fn subscription_writes_both_mirrors() {
    let f = fixture();
    let general = general_with_rooms(&f.client).await;
    let alice = profile("alice");

    f.mirror.subscribe_user_to_channel(&alice, &general).await.unwrap();

    assert!(f.store.peek("users/alice/channels/general").is_some());
    assert!(f.store.peek("Channels/general/users/alice").is_some());
    assert_eq!(
        f.mirror.check_membership(&alice.uid, &general).await.unwrap(),
        MembershipHealth::Consistent
    );
}

#[tokio::test]
async fn unread_rooms_follow_reads_and_new_rooms() {
    let f = fixture();
    let general = general_with_rooms(&f.client).await;
    let alice = profile("alice");

    f.channels.subscribe_to_channel(&alice, &general).await.unwrap();
    assert_eq!(
        f.unread.unread_rooms(&alice.uid, &general).await.unwrap(),
        rooms(&["welcome", "rules"])
    );

    f.unread
        .mark_read(&alice.uid, &general, &RoomId::from_static("welcome"))
        .await
        .unwrap();
    assert_eq!(
        f.unread.unread_rooms(&alice.uid, &general).await.unwrap(),
        rooms(&["rules"])
    );

    let off_topic = f.channels.create_room(&general, "off-topic", None).await.unwrap();
    let mut expected = rooms(&["rules"]);
    expected.insert(off_topic);
    assert_eq!(f.unread.unread_rooms(&alice.uid, &general).await.unwrap(), expected);
}

#[tokio::test]
async fn resubscribing_does_not_reseed_read_rooms() {
    let f = fixture();
    let general = general_with_rooms(&f.client).await;
    let alice = profile("alice");

    f.channels.subscribe_to_channel(&alice, &general).await.unwrap();
    f.unread
        .mark_read(&alice.uid, &general, &RoomId::from_static("welcome"))
        .await
        .unwrap();
    f.channels.subscribe_to_channel(&alice, &general).await.unwrap();

    assert_eq!(
        f.unread.unread_rooms(&alice.uid, &general).await.unwrap(),
        rooms(&["rules"])
    );
}

#[tokio::test]
async fn room_created_twice_equals_once() {
    let f = fixture();
    let general = general_with_rooms(&f.client).await;
    f.mirror
        .subscribe_user_to_channel(&profile("alice"), &general)
        .await
        .unwrap();
    let room = RoomId::from_static("announcements");

    f.unread.on_room_created(&general, &room).await.unwrap();
    let once = f.store.peek("users");
    f.unread.on_room_created(&general, &room).await.unwrap();

    assert_eq!(f.store.peek("users"), once);
}

#[tokio::test]
async fn read_then_created_again_is_unread() {
    let f = fixture();
    let general = general_with_rooms(&f.client).await;
    let alice = profile("alice");
    f.mirror.subscribe_user_to_channel(&alice, &general).await.unwrap();
    let welcome = RoomId::from_static("welcome");

    f.unread.mark_read(&alice.uid, &general, &welcome).await.unwrap();
    f.unread.on_room_created(&general, &welcome).await.unwrap();

    assert!(
        f.unread
            .unread_rooms(&alice.uid, &general)
            .await
            .unwrap()
            .contains(&welcome)
    );
}

#[tokio::test]
async fn disconnect_without_logout_marks_every_channel_offline() {
    let store = MemoryStore::new();
    let setup: Arc<dyn StoreClient> = Arc::new(store.connect());
    let mirror = MembershipMirror::new(setup.clone(), config());
    let channels = ChannelDirectory::new(setup.clone(), mirror);
    let alice = profile("alice");

    let mut ids = Vec::new();
    for name in ["general", "random", "help", "news"] {
        ids.push(channels.create_channel(&alice, name, false).await.unwrap());
    }

    let laptop = Arc::new(store.connect());
    let presence = PresenceController::new(laptop.clone(), alice.clone());
    let list: Vec<(ChannelId, Role)> = ids
        .iter()
        .map(|id| (id.clone(), Role::from_static("owner")))
        .collect();
    presence.go_online(&list).await.unwrap();
    for id in &ids {
        assert_eq!(
            store.peek(&format!("Channels/{}/users/alice/status", id)),
            Some(json!("online"))
        );
    }

    // lid closed: no logout, the socket just goes away
    drop(presence);
    drop(laptop);

    assert_eq!(store.peek("users/alice/isOnline"), Some(json!(false)));
    for id in &ids {
        assert_eq!(
            store.peek(&format!("Channels/{}/users/alice/status", id)),
            Some(json!("offline"))
        );
        assert_eq!(store.peek(&format!("Channels/{}/online_users", id)), None);
    }
}

#[tokio::test]
async fn attach_twice_then_detach_all_leaves_nothing() {
    let f = fixture();
    let registry = ListenerRegistry::new(f.client.clone());
    let general = ChannelId::from_static("general");
    let alice = Uid::from_static("alice");
    let key = ListenerKey::new(general.clone(), alice.clone(), ListenerKind::UnreadRooms);

    let _first = registry.attach(key.clone()).await.unwrap();
    let _second = registry.attach(key).await.unwrap();
    assert_eq!(registry.active_count(), 1);
    assert_eq!(registry.totals().0, 1);

    registry.detach_all(&general, &alice).await;
    registry.detach_all(&general, &alice).await;
    assert_eq!(registry.active_count(), 0);
    assert_eq!(registry.totals(), (1, 1));
    assert_eq!(f.store.watch_count(), 0);
}

#[tokio::test]
async fn half_written_membership_is_reported() {
    let f = fixture();
    f.store.set_atomic(false);
    f.store.fail_writes_under("Channels/general/users", 100);
    let general = general_with_rooms(&f.client).await;
    let alice = profile("alice");

    let err = f
        .mirror
        .subscribe_user_to_channel(&alice, &general)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConsistencyViolation { .. }));
    assert!(matches!(
        f.mirror.check_membership(&alice.uid, &general).await.unwrap(),
        MembershipHealth::Degraded { .. }
    ));

    f.store.clear_faults();
    f.mirror.subscribe_user_to_channel(&alice, &general).await.unwrap();
    assert_eq!(
        f.mirror.check_membership(&alice.uid, &general).await.unwrap(),
        MembershipHealth::Consistent
    );
}

#[tokio::test]
async fn permission_errors_are_surfaced() {
    let f = fixture();
    f.store.deny_writes_under("Channels/general/users");
    let general = general_with_rooms(&f.client).await;

    let err = f
        .mirror
        .subscribe_user_to_channel(&profile("alice"), &general)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Permission { .. }));
    assert_eq!(f.store.peek("users"), None);
}

#[tokio::test]
async fn malformed_records_are_decoding_errors() {
    let f = fixture();
    let mut updates = Updates::new();
    updates.set("users/alice/channels", json!({ "general": 5 }));
    f.client.write(updates).await.unwrap();

    let err = f
        .users
        .channel_list(&Uid::from_static("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Decoding { ref path, .. } if path == "users/alice/channels"));
}

#[tokio::test]
async fn session_survives_a_connection_cycle() {
    let store = MemoryStore::new();
    let setup: Arc<dyn StoreClient> = Arc::new(store.connect());
    let mirror = MembershipMirror::new(setup.clone(), config());
    let channels = ChannelDirectory::new(setup, mirror);
    let bob = profile("bob");
    let general = channels.create_channel(&bob, "general", false).await.unwrap();

    let device = Arc::new(store.connect());
    let mut session = Session::start(device.clone(), bob.clone(), config())
        .await
        .unwrap();
    assert_eq!(session.next_event().await, Some(SessionEvent::Online { channels: 1 }));
    assert_eq!(
        store.peek(&format!("Channels/{}/online_users/bob/role", general)),
        Some(json!("owner"))
    );

    device.disconnect();
    assert_eq!(session.next_event().await, Some(SessionEvent::Offline));
    assert_eq!(
        store.peek(&format!("Channels/{}/users/bob/status", general)),
        Some(json!("offline"))
    );

    device.reconnect();
    assert_eq!(session.next_event().await, Some(SessionEvent::Online { channels: 1 }));
    assert_eq!(
        store.peek(&format!("Channels/{}/users/bob/status", general)),
        Some(json!("online"))
    );

    session.logout().await.unwrap();
    assert_eq!(store.peek("users/bob/isOnline"), Some(json!(false)));
    assert_eq!(store.deferred_count(device.id()), 0);
}

#[tokio::test]
async fn resubscribing_keeps_owner_role_and_online_status() {
    let store = MemoryStore::new();
    let setup: Arc<dyn StoreClient> = Arc::new(store.connect());
    let mirror = MembershipMirror::new(setup.clone(), config());
    let channels = ChannelDirectory::new(setup, mirror);
    let bob = profile("bob");
    let general = channels.create_channel(&bob, "general", false).await.unwrap();

    channels.subscribe_to_channel(&bob, &general).await.unwrap();
    assert_eq!(
        store.peek(&format!("users/bob/channels/{}", general)),
        Some(json!("owner"))
    );
    assert_eq!(
        store.peek(&format!("Channels/{}/users/bob/role", general)),
        Some(json!("owner"))
    );

    let alice = profile("alice");
    channels.subscribe_to_channel(&alice, &general).await.unwrap();
    let device = Arc::new(store.connect());
    let mut session = Session::start(device, alice.clone(), config()).await.unwrap();
    assert_eq!(session.next_event().await, Some(SessionEvent::Online { channels: 1 }));

    session.channels().subscribe_to_channel(&alice, &general).await.unwrap();
    assert_eq!(
        store.peek(&format!("Channels/{}/users/alice/status", general)),
        Some(json!("online"))
    );
    assert_eq!(store.peek("users/alice/isOnline"), Some(json!(true)));
    assert!(
        store
            .peek(&format!("Channels/{}/online_users/alice", general))
            .is_some()
    );
}
