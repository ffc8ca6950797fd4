use std::sync::Arc;
use std::time::Duration;

use parlor_server::{ServerState, router};
use parlor_store::{MemoryStore, RemoteConfig, RemoteStore, StoreClient, StoreError};
use parlor_sync::{Session, SessionEvent, SyncConfig};
use parlor_types::paths::CONNECTED;
use parlor_types::{Uid, Updates, UserProfile, server_timestamp};
use serde_json::{Value, json};

async fn serve(store: MemoryStore) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(ServerState {
        store,
        heartbeat: Duration::from_secs(15),
    });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{}/store", addr)
}

async fn connect(url: &str) -> RemoteStore {
    let mut config = RemoteConfig::new(url);
    config.reconnect_delay = Duration::from_millis(50);
    config.request_timeout = Duration::from_secs(5);
    RemoteStore::connect(config).await.unwrap()
}

/// Poll until the server-side tree shows `expected` at `path`.
async fn eventually(store: &MemoryStore, path: &str, expected: Value) {
    for _ in 0..100 {
        if store.peek(path).as_ref() == Some(&expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never became {}", path, expected);
}

#[tokio::test]
async fn writes_reads_and_watches_round_trip() {
    let store = MemoryStore::new();
    let url = serve(store.clone()).await;
    let remote = connect(&url).await;

    let mut watch = remote.watch("Channels/general/rooms").await.unwrap();
    assert_eq!(watch.values.recv().await.unwrap(), None);

    let mut updates = Updates::new();
    updates.set("Channels/general/rooms/welcome/name", "welcome");
    remote.write(updates).await.unwrap();

    assert_eq!(
        watch.values.recv().await.unwrap(),
        Some(json!({ "welcome": { "name": "welcome" } }))
    );
    assert_eq!(
        remote.read_once("Channels/general/rooms/welcome/name").await.unwrap(),
        Some(json!("welcome"))
    );
    assert_eq!(store.peek("Channels/general/rooms/welcome/name"), Some(json!("welcome")));

    remote.unwatch(watch.id).await.unwrap();
    remote.unwatch(watch.id).await.unwrap();
}

#[tokio::test]
async fn rejections_keep_their_kind() {
    let store = MemoryStore::new();
    store.deny_writes_under("Channels/secret");
    let url = serve(store).await;
    let remote = connect(&url).await;

    let mut updates = Updates::new();
    updates.set("Channels/secret/name", "secret");
    assert_eq!(
        remote.write(updates).await,
        Err(StoreError::PermissionDenied {
            path: "Channels/secret/name".into()
        })
    );

    let mut bad = Updates::new();
    bad.set("users/a.b", true);
    assert!(matches!(
        remote.write(bad).await,
        Err(StoreError::InvalidPath { .. })
    ));
}

#[tokio::test]
async fn dropped_client_runs_its_deferred_writes() {
    let store = MemoryStore::new();
    let url = serve(store.clone()).await;
    let remote = connect(&url).await;

    let mut connected = remote.watch(CONNECTED).await.unwrap();
    assert_eq!(connected.values.recv().await.unwrap(), Some(json!(true)));

    let mut online = Updates::new();
    online.set("users/u1/isOnline", true);
    remote.write(online).await.unwrap();

    let mut offline = Updates::new();
    offline
        .set("users/u1/isOnline", false)
        .set("users/u1/lastLoggedIn", server_timestamp());
    remote.register_deferred_write(offline).await.unwrap();

    drop(remote);

    eventually(&store, "users/u1/isOnline", json!(false)).await;
    assert!(store.peek("users/u1/lastLoggedIn").unwrap().is_i64());
}

#[tokio::test]
async fn session_over_the_wire() {
    let store = MemoryStore::new();
    let url = serve(store.clone()).await;
    let remote: Arc<dyn StoreClient> = Arc::new(connect(&url).await);

    let mut seed = Updates::new();
    seed.set("Channels/general/name", "general")
        .set("users/ada/channels/general", "member")
        .set(
            "Channels/general/users/ada",
            json!({ "displayName": "Ada", "role": "member", "status": "offline" }),
        );
    remote.write(seed).await.unwrap();

    let profile = UserProfile {
        uid: Uid::from_static("ada"),
        display_name: "Ada".into(),
        email: "ada@example.com".into(),
        photo_url: String::new(),
        color: "#aa00ff".into(),
    };
    let mut session = Session::start(remote.clone(), profile, SyncConfig::default())
        .await
        .unwrap();
    assert_eq!(
        session.next_event().await,
        Some(SessionEvent::Online { channels: 1 })
    );
    assert_eq!(store.peek("Channels/general/users/ada/status"), Some(json!("online")));

    session.logout().await.unwrap();
    assert_eq!(store.peek("Channels/general/users/ada/status"), Some(json!("offline")));
    assert_eq!(store.peek("Channels/general/online_users"), None);
}
