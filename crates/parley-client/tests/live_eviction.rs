//! Server-side ending of live connections: handshake rejection, duplicate
//! replacement and the liveness sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio_tungstenite::tungstenite;

use parley_client::live::{self, LiveConnection};
use parley_client::{ApiClient, ChatClient, ClientError};
use parley_server::media_store::DiskMediaStore;
use parley_server::presence::PresenceBroadcaster;
use parley_server::{build_router, AppState, ConnectionRegistry, ServerConfig};
use parley_shared::types::UserId;
use parley_store::{MessageStore, SqliteStore};

const QUIET: Duration = Duration::from_secs(3600);

struct TestServer {
    url: String,
    registry: Arc<ConnectionRegistry>,
    _media_dir: TempDir,
}

async fn start_server() -> TestServer {
    let media_dir = TempDir::new().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let config = ServerConfig {
        media_storage_path: media_dir.path().to_path_buf(),
        public_base_url: url.clone(),
        ..ServerConfig::default()
    };
    let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::in_memory().unwrap());
    let media = Arc::new(
        DiskMediaStore::new(
            config.media_storage_path.clone(),
            config.public_base_url.clone(),
            config.max_media_size,
        )
        .await
        .unwrap(),
    );
    let registry = Arc::new(ConnectionRegistry::new());
    PresenceBroadcaster::new(Arc::clone(&registry)).spawn();

    let app = build_router(AppState::new(store, media, Arc::clone(&registry), config));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        url,
        registry,
        _media_dir: media_dir,
    }
}

impl TestServer {
    async fn register(&self, name: &str) -> (ApiClient, UserId) {
        let api = ApiClient::new(&self.url).unwrap();
        let user = api.register_user(name).await.unwrap();
        (api, user.id)
    }

    async fn connect(&self, api: &ApiClient, user: UserId, heartbeat: Duration) -> LiveConnection {
        live::connect_with_heartbeat(&api.live_url(user).unwrap(), heartbeat)
            .await
            .unwrap()
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Drain `conn` until the server closes it.
async fn closes(conn: &mut LiveConnection) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        while conn.recv().await.is_some() {}
    })
    .await
    .is_ok()
}

fn assert_unauthorized(result: Result<LiveConnection, ClientError>) {
    match result {
        Err(ClientError::Live(tungstenite::Error::Http(resp))) => {
            assert_eq!(resp.status().as_u16(), 401);
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("handshake should have been rejected"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_rejects_unknown_user() {
    let server = start_server().await;
    let ws_base = server.url.replacen("http://", "ws://", 1);

    assert_unauthorized(live::connect(&format!("{ws_base}/ws?userId={}", UserId::new())).await);
    assert_unauthorized(live::connect(&format!("{ws_base}/ws?userId=not-a-uuid")).await);
    assert_unauthorized(live::connect(&format!("{ws_base}/ws")).await);
    assert!(server.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_closes_replaced_connection() {
    let server = start_server().await;
    let (api, me) = server.register("Alice").await;

    let mut first = server.connect(&api, me, QUIET).await;
    let registry = Arc::clone(&server.registry);
    wait_until("first registered", || registry.lookup(me).is_some()).await;
    let first_conn = server.registry.lookup(me).unwrap().conn_id();

    let _second = server.connect(&api, me, QUIET).await;
    wait_until("second registered", || {
        registry.lookup(me).is_some_and(|h| h.conn_id() != first_conn)
    })
    .await;

    assert!(closes(&mut first).await, "replaced connection should close");
    // The replaced socket's exit must not remove the newer entry.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.registry.len(), 1);
    assert!(server.registry.lookup(me).is_some_and(|h| h.conn_id() != first_conn));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_sweep_closes_connection() {
    let server = start_server().await;
    let (api, me) = server.register("Alice").await;

    let mut conn = server.connect(&api, me, QUIET).await;
    let registry = Arc::clone(&server.registry);
    wait_until("registered", || registry.lookup(me).is_some()).await;

    let evicted = server
        .registry
        .evict_stale(Instant::now() + Duration::from_secs(120), Duration::from_secs(60));
    assert_eq!(evicted.len(), 1);

    assert!(closes(&mut conn).await, "evicted connection should close");
    assert!(server.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_sweep_updates_peer_roster() {
    let server = start_server().await;
    let (alice_api, alice_id) = server.register("Alice").await;
    let (bob_api, bob_id) = server.register("Bob").await;

    let alice = ChatClient::new(alice_api, alice_id);
    let alice_conn = server
        .connect(alice.api(), alice_id, Duration::from_millis(50))
        .await;
    alice.spawn_live(alice_conn);

    let mut bob_conn = server.connect(&bob_api, bob_id, QUIET).await;
    wait_until("bob online for alice", || {
        alice.with_session(|s| s.is_online(bob_id) && s.is_online(alice_id))
    })
    .await;

    // Alice keeps heartbeating, Bob goes quiet after his first frame.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let evicted = server
        .registry
        .evict_stale(Instant::now(), Duration::from_millis(500));
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].user_id(), bob_id);

    wait_until("bob offline for alice", || {
        !alice.with_session(|s| s.is_online(bob_id))
    })
    .await;
    assert!(alice.with_session(|s| s.is_online(alice_id)));
    assert!(closes(&mut bob_conn).await);
}
