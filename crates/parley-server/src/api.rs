use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, FromRequestParts, Path, State},
    http::{header, request::Parts, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::constants::{PROTOCOL_VERSION, USER_ID_HEADER};
use parley_shared::media::MediaPayload;
use parley_shared::protocol::{
    ContactsResponse, ConversationResponse, MarkSeenResponse, RegisterUserRequest,
    SendMessageRequest,
};
use parley_shared::types::{MessageId, UserId};
use parley_shared::{Message, User};
use parley_store::MessageStore;

use crate::config::ServerConfig;
use crate::delivery::{run_blocking, DeliveryPipeline, SendRequest};
use crate::error::ServerError;
use crate::live;
use crate::media_store::DiskMediaStore;
use crate::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub media: Arc<DiskMediaStore>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub registry: Arc<ConnectionRegistry>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn MessageStore>,
        media: Arc<DiskMediaStore>,
        registry: Arc<ConnectionRegistry>,
        config: ServerConfig,
    ) -> Self {
        let pipeline = Arc::new(DeliveryPipeline::new(
            Arc::clone(&store),
            media.clone(),
            Arc::clone(&registry),
        ));
        Self {
            store,
            media,
            pipeline,
            registry,
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    // Media travels base64-encoded inside JSON.
    let body_limit = state.config.max_media_size / 3 * 4 + 64 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/api/users", post(register_user).get(contacts))
        .route("/api/messages/{peer_id}", get(conversation))
        .route("/api/messages/send/{peer_id}", post(send_message))
        .route("/api/messages/mark/{id}", put(mark_message_seen))
        .route("/media/{file}", get(media_download))
        .route("/ws", get(live::ws_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve a raw user id to a registered user.
pub(crate) async fn known_user(state: &AppState, raw: Option<&str>) -> Result<UserId, ServerError> {
    let id = raw
        .and_then(|r| UserId::parse(r.trim()).ok())
        .ok_or(ServerError::Unauthorized)?;
    if run_blocking(&state.store, move |s| s.user_exists(id)).await? {
        Ok(id)
    } else {
        Err(ServerError::Unauthorized)
    }
}

/// Caller identity taken from the `x-user-id` header.
pub struct CurrentUser(pub UserId);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok());
        known_user(state, raw).await.map(CurrentUser)
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    protocol: &'static str,
    online: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        online: state.registry.len(),
    })
}

async fn register_user(
    State(state): State<AppState>,
    Json(req): Json<RegisterUserRequest>,
) -> Result<(StatusCode, Json<User>), ServerError> {
    let full_name = req.full_name.trim().to_string();
    if full_name.is_empty() {
        return Err(ServerError::BadRequest("fullName is required".into()));
    }

    let user = User {
        id: UserId::new(),
        full_name,
        created_at: Utc::now(),
    };
    let stored = user.clone();
    run_blocking(&state.store, move |s| s.insert_user(&stored)).await?;

    info!(user = %user.id, name = %user.full_name, "User registered");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn contacts(
    CurrentUser(me): CurrentUser,
    State(state): State<AppState>,
) -> Result<Json<ContactsResponse>, ServerError> {
    let (users, unseen_messages) = run_blocking(&state.store, move |s| {
        let users: Vec<User> = s.list_users()?.into_iter().filter(|u| u.id != me).collect();
        Ok((users, s.unseen_counts(me)?))
    })
    .await?;

    Ok(Json(ContactsResponse {
        users,
        unseen_messages,
    }))
}

/// History with `peer`, then mark everything `peer` sent us as seen.
/// The returned records reflect their state before the mark.
async fn conversation(
    CurrentUser(me): CurrentUser,
    State(state): State<AppState>,
    Path(peer): Path<UserId>,
) -> Result<Json<ConversationResponse>, ServerError> {
    let messages = state.pipeline.history(me, peer).await?;
    state.pipeline.mark_seen(peer, me).await?;
    Ok(Json(ConversationResponse { messages }))
}

async fn send_message(
    CurrentUser(me): CurrentUser,
    State(state): State<AppState>,
    Path(peer): Path<UserId>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let media = req
        .image
        .as_deref()
        .filter(|url| !url.is_empty())
        .map(MediaPayload::from_data_url)
        .transpose()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let delivery = state
        .pipeline
        .send(SendRequest {
            sender: me,
            recipient: peer,
            text: req.text,
            media,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(delivery.message)))
}

async fn mark_message_seen(
    CurrentUser(me): CurrentUser,
    State(state): State<AppState>,
    Path(id): Path<MessageId>,
) -> Result<Json<MarkSeenResponse>, ServerError> {
    let updated = state.pipeline.mark_message_seen(id, me).await?;
    Ok(Json(MarkSeenResponse { updated }))
}

async fn media_download(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let (data, content_type) = state.media.get(&file).await?;
    Ok(([(header::CONTENT_TYPE, content_type)], data))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use parley_shared::protocol::ServerEvent;
    use parley_store::SqliteStore;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::registry::LiveHandle;

    struct TestApp {
        router: Router,
        state: AppState,
        _media_dir: TempDir,
    }

    async fn test_app() -> TestApp {
        test_app_with_media_limit(ServerConfig::default().max_media_size).await
    }

    async fn test_app_with_media_limit(max_media_size: usize) -> TestApp {
        let media_dir = TempDir::new().unwrap();
        let config = ServerConfig {
            media_storage_path: media_dir.path().to_path_buf(),
            public_base_url: "http://chat.test".into(),
            max_media_size,
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
        let state = AppState::new(store, media, Arc::new(ConnectionRegistry::new()), config);
        TestApp {
            router: build_router(state.clone()),
            state,
            _media_dir: media_dir,
        }
    }

    impl TestApp {
        async fn call(&self, req: Request<Body>) -> (StatusCode, Value) {
            let resp = self.router.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
                .await
                .unwrap();
            let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, body)
        }

        async fn register(&self, name: &str) -> UserId {
            let (status, body) = self
                .call(json_request(Method::POST, "/api/users", None, json!({ "fullName": name })))
                .await;
            assert_eq!(status, StatusCode::CREATED);
            UserId::parse(body["id"].as_str().unwrap()).unwrap()
        }
    }

    fn json_request(method: Method, uri: &str, user: Option<UserId>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user.to_string());
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str, user: Option<UserId>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user.to_string());
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app().await;
        let (status, body) = app.call(get("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_register_requires_name() {
        let app = test_app().await;
        let (status, body) = app
            .call(json_request(Method::POST, "/api/users", None, json!({ "fullName": "  " })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_caller_is_unauthorized() {
        let app = test_app().await;
        let (status, _) = app.call(get("/api/users", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = app.call(get("/api/users", Some(UserId::new()))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_send_then_read_clears_unseen() {
        let app = test_app().await;
        let alice = app.register("Alice").await;
        let bob = app.register("Bob").await;

        let (status, sent) = app
            .call(json_request(
                Method::POST,
                &format!("/api/messages/send/{bob}"),
                Some(alice),
                json!({ "text": "hi" }),
            ))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sent["text"], "hi");
        assert_eq!(sent["seen"], false);

        let (_, contacts) = app.call(get("/api/users", Some(bob))).await;
        assert_eq!(contacts["users"].as_array().unwrap().len(), 1);
        assert_eq!(contacts["unseenMessages"][alice.to_string()], 1);

        let (status, history) = app
            .call(get(&format!("/api/messages/{alice}"), Some(bob)))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["messages"][0]["id"], sent["id"]);

        let (_, contacts) = app.call(get("/api/users", Some(bob))).await;
        assert!(contacts["unseenMessages"].get(alice.to_string()).is_none());
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let app = test_app().await;
        let alice = app.register("Alice").await;
        let bob = app.register("Bob").await;

        let (status, body) = app
            .call(json_request(
                Method::POST,
                &format!("/api/messages/send/{bob}"),
                Some(alice),
                json!({}),
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("text or media"));
    }

    #[tokio::test]
    async fn test_send_pushes_to_online_recipient() {
        let app = test_app().await;
        let alice = app.register("Alice").await;
        let bob = app.register("Bob").await;
        let (handle, mut rx) = LiveHandle::channel(bob, 8);
        app.state.registry.register(handle);

        let (_, sent) = app
            .call(json_request(
                Method::POST,
                &format!("/api/messages/send/{bob}"),
                Some(alice),
                json!({ "text": "you there?" }),
            ))
            .await;

        match rx.try_recv().unwrap() {
            ServerEvent::MessageDelivered(m) => assert_eq!(m.id.to_string(), sent["id"]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_image_upload_is_served_back() {
        let app = test_app().await;
        let alice = app.register("Alice").await;
        let bob = app.register("Bob").await;
        let image = MediaPayload::new("image/png", b"\x89PNG fake".to_vec());

        let (status, sent) = app
            .call(json_request(
                Method::POST,
                &format!("/api/messages/send/{bob}"),
                Some(alice),
                json!({ "image": image.to_data_url() }),
            ))
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let url = sent["mediaUrl"].as_str().unwrap();
        let path = url.strip_prefix("http://chat.test").unwrap();
        let resp = app.router.clone().oneshot(get(path, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"\x89PNG fake");
    }

    #[tokio::test]
    async fn test_malformed_image_rejected() {
        let app = test_app().await;
        let alice = app.register("Alice").await;
        let bob = app.register("Bob").await;

        let (status, _) = app
            .call(json_request(
                Method::POST,
                &format!("/api/messages/send/{bob}"),
                Some(alice),
                json!({ "image": "not a data url" }),
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rejected_upload_is_bad_gateway() {
        let app = test_app_with_media_limit(4).await;
        let alice = app.register("Alice").await;
        let bob = app.register("Bob").await;
        let image = MediaPayload::new("image/png", vec![7u8; 64]);

        let (status, body) = app
            .call(json_request(
                Method::POST,
                &format!("/api/messages/send/{bob}"),
                Some(alice),
                json!({ "text": "look", "image": image.to_data_url() }),
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "Media upload failed");

        let (_, history) = app.call(get(&format!("/api/messages/{alice}"), Some(bob))).await;
        assert!(history["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_media_is_not_found() {
        let app = test_app().await;
        let (status, _) = app
            .call(get(&format!("/media/{}.png", uuid::Uuid::new_v4()), None))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mark_single_message() {
        let app = test_app().await;
        let alice = app.register("Alice").await;
        let bob = app.register("Bob").await;
        let (_, sent) = app
            .call(json_request(
                Method::POST,
                &format!("/api/messages/send/{bob}"),
                Some(alice),
                json!({ "text": "ping" }),
            ))
            .await;
        let uri = format!("/api/messages/mark/{}", sent["id"].as_str().unwrap());

        let (status, body) = app
            .call(json_request(Method::PUT, &uri, Some(bob), Value::Null))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], true);

        let (_, body) = app
            .call(json_request(Method::PUT, &uri, Some(bob), Value::Null))
            .await;
        assert_eq!(body["updated"], false);
    }
}
