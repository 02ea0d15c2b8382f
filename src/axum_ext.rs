//! Axum integration.
//!
//! | Endpoint | Method | Purpose |
//! |----------|--------|---------|
//! | `/v0/devices/{id}/next` | GET | Pull the next image (polling tiles) |
//! | `/v0/devices/{id}/ws` | GET | Persistent delivery session |
//! | `/v0/devices/{id}/push` | POST | Push an image, now or into a pushed installation |
//! | `/v0/dashboard/{user}/ws` | GET | Observe a user's devices |
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tilecast::axum_ext::router;
//!
//! let app = router(Arc::new(engine));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(listener, app).await?;
//! ```

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use futures_util::{future, SinkExt, StreamExt};
use http::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use serde::Deserialize;

use crate::auth::TokenAuth;
use crate::cache::ImageKey;
use crate::engine::Engine;
use crate::error::Error;
use crate::model::Device;
use crate::notify::{user_key, DashboardEvent, Notification};
use crate::protocol::WireMessage;
use crate::pull::{next_pull, PullResponse};
use crate::session::run_session;

/// Pull response header carrying brightness on the 0-255 scale.
pub const BRIGHTNESS_HEADER: &str = "tilecast-brightness";

/// Pull response header carrying the dwell time in seconds.
pub const DWELL_HEADER: &str = "tilecast-dwell-secs";

/// Build the router over a shared engine.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/v0/devices/{id}/next", get(next_image))
        .route("/v0/devices/{id}/ws", get(device_ws))
        .route("/v0/devices/{id}/push", post(push))
        .route("/v0/dashboard/{user}/ws", get(dashboard_ws))
        .with_state(engine)
}

/// A device that exists in the store, resolved from the `{id}` path segment.
#[derive(Debug, Clone)]
pub struct KnownDevice(pub Device);

impl FromRequestParts<Arc<Engine>> for KnownDevice {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        engine: &Arc<Engine>,
    ) -> Result<Self, Self::Rejection> {
        let Path(id) = Path::<String>::from_request_parts(parts, engine)
            .await
            .map_err(IntoResponse::into_response)?;
        engine
            .device(&id)
            .await
            .map(KnownDevice)
            .map_err(error_response)
    }
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        Error::Config(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    }
    (status, err.to_string()).into_response()
}

async fn next_image(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> Response {
    image_response(next_pull(&engine, &id, Utc::now()).await)
}

fn image_response(pull: PullResponse) -> Response {
    (
        [
            (CONTENT_TYPE, HeaderValue::from_static("image/webp")),
            (
                CACHE_CONTROL,
                HeaderValue::from_static("no-cache, must-revalidate"),
            ),
            (
                HeaderName::from_static(BRIGHTNESS_HEADER),
                HeaderValue::from(u32::from(pull.brightness)),
            ),
            (
                HeaderName::from_static(DWELL_HEADER),
                HeaderValue::from(pull.dwell_secs),
            ),
        ],
        pull.image,
    )
        .into_response()
}

async fn device_ws(
    State(engine): State<Arc<Engine>>,
    KnownDevice(device): KnownDevice,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let sink = sink.with(|message: WireMessage| {
            future::ready(Ok::<_, axum::Error>(to_axum(message)))
        });
        let stream = stream.filter_map(|message| future::ready(from_axum(message)));

        // run_session logs how the session ended
        let _ = run_session(engine, &device.id, sink, stream).await;
    })
}

fn to_axum(message: WireMessage) -> Message {
    match message {
        WireMessage::Text(text) => Message::Text(text.into()),
        WireMessage::Binary(image) => Message::Binary(image),
        WireMessage::Close => Message::Close(None),
    }
}

/// Pings and pongs are answered by axum and never reach the session.
fn from_axum(
    message: Result<Message, axum::Error>,
) -> Option<Result<WireMessage, axum::Error>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text.as_str().to_string()))),
        Ok(Message::Binary(data)) => Some(Ok(WireMessage::Binary(data))),
        Ok(Message::Close(_)) => Some(Ok(WireMessage::Close)),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => Some(Err(e)),
    }
}

#[derive(Debug, Deserialize)]
struct PushParams {
    installation: Option<String>,
}

async fn push(
    State(engine): State<Arc<Engine>>,
    KnownDevice(device): KnownDevice,
    Query(params): Query<PushParams>,
    auth: TokenAuth,
    body: Bytes,
) -> Response {
    if let Err(e) = auth.authorize_device(&device, engine.config().api_token.as_deref()) {
        return (StatusCode::UNAUTHORIZED, e.message).into_response();
    }
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "Empty image").into_response();
    }

    let Some(iname) = params.installation else {
        // Live sessions show it now; otherwise queue it for the next poll
        let delivered = engine
            .notifier()
            .notify(&device.id, Notification::Image(body.clone()));
        if delivered > 0 {
            tracing::info!("Pushed image to {} live session(s) of {}", delivered, device.id);
            return StatusCode::ACCEPTED.into_response();
        }
        return match engine.images().enqueue_push(&device.id, &body).await {
            Ok(_) => {
                tracing::info!("Queued pushed image for {}", device.id);
                StatusCode::ACCEPTED.into_response()
            }
            Err(e) => error_response(e),
        };
    };

    let Some(installation) = device.installation(&iname) else {
        return (StatusCode::NOT_FOUND, "Unknown installation").into_response();
    };
    if !installation.pushed {
        return (StatusCode::BAD_REQUEST, "Installation does not accept pushes").into_response();
    }

    let key = ImageKey::installation(&device.id, &installation.name, &installation.iname);
    if let Err(e) = engine.images().put(&key, &body).await {
        return error_response(e);
    }
    tracing::info!("Updated pushed installation {}/{}", device.id, iname);
    engine.notifier().notify(&device.id, Notification::Refresh);
    engine.notify_dashboard(&device);
    StatusCode::OK.into_response()
}

async fn dashboard_ws(
    State(engine): State<Arc<Engine>>,
    Path(user): Path<String>,
    auth: TokenAuth,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = auth.validate_server(engine.config().api_token.as_deref()) {
        return (StatusCode::UNAUTHORIZED, e.message).into_response();
    }
    ws.on_upgrade(move |socket| run_dashboard(engine, user, socket))
}

async fn run_dashboard(engine: Arc<Engine>, user: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let mut subscription = engine.notifier().subscribe(&user_key(&user));
    let cancel = engine.shutdown_token().child_token();
    tracing::debug!("Dashboard for {} connected", user);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            note = subscription.recv() => {
                let Some(note) = note else { break };
                let Some(event) = DashboardEvent::from_notification(&note) else {
                    continue;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Failed to encode dashboard event: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    engine.notifier().unsubscribe(subscription);
    let _ = sink.close().await;
    tracing::debug!("Dashboard for {} disconnected", user);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Installation;
    use crate::testing::{test_engine, TestEngine};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn device() -> Device {
        Device::new("tile-1").with_installation(
            Installation::new("1", "clock").with_app_path("clock.star"),
        )
    }

    async fn send(t: &TestEngine, request: Request<Body>) -> (StatusCode, Response) {
        let response = router(t.engine.clone()).oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn body(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn push_request(uri: &str, image: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(image))
            .unwrap()
    }

    #[tokio::test]
    async fn test_pull_headers() {
        let mut dimmed = device();
        dimmed.brightness = 50;
        let t = test_engine([dimmed]);

        let (status, response) = send(&t, get_request("/v0/devices/tile-1/next")).await;
        assert_eq!(status, StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[CONTENT_TYPE], "image/webp");
        assert_eq!(headers[CACHE_CONTROL], "no-cache, must-revalidate");
        assert_eq!(headers[BRIGHTNESS_HEADER], "128");
        assert_eq!(headers[DWELL_HEADER], "15");
        assert_eq!(body(response).await, Bytes::from_static(b"img:clock.star"));
    }

    #[tokio::test]
    async fn test_pull_unknown_device_gets_default() {
        let t = test_engine([]);
        let (status, response) = send(&t, get_request("/v0/devices/ghost/next")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body(response).await, t.engine.default_image());
    }

    #[tokio::test]
    async fn test_push_queued_for_polling_device() {
        let t = test_engine([device()]);

        let (status, _) = send(&t, push_request("/v0/devices/tile-1/push", b"pushed")).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (_, response) = send(&t, get_request("/v0/devices/tile-1/next")).await;
        assert_eq!(body(response).await, Bytes::from_static(b"pushed"));
        // Served once
        let (_, response) = send(&t, get_request("/v0/devices/tile-1/next")).await;
        assert_eq!(body(response).await, Bytes::from_static(b"img:clock.star"));
    }

    #[tokio::test]
    async fn test_push_interrupts_live_session() {
        let t = test_engine([device()]);
        let mut session = t.engine.notifier().subscribe("tile-1");

        let (status, _) = send(&t, push_request("/v0/devices/tile-1/push", b"pushed")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(
            session.try_recv(),
            Some(Notification::Image(Bytes::from_static(b"pushed")))
        );
        assert_eq!(t.engine.images().take_next_push("tile-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_to_installation() {
        let mut device = device();
        device.owner = Some("alice".to_string());
        let device = device.with_installation(Installation::new("7", "photo").pushed());
        let t = test_engine([device]);
        let mut dashboard = t.engine.notifier().subscribe("user:alice");

        let (status, _) = send(
            &t,
            push_request("/v0/devices/tile-1/push?installation=7", b"photo"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let key = ImageKey::installation("tile-1", "photo", "7");
        assert_eq!(
            t.engine.images().get(&key).await.unwrap(),
            Some(Bytes::from_static(b"photo"))
        );
        assert_eq!(dashboard.try_recv(), Some(Notification::Refresh));

        let (status, _) = send(
            &t,
            push_request("/v0/devices/tile-1/push?installation=1", b"photo"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &t,
            push_request("/v0/devices/tile-1/push?installation=99", b"photo"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_push_requires_device_key() {
        let mut keyed = device();
        keyed.api_key = Some("k3y".to_string());
        let t = test_engine([keyed]);

        let (status, _) = send(&t, push_request("/v0/devices/tile-1/push", b"x")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&t, push_request("/v0/devices/tile-1/push?token=k3y", b"x")).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let request = Request::builder()
            .method("POST")
            .uri("/v0/devices/tile-1/push")
            .header("Authorization", "Bearer k3y")
            .body(Body::from("x"))
            .unwrap();
        let (status, _) = send(&t, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_push_rejects_unknown_device_and_empty_body() {
        let t = test_engine([device()]);

        let (status, _) = send(&t, push_request("/v0/devices/ghost/push", b"x")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&t, push_request("/v0/devices/tile-1/push", b"")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ws_unknown_device_refused_before_upgrade() {
        let t = test_engine([]);
        let (status, _) = send(&t, get_request("/v0/devices/ghost/ws")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_message_mapping() {
        assert_eq!(
            from_axum(Ok(Message::Text("{}".into()))).unwrap().unwrap(),
            WireMessage::Text("{}".to_string())
        );
        assert!(from_axum(Ok(Message::Ping(Bytes::new()))).is_none());
        assert!(matches!(
            to_axum(WireMessage::Binary(Bytes::from_static(b"img"))),
            Message::Binary(data) if data == Bytes::from_static(b"img")
        ));
    }
}
