//! The HTTP seam: a thin `warp` surface over the Session Facade. Every
//! route here is a direct realization of the original prototype's gin
//! handlers (`healthcheck`, `getUUID`, `readData`, `writeData`,
//! `updateData`) plus the `/setpassword`, `/clearpassword` and `/events`
//! routes the prototype's handler table described but `cmd/main.go` hadn't
//! wired up yet.

use std::convert::Infallible;
use std::sync::Arc;

use futures::StreamExt;
use log::warn;
use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::driver::CardDriver;
use crate::error::Error;
use crate::session::Facade;
use crate::tags::{CardPayload, PartialCardPayload};
use crate::watcher::PresenceEvent;

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl ErrorBody {
    fn new(msg: impl Into<String>) -> ErrorBody {
        ErrorBody {
            success: false,
            error: msg.into(),
        }
    }
}

/// Maps the error taxonomy onto the status codes in the external
/// interfaces table. `clearpassword` reports an auth failure as `500`
/// ("invalid password") rather than the `403` every other route uses,
/// matching the literal text of that one route's contract.
fn status_for(err: &Error, is_clear_password: bool) -> StatusCode {
    match err {
        Error::BadRequest(_) => StatusCode::BAD_REQUEST,
        Error::UuidMismatch { .. } => StatusCode::FORBIDDEN,
        Error::AuthFailed if is_clear_password => StatusCode::INTERNAL_SERVER_ERROR,
        Error::AuthFailed => StatusCode::FORBIDDEN,
        Error::CardEmpty => StatusCode::EXPECTATION_FAILED,
        Error::CardNotReady
        | Error::UnsupportedCard(_)
        | Error::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(err: Error, is_clear_password: bool) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = status_for(&err, is_clear_password);
    warn!("request failed: {}", err);
    warp::reply::with_status(warp::reply::json(&ErrorBody::new(err.to_string())), status)
}

#[derive(Serialize)]
struct HealthResponse {
    ready: bool,
}

#[derive(Serialize)]
struct UuidResponse {
    success: bool,
    uuid: String,
}

#[derive(Deserialize)]
struct ReadRequest {
    uuid: String,
    password: u32,
}

#[derive(Serialize)]
struct CardJson {
    attendee_id: u32,
    convention_id: u32,
    issuance_count: u32,
    issuance_timestamp: u64,
    expiration: u64,
    signature: String,
}

impl From<CardPayload> for CardJson {
    fn from(p: CardPayload) -> CardJson {
        CardJson {
            attendee_id: p.attendee_id,
            convention_id: p.convention_id,
            issuance_count: p.issuance_count,
            issuance_timestamp: p.issuance_timestamp,
            expiration: p.expiration.unwrap_or(0),
            signature: base64::encode(&p.signature),
        }
    }
}

#[derive(Serialize)]
struct ReadResponse {
    success: bool,
    card: CardJson,
}

#[derive(Deserialize)]
struct WriteRequest {
    uuid: String,
    password: u32,
    attendee_id: u32,
    convention_id: u32,
    issuance: u32,
    timestamp: u64,
    signature: String,
    #[serde(default)]
    expiration: Option<u64>,
}

#[derive(Deserialize)]
struct UpdateRequest {
    uuid: String,
    password: u32,
    signature: String,
    attendee_id: Option<u32>,
    convention_id: Option<u32>,
    issuance: Option<u32>,
    timestamp: Option<u64>,
    expiration: Option<u64>,
}

#[derive(Deserialize)]
struct SetPasswordRequest {
    uuid: String,
    password: u32,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

const OK: SuccessResponse = SuccessResponse { success: true };

fn with_facade<D: CardDriver + 'static>(
    facade: Arc<Facade<D>>,
) -> impl Filter<Extract = (Arc<Facade<D>>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&facade))
}

fn decode_signature(b64: &str) -> Result<Vec<u8>, Error> {
    base64::decode(b64).map_err(|_| Error::BadRequest("signature is not valid base64".into()))
}

async fn healthcheck<D: CardDriver>(facade: Arc<Facade<D>>) -> Result<impl Reply, Infallible> {
    let ready = facade.is_ready();
    let status = if ready { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    Ok(warp::reply::with_status(warp::reply::json(&HealthResponse { ready }), status))
}

async fn get_uuid<D: CardDriver>(facade: Arc<Facade<D>>) -> Result<impl Reply, Infallible> {
    match facade.uuid() {
        Ok(uuid) => Ok(warp::reply::with_status(
            warp::reply::json(&UuidResponse { success: true, uuid }),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(e, false)),
    }
}

async fn read<D: CardDriver>(req: ReadRequest, facade: Arc<Facade<D>>) -> Result<impl Reply, Infallible> {
    match facade.read(&req.uuid, req.password) {
        Ok(payload) => Ok(warp::reply::with_status(
            warp::reply::json(&ReadResponse {
                success: true,
                card: payload.into(),
            }),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(e, false)),
    }
}

async fn write<D: CardDriver>(req: WriteRequest, facade: Arc<Facade<D>>) -> Result<impl Reply, Infallible> {
    let signature = match decode_signature(&req.signature) {
        Ok(s) => s,
        Err(e) => return Ok(error_reply(e, false)),
    };
    let payload = CardPayload {
        attendee_id: req.attendee_id,
        convention_id: req.convention_id,
        issuance_count: req.issuance,
        issuance_timestamp: req.timestamp,
        expiration: req.expiration.filter(|&e| e != 0),
        signature,
    };
    match facade.write(&req.uuid, req.password, payload) {
        Ok(()) => Ok(warp::reply::with_status(warp::reply::json(&OK), StatusCode::OK)),
        Err(e) => Ok(error_reply(e, false)),
    }
}

async fn update<D: CardDriver>(req: UpdateRequest, facade: Arc<Facade<D>>) -> Result<impl Reply, Infallible> {
    let signature = match decode_signature(&req.signature) {
        Ok(s) => s,
        Err(e) => return Ok(error_reply(e, false)),
    };
    let partial = PartialCardPayload {
        attendee_id: req.attendee_id,
        convention_id: req.convention_id,
        issuance_count: req.issuance,
        issuance_timestamp: req.timestamp,
        expiration: req.expiration,
        signature: Some(signature),
    };
    match facade.update(&req.uuid, req.password, partial) {
        Ok(()) => Ok(warp::reply::with_status(warp::reply::json(&OK), StatusCode::OK)),
        Err(e) => Ok(error_reply(e, false)),
    }
}

async fn set_password<D: CardDriver>(
    req: SetPasswordRequest,
    facade: Arc<Facade<D>>,
) -> Result<impl Reply, Infallible> {
    match facade.set_password(&req.uuid, req.password) {
        Ok(()) => Ok(warp::reply::with_status(warp::reply::json(&OK), StatusCode::OK)),
        Err(e) => Ok(error_reply(e, false)),
    }
}

async fn clear_password<D: CardDriver>(
    req: SetPasswordRequest,
    facade: Arc<Facade<D>>,
) -> Result<impl Reply, Infallible> {
    match facade.clear_password(&req.uuid, req.password) {
        Ok(()) => Ok(warp::reply::with_status(warp::reply::json(&OK), StatusCode::OK)),
        Err(e) => Ok(error_reply(e, true)),
    }
}

#[derive(Serialize)]
struct EventBody {
    #[serde(rename = "Event")]
    event: String,
}

fn describe(event: &PresenceEvent) -> String {
    match event {
        PresenceEvent::ReaderAttached(name) => format!("Reader attached: {}", name),
        PresenceEvent::ReaderRemoved(name) => format!("Reader removed: {}", name),
        PresenceEvent::CardPresent { .. } => "Card present".to_string(),
        PresenceEvent::CardAbsent { .. } => "Card absent".to_string(),
        PresenceEvent::ReaderError(msg) => format!("Reader error: {}", msg),
    }
}

fn events_route(
    events: tokio::sync::broadcast::Sender<PresenceEvent>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    warp::path("events").and(warp::get()).map(move || {
        let rx = events.subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|item| async move {
            let event = item.ok()?;
            let body = EventBody { event: describe(&event) };
            let json = serde_json::to_string(&body).ok()?;
            Some(Ok::<_, Infallible>(warp::sse::Event::default().data(json)))
        });
        warp::sse::reply(warp::sse::keep_alive().stream(stream))
    })
}

/// Builds the full route tree. Generic over the driver so the binary can
/// wire up `Facade<PcscDriver>` and a test can wire up `Facade<MockDriver>`
/// with identical routing code.
pub fn routes<D: CardDriver + 'static>(
    facade: Arc<Facade<D>>,
    events: tokio::sync::broadcast::Sender<PresenceEvent>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let healthcheck_route = warp::path("healthcheck")
        .and(warp::get())
        .and(with_facade(Arc::clone(&facade)))
        .and_then(healthcheck::<D>);

    let uuid_route = warp::path("uuid")
        .and(warp::get())
        .and(with_facade(Arc::clone(&facade)))
        .and_then(get_uuid::<D>);

    let read_route = warp::path("read")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_facade(Arc::clone(&facade)))
        .and_then(read::<D>);

    let write_route = warp::path("write")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_facade(Arc::clone(&facade)))
        .and_then(write::<D>);

    let update_route = warp::path("write")
        .and(warp::patch())
        .and(warp::body::json())
        .and(with_facade(Arc::clone(&facade)))
        .and_then(update::<D>);

    let set_password_route = warp::path("setpassword")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_facade(Arc::clone(&facade)))
        .and_then(set_password::<D>);

    let clear_password_route = warp::path("clearpassword")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_facade(facade))
        .and_then(clear_password::<D>);

    healthcheck_route
        .or(uuid_route)
        .or(read_route)
        .or(write_route)
        .or(update_route)
        .or(set_password_route)
        .or(clear_password_route)
        .or(events_route(events))
}

#[cfg(all(test, feature = "test-support"))]
mod tests {
    use super::*;
    use crate::mock::{MockDriver, MockState};

    fn test_facade() -> Arc<Facade<MockDriver>> {
        let state = MockState::new("04412a014b3403");
        Arc::new(Facade::new(MockDriver::new(state)))
    }

    #[tokio::test]
    async fn healthcheck_reports_ready() {
        let facade = test_facade();
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let filter = routes(facade, tx);

        let resp = warp::test::request().path("/healthcheck").reply(&filter).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), br#"{"ready":true}"#);
    }

    #[tokio::test]
    async fn read_on_empty_card_is_417() {
        let facade = test_facade();
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let filter = routes(facade, tx);

        let resp = warp::test::request()
            .method("PUT")
            .path("/read")
            .json(&serde_json::json!({"uuid": "04412a014b3403", "password": 0}))
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), StatusCode::EXPECTATION_FAILED);
        let body = String::from_utf8(resp.body().to_vec()).unwrap();
        assert!(body.contains("Card is empty!"));
    }

    #[tokio::test]
    async fn clear_password_with_wrong_password_is_500_invalid_password() {
        let facade = test_facade();
        facade.set_password("04412a014b3403", 124).unwrap();
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let filter = routes(facade, tx);

        let resp = warp::test::request()
            .method("PUT")
            .path("/clearpassword")
            .json(&serde_json::json!({"uuid": "04412a014b3403", "password": 1_111_111}))
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(resp.body().to_vec()).unwrap();
        assert!(body.contains("invalid password"));
    }

    #[tokio::test]
    async fn read_with_wrong_uuid_is_403() {
        let facade = test_facade();
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let filter = routes(facade, tx);

        let resp = warp::test::request()
            .method("PUT")
            .path("/read")
            .json(&serde_json::json!({"uuid": "not-it", "password": 0}))
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn write_then_read_round_trips_over_http() {
        let facade = test_facade();
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        let filter = routes(facade, tx);

        let write_body = serde_json::json!({
            "uuid": "04412a014b3403",
            "password": 123,
            "attendee_id": 123,
            "convention_id": 32,
            "issuance": 1,
            "timestamp": 1_700_000_000u64,
            "expiration": 1_700_086_400u64,
            "signature": base64::encode([0xABu8; 64]),
        });
        let write_resp = warp::test::request()
            .method("POST")
            .path("/write")
            .json(&write_body)
            .reply(&filter)
            .await;
        assert_eq!(write_resp.status(), StatusCode::OK);

        let read_resp = warp::test::request()
            .method("PUT")
            .path("/read")
            .json(&serde_json::json!({"uuid": "04412a014b3403", "password": 123}))
            .reply(&filter)
            .await;
        assert_eq!(read_resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(read_resp.body()).unwrap();
        assert_eq!(body["card"]["attendee_id"], 123);
        assert_eq!(body["success"], true);
    }
}
