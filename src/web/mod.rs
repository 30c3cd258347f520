//! The HTTP surface of the actor protocol.
//!
//! Every call lands on a single route, `POST /uds/rest/actor/v3/{action}`,
//! with the exception of the notify action which arrives as a `GET` with its
//! parameters in the query string.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use axum::{
    Json, Router,
    body::{Bytes, to_bytes},
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    core::{ActorAction, ActorError, crypto::MsSinceEpoch},
    executor::{ActorReply, ActorService, RequestContext},
};

pub const ACTOR_PATH: &str = "/uds/rest/actor/v3/{action}";

pub const AUTH_HEADER: &str = "x-auth-token";
pub const VERSION_HEADER: &str = "uds-version";
pub const STAMP_HEADER: &str = "response-stamp";

const MAX_BODY: usize = 1 << 20;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn ActorService>,
    trusted_proxies: Arc<[IpAddr]>,
    stamp: Arc<AtomicI64>,
}

impl AppState {
    pub fn new(service: Arc<dyn ActorService>, trusted_proxies: Vec<IpAddr>) -> Self {
        Self { service, trusted_proxies: trusted_proxies.into(), stamp: Arc::default() }
    }

    /// The address the call is accounted against in the brute force guard.
    ///
    /// That is the peer address, unless the peer is a trusted proxy that
    /// names the client in `X-Forwarded-For`.
    fn source_of(&self, request: &Request) -> String {
        let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| addr.ip());
        let forwarded = peer
            .filter(|ip| self.trusted_proxies.contains(ip))
            .and_then(|_| request.headers().get("x-forwarded-for"))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        match (forwarded, peer) {
            (Some(forwarded), _) => forwarded,
            (None, Some(peer)) => peer.to_string(),
            (None, None) => "unknown".into(),
        }
    }

    /// Strictly increasing, and never behind the wall clock.
    fn next_stamp(&self, now: MsSinceEpoch) -> i64 {
        let mut current = self.stamp.load(Ordering::Relaxed);
        loop {
            let next = now.0.max(current + 1);
            match self.stamp.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    fn finish(&self, now: MsSinceEpoch, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        let headers = response.headers_mut();
        if let Ok(version) = HeaderValue::from_str(self.service.version()) {
            headers.insert(VERSION_HEADER, version);
        }
        headers.insert(STAMP_HEADER, HeaderValue::from(self.next_stamp(now)));
        response
    }
}

pub fn router(service: Arc<dyn ActorService>, trusted_proxies: Vec<IpAddr>) -> Router {
    Router::new()
        .route(ACTOR_PATH, get(actor_get).post(actor_post))
        .with_state(AppState::new(service, trusted_proxies))
}

fn parse_body(body: &Bytes) -> Result<Value, ActorError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(body).map_err(|e| ActorError::RequestError(e.to_string()))
}

fn reply_body(state: &AppState, now: MsSinceEpoch, reply: ActorReply) -> Json<Value> {
    let mut body = json!({
        "result": reply.result,
        "stamp": now.seconds(),
        "version": state.service.version(),
    });
    if let Some(error) = reply.error {
        body["error"] = Value::String(error);
    }
    Json(body)
}

/// Turns a failed call into its plain text status, holding blocked sources
/// for the configured delay first.
async fn failure(state: &AppState, error: ActorError) -> (StatusCode, String) {
    match error {
        ActorError::Blocked => {
            tokio::time::sleep(state.service.block_delay()).await;
            (StatusCode::FORBIDDEN, "Access denied".into())
        }
        ActorError::RequestError(_) | ActorError::MissingField(_) => {
            (StatusCode::BAD_REQUEST, "Invalid parameters".into())
        }
        ActorError::UnknownAction(action) | ActorError::NotFound(action) => {
            (StatusCode::NOT_FOUND, format!("Method not found: {action}"))
        }
        _ => (StatusCode::FORBIDDEN, "Access denied".into()),
    }
}

async fn respond(state: &AppState, now: MsSinceEpoch, outcome: Result<ActorReply, ActorError>) -> Response {
    match outcome {
        Ok(reply) => {
            let body = reply_body(state, now, reply);
            state.finish(now, body)
        }
        Err(e) => {
            debug!(error = %e, "actor call answered with a failure");
            let failure = failure(state, e).await;
            state.finish(now, failure)
        }
    }
}

fn staff_caller(state: &AppState, headers: &HeaderMap) -> Option<crate::core::model::StaffUser> {
    let bearer = headers.get(AUTH_HEADER)?.to_str().ok()?;
    let caller = state.service.authenticate(bearer);
    if caller.is_none() {
        warn!("unknown {AUTH_HEADER} presented");
    }
    caller
}

async fn actor_post(State(state): State<AppState>, Path(action): Path<String>, request: Request) -> Response {
    let now = MsSinceEpoch::now();
    let Ok(action) = ActorAction::try_from(action.as_str()) else {
        return respond(&state, now, Err(ActorError::UnknownAction(action))).await;
    };

    let mut ctx = RequestContext::new(now, state.source_of(&request));
    if action == ActorAction::Register {
        ctx = ctx.with_caller(staff_caller(&state, request.headers()));
    }

    let body = match to_bytes(request.into_body(), MAX_BODY).await {
        Ok(body) => body,
        Err(e) => return respond(&state, now, Err(ActorError::RequestError(e.to_string()))).await,
    };
    let outcome = match parse_body(&body) {
        Ok(params) => state.service.handle(&ctx, action, params),
        Err(e) => Err(e),
    };
    respond(&state, now, outcome).await
}

async fn actor_get(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let now = MsSinceEpoch::now();
    if !action.eq_ignore_ascii_case(ActorAction::Notify.to_static_str()) {
        return respond(&state, now, Err(ActorError::UnknownAction(action))).await;
    }
    let ctx = RequestContext::new(now, state.source_of(&request));
    let params: Map<String, Value> = query.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    let outcome = state.service.notify(&ctx, Value::Object(params));
    respond(&state, now, outcome).await
}


#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, SocketAddr},
        sync::Arc,
    };

    use axum::{
        Router,
        body::Body,
        extract::ConnectInfo,
        http::{Request, StatusCode},
        response::Response,
    };
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::testutil::{self, MAC, MASTER_TOKEN, STAFF_TOKEN};

    use super::{AUTH_HEADER, STAMP_HEADER, VERSION_HEADER, router};

    const SOURCE: &str = "10.9.9.9";
    const PROXY: &str = "10.0.0.1";

    fn app() -> Router {
        let fixture = testutil::fixture(crate::core::crypto::MsSinceEpoch::now());
        router(Arc::new(fixture.executor), vec![PROXY.parse().unwrap()])
    }

    fn from_peer(mut request: Request<Body>, peer: &str) -> Request<Body> {
        let ip: IpAddr = peer.parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(SocketAddr::new(ip, 40000)));
        request
    }

    fn post(action: &str, body: Value) -> Request<Body> {
        let request = Request::post(format!("/uds/rest/actor/v3/{action}"))
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        from_peer(request, SOURCE)
    }

    fn get(uri: &str) -> Request<Body> {
        from_peer(Request::get(uri).body(Body::empty()).unwrap(), SOURCE)
    }

    async fn json_of(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn stamp_of(response: &Response) -> i64 {
        response.headers()[STAMP_HEADER].to_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_needs_staff_header() {
        let app = app();
        let params = json!({
            "mac": MAC, "ip": "10.0.0.2", "hostname": "desk", "pre_command": "",
            "post_command": "", "run_once_command": "", "log_level": 2
        });

        let denied = app.clone().oneshot(post("register", params.clone())).await.unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        let first_stamp = stamp_of(&denied);

        let mut request = post("register", params);
        request.headers_mut().insert(AUTH_HEADER, STAFF_TOKEN.parse().unwrap());
        let accepted = app.oneshot(request).await.unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
        assert!(accepted.headers().contains_key(VERSION_HEADER));
        assert!(stamp_of(&accepted) > first_stamp);

        let body = json_of(accepted).await;
        assert_eq!(body["result"].as_str().unwrap().len(), 40);
        assert!(body.get("error").is_none());
        assert!(body["stamp"].is_i64());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let app = app();
        let unknown = app.clone().oneshot(post("reboot", json!({}))).await.unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let garbage = from_peer(Request::post("/uds/rest/actor/v3/login").body(Body::from("{not json")).unwrap(), SOURCE);
        assert_eq!(app.clone().oneshot(garbage).await.unwrap().status(), StatusCode::BAD_REQUEST);

        let notify = get("/uds/rest/actor/v3/notify?action=reboot&token=x");
        assert_eq!(app.clone().oneshot(notify).await.unwrap().status(), StatusCode::BAD_REQUEST);

        let data = get(&format!("/uds/rest/actor/v3/notify?action=data&token={MASTER_TOKEN}&data=hello"));
        let data = app.oneshot(data).await.unwrap();
        assert_eq!(data.status(), StatusCode::OK);
        assert_eq!(json_of(data).await["result"], "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_source_is_held_back() {
        let app = app();
        for _ in 0..5 {
            let response = app.clone().oneshot(post("test", json!({ "token": "bad" }))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(json_of(response).await["error"], "invalid token");
        }

        let started = tokio::time::Instant::now();
        let blocked = app.oneshot(post("test", json!({ "token": "bad" }))).await.unwrap();
        assert_eq!(blocked.status(), StatusCode::FORBIDDEN);
        assert!(started.elapsed() >= std::time::Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarded_header_ignored_from_untrusted_peer() {
        let app = app();
        for i in 0..5 {
            let mut request = post("test", json!({ "token": "bad" }));
            request.headers_mut().insert("x-forwarded-for", format!("192.0.2.{i}").parse().unwrap());
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let mut request = post("test", json!({ "token": "bad" }));
        request.headers_mut().insert("x-forwarded-for", "192.0.2.99".parse().unwrap());
        assert_eq!(app.oneshot(request).await.unwrap().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trusted_proxy_names_the_source() {
        let app = app();
        let through_proxy = |client: &str| {
            let mut request = from_peer(post("test", json!({ "token": "bad" })), PROXY);
            request.headers_mut().insert("x-forwarded-for", format!("{client}, {PROXY}").parse().unwrap());
            request
        };

        // Each client is accounted on its own, the proxy itself never blocks.
        for i in 0..6 {
            let response = app.clone().oneshot(through_proxy(&format!("192.0.2.{i}"))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        for _ in 0..5 {
            app.clone().oneshot(through_proxy("198.51.100.7")).await.unwrap();
        }
        let blocked = app.clone().oneshot(through_proxy("198.51.100.7")).await.unwrap();
        assert_eq!(blocked.status(), StatusCode::FORBIDDEN);
        let other = app.oneshot(through_proxy("198.51.100.8")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }
}
