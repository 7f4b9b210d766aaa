//! HTTP signaling surface.
//!
//! Two write endpoints decide the media path for a session. `/webrtc/route`
//! takes the ICE credentials and server candidates directly; `/webrtc/request`
//! (and its `/board` alias) carries a full SDP offer inside an opaque
//! conference JSON, which the proxy forwards to the media server at
//! `dst_url` and whose answer it rewrites on the way back. In both cases the
//! geo oracle picks direct or relay; choosing relay installs a
//! [`PendingSession`] the data plane will collect on the first connectivity
//! check.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::{header, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use icegate_ice_proto::sdp::{extract_candidates, update_candidates, SessionDescription};
use icegate_ice_proto::Candidate;

use crate::cache::Cache;
use crate::error::Result;
use crate::geo::RouteOracle;
use crate::session::{IceCredentials, PendingSession, RouteMode};

/// Version tag served by `/webrtc/version`.
pub const AGENT_VERSION: &str = concat!("icegate-v", env!("CARGO_PKG_VERSION"));

const ALLOW_HEADERS: &str =
    "Content-Type, Content-Range, Content-Disposition, Content-Description";

/// JSON pointer to the offer SDP inside a `/webrtc/request` body.
const OFFER_POINTER: &str = "/action/user_roster/0/audio_status/channels/0/webrtc_offer";

/// JSON pointer to the answer SDP inside the media server's response.
const ANSWER_POINTER: &str = "/action/user_roster/0/audio_status/channels/0/webrtc_answer";

/// JSON pointer to the channel object holding the answer SDP.
const CHANNEL_POINTER: &str = "/action/user_roster/0/audio_status/channels/0";

/// Remote address of the HTTP client, injected per connection.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Shared state behind the signaling router.
pub struct SignalState {
    pub cache: Arc<Cache<PendingSession>>,
    pub oracle: Arc<dyn RouteOracle>,
    /// Candidate lines this proxy advertises when it relays.
    pub proxy_candidates: Vec<String>,
    pub http_client: reqwest::Client,
    /// When set, each request is stamped with a fresh UUID in this header.
    pub request_id_header: Option<HeaderName>,
}

pub type SharedState = Arc<SignalState>;

/// `/webrtc/route` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub offer_ice: IceCredentials,
    pub answer_ice: IceCredentials,
    /// The media server's candidate lines.
    pub candidates: Vec<String>,
}

/// `/webrtc/route` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub candidates: Vec<String>,
}

/// Signaling failures, shaped as `{"status": <message>}` with the matching
/// HTTP status.
#[derive(Debug)]
pub enum SignalError {
    BadJson(String),
    BadSdp(&'static str),
    NoCandidates,
    UpstreamError(String),
}

impl IntoResponse for SignalError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            SignalError::BadJson(msg) => (StatusCode::BAD_REQUEST, msg),
            SignalError::BadSdp(msg) => (StatusCode::BAD_REQUEST, msg.to_string()),
            SignalError::NoCandidates => (StatusCode::BAD_REQUEST, "no candidates".to_string()),
            SignalError::UpstreamError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "status": message }))).into_response()
    }
}

/// Build the signaling router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/webrtc/version", get(version))
        .route("/webrtc/status", get(status))
        .route("/webrtc/route", post(webrtc_route))
        .route("/webrtc/request", post(webrtc_request))
        .route("/board", post(webrtc_request))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            stamp_request_id,
        ))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Serve the router on a dedicated plain-HTTP listener.
pub async fn run_http_listener(
    addr: SocketAddr,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "http signaling listener bound");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let service = router.clone().layer(Extension(ClientAddr(peer)));
                tokio::spawn(async move {
                    if let Err(e) = hyper::server::conn::Http::new()
                        .serve_connection(stream, service)
                        .await
                    {
                        debug!(%peer, error = %e, "http connection ended");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!(%local_addr, "http listener shutting down");
                return Ok(());
            }
        }
    }
}

/// CORS headers on everything, and a canned answer for preflights.
async fn cors(req: Request<Body>, next: Next<Body>) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        Json(json!({"status": "OK"})).into_response()
    } else {
        next.run(req).await
    };
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    response
}

/// Stamp a generated request id when the deployment asks for one.
async fn stamp_request_id(
    State(state): State<SharedState>,
    mut req: Request<Body>,
    next: Next<Body>,
) -> Response {
    if let Some(name) = &state.request_id_header {
        let id = uuid::Uuid::new_v4().to_string();
        if let Ok(value) = HeaderValue::from_str(&id) {
            req.headers_mut().insert(name.clone(), value);
        }
    }
    next.run(req).await
}

async fn version() -> Json<Value> {
    Json(json!({ "version": AGENT_VERSION }))
}

async fn status() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

/// `/webrtc/route`: decide direct vs relay for explicitly supplied ICE.
async fn webrtc_route(
    State(state): State<SharedState>,
    client: Option<Extension<ClientAddr>>,
    body: bytes::Bytes,
) -> std::result::Result<Json<RouteResponse>, SignalError> {
    let request: RouteRequest =
        serde_json::from_slice(&body).map_err(|e| SignalError::BadJson(e.to_string()))?;
    let client_ip = client_ip(client);
    debug!(%client_ip, offer = %request.offer_ice.ufrag, answer = %request.answer_ice.ufrag, "route request");

    let candidates = choose_candidates(
        &state,
        client_ip,
        &request.offer_ice,
        &request.answer_ice,
        &request.candidates,
    )
    .await?;

    Ok(Json(RouteResponse {
        session_key: request.session_key,
        candidates,
    }))
}

/// `/webrtc/request` and `/board`: reverse-proxy an opaque conference JSON
/// to the media server and rewrite the answered candidate set.
async fn webrtc_request(
    State(state): State<SharedState>,
    client: Option<Extension<ClientAddr>>,
    body: bytes::Bytes,
) -> std::result::Result<Json<Value>, SignalError> {
    let request: Value =
        serde_json::from_slice(&body).map_err(|e| SignalError::BadJson(e.to_string()))?;

    let offer_sdp = request
        .pointer(OFFER_POINTER)
        .and_then(Value::as_str)
        .ok_or(SignalError::BadSdp("no webrtc_offer in request"))?;
    let offer = SessionDescription::parse(offer_sdp)
        .map_err(|_| SignalError::BadSdp("invalid offer"))?;

    let dst_url = request
        .get("dst_url")
        .and_then(Value::as_str)
        .ok_or_else(|| SignalError::BadJson("no dst_url".into()))?;
    let dst_url = reqwest::Url::parse(dst_url)
        .map_err(|e| SignalError::BadJson(format!("bad dst_url: {e}")))?;

    // Forward the body as-is; the media server answers with the same shape.
    let upstream = state
        .http_client
        .post(dst_url)
        .json(&request)
        .send()
        .await
        .map_err(|e| SignalError::UpstreamError(e.to_string()))?;
    let mut response: Value = upstream
        .json()
        .await
        .map_err(|e| SignalError::UpstreamError(e.to_string()))?;

    let answer_sdp = response
        .pointer(ANSWER_POINTER)
        .and_then(Value::as_str)
        .ok_or(SignalError::BadSdp("no webrtc_answer in response"))?
        .to_string();
    let answer = SessionDescription::parse(&answer_sdp)
        .map_err(|_| SignalError::BadSdp("invalid answer"))?;

    let offer_ice = credentials_of(&offer).ok_or(SignalError::BadSdp("offer without ice"))?;
    let answer_ice = credentials_of(&answer).ok_or(SignalError::BadSdp("answer without ice"))?;

    // The server's reachable endpoints ride in the offer's candidate lines.
    let server_candidates = extract_candidates(offer_sdp);
    let client_ip = client_ip(client);
    let chosen = choose_candidates(
        &state,
        client_ip,
        &offer_ice,
        &answer_ice,
        &server_candidates,
    )
    .await?;

    let rewritten = update_candidates(&answer_sdp, &chosen);
    let channel = response
        .pointer_mut(CHANNEL_POINTER)
        .and_then(Value::as_object_mut)
        .ok_or(SignalError::BadSdp("no answer channel in response"))?;
    channel.insert("webrtc_answer".to_string(), Value::String(rewritten));

    Ok(Json(response))
}

fn client_ip(client: Option<Extension<ClientAddr>>) -> IpAddr {
    client
        .map(|Extension(ClientAddr(addr))| addr.ip())
        .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]))
}

fn credentials_of(sdp: &SessionDescription) -> Option<IceCredentials> {
    Some(IceCredentials {
        ufrag: sdp.ice_ufrag()?.to_string(),
        pwd: sdp.ice_pwd()?.to_string(),
        options: sdp.ice_options().map(str::to_string),
    })
}

/// The routing decision. Relay installs the pending session; direct leaves
/// no trace.
async fn choose_candidates(
    state: &SignalState,
    client_ip: IpAddr,
    offer_ice: &IceCredentials,
    answer_ice: &IceCredentials,
    server_candidates: &[String],
) -> std::result::Result<Vec<String>, SignalError> {
    if server_candidates.is_empty() {
        return Err(SignalError::NoCandidates);
    }
    if state.proxy_candidates.is_empty() {
        return Ok(server_candidates.to_vec());
    }

    let proxy_ip = candidate_ip(&state.proxy_candidates[0]).await;
    let server_ip = candidate_ip(&server_candidates[0]).await;
    let (Some(proxy_ip), Some(server_ip)) = (proxy_ip, server_ip) else {
        warn!("could not resolve proxy or server candidate host, using direct");
        return Ok(server_candidates.to_vec());
    };

    if !state.oracle.route_via_proxy(client_ip, proxy_ip, server_ip) {
        return Ok(server_candidates.to_vec());
    }

    let pending = PendingSession {
        offer_ice: offer_ice.clone(),
        answer_ice: answer_ice.clone(),
        candidates: server_candidates.to_vec(),
        mode: RouteMode::Relay,
    };
    let key = pending.key();
    info!(%key, %client_ip, "relaying session through this proxy");
    state.cache.set(key, pending).await;

    Ok(state.proxy_candidates.clone())
}

/// The IP a candidate line points at, resolving hostnames when needed.
async fn candidate_ip(line: &str) -> Option<IpAddr> {
    let candidate = Candidate::parse(line).ok()?;
    if let Ok(ip) = candidate.host.parse::<IpAddr>() {
        return Some(ip);
    }
    let addr = tokio::net::lookup_host((candidate.host.as_str(), candidate.port))
        .await
        .ok()?
        .next()
        .map(|addr| addr.ip());
    addr
}

/// State builder used by the binary and the tests.
pub fn signal_state(
    cache: Arc<Cache<PendingSession>>,
    oracle: Arc<dyn RouteOracle>,
    proxy_candidates: Vec<String>,
    request_id_header: Option<&str>,
) -> SharedState {
    Arc::new(SignalState {
        cache,
        oracle,
        proxy_candidates,
        http_client: reqwest::Client::new(),
        request_id_header: request_id_header
            .and_then(|name| HeaderName::from_bytes(name.as_bytes()).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::RouteOracle;
    use tower::ServiceExt;

    struct StaticOracle(bool);

    impl RouteOracle for StaticOracle {
        fn route_via_proxy(&self, _: IpAddr, _: IpAddr, _: IpAddr) -> bool {
            self.0
        }
    }

    const SERVER_CANDIDATE: &str = "a=candidate:1 1 udp 2113937151 203.0.113.10 5000 typ host";
    const PROXY_CANDIDATE: &str = "a=candidate:9 1 udp 2113937151 198.51.100.7 9001 typ host";

    fn state_with_oracle(relay: bool) -> (SharedState, Arc<Cache<PendingSession>>) {
        let cache = Arc::new(Cache::new());
        let state = signal_state(
            cache.clone(),
            Arc::new(StaticOracle(relay)),
            vec![PROXY_CANDIDATE.to_string()],
            None,
        );
        (state, cache)
    }

    fn route_body() -> Value {
        json!({
            "session_key": "sess-1",
            "offer_ice": {"ufrag": "c1", "pwd": "opwd"},
            "answer_ice": {"ufrag": "s1", "pwd": "apwd"},
            "candidates": [SERVER_CANDIDATE],
        })
    }

    async fn post_json(router: Router, path: &str, body: Value) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(path)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn version_and_status_endpoints() {
        let (state, _cache) = state_with_oracle(false);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/webrtc/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["version"], AGENT_VERSION);

        let response = app
            .oneshot(Request::get("/webrtc/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "OK");
    }

    #[tokio::test]
    async fn options_preflight_is_answered() {
        let (state, _cache) = state_with_oracle(false);
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/webrtc/route")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
            ALLOW_HEADERS
        );
    }

    #[tokio::test]
    async fn non_post_on_write_endpoint_is_405() {
        let (state, _cache) = state_with_oracle(false);
        let response = router(state)
            .oneshot(Request::get("/webrtc/route").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn direct_outcome_echoes_server_candidates_and_installs_nothing() {
        let (state, cache) = state_with_oracle(false);
        let (status, body) = post_json(router(state), "/webrtc/route", route_body()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_key"], "sess-1");
        assert_eq!(body["candidates"], json!([SERVER_CANDIDATE]));
        assert!(cache.get("s1:c1").await.is_none());
    }

    #[tokio::test]
    async fn relay_outcome_returns_proxy_candidates_and_installs_session() {
        let (state, cache) = state_with_oracle(true);
        let (status, body) = post_json(router(state), "/webrtc/route", route_body()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["candidates"], json!([PROXY_CANDIDATE]));

        let pending = cache.get("s1:c1").await.expect("pending session installed");
        assert_eq!(pending.offer_ice.ufrag, "c1");
        assert_eq!(pending.offer_ice.pwd, "opwd");
        assert_eq!(pending.answer_ice.ufrag, "s1");
        assert_eq!(pending.answer_ice.pwd, "apwd");
        assert_eq!(pending.candidates, vec![SERVER_CANDIDATE.to_string()]);
        assert_eq!(pending.mode, RouteMode::Relay);
    }

    #[tokio::test]
    async fn bad_json_is_a_400_with_status_body() {
        let (state, _cache) = state_with_oracle(false);
        let (status, body) = post_json(
            router(state),
            "/webrtc/route",
            Value::String("not an object".into()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["status"].is_string());
    }

    #[tokio::test]
    async fn empty_candidates_are_rejected() {
        let (state, _cache) = state_with_oracle(false);
        let mut body = route_body();
        body["candidates"] = json!([]);
        let (status, body) = post_json(router(state), "/webrtc/route", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "no candidates");
    }

    fn offer_sdp() -> String {
        format!(
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\n\
             a=ice-ufrag:c1\r\na=ice-pwd:opwd\r\n{SERVER_CANDIDATE}\r\n"
        )
    }

    fn answer_sdp() -> String {
        format!(
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\n\
             a=ice-ufrag:s1\r\na=ice-pwd:apwd\r\n{SERVER_CANDIDATE}\r\n"
        )
    }

    fn request_body(dst_url: &str) -> Value {
        json!({
            "type": "offer_sdp",
            "action": {
                "session_key": "conf-1",
                "user_roster": [
                    {"audio_status": {"channels": [{"webrtc_offer": offer_sdp()}]}}
                ]
            },
            "dst_url": dst_url,
        })
    }

    /// A stand-in media server answering `/webrtc/request` forwards.
    async fn spawn_media_server() -> SocketAddr {
        let answer = json!({
            "action": {
                "user_roster": [
                    {"audio_status": {"channels": [{"webrtc_answer": answer_sdp()}]}}
                ]
            },
            "code": "200"
        });
        let app = Router::new().route(
            "/offer",
            post(move || {
                let answer = answer.clone();
                async move { Json(answer) }
            }),
        );
        let server =
            axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn request_flow_rewrites_the_answer_in_relay_mode() {
        let media = spawn_media_server().await;
        let (state, cache) = state_with_oracle(true);

        let (status, body) = post_json(
            router(state),
            "/webrtc/request",
            request_body(&format!("http://{media}/offer")),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let rewritten = body
            .pointer("/action/user_roster/0/audio_status/channels/0/webrtc_answer")
            .and_then(Value::as_str)
            .unwrap();
        // The answer now advertises the proxy, not the server.
        assert!(rewritten.contains(PROXY_CANDIDATE));
        assert!(!rewritten.contains(SERVER_CANDIDATE));
        assert!(rewritten.contains("a=end-of-candidates"));
        // Credentials were lifted from both SDPs.
        assert!(cache.get("s1:c1").await.is_some());
    }

    #[tokio::test]
    async fn board_alias_hits_the_same_handler() {
        let media = spawn_media_server().await;
        let (state, _cache) = state_with_oracle(false);

        let (status, body) = post_json(
            router(state),
            "/board",
            request_body(&format!("http://{media}/offer")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let answer = body
            .pointer("/action/user_roster/0/audio_status/channels/0/webrtc_answer")
            .and_then(Value::as_str)
            .unwrap();
        // Direct outcome: the server candidate set stays.
        assert!(answer.contains(SERVER_CANDIDATE));
    }

    #[tokio::test]
    async fn unreachable_dst_url_is_a_500() {
        let (state, _cache) = state_with_oracle(false);
        let (status, body) = post_json(
            router(state),
            "/webrtc/request",
            request_body("http://127.0.0.1:1/offer"),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["status"].is_string());
    }

    #[tokio::test]
    async fn missing_offer_is_a_400() {
        let (state, _cache) = state_with_oracle(false);
        let (status, _body) = post_json(
            router(state),
            "/webrtc/request",
            json!({"dst_url": "http://example.invalid/"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
