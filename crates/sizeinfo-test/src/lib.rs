//! Helpers for testing the size info service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`SizeInfoServer`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, it stops serving and all
//!    connections to it will fail. To avoid this, assign it to a variable:
//!    `let server = SizeInfoServer::new();`.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{self, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use reqwest::Url;
use serde::Deserialize;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// The path under which [`SizeInfoServer`] serves size metadata.
pub const MODEL_PATH: &str = "/v0/model";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `sizeinfo_service` crate and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("sizeinfo_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// How [`SizeInfoServer`] answers for one garment.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Responds with `200 OK` and the given JSON document.
    Json(serde_json::Value),
    /// Responds with an empty body and the given status code.
    Status(u16),
    /// Responds with `200 OK` and a body that is not JSON.
    Garbage(String),
}

#[derive(Debug, Default)]
struct MockState {
    hits: Mutex<BTreeMap<String, usize>>,
    responses: Mutex<HashMap<(String, String), MockResponse>>,
    delay: Mutex<Duration>,
}

#[derive(Debug, Deserialize)]
struct ModelQuery {
    #[serde(rename = "ClothID")]
    garment_id: String,
    #[serde(rename = "Brand")]
    brand: String,
}

/// A mock of the size-metadata endpoint that counts its hits.
///
/// Garments without a registered [`MockResponse`] are answered with `404 Not Found`.
pub struct SizeInfoServer {
    server: Server,
    state: Arc<MockState>,
}

impl SizeInfoServer {
    pub fn new() -> Self {
        let state = Arc::new(MockState::default());

        let hitcounter = {
            let state = state.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri, req: Request, next: Next| {
                let state = state.clone();
                async move {
                    {
                        let mut hits = state.hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(MODEL_PATH, get(model))
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .layer(middleware::from_fn(hitcounter))
            .with_state(state.clone());

        let server = Server::with_router(router);

        Self { server, state }
    }

    /// Registers the answer for the given garment.
    pub fn respond(&self, garment_id: &str, brand: &str, response: MockResponse) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert((garment_id.to_owned(), brand.to_owned()), response);
    }

    /// Delays every answer of the model endpoint by the given duration.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    /// Returns the number of requests since the last call, and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns all requested URIs with their hit counts, and resets the counter.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// The URL of the size-metadata endpoint.
    pub fn endpoint(&self) -> Url {
        self.url(MODEL_PATH)
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for SizeInfoServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn model(State(state): State<Arc<MockState>>, Query(query): Query<ModelQuery>) -> Response {
    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let response = state
        .responses
        .lock()
        .unwrap()
        .get(&(query.garment_id, query.brand))
        .cloned();

    match response {
        Some(MockResponse::Json(value)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            value.to_string(),
        )
            .into_response(),
        Some(MockResponse::Status(status)) => StatusCode::from_u16(status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        Some(MockResponse::Garbage(body)) => (StatusCode::OK, body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
