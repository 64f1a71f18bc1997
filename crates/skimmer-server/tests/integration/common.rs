use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tower::ServiceExt;

use skimmer_core::clock::ManualClock;
use skimmer_core::events::EventBus;
use skimmer_core::job::JobDefaults;
use skimmer_core::ratelimit::{
    DomainPolicyTable, FixedLoad, HierarchyPolicy, LimitPolicy, LimiterConfig, RateLimiterService,
};
use skimmer_db::{Backends, Database};
use skimmer_server::routes;
use skimmer_server::state::AppState;

pub const TEST_API_KEY: &str = "test-secret-key";

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub clock: ManualClock,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// Knobs for the in-memory test app.
pub struct TestOptions {
    pub api_keys: Vec<String>,
    pub hierarchy: HierarchyPolicy,
    pub submit_limit: u32,
    pub sse_poll: Duration,
    pub trust_proxy: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            api_keys: vec![TEST_API_KEY.to_string()],
            hierarchy: HierarchyPolicy::default(),
            submit_limit: 100,
            sse_poll: Duration::from_secs(60),
            trust_proxy: false,
        }
    }
}

impl TestOptions {
    pub fn without_auth(mut self) -> Self {
        self.api_keys.clear();
        self
    }

    pub fn with_ip_limit(mut self, capacity: u32) -> Self {
        self.hierarchy.ip = LimitPolicy::per_minute(capacity);
        self
    }

    pub fn with_user_limit(mut self, capacity: u32) -> Self {
        self.hierarchy.user = LimitPolicy::per_minute(capacity);
        self
    }

    pub fn with_submit_limit(mut self, limit: u32) -> Self {
        self.submit_limit = limit;
        self
    }

    pub fn with_trusted_proxy(mut self) -> Self {
        self.trust_proxy = true;
        self
    }

    pub fn with_sse_poll(mut self, interval: Duration) -> Self {
        self.sse_poll = interval;
        self
    }
}

/// Router over in-memory backends driven by a manual clock.
pub fn setup_test_app() -> TestApp {
    setup_test_app_with(TestOptions::default())
}

pub fn setup_test_app_with(options: TestOptions) -> TestApp {
    let clock = ManualClock::starting_now();
    let backends = Backends::memory(clock.shared(), JobDefaults::default());
    let limiter = RateLimiterService::new(
        backends.store,
        DomainPolicyTable::builtin(),
        Arc::new(FixedLoad(0.0)),
        clock.shared(),
        LimiterConfig::default()
            .with_hierarchy(options.hierarchy)
            .with_submit_limit(options.submit_limit, Duration::from_secs(60)),
    );

    let state = Arc::new(
        AppState::new(backends.queue, limiter, EventBus::default())
            .with_api_keys(options.api_keys)
            .with_sse_poll_interval(options.sse_poll)
            .with_trusted_proxy(options.trust_proxy),
    );

    TestApp {
        router: routes::router(state.clone()),
        state,
        clock,
    }
}

/// Router over PostgreSQL in a container. Keep the container in scope.
pub async fn setup_pg_app() -> (TestApp, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "skimmer_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");
    let url = format!("postgresql://postgres:postgres@{host}:{port}/skimmer_test");

    let db = Database::from_pool(retry_connect(&url).await);
    db.migrate().await.expect("Failed to run migrations");

    let clock = ManualClock::starting_now();
    let backends = Backends::postgres(db, JobDefaults::default());
    let limiter = RateLimiterService::new(
        backends.store,
        DomainPolicyTable::builtin(),
        Arc::new(FixedLoad(0.0)),
        clock.shared(),
        LimiterConfig::default(),
    );

    let mut state = AppState::new(backends.queue, limiter, EventBus::default())
        .with_api_keys(vec![TEST_API_KEY.to_string()]);
    if let Some(db) = backends.db {
        state = state.with_database(db);
    }
    let state = Arc::new(state);

    let app = TestApp {
        router: routes::router(state.clone()),
        state,
        clock,
    };
    (app, container)
}

async fn retry_connect(url: &str) -> sqlx::PgPool {
    for _ in 0..30 {
        if let Ok(pool) = PgPoolOptions::new().max_connections(5).connect(url).await {
            return pool;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Failed to connect to test database");
}

pub fn authed(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header("authorization", format!("Bearer {TEST_API_KEY}"))
}

/// Stamp the request as arriving from `ip`, as the server's connect-info layer does.
pub fn from_peer(builder: axum::http::request::Builder, ip: &str) -> axum::http::request::Builder {
    let ip: IpAddr = ip.parse().unwrap();
    builder.extension(ConnectInfo(SocketAddr::new(ip, 40_000)))
}

pub fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
    authed(Request::post(uri))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    authed(Request::get(uri)).body(Body::empty()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(body.to_vec()).unwrap()
}
