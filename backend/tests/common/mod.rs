#![allow(dead_code)]
use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use orgs_backend::{
    api,
    auth::create_token,
    clock::{ManualClock, SystemClock},
    models::{membership::Role, user::User},
    orgs::{Authority, AuthoritySettings},
    store::{MemoryStore, PgStore, Store},
    AppState,
};

const JWT_SECRET: &str = "test-secret-that-is-at-least-32-chars-long!!";
const JWT_EXPIRY_HOURS: u64 = 12;

pub struct TestApp {
    pub addr: SocketAddr,
    pub store: MemoryStore,
    pub clock: ManualClock,
    client: reqwest::Client,
}

/// A registered user plus a bearer token for one session.
pub struct TestUser {
    pub user: User,
    pub token: String,
}

/// Spin up a real Axum server on a random port over an in-memory store and a
/// clock the test controls.
pub async fn setup_test_app() -> TestApp {
    let store = MemoryStore::new();
    let clock = ManualClock::default();
    let shared: Arc<dyn Store> = Arc::new(store.clone());

    let authority = Authority::new(
        shared.clone(),
        Arc::new(clock.clone()),
        AuthoritySettings::default(),
    );
    let state = AppState {
        authority,
        store: shared,
        jwt_secret: JWT_SECRET.to_string(),
    };

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        addr,
        store,
        clock,
        client: reqwest::Client::new(),
    }
}

impl TestApp {
    /// Register a user with the identity store and mint a token for a fresh session.
    pub async fn user(&self, name: &str) -> TestUser {
        let user = User {
            id: Uuid::new_v4(),
            email: format!(
                "{}+{}@test.local",
                name.to_lowercase(),
                &Uuid::new_v4().to_string()[..8]
            ),
            name: name.to_string(),
            picture: None,
            created_at: time::OffsetDateTime::now_utc(),
        };
        self.store.upsert_user(&user).await.expect("Failed to register user");
        let token = self.session(&user);
        TestUser { user, token }
    }

    /// Another session for an already registered user.
    pub fn session(&self, user: &User) -> String {
        create_token(user.id, &Uuid::new_v4().to_string(), JWT_SECRET, JWT_EXPIRY_HOURS)
            .expect("Failed to mint token")
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (u16, Value) {
        let mut req = self
            .client
            .request(method, format!("http://{}{}", self.addr, path));
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.expect("Request failed");
        let status = resp.status().as_u16();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn get(&self, path: &str, as_user: &TestUser) -> (u16, Value) {
        self.request(Method::GET, path, Some(&as_user.token), None).await
    }

    pub async fn post(&self, path: &str, as_user: &TestUser, body: Value) -> (u16, Value) {
        self.request(Method::POST, path, Some(&as_user.token), Some(body)).await
    }

    pub async fn put(&self, path: &str, as_user: &TestUser, body: Value) -> (u16, Value) {
        self.request(Method::PUT, path, Some(&as_user.token), Some(body)).await
    }

    pub async fn delete(&self, path: &str, as_user: &TestUser) -> (u16, Value) {
        self.request(Method::DELETE, path, Some(&as_user.token), None).await
    }

    /// Create an organization through the API and return its id.
    pub async fn create_org(&self, owner: &TestUser, name: &str) -> Uuid {
        let (status, body) = self
            .post("/api/organizations", owner, serde_json::json!({ "name": name }))
            .await;
        assert_eq!(status, 200, "create org failed: {}", body);
        body["id"].as_str().unwrap().parse().unwrap()
    }

    /// Invite `who` at `role` and accept it as them.
    pub async fn join(&self, org_id: Uuid, inviter: &TestUser, who: &TestUser, role: &str) {
        let (status, body) = self
            .post(
                &format!("/api/organizations/{}/invitations", org_id),
                inviter,
                serde_json::json!({ "email": who.user.email, "role": role }),
            )
            .await;
        assert_eq!(status, 200, "invite failed: {}", body);

        let token = self.invitation_token(who, org_id).await;
        let (status, body) = self
            .post(&format!("/api/invitations/{}/accept", token), who, Value::Null)
            .await;
        assert_eq!(status, 200, "accept failed: {}", body);
    }

    /// Token of the caller's pending invitation into `org_id`.
    pub async fn invitation_token(&self, who: &TestUser, org_id: Uuid) -> String {
        let (status, body) = self.get("/api/invitations", who).await;
        assert_eq!(status, 200);
        body.as_array()
            .unwrap()
            .iter()
            .find(|i| i["organization_id"] == org_id.to_string())
            .expect("No pending invitation for that organization")["token"]
            .as_str()
            .unwrap()
            .to_string()
    }
}

/// The authority over a real Postgres database.
pub struct PgHarness {
    pub authority: Authority,
    pub store: PgStore,
}

/// Connect to `TEST_DATABASE_URL` and bring the schema up to date. Returns
/// `None` when the variable is unset so the Postgres suite can be skipped.
/// Tests share the database; isolation comes from unique users and orgs.
pub async fn pg_harness() -> Option<PgHarness> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let store = PgStore::new(pool);
    let authority = Authority::new(
        Arc::new(store.clone()),
        Arc::new(SystemClock),
        AuthoritySettings::default(),
    );
    Some(PgHarness { authority, store })
}

impl PgHarness {
    pub async fn user(&self, name: &str) -> User {
        let id = Uuid::new_v4();
        let user = User {
            id,
            email: format!("{}+{}@pg.test", name.to_lowercase(), &id.to_string()[..8]),
            name: name.to_string(),
            picture: None,
            created_at: time::OffsetDateTime::now_utc(),
        };
        self.store.upsert_user(&user).await.expect("Failed to register user");
        user
    }

    /// Invite `who` at `role` and accept it as them.
    pub async fn join(&self, org_id: Uuid, inviter: &User, who: &User, role: Role) {
        let invitation = self
            .authority
            .create_invitation(org_id, &who.email, role, inviter)
            .await
            .expect("invite failed");
        self.authority
            .accept_invitation(&invitation.token, who)
            .await
            .expect("accept failed");
    }

    pub async fn owners(&self, org_id: Uuid) -> i64 {
        let mut tx = self.store.begin().await.expect("begin failed");
        tx.count_owners(org_id).await.expect("count failed")
    }
}
