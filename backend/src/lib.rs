pub mod auth;
pub mod roll;
pub mod store;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gacha_core::{GachaId, Item, RarityRates, UserId};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::auth::Claims;
use crate::roll::RollError;
use crate::store::{GachaMeta, GachaRecord, NewItem};

/// A gacha definition must ship with at least this many items.
const MIN_GACHA_ITEMS: usize = 5;

#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl AppState {
    pub fn new(conn: Connection) -> Self {
        Self::with_rng(conn, ChaCha8Rng::from_entropy())
    }

    /// Explicit generator, used by tests for reproducible draws.
    pub fn with_rng(conn: Connection, rng: ChaCha8Rng) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn open(path: &str) -> rusqlite::Result<Self> {
        Ok(Self::new(store::open(path)?))
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        Ok(Self::new(store::open_in_memory()?))
    }

    /// Create the admin account, or rotate an existing account's password
    /// and promote it to the admin role.
    pub async fn seed_admin(&self, email: &str, password: &str) -> Result<UserId, SeedError> {
        let hash = auth::hash_password(password).map_err(SeedError::Hash)?;
        let db = self.db.lock().await;
        match store::find_user_by_email(&db, email)? {
            Some(user) => {
                store::promote_to_admin(&db, user.id, &hash)?;
                Ok(user.id)
            }
            None => Ok(store::insert_user(&db, email, &hash, Some("Administrator"), "admin")?),
        }
    }
}

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("password hash failure: {0}")]
    Hash(argon2::password_hash::Error),
    #[error("storage failure: {0}")]
    Store(#[from] rusqlite::Error),
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(me))
        .route("/api/gachas", get(list_gachas).post(create_gacha))
        .route(
            "/api/gachas/:id",
            get(get_gacha).put(update_gacha).delete(delete_gacha),
        )
        .route("/api/gachas/:id/roll", post(roll_gacha))
        .route("/api/gachas/:id/preview", post(preview_gacha))
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

fn server_error(operation: &str, err: impl std::fmt::Display) -> Response {
    tracing::error!(%err, operation, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "server_error")
}

fn bearer_claims(headers: &HeaderMap) -> Result<Claims, Response> {
    let token = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "missing_token"))?;
    auth::verify_token(token, &auth::jwt_secret())
        .map_err(|_| error_response(StatusCode::UNAUTHORIZED, "invalid_token"))
}

fn require_role(claims: &Claims, role: &str) -> Result<(), Response> {
    if claims.role != role {
        return Err(error_response(StatusCode::FORBIDDEN, "forbidden"));
    }
    Ok(())
}

async fn index() -> impl IntoResponse {
    Json(json!({ "ok": true, "version": "gachapon-api" }))
}

#[derive(Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
}

async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Response {
    let email = payload.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return error_response(StatusCode::BAD_REQUEST, "invalid_email");
    }
    if payload.password.len() < 8 {
        return error_response(StatusCode::BAD_REQUEST, "weak_password");
    }
    if payload.display_name.as_deref().is_some_and(|n| n.len() > 100) {
        return error_response(StatusCode::BAD_REQUEST, "display_name_too_long");
    }

    let db = state.db.lock().await;
    match store::find_user_by_email(&db, &email) {
        Ok(Some(_)) => return error_response(StatusCode::CONFLICT, "email_taken"),
        Ok(None) => {}
        Err(err) => return server_error("register", err),
    }

    let hash = match auth::hash_password(&payload.password) {
        Ok(hash) => hash,
        Err(err) => return server_error("register", err),
    };
    match store::insert_user(&db, &email, &hash, payload.display_name.as_deref(), "user") {
        Ok(id) => (
            StatusCode::CREATED,
            Json(json!({ "id": id, "email": email, "role": "user" })),
        )
            .into_response(),
        Err(err) => server_error("register", err),
    }
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    expires_in: i64,
    user: UserView,
}

#[derive(Serialize)]
struct UserView {
    id: UserId,
    email: String,
    role: String,
}

async fn login(State(state): State<AppState>, Json(payload): Json<LoginRequest>) -> Response {
    let email = payload.email.trim().to_lowercase();
    let db = state.db.lock().await;
    let user = match store::find_user_by_email(&db, &email) {
        Ok(Some(user)) => user,
        Ok(None) => return error_response(StatusCode::UNAUTHORIZED, "invalid_credentials"),
        Err(err) => return server_error("login", err),
    };

    if auth::is_locked(user.locked_until.as_deref()) {
        return error_response(StatusCode::LOCKED, "account_locked");
    }

    let verified = auth::verify_password(&payload.password, &user.password_hash).unwrap_or(false);
    if !verified {
        let failed = user.failed_login_attempts + 1;
        let deadline = (failed >= auth::MAX_FAILED_LOGINS).then(auth::lockout_deadline);
        if let Err(err) = store::record_failed_login(&db, user.id, failed, deadline.as_deref()) {
            return server_error("login", err);
        }
        return error_response(StatusCode::UNAUTHORIZED, "invalid_credentials");
    }

    if let Err(err) = store::reset_login_counters(&db, user.id) {
        return server_error("login", err);
    }

    match auth::issue_token(user.id, &email, &user.role, &auth::jwt_secret()) {
        Ok(token) => Json(LoginResponse {
            access_token: token,
            expires_in: auth::TOKEN_TTL_SECS,
            user: UserView {
                id: user.id,
                email,
                role: user.role,
            },
        })
        .into_response(),
        Err(err) => server_error("login", err),
    }
}

async fn me(headers: HeaderMap) -> Response {
    match bearer_claims(&headers) {
        Ok(claims) => Json(json!({
            "id": claims.sub,
            "email": claims.email,
            "role": claims.role,
        }))
        .into_response(),
        Err(resp) => resp,
    }
}

async fn list_gachas(State(state): State<AppState>) -> Response {
    let db = state.db.lock().await;
    match store::list_gachas(&db) {
        Ok(list) => Json(list).into_response(),
        Err(err) => server_error("list_gachas", err),
    }
}

#[derive(Serialize)]
struct GachaDetail {
    #[serde(flatten)]
    gacha: GachaRecord,
    items: Vec<Item>,
}

async fn get_gacha(State(state): State<AppState>, Path(id): Path<GachaId>) -> Response {
    let db = state.db.lock().await;
    let gacha = match store::get_gacha(&db, id) {
        Ok(Some(gacha)) => gacha,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(err) => return server_error("get_gacha", err),
    };
    match store::get_items(&db, id) {
        Ok(items) => Json(GachaDetail { gacha, items }).into_response(),
        Err(err) => server_error("get_gacha", err),
    }
}

#[derive(Deserialize)]
struct ItemPayload {
    name: String,
    rarity: String,
    img_src: Option<String>,
    weight: Option<i64>,
}

impl ItemPayload {
    fn into_row(self) -> NewItem {
        NewItem {
            name: self.name,
            rarity: self.rarity,
            img_src: self.img_src,
            // Missing or zero weight defaults to 1; negatives are stored
            // as-is and floored at roll time.
            weight: self.weight.filter(|w| *w != 0).unwrap_or(1),
        }
    }
}

#[derive(Deserialize)]
struct CreateGachaRequest {
    title: String,
    description: Option<String>,
    category: Option<String>,
    thumbnail: Option<String>,
    rarity_rates: Option<RarityRates>,
    items: Vec<ItemPayload>,
}

async fn create_gacha(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateGachaRequest>,
) -> Response {
    let claims = match bearer_claims(&headers) {
        Ok(claims) => claims,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(&claims, "admin") {
        return resp;
    }

    if payload.title.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "title_required");
    }
    if payload.items.len() < MIN_GACHA_ITEMS {
        return error_response(StatusCode::BAD_REQUEST, "too_few_items");
    }

    let meta = GachaMeta {
        title: payload.title,
        description: payload.description,
        category: payload.category,
        thumbnail: payload.thumbnail,
        rarity_rates: payload.rarity_rates.unwrap_or_default(),
    };
    let items: Vec<NewItem> = payload.items.into_iter().map(ItemPayload::into_row).collect();

    let mut db = state.db.lock().await;
    match store::create_gacha(&mut db, &meta, claims.sub, &items) {
        Ok(id) => (StatusCode::CREATED, Json(json!({ "id": id }))).into_response(),
        Err(err) => server_error("create_gacha", err),
    }
}

#[derive(Deserialize)]
struct UpdateGachaRequest {
    title: String,
    description: Option<String>,
    category: Option<String>,
    thumbnail: Option<String>,
    rarity_rates: Option<RarityRates>,
}

async fn update_gacha(
    State(state): State<AppState>,
    Path(id): Path<GachaId>,
    headers: HeaderMap,
    Json(payload): Json<UpdateGachaRequest>,
) -> Response {
    let claims = match bearer_claims(&headers) {
        Ok(claims) => claims,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(&claims, "admin") {
        return resp;
    }

    let meta = GachaMeta {
        title: payload.title,
        description: payload.description,
        category: payload.category,
        thumbnail: payload.thumbnail,
        rarity_rates: payload.rarity_rates.unwrap_or_default(),
    };
    let db = state.db.lock().await;
    match store::update_gacha(&db, id, &meta) {
        // Success is reported whether or not the row existed.
        Ok(_) => Json(json!({ "ok": true })).into_response(),
        Err(err) => server_error("update_gacha", err),
    }
}

async fn delete_gacha(
    State(state): State<AppState>,
    Path(id): Path<GachaId>,
    headers: HeaderMap,
) -> Response {
    let claims = match bearer_claims(&headers) {
        Ok(claims) => claims,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(&claims, "admin") {
        return resp;
    }

    let db = state.db.lock().await;
    match store::delete_gacha(&db, id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => server_error("delete_gacha", err),
    }
}

#[derive(Deserialize, Default)]
struct RollRequest {
    times: Option<i64>,
}

async fn roll_gacha(
    State(state): State<AppState>,
    Path(id): Path<GachaId>,
    headers: HeaderMap,
    payload: Option<Json<RollRequest>>,
) -> Response {
    let claims = match bearer_claims(&headers) {
        Ok(claims) => claims,
        Err(resp) => return resp,
    };
    let times = payload.and_then(|Json(body)| body.times).unwrap_or(1);

    let mut db = state.db.lock().await;
    let mut rng = state.rng.lock().await;
    match roll::execute_roll(&mut db, &mut *rng, id, claims.sub, times) {
        Ok(results) => Json(json!({ "results": results, "rolls_saved": true })).into_response(),
        Err(RollError::GachaNotFound) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(RollError::NoItems(_)) => error_response(StatusCode::BAD_REQUEST, "no_items"),
        Err(err) => server_error("roll", err),
    }
}

async fn preview_gacha(
    State(state): State<AppState>,
    Path(id): Path<GachaId>,
    headers: HeaderMap,
    payload: Option<Json<RollRequest>>,
) -> Response {
    if let Err(resp) = bearer_claims(&headers) {
        return resp;
    }
    let times = payload.and_then(|Json(body)| body.times).unwrap_or(1);

    let db = state.db.lock().await;
    let mut rng = state.rng.lock().await;
    match roll::preview_roll(&db, &mut *rng, id, times) {
        Ok(results) => Json(json!({ "results": results, "rolls_saved": false })).into_response(),
        Err(RollError::GachaNotFound) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(RollError::NoItems(_)) => error_response(StatusCode::BAD_REQUEST, "no_items"),
        Err(err) => server_error("preview", err),
    }
}
