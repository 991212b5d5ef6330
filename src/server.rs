//! Giveaway Server
//!
//! HTTP command surface for the engine, plus the relay endpoint the gateway
//! bridge posts member-joined events to.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::{Settings, SettingsPatch};
use crate::error::ValidationError;
use crate::models::{Giveaway, GiveawayStats, NewGiveaway, UserId};
use crate::platform::MemberJoined;
use crate::service::{GiveawayService, InviteLink};
use crate::store::StandingsSnapshot;

pub struct AppState {
    pub service: Arc<GiveawayService>,
    pub events: mpsc::Sender<MemberJoined>,
    pub started_at: std::time::Instant,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/giveaways", get(list_handler).post(create_handler))
        .route("/giveaways/:id/leaderboard", get(leaderboard_handler))
        .route("/giveaways/:id/enter", post(enter_handler))
        .route("/giveaways/:id/invite", post(invite_handler))
        .route("/giveaways/:id/end", post(end_handler))
        .route("/settings", get(settings_handler).patch(update_settings_handler))
        .route("/events/member-join", post(member_join_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Validation failure returned to the caller with its message.
pub struct ApiError(ValidationError);

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ValidationError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub uptime_secs: u64,
    pub version: String,
    pub active_giveaways: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserRequest {
    pub user_id: UserId,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_giveaways: state.service.store().active_count(),
    })
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<GiveawayStats> {
    Json(state.service.get_stats())
}

async fn list_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Giveaway>> {
    Json(state.service.list_giveaways())
}

async fn create_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewGiveaway>,
) -> Result<(StatusCode, Json<Giveaway>), ApiError> {
    let giveaway = state.service.create_giveaway(request).await?;
    Ok((StatusCode::CREATED, Json(giveaway)))
}

async fn leaderboard_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StandingsSnapshot> {
    Ok(Json(state.service.standings(&id)?))
}

async fn enter_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UserRequest>,
) -> ApiResult<Giveaway> {
    Ok(Json(state.service.enter_giveaway(&id, &request.user_id).await?))
}

async fn invite_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UserRequest>,
) -> ApiResult<InviteLink> {
    Ok(Json(
        state
            .service
            .create_invite_link(&id, &request.user_id)
            .await?,
    ))
}

async fn end_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Giveaway> {
    Ok(Json(state.service.end_giveaway_now(&id).await?))
}

async fn settings_handler(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(state.service.store().settings())
}

async fn update_settings_handler(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Settings> {
    Ok(Json(state.service.update_settings(patch).await?))
}

async fn member_join_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<MemberJoined>,
) -> StatusCode {
    match state.events.try_send(event) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            warn!("Dropping member-joined event: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Run the server until `shutdown` resolves
pub async fn run_server(
    host: &str,
    port: u16,
    service: Arc<GiveawayService>,
    events: mpsc::Sender<MemberJoined>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        service,
        events,
        started_at: std::time::Instant::now(),
    });

    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting giveaway server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;
    use crate::scheduler::ManualClock;
    use crate::store::tests::memory_store;
    use chrono::Utc;
    use tokio_test::assert_err;

    fn state() -> (Arc<AppState>, mpsc::Receiver<MemberJoined>) {
        let platform = Arc::new(MockPlatform::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service = Arc::new(GiveawayService::new(
            Arc::new(memory_store()),
            platform,
            clock,
        ));
        let (events, rx) = mpsc::channel(1);
        (
            Arc::new(AppState {
                service,
                events,
                started_at: std::time::Instant::now(),
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn test_validation_error_is_bad_request() {
        let (state, _rx) = state();
        let result = create_handler(State(state), Json(NewGiveaway::default())).await;
        let response = assert_err!(result).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_giveaway_is_not_found() {
        let (state, _rx) = state();
        let result = end_handler(State(state), Path("nope".to_string())).await;
        let response = assert_err!(result).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_member_join_relay_backpressure() {
        let (state, mut rx) = state();
        let event = MemberJoined {
            member: crate::platform::Member {
                id: "u1".into(),
                username: "newbie".into(),
                created_at: Utc::now(),
                joined_at: Some(Utc::now()),
                avatar: None,
                bot: false,
                roles: vec![],
                mfa_enabled: None,
                verified: None,
            },
        };

        let first = member_join_handler(State(state.clone()), Json(event.clone())).await;
        assert_eq!(first, StatusCode::ACCEPTED);
        let second = member_join_handler(State(state), Json(event)).await;
        assert_eq!(second, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(rx.recv().await.unwrap().member.id, "u1");
    }
}
