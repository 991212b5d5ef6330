//! Persistence backends
//!
//! The core only sees [`GiveawayRepository`]. Two implementations exist: a
//! remote PostgreSQL store and a local SQLite file. [`open_repository`] picks
//! once at startup; when the remote store is in use every call falls back to
//! the local file on failure.

mod pg;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{DatabaseConfig, Settings};
use crate::error::StorageResult;
use crate::models::{Giveaway, GiveawayId, InviteCode, InviteTrackingRecord, UserId};

pub use pg::PgRepository;
pub use sqlite::SqliteRepository;

/// Attribution state as stored, flattened to rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InviteState {
    pub tracking: Vec<InviteTrackingRecord>,
    pub codes: Vec<InviteCode>,
    /// (giveaway, inviter, invitee)
    pub invited: Vec<(GiveawayId, UserId, UserId)>,
    /// (giveaway, user, validated count)
    pub counts: Vec<(GiveawayId, UserId, u32)>,
}

#[async_trait]
pub trait GiveawayRepository: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn load_settings(&self) -> StorageResult<Option<Settings>>;

    async fn save_settings(&self, settings: &Settings) -> StorageResult<()>;

    async fn load_all_giveaways(&self) -> StorageResult<Vec<Giveaway>>;

    async fn create_giveaway(&self, giveaway: &Giveaway) -> StorageResult<()>;

    async fn update_giveaway(&self, giveaway: &Giveaway) -> StorageResult<()>;

    async fn load_participants(&self, giveaway_id: &str) -> StorageResult<Vec<UserId>>;

    async fn add_participant(&self, giveaway_id: &str, user_id: &str) -> StorageResult<()>;

    async fn load_invite_state(&self) -> StorageResult<InviteState>;

    async fn update_invite_tracking(&self, record: &InviteTrackingRecord) -> StorageResult<()>;

    async fn add_invited_user(
        &self,
        giveaway_id: &str,
        inviter_id: &str,
        invitee_id: &str,
    ) -> StorageResult<()>;

    async fn update_user_invites(
        &self,
        giveaway_id: &str,
        user_id: &str,
        count: u32,
    ) -> StorageResult<()>;

    async fn create_invite_code(&self, code: &InviteCode) -> StorageResult<()>;

    async fn update_invite_code_uses(&self, code: &str, uses: u32) -> StorageResult<()>;
}

/// Remote store with a local file behind it.
pub struct FallbackRepository {
    primary: Arc<dyn GiveawayRepository>,
    local: Arc<dyn GiveawayRepository>,
}

impl FallbackRepository {
    pub fn new(primary: Arc<dyn GiveawayRepository>, local: Arc<dyn GiveawayRepository>) -> Self {
        Self { primary, local }
    }
}

macro_rules! with_fallback {
    ($self:ident, $op:literal, $repo:ident => $call:expr) => {{
        let $repo = &$self.primary;
        match $call.await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    "{} failed on {} backend: {}; using {} backend",
                    $op,
                    $self.primary.backend_name(),
                    e,
                    $self.local.backend_name()
                );
                let $repo = &$self.local;
                $call.await
            }
        }
    }};
}

#[async_trait]
impl GiveawayRepository for FallbackRepository {
    fn backend_name(&self) -> &'static str {
        self.primary.backend_name()
    }

    async fn load_settings(&self) -> StorageResult<Option<Settings>> {
        with_fallback!(self, "load_settings", repo => repo.load_settings())
    }

    async fn save_settings(&self, settings: &Settings) -> StorageResult<()> {
        with_fallback!(self, "save_settings", repo => repo.save_settings(settings))
    }

    async fn load_all_giveaways(&self) -> StorageResult<Vec<Giveaway>> {
        with_fallback!(self, "load_all_giveaways", repo => repo.load_all_giveaways())
    }

    async fn create_giveaway(&self, giveaway: &Giveaway) -> StorageResult<()> {
        with_fallback!(self, "create_giveaway", repo => repo.create_giveaway(giveaway))
    }

    async fn update_giveaway(&self, giveaway: &Giveaway) -> StorageResult<()> {
        with_fallback!(self, "update_giveaway", repo => repo.update_giveaway(giveaway))
    }

    async fn load_participants(&self, giveaway_id: &str) -> StorageResult<Vec<UserId>> {
        with_fallback!(self, "load_participants", repo => repo.load_participants(giveaway_id))
    }

    async fn add_participant(&self, giveaway_id: &str, user_id: &str) -> StorageResult<()> {
        with_fallback!(self, "add_participant", repo => repo.add_participant(giveaway_id, user_id))
    }

    async fn load_invite_state(&self) -> StorageResult<InviteState> {
        with_fallback!(self, "load_invite_state", repo => repo.load_invite_state())
    }

    async fn update_invite_tracking(&self, record: &InviteTrackingRecord) -> StorageResult<()> {
        with_fallback!(self, "update_invite_tracking", repo => repo.update_invite_tracking(record))
    }

    async fn add_invited_user(
        &self,
        giveaway_id: &str,
        inviter_id: &str,
        invitee_id: &str,
    ) -> StorageResult<()> {
        with_fallback!(self, "add_invited_user", repo => repo.add_invited_user(giveaway_id, inviter_id, invitee_id))
    }

    async fn update_user_invites(
        &self,
        giveaway_id: &str,
        user_id: &str,
        count: u32,
    ) -> StorageResult<()> {
        with_fallback!(self, "update_user_invites", repo => repo.update_user_invites(giveaway_id, user_id, count))
    }

    async fn create_invite_code(&self, code: &InviteCode) -> StorageResult<()> {
        with_fallback!(self, "create_invite_code", repo => repo.create_invite_code(code))
    }

    async fn update_invite_code_uses(&self, code: &str, uses: u32) -> StorageResult<()> {
        with_fallback!(self, "update_invite_code_uses", repo => repo.update_invite_code_uses(code, uses))
    }
}

/// Choose the backend once at startup.
pub async fn open_repository(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn GiveawayRepository>> {
    let local: Arc<dyn GiveawayRepository> = Arc::new(SqliteRepository::new(&config.data_path)?);
    info!("Local storage at {}", config.data_path);

    let Some(url) = config.url.as_deref() else {
        info!("DATABASE_URL not set, using local storage only");
        return Ok(local);
    };

    match PgRepository::new(url).await {
        Ok(pg) => {
            info!("Using PostgreSQL storage with local fallback");
            Ok(Arc::new(FallbackRepository::new(Arc::new(pg), local)))
        }
        Err(e) => {
            warn!("PostgreSQL unavailable ({}), using local storage only", e);
            Ok(local)
        }
    }
}
