//! Giveaway service
//!
//! The command surface the server and binaries talk to. Builds the engine
//! components around one store and platform, validates commands, and runs
//! the named background tasks.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attribution::{AttributionOutcome, InviteAttributionEngine};
use crate::config::{Settings, SettingsPatch};
use crate::error::ValidationError;
use crate::leaderboard::LeaderboardSynchronizer;
use crate::lifecycle::GiveawayLifecycleManager;
use crate::models::{Giveaway, GiveawayId, GiveawayStats, InviteCode, MessageRef, NewGiveaway};
use crate::notify::NotificationDispatcher;
use crate::platform::{ChatPlatform, Embed, Member, MemberJoined, OutgoingMessage};
use crate::scheduler::{Clock, Schedule, Scheduler, TaskKind, TaskRunner};
use crate::store::{GiveawayStore, StandingsSnapshot};

const ANNOUNCEMENT_COLOR: u32 = 0x5865F2;

/// An invite link handed to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InviteLink {
    pub giveaway_id: GiveawayId,
    pub code: String,
    pub url: String,
    pub uses: u32,
    pub expires_at: DateTime<Utc>,
}

pub struct GiveawayService {
    store: Arc<GiveawayStore>,
    platform: Arc<dyn ChatPlatform>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<Scheduler>,
    attribution: InviteAttributionEngine,
    lifecycle: GiveawayLifecycleManager,
    leaderboard: Arc<LeaderboardSynchronizer>,
    notifier: Arc<NotificationDispatcher>,
    create_guard: Mutex<()>,
    invite_guard: Mutex<()>,
}

impl GiveawayService {
    pub fn new(
        store: Arc<GiveawayStore>,
        platform: Arc<dyn ChatPlatform>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_rng(store, platform, clock, StdRng::from_entropy())
    }

    /// Same as [`GiveawayService::new`] with a fixed winner-selection RNG.
    pub fn with_rng(
        store: Arc<GiveawayStore>,
        platform: Arc<dyn ChatPlatform>,
        clock: Arc<dyn Clock>,
        rng: StdRng,
    ) -> Self {
        let settings = store.settings();
        let scheduler = Arc::new(Scheduler::new(
            Schedule::standard(settings.leaderboard.refresh_interval_secs, clock.now()),
            clock.clone(),
        ));
        let leaderboard = Arc::new(LeaderboardSynchronizer::new(
            store.clone(),
            platform.clone(),
            clock.clone(),
        ));
        let notifier = Arc::new(NotificationDispatcher::new(
            platform.clone(),
            StdDuration::from_millis(settings.notifications.dm_pacing_ms),
        ));
        let attribution = InviteAttributionEngine::new(
            store.clone(),
            platform.clone(),
            leaderboard.clone(),
            clock.clone(),
        );
        let lifecycle = GiveawayLifecycleManager::with_rng(
            store.clone(),
            platform.clone(),
            leaderboard.clone(),
            notifier.clone(),
            clock.clone(),
            rng,
        );

        Self {
            store,
            platform,
            clock,
            scheduler,
            attribution,
            lifecycle,
            leaderboard,
            notifier,
            create_guard: Mutex::new(()),
            invite_guard: Mutex::new(()),
        }
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn store(&self) -> &Arc<GiveawayStore> {
        &self.store
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    pub async fn create_giveaway(
        &self,
        options: NewGiveaway,
    ) -> Result<Giveaway, ValidationError> {
        // Held until the insert so concurrent creates cannot both pass the cap
        let _guard = self.create_guard.lock().await;

        let now = self.clock.now();
        let settings = self.store.settings();
        let end_time = validate_new_giveaway(&options, &settings, now)?;

        let limit = settings.limits.max_active_giveaways;
        if self.store.active_count() >= limit {
            return Err(ValidationError::TooManyActive { limit });
        }

        let channel_id = options.channel_id.trim().to_string();
        let id = Uuid::new_v4().to_string();
        let mut giveaway = Giveaway::new(id, options, end_time, now);
        giveaway.title = giveaway.title.trim().to_string();
        giveaway.prize = giveaway.prize.trim().to_string();

        let message = announcement_message(&giveaway);
        let message_id = match self.platform.send_message(&channel_id, &message).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Could not post announcement for {}: {}", giveaway.id, e);
                None
            }
        };
        giveaway.announcement = Some(MessageRef {
            channel_id,
            message_id,
        });

        self.store.insert_giveaway(giveaway.clone()).await;
        info!(
            "Created {:?} giveaway {} ({}), ends {}",
            giveaway.kind,
            giveaway.id,
            giveaway.title,
            giveaway.end_time()
        );
        Ok(giveaway)
    }

    /// Enter a classic giveaway after checking its requirements.
    pub async fn enter_giveaway(
        &self,
        giveaway_id: &str,
        user_id: &str,
    ) -> Result<Giveaway, ValidationError> {
        let giveaway = self.open_giveaway(giveaway_id)?;
        if giveaway.is_invite() {
            return Err(ValidationError::NotClassicGiveaway(giveaway.id));
        }
        if giveaway.participants.contains(user_id) {
            return Err(ValidationError::AlreadyEntered(giveaway.id));
        }

        let member = self.platform.fetch_member(user_id).await.map_err(|e| {
            ValidationError::RequirementNotMet(format!("could not verify membership ({})", e))
        })?;
        giveaway
            .requirements
            .check_entry(&member, self.clock.now())
            .map_err(ValidationError::RequirementNotMet)?;

        if !self.store.add_participant(giveaway_id, user_id).await {
            return Err(ValidationError::AlreadyEntered(giveaway.id));
        }
        debug!("{} entered {}", user_id, giveaway_id);
        self.store
            .giveaway(giveaway_id)
            .ok_or_else(|| ValidationError::NotFound(giveaway_id.to_string()))
    }

    /// Return the caller's invite link for an invite giveaway, creating it on
    /// first request.
    pub async fn create_invite_link(
        &self,
        giveaway_id: &str,
        user_id: &str,
    ) -> Result<InviteLink, ValidationError> {
        let _guard = self.invite_guard.lock().await;

        let giveaway = self.open_giveaway(giveaway_id)?;
        if !giveaway.is_invite() {
            return Err(ValidationError::NotInviteGiveaway(giveaway.id));
        }

        if let Some(code) = self.store.code_for(user_id, giveaway_id) {
            return Ok(self.invite_link(code));
        }

        let now = self.clock.now();
        let max_age = giveaway.seconds_remaining(now) as u64;
        if max_age == 0 {
            return Err(ValidationError::AlreadyEnded(giveaway.id));
        }
        let max_uses = self.store.settings().invites.max_uses_per_code;
        let channel_id = giveaway_channel(&giveaway);

        let created = self
            .platform
            .create_invite(&channel_id, max_age, max_uses)
            .await
            .map_err(|e| ValidationError::InviteUnavailable(e.to_string()))?;

        let owner_name = self
            .platform
            .fetch_member(user_id)
            .await
            .map(|m| m.username)
            .ok();
        let code = InviteCode {
            code: created.code,
            owner_id: user_id.to_string(),
            giveaway_id: giveaway.id.clone(),
            uses: 0,
            max_uses,
            expires_at: giveaway.end_time(),
            created_at: now,
        };
        self.store.add_invite_code(code.clone(), owner_name).await;
        info!("Created invite {} for {} in {}", code.code, user_id, giveaway.id);

        Ok(InviteLink {
            url: created.url,
            ..self.invite_link(code)
        })
    }

    pub fn get_stats(&self) -> GiveawayStats {
        self.store.stats()
    }

    pub fn list_giveaways(&self) -> Vec<Giveaway> {
        self.store.giveaways()
    }

    pub fn standings(&self, giveaway_id: &str) -> Result<StandingsSnapshot, ValidationError> {
        self.store
            .standings(giveaway_id, self.clock.now())
            .ok_or_else(|| ValidationError::NotFound(giveaway_id.to_string()))
    }

    /// Merge a settings patch. A changed refresh interval restarts the
    /// refresh timer and forces one pass over the auto boards.
    pub async fn update_settings(
        &self,
        patch: SettingsPatch,
    ) -> Result<Settings, ValidationError> {
        let change = self.store.update_settings(patch).await?;
        let settings = self.store.settings();

        self.notifier
            .set_pacing(StdDuration::from_millis(settings.notifications.dm_pacing_ms));

        if change.refresh_interval_changed {
            let secs = settings.leaderboard.refresh_interval_secs;
            self.scheduler
                .reschedule(TaskKind::LeaderboardRefresh, Duration::seconds(secs as i64));
            info!("Leaderboard refresh interval set to {}s", secs);
            self.leaderboard.refresh_all_auto(true).await;
        }
        Ok(settings)
    }

    /// End a giveaway before its end time.
    pub async fn end_giveaway_now(
        &self,
        giveaway_id: &str,
    ) -> Result<Giveaway, ValidationError> {
        let giveaway = self
            .store
            .giveaway(giveaway_id)
            .ok_or_else(|| ValidationError::NotFound(giveaway_id.to_string()))?;
        if !giveaway.is_active() {
            return Err(ValidationError::AlreadyEnded(giveaway.id));
        }

        info!("Ending giveaway {} early", giveaway_id);
        self.lifecycle
            .end_giveaway(giveaway_id)
            .await
            .ok_or(ValidationError::AlreadyEnded(giveaway.id))
    }

    pub async fn handle_member_join(&self, member: &Member) -> AttributionOutcome {
        self.attribution.handle_join(member).await
    }

    /// Consume member-joined events until shutdown or the sender closes.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<MemberJoined>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Member event loop started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        let outcome = self.handle_member_join(&event.member).await;
                        debug!("Join of {}: {:?}", event.member.id, outcome);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Member event loop stopped");
    }

    fn open_giveaway(&self, giveaway_id: &str) -> Result<Giveaway, ValidationError> {
        let giveaway = self
            .store
            .giveaway(giveaway_id)
            .ok_or_else(|| ValidationError::NotFound(giveaway_id.to_string()))?;
        if !giveaway.is_active() || giveaway.is_expired(self.clock.now()) {
            return Err(ValidationError::AlreadyEnded(giveaway.id));
        }
        Ok(giveaway)
    }

    fn invite_link(&self, code: InviteCode) -> InviteLink {
        InviteLink {
            url: self.platform.invite_url(&code.code),
            giveaway_id: code.giveaway_id,
            code: code.code,
            uses: code.uses,
            expires_at: code.expires_at,
        }
    }
}

#[async_trait]
impl TaskRunner for GiveawayService {
    async fn run_task(&self, kind: TaskKind) {
        match kind {
            TaskKind::ExpirySweep => {
                self.lifecycle.sweep().await;
            }
            TaskKind::LeaderboardRefresh => {
                self.leaderboard.refresh_all_auto(false).await;
            }
            TaskKind::DailyAutoPost => {
                self.leaderboard.post_daily_if_due(self.clock.now()).await;
            }
        }
    }
}

/// Check creation input and return the end time.
fn validate_new_giveaway(
    options: &NewGiveaway,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ValidationError> {
    if options.title.trim().is_empty() {
        return Err(ValidationError::MissingField("title"));
    }
    if options.prize.trim().is_empty() {
        return Err(ValidationError::MissingField("prize"));
    }
    if options.channel_id.trim().is_empty() {
        return Err(ValidationError::MissingField("channel_id"));
    }
    let end_time = options
        .end_time
        .ok_or(ValidationError::MissingField("end_time"))?;
    if end_time <= now {
        return Err(ValidationError::EndTimeInPast);
    }

    let limits = &settings.limits;
    let duration = (end_time - now).num_seconds();
    if duration < limits.min_duration_secs {
        return Err(ValidationError::DurationTooShort {
            min_secs: limits.min_duration_secs,
        });
    }
    if duration > limits.max_duration_secs {
        return Err(ValidationError::DurationTooLong {
            max_secs: limits.max_duration_secs,
        });
    }

    if options.winner_count == 0 || options.winner_count > limits.max_winners {
        return Err(ValidationError::WinnerCount {
            max: limits.max_winners,
        });
    }
    Ok(end_time)
}

fn giveaway_channel(giveaway: &Giveaway) -> String {
    giveaway
        .announcement
        .as_ref()
        .map(|a| a.channel_id.clone())
        .unwrap_or_default()
}

fn announcement_message(giveaway: &Giveaway) -> OutgoingMessage {
    let how_to_enter = if giveaway.is_invite() {
        let min = giveaway.requirements.min_invites;
        if min > 0 {
            format!(
                "Invite friends with your personal link. At least {} validated invites needed; most invites wins.",
                min
            )
        } else {
            "Invite friends with your personal link. Most validated invites wins.".to_string()
        }
    } else {
        "Enter to join the draw.".to_string()
    };

    let mut embed = Embed::new(format!("🎉 {}", giveaway.title))
        .color(ANNOUNCEMENT_COLOR)
        .field("Prize", &giveaway.prize, true)
        .field("Winners", giveaway.winner_count.to_string(), true)
        .field(
            "Ends",
            format!("<t:{}:R>", giveaway.end_time().timestamp()),
            true,
        )
        .field("How to enter", how_to_enter, false)
        .footer(format!("Giveaway ID: {}", giveaway.id))
        .timestamp(giveaway.created_at);
    if !giveaway.description.is_empty() {
        embed = embed.description(&giveaway.description);
    }
    OutgoingMessage::embed(embed)
}
