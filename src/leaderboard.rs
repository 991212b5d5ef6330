//! Leaderboard channels
//!
//! Each active invite giveaway can have two mirrors of its standings:
//!
//! - a manual board, created next to the announcement channel on first use,
//!   holding one message that is edited in place
//! - an auto-post board under the configured category, where every refresh
//!   deletes the previous snapshot and posts a fresh timestamped one
//!
//! Stored message and channel references are checked on use. A reference
//! the platform no longer knows is cleared and re-created instead of retried.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::PlatformResult;
use crate::models::{ChannelId, Giveaway, MessageRef};
use crate::platform::{mention, ChatPlatform, Embed, NewChannel, OutgoingMessage};
use crate::scheduler::Clock;
use crate::store::{GiveawayStore, StandingsSnapshot};

const LEADERBOARD_COLOR: u32 = 0xF1C40F;
const CHANNEL_SLUG_MAX: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Board {
    Manual,
    Auto,
}

impl Board {
    fn slot(self, giveaway: &mut Giveaway) -> &mut Option<MessageRef> {
        match self {
            Board::Manual => &mut giveaway.leaderboard,
            Board::Auto => &mut giveaway.auto_leaderboard,
        }
    }

    fn current(self, giveaway: &Giveaway) -> Option<&MessageRef> {
        match self {
            Board::Manual => giveaway.leaderboard.as_ref(),
            Board::Auto => giveaway.auto_leaderboard.as_ref(),
        }
    }
}

pub struct LeaderboardSynchronizer {
    store: Arc<GiveawayStore>,
    platform: Arc<dyn ChatPlatform>,
    clock: Arc<dyn Clock>,
    last_daily_post: Mutex<Option<NaiveDate>>,
}

impl LeaderboardSynchronizer {
    pub fn new(
        store: Arc<GiveawayStore>,
        platform: Arc<dyn ChatPlatform>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            platform,
            clock,
            last_daily_post: Mutex::new(None),
        }
    }

    /// Bring the manual board of one giveaway up to date. Failures are logged.
    pub async fn refresh(&self, giveaway_id: &str) {
        if let Err(e) = self.sync_manual(giveaway_id).await {
            warn!("Manual leaderboard update failed for {}: {}", giveaway_id, e);
        }
    }

    /// Post a new auto-board snapshot for every active invite giveaway.
    /// Returns how many boards were posted.
    pub async fn refresh_all_auto(&self, force: bool) -> usize {
        let mut posted = 0;
        for giveaway in self.store.active_giveaways() {
            if !giveaway.is_invite() {
                continue;
            }
            match self.sync_auto(&giveaway.id, force).await {
                Ok(true) => posted += 1,
                Ok(false) => {}
                Err(e) => warn!("Auto leaderboard update failed for {}: {}", giveaway.id, e),
            }
        }
        debug!("Auto leaderboard pass posted {} boards (force: {})", posted, force);
        posted
    }

    async fn sync_manual(&self, giveaway_id: &str) -> PlatformResult<()> {
        let now = self.clock.now();
        let Some(snapshot) = self.store.standings(giveaway_id, now) else {
            return Ok(());
        };
        let giveaway = &snapshot.giveaway;
        if !giveaway.is_invite() || !giveaway.is_active() {
            return Ok(());
        }

        let max_entries = self.store.settings().leaderboard.max_entries;
        let message = OutgoingMessage::embed(render_standings(&snapshot, max_entries, now));

        let current = Board::Manual.current(giveaway).cloned();
        let channel_id = match &current {
            Some(r) => r.channel_id.clone(),
            None => self.create_manual_channel(giveaway).await?,
        };

        if let Some(message_id) = current.as_ref().and_then(|r| r.message_id.as_deref()) {
            match self
                .platform
                .edit_message(&channel_id, message_id, &message)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => {
                    debug!("Leaderboard message {} is gone, posting a new one", message_id);
                }
                Err(e) => return Err(e),
            }
        }

        self.post_to(giveaway_id, Board::Manual, channel_id, &message)
            .await
            .map(|_| ())
    }

    /// Returns true when a snapshot was posted.
    pub async fn sync_auto(&self, giveaway_id: &str, force: bool) -> PlatformResult<bool> {
        let settings = self.store.settings().leaderboard;
        if !settings.auto_post_enabled {
            return Ok(false);
        }

        let now = self.clock.now();
        let Some(snapshot) = self.store.standings(giveaway_id, now) else {
            return Ok(false);
        };
        let giveaway = &snapshot.giveaway;
        if !giveaway.is_invite() || !giveaway.is_active() {
            return Ok(false);
        }
        if snapshot.entries.is_empty() && !force {
            return Ok(false);
        }

        let topic = auto_topic(&giveaway.title, settings.refresh_interval_secs);
        let current = Board::Auto.current(giveaway).cloned();
        let (channel_id, created) = match &current {
            Some(r) => (r.channel_id.clone(), false),
            None => {
                let channel = NewChannel {
                    name: format!("live-{}", channel_slug(giveaway)),
                    topic: Some(topic.clone()),
                    parent_id: settings.auto_post_category_id.clone(),
                };
                let id = self.platform.create_channel(&channel).await?;
                info!("Created auto leaderboard channel {} for {}", id, giveaway_id);
                self.set_ref(giveaway_id, Board::Auto, Some(MessageRef::channel(id.clone())))
                    .await;
                (id, true)
            }
        };

        if let Some(message_id) = current.as_ref().and_then(|r| r.message_id.as_deref()) {
            match self.platform.delete_message(&channel_id, message_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Could not delete old snapshot {}: {}", message_id, e),
            }
        }

        let message = OutgoingMessage::embed(render_standings(
            &snapshot,
            settings.max_entries,
            now,
        ))
        .with_content(format!("Snapshot at {}", now.format("%Y-%m-%d %H:%M UTC")));

        if !self
            .post_to(giveaway_id, Board::Auto, channel_id.clone(), &message)
            .await?
        {
            return Ok(false);
        }

        if force && !created {
            if let Err(e) = self.platform.set_channel_topic(&channel_id, &topic).await {
                warn!("Could not update topic of {}: {}", channel_id, e);
            }
        }
        Ok(true)
    }

    /// Send `message` as the board's message. A missing channel clears the
    /// reference so the next pass re-creates it; returns false in that case.
    async fn post_to(
        &self,
        giveaway_id: &str,
        board: Board,
        channel_id: ChannelId,
        message: &OutgoingMessage,
    ) -> PlatformResult<bool> {
        match self.platform.send_message(&channel_id, message).await {
            Ok(message_id) => {
                let reference = MessageRef {
                    channel_id,
                    message_id: Some(message_id),
                };
                self.set_ref(giveaway_id, board, Some(reference)).await;
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                warn!(
                    "Leaderboard channel {} for {} no longer exists, clearing it",
                    channel_id, giveaway_id
                );
                self.set_ref(giveaway_id, board, None).await;
                Ok(false)
            }
            Err(e) => {
                self.set_ref(giveaway_id, board, Some(MessageRef::channel(channel_id)))
                    .await;
                Err(e)
            }
        }
    }

    async fn create_manual_channel(&self, giveaway: &Giveaway) -> PlatformResult<ChannelId> {
        // Sit next to the announcement channel when it lives in a category
        let parent_id = match &giveaway.announcement {
            Some(announcement) => self
                .platform
                .fetch_channel(&announcement.channel_id)
                .await
                .ok()
                .and_then(|c| c.parent_id),
            None => None,
        };

        let channel = NewChannel {
            name: format!("leaderboard-{}", channel_slug(giveaway)),
            topic: Some(format!("Invite standings for {}", giveaway.title)),
            parent_id,
        };
        let id = self.platform.create_channel(&channel).await?;
        info!("Created leaderboard channel {} for {}", id, giveaway.id);
        self.set_ref(&giveaway.id, Board::Manual, Some(MessageRef::channel(id.clone())))
            .await;
        Ok(id)
    }

    async fn set_ref(&self, giveaway_id: &str, board: Board, reference: Option<MessageRef>) {
        self.store
            .update_giveaway(giveaway_id, |g| *board.slot(g) = reference)
            .await;
    }

    /// Delete both boards of a giveaway and forget them. The references are
    /// cleared even when deletion fails.
    pub async fn teardown(&self, giveaway_id: &str) {
        let Some(giveaway) = self.store.giveaway(giveaway_id) else {
            return;
        };
        if giveaway.leaderboard.is_none() && giveaway.auto_leaderboard.is_none() {
            return;
        }

        for reference in [&giveaway.leaderboard, &giveaway.auto_leaderboard]
            .into_iter()
            .flatten()
        {
            match self.platform.delete_channel(&reference.channel_id).await {
                Ok(()) => info!("Deleted leaderboard channel {}", reference.channel_id),
                Err(e) if e.is_not_found() => {
                    debug!("Leaderboard channel {} already gone", reference.channel_id)
                }
                Err(e) => warn!(
                    "Failed to delete leaderboard channel {}: {}",
                    reference.channel_id, e
                ),
            }
        }

        self.store
            .update_giveaway(giveaway_id, |g| {
                g.leaderboard = None;
                g.auto_leaderboard = None;
            })
            .await;
    }

    /// Tear down boards left behind by ended giveaways, at most `limit`.
    pub async fn teardown_stale(&self, limit: usize) -> usize {
        let stale: Vec<String> = self
            .store
            .giveaways()
            .into_iter()
            .filter(|g| !g.is_active())
            .filter(|g| g.leaderboard.is_some() || g.auto_leaderboard.is_some())
            .take(limit)
            .map(|g| g.id)
            .collect();

        for id in &stale {
            self.teardown(id).await;
        }
        if !stale.is_empty() {
            info!("Cleaned up leaderboards of {} ended giveaways", stale.len());
        }
        stale.len()
    }

    /// Force every auto board once per day at the configured minute.
    pub async fn post_daily_if_due(&self, now: DateTime<Utc>) -> bool {
        let Some(at) = self.store.settings().leaderboard.daily_post_at() else {
            return false;
        };
        if now.hour() != at.hour() || now.minute() != at.minute() {
            return false;
        }

        let today = now.date_naive();
        {
            let mut last = self.last_daily_post.lock();
            if *last == Some(today) {
                return false;
            }
            *last = Some(today);
        }

        let posted = self.refresh_all_auto(true).await;
        info!("Daily leaderboard post: {} boards", posted);
        true
    }
}

/// Render standings as an embed. Entrants and averages always cover the
/// full standings even when the list is cut at `max_entries`.
pub fn render_standings(
    snapshot: &StandingsSnapshot,
    max_entries: usize,
    now: DateTime<Utc>,
) -> Embed {
    let giveaway = &snapshot.giveaway;
    let min_invites = giveaway.requirements.min_invites;

    let mut lines: Vec<String> = snapshot
        .entries
        .iter()
        .take(max_entries)
        .enumerate()
        .map(|(i, entry)| {
            let marker = if entry.count >= min_invites { "✅" } else { "⏳" };
            let name = entry
                .username
                .clone()
                .unwrap_or_else(|| mention(&entry.user_id));
            format!(
                "{} **#{}** {} · {} invites ({} unique)",
                marker,
                i + 1,
                name,
                entry.count,
                entry.invitees
            )
        })
        .collect();

    if lines.is_empty() {
        lines.push("No validated invites yet. Share your invite link to climb the board!".to_string());
    } else if snapshot.entries.len() > max_entries {
        lines.push(format!("…and {} more", snapshot.entries.len() - max_entries));
    }

    let remaining = giveaway.seconds_remaining(now);
    Embed::new(format!("🏆 Invite Leaderboard: {}", giveaway.title))
        .description(lines.join("\n"))
        .color(LEADERBOARD_COLOR)
        .field("Prize", &giveaway.prize, true)
        .field("Entrants", snapshot.entries.len().to_string(), true)
        .field("Minimum invites", min_invites.to_string(), true)
        .field("Active invite links", snapshot.active_codes.to_string(), true)
        .field("Total invitees", snapshot.total_invitees.to_string(), true)
        .field(
            "Average invites",
            format!("{:.1}", snapshot.average_invites()),
            true,
        )
        .footer(format!(
            "Ends in {}h {}m",
            remaining / 3600,
            (remaining % 3600) / 60
        ))
        .timestamp(now)
}

pub fn auto_topic(title: &str, interval_secs: u64) -> String {
    format!(
        "Live invite standings for {}. Refreshes every {}.",
        title,
        describe_interval(interval_secs)
    )
}

fn describe_interval(secs: u64) -> String {
    match secs {
        1 => "second".to_string(),
        s if s < 60 => format!("{} seconds", s),
        60 => "minute".to_string(),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        s => format!("{}m {}s", s / 60, s % 60),
    }
}

fn channel_slug(giveaway: &Giveaway) -> String {
    let mut slug = String::new();
    for c in giveaway.title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= CHANNEL_SLUG_MAX {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        giveaway.id.chars().take(8).collect()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingsPatch;
    use crate::platform::mock::MockPlatform;
    use crate::scheduler::ManualClock;
    use crate::store::tests::{invite_giveaway, memory_store};
    use chrono::{Duration, TimeZone};

    struct Fixture {
        store: Arc<GiveawayStore>,
        platform: Arc<MockPlatform>,
        clock: Arc<ManualClock>,
        sync: LeaderboardSynchronizer,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
        let store = Arc::new(memory_store());
        let platform = Arc::new(MockPlatform::new());
        platform.add_channel("announce", Some("events-category"));

        let mut giveaway = invite_giveaway("g1", clock.now());
        giveaway.title = "Spring Nitro Drop".into();
        giveaway.announcement = Some(MessageRef {
            channel_id: "announce".into(),
            message_id: Some("m0".into()),
        });
        store.insert_giveaway(giveaway).await;

        let sync = LeaderboardSynchronizer::new(store.clone(), platform.clone(), clock.clone());
        Fixture {
            store,
            platform,
            clock,
            sync,
        }
    }

    #[tokio::test]
    async fn test_manual_board_created_then_edited() {
        let f = fixture().await;
        f.store.record_attribution("g1", "alice", Some("alice".into()), "x", "x").await;

        f.sync.refresh("g1").await;
        let board = f.store.giveaway("g1").unwrap().leaderboard.unwrap();
        let info = f.platform.fetch_channel(&board.channel_id).await.unwrap();
        assert_eq!(info.parent_id.as_deref(), Some("events-category"));
        assert!(info.name.starts_with("leaderboard-spring-nitro-drop"));
        assert_eq!(f.platform.sent_to(&board.channel_id).len(), 1);

        f.store.record_attribution("g1", "alice", None, "y", "y").await;
        f.sync.refresh("g1").await;
        assert_eq!(f.platform.sent_to(&board.channel_id).len(), 1);
        assert_eq!(f.platform.state.lock().edits.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_board_reposts_when_message_is_gone() {
        let f = fixture().await;
        f.sync.refresh("g1").await;
        let first = f.store.giveaway("g1").unwrap().leaderboard.unwrap();
        let first_id = first.message_id.clone().unwrap();

        f.platform.state.lock().live_messages.remove(&first_id);
        f.sync.refresh("g1").await;

        let second = f.store.giveaway("g1").unwrap().leaderboard.unwrap();
        assert_eq!(second.channel_id, first.channel_id);
        assert_ne!(second.message_id, Some(first_id));
    }

    #[tokio::test]
    async fn test_auto_board_skips_empty_unless_forced() {
        let f = fixture().await;
        assert_eq!(f.sync.refresh_all_auto(false).await, 0);
        assert!(f.store.giveaway("g1").unwrap().auto_leaderboard.is_none());

        assert_eq!(f.sync.refresh_all_auto(true).await, 1);
        let board = f.store.giveaway("g1").unwrap().auto_leaderboard.unwrap();
        assert!(f
            .platform
            .topic(&board.channel_id)
            .unwrap()
            .contains("30 seconds"));
    }

    #[tokio::test]
    async fn test_auto_board_replaces_previous_snapshot() {
        let f = fixture().await;
        f.store.record_attribution("g1", "alice", None, "x", "x").await;

        assert!(f.sync.sync_auto("g1", false).await.unwrap());
        let first = f.store.giveaway("g1").unwrap().auto_leaderboard.unwrap();

        f.clock.advance(Duration::seconds(30));
        assert!(f.sync.sync_auto("g1", false).await.unwrap());
        let second = f.store.giveaway("g1").unwrap().auto_leaderboard.unwrap();

        assert_eq!(first.channel_id, second.channel_id);
        let deleted = f.platform.state.lock().deleted_messages.clone();
        assert_eq!(deleted, vec![first.message_id.unwrap()]);
        assert_eq!(f.platform.sent_to(&second.channel_id).len(), 2);
    }

    #[tokio::test]
    async fn test_forced_refresh_updates_topic() {
        let f = fixture().await;
        f.store.record_attribution("g1", "alice", None, "x", "x").await;
        f.sync.refresh_all_auto(false).await;
        let board = f.store.giveaway("g1").unwrap().auto_leaderboard.unwrap();

        f.store
            .update_settings(SettingsPatch {
                refresh_interval_secs: Some(120),
                ..Default::default()
            })
            .await
            .unwrap();
        f.sync.refresh_all_auto(true).await;
        assert!(f
            .platform
            .topic(&board.channel_id)
            .unwrap()
            .contains("2 minutes"));
    }

    #[tokio::test]
    async fn test_teardown_clears_refs_even_if_channel_missing() {
        let f = fixture().await;
        f.sync.refresh("g1").await;
        f.sync.refresh_all_auto(true).await;
        let g = f.store.giveaway("g1").unwrap();
        let manual = g.leaderboard.unwrap().channel_id;
        let auto = g.auto_leaderboard.unwrap().channel_id;

        // Someone removed the manual board by hand
        f.platform.state.lock().channels.remove(&manual);

        f.sync.teardown("g1").await;
        let g = f.store.giveaway("g1").unwrap();
        assert!(g.leaderboard.is_none());
        assert!(g.auto_leaderboard.is_none());
        assert!(!f.platform.has_channel(&auto));
    }

    #[tokio::test]
    async fn test_stale_teardown_is_batched() {
        let f = fixture().await;
        let now = f.clock.now();
        for i in 0..7 {
            let mut g = invite_giveaway(&format!("old{}", i), now);
            g.leaderboard = Some(MessageRef::channel(format!("board{}", i)));
            g.mark_ended(vec![], now);
            f.store.insert_giveaway(g).await;
        }

        assert_eq!(f.sync.teardown_stale(5).await, 5);
        assert_eq!(f.sync.teardown_stale(5).await, 2);
        assert_eq!(f.sync.teardown_stale(5).await, 0);
    }

    #[tokio::test]
    async fn test_daily_post_once_per_day() {
        let f = fixture().await;
        f.store
            .update_settings(SettingsPatch {
                daily_post_time: Some("09:30".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 10).unwrap();
        assert!(!f.sync.post_daily_if_due(at - Duration::minutes(1)).await);
        assert!(f.sync.post_daily_if_due(at).await);
        assert!(!f.sync.post_daily_if_due(at + Duration::seconds(20)).await);
        assert!(f.sync.post_daily_if_due(at + Duration::days(1)).await);
        assert!(f.store.giveaway("g1").unwrap().auto_leaderboard.is_some());
    }

    #[test]
    fn test_render_marks_eligibility_and_counts_everyone() {
        let now = Utc::now();
        let mut giveaway = invite_giveaway("g1", now);
        giveaway.requirements.min_invites = 2;
        let snapshot = StandingsSnapshot {
            giveaway,
            entries: vec![
                crate::store::StandingEntry {
                    user_id: "a".into(),
                    username: Some("alice".into()),
                    count: 3,
                    invitees: 3,
                },
                crate::store::StandingEntry {
                    user_id: "b".into(),
                    username: None,
                    count: 1,
                    invitees: 1,
                },
            ],
            active_codes: 2,
            total_invitees: 4,
        };

        let embed = render_standings(&snapshot, 1, now);
        let description = embed.description.unwrap();
        assert!(description.contains("✅ **#1** alice · 3 invites (3 unique)"));
        assert!(description.contains("…and 1 more"));
        let entrants = embed.fields.iter().find(|f| f.name == "Entrants").unwrap();
        assert_eq!(entrants.value, "2");
    }

    #[test]
    fn test_describe_interval() {
        assert_eq!(describe_interval(10), "10 seconds");
        assert_eq!(describe_interval(60), "minute");
        assert_eq!(describe_interval(300), "5 minutes");
        assert_eq!(describe_interval(90), "1m 30s");
    }
}
