//! Giveaway lifecycle
//!
//! `active -> ended` is the only transition. The sweep hands every expired
//! active giveaway to [`GiveawayLifecycleManager::end_giveaway`], which is also
//! what an early end goes through. The transition itself happens under the
//! store lock, so a giveaway reaching the end procedure twice is ended once.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::leaderboard::LeaderboardSynchronizer;
use crate::models::{Giveaway, MessageRef};
use crate::notify::NotificationDispatcher;
use crate::platform::ChatPlatform;
use crate::scheduler::Clock;
use crate::store::GiveawayStore;
use crate::winners::WinnerSelector;

/// Ended giveaways whose boards are cleaned per sweep.
pub const STALE_TEARDOWN_BATCH: usize = 5;

pub struct GiveawayLifecycleManager {
    store: Arc<GiveawayStore>,
    platform: Arc<dyn ChatPlatform>,
    leaderboard: Arc<LeaderboardSynchronizer>,
    notifier: Arc<NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
}

impl GiveawayLifecycleManager {
    pub fn new(
        store: Arc<GiveawayStore>,
        platform: Arc<dyn ChatPlatform>,
        leaderboard: Arc<LeaderboardSynchronizer>,
        notifier: Arc<NotificationDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_rng(
            store,
            platform,
            leaderboard,
            notifier,
            clock,
            StdRng::from_entropy(),
        )
    }

    pub fn with_rng(
        store: Arc<GiveawayStore>,
        platform: Arc<dyn ChatPlatform>,
        leaderboard: Arc<LeaderboardSynchronizer>,
        notifier: Arc<NotificationDispatcher>,
        clock: Arc<dyn Clock>,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            platform,
            leaderboard,
            notifier,
            clock,
            rng: Mutex::new(rng),
        }
    }

    /// End every expired giveaway, then clean a batch of leftover boards.
    /// Returns the number of giveaways ended.
    pub async fn sweep(&self) -> usize {
        let due = self.store.due_giveaways(self.clock.now());
        debug!("Expiry sweep: {} giveaways due", due.len());

        let mut ended = 0;
        for id in due {
            if self.end_giveaway(&id).await.is_some() {
                ended += 1;
            }
        }

        self.leaderboard.teardown_stale(STALE_TEARDOWN_BATCH).await;
        ended
    }

    /// Run the end-of-life procedure. Returns the ended giveaway, or `None`
    /// when it is unknown or was already ended.
    pub async fn end_giveaway(&self, id: &str) -> Option<Giveaway> {
        let current = self.store.giveaway(id)?;
        if !current.is_active() {
            return None;
        }

        let counts = self.store.invite_counts(id);
        let winners = WinnerSelector::select(&current, &counts, &mut *self.rng.lock());

        let now = self.clock.now();
        let mut transitioned = false;
        let ended = self
            .store
            .update_giveaway(id, |g| transitioned = g.mark_ended(winners, now))
            .await?;
        if !transitioned {
            return None;
        }
        info!(
            "Giveaway {} ended with {} winner(s): {:?}",
            id,
            ended.winner_ids().len(),
            ended.winner_ids()
        );

        if let Some(MessageRef {
            channel_id,
            message_id: Some(message_id),
        }) = &ended.announcement
        {
            match self.platform.delete_message(channel_id, message_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("Announcement of {} already gone", id),
                Err(e) => warn!("Could not delete announcement of {}: {}", id, e),
            }
        }

        let dm_winners = self.store.settings().notifications.dm_winners;
        let report = self.notifier.announce_end(&ended, dm_winners).await;

        // Point the announcement reference at the result post
        let channel_id = ended.announcement.as_ref().map(|a| a.channel_id.clone());
        let ended = match channel_id {
            Some(channel_id) => self
                .store
                .update_giveaway(id, |g| {
                    g.announcement = Some(MessageRef {
                        channel_id,
                        message_id: report.announcement,
                    })
                })
                .await
                .unwrap_or(ended),
            None => ended,
        };

        self.leaderboard.teardown(id).await;
        self.store.giveaway(id).or(Some(ended))
    }
}
