//! In-memory giveaway state
//!
//! `GiveawayStore` is the only owner of giveaways, invite codes, invite
//! tracking records, invited-user sets and per-giveaway invite counts. Other
//! components read clones or snapshots and write through the methods here.
//! The lock is never held across an `.await`: each mutation changes memory
//! first, then persists what changed. Persistence failures are logged and the
//! in-memory state stays authoritative.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::{Settings, SettingsChange, SettingsPatch};
use crate::error::ValidationError;
use crate::models::{
    Giveaway, GiveawayId, GiveawayStats, InviteCode, InviteTrackingRecord, UserId,
};
use crate::storage::{GiveawayRepository, InviteState};

#[derive(Default)]
struct StoreState {
    giveaways: HashMap<GiveawayId, Giveaway>,
    codes: HashMap<String, InviteCode>,
    tracking: HashMap<UserId, InviteTrackingRecord>,
    /// giveaway -> inviter -> invitees
    invited: HashMap<GiveawayId, HashMap<UserId, BTreeSet<UserId>>>,
    /// giveaway -> user -> validated invites
    counts: HashMap<GiveawayId, HashMap<UserId, u32>>,
    settings: Settings,
}

impl StoreState {
    fn is_invited(&self, giveaway_id: &str, invitee_id: &str) -> bool {
        self.invited
            .get(giveaway_id)
            .map(|by_inviter| by_inviter.values().any(|set| set.contains(invitee_id)))
            .unwrap_or(false)
    }

    fn tracking_mut(&mut self, user_id: &str) -> &mut InviteTrackingRecord {
        self.tracking
            .entry(user_id.to_string())
            .or_insert_with(|| InviteTrackingRecord::new(user_id))
    }
}

/// One row of a rendered leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StandingEntry {
    pub user_id: UserId,
    pub username: Option<String>,
    pub count: u32,
    pub invitees: usize,
}

/// Consistent view of one invite giveaway, taken under a single read lock.
#[derive(Debug, Clone, Serialize)]
pub struct StandingsSnapshot {
    pub giveaway: Giveaway,
    /// Sorted by count, then distinct invitees, both descending.
    pub entries: Vec<StandingEntry>,
    pub active_codes: usize,
    pub total_invitees: usize,
}

impl StandingsSnapshot {
    pub fn average_invites(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let total: u64 = self.entries.iter().map(|e| e.count as u64).sum();
        total as f64 / self.entries.len() as f64
    }
}

/// Outcome of recording a validated invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    Counted { new_count: u32 },
    AlreadyCounted,
    GiveawayClosed,
}

pub struct GiveawayStore {
    state: RwLock<StoreState>,
    repo: Arc<dyn GiveawayRepository>,
}

impl GiveawayStore {
    pub fn new(repo: Arc<dyn GiveawayRepository>, settings: Settings) -> Self {
        Self {
            state: RwLock::new(StoreState {
                settings,
                ..Default::default()
            }),
            repo,
        }
    }

    /// Load everything from the backend. Stored settings replace the ones the
    /// store was created with.
    pub async fn hydrate(&self) -> anyhow::Result<()> {
        let settings = self.repo.load_settings().await?;
        let giveaways = self.repo.load_all_giveaways().await?;
        let invites = self.repo.load_invite_state().await?;

        let mut state = self.state.write();
        if let Some(settings) = settings {
            state.settings = settings;
        }
        state.giveaways = giveaways.into_iter().map(|g| (g.id.clone(), g)).collect();
        apply_invite_state(&mut state, invites);

        info!(
            "Loaded {} giveaways, {} invite codes, {} tracked users from {} storage",
            state.giveaways.len(),
            state.codes.len(),
            state.tracking.len(),
            self.repo.backend_name()
        );
        Ok(())
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn settings(&self) -> Settings {
        self.state.read().settings.clone()
    }

    pub fn giveaway(&self, id: &str) -> Option<Giveaway> {
        self.state.read().giveaways.get(id).cloned()
    }

    /// All giveaways, newest first.
    pub fn giveaways(&self) -> Vec<Giveaway> {
        let mut all: Vec<Giveaway> = self.state.read().giveaways.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub fn active_giveaways(&self) -> Vec<Giveaway> {
        let mut active: Vec<Giveaway> = self
            .state
            .read()
            .giveaways
            .values()
            .filter(|g| g.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|g| g.end_time());
        active
    }

    pub fn active_count(&self) -> usize {
        self.state
            .read()
            .giveaways
            .values()
            .filter(|g| g.is_active())
            .count()
    }

    /// Active giveaways whose end time has passed.
    pub fn due_giveaways(&self, now: DateTime<Utc>) -> Vec<GiveawayId> {
        let mut due: Vec<(DateTime<Utc>, GiveawayId)> = self
            .state
            .read()
            .giveaways
            .values()
            .filter(|g| g.is_active() && g.is_expired(now))
            .map(|g| (g.end_time(), g.id.clone()))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Invite codes that belong to active giveaways.
    pub fn tracked_codes(&self) -> Vec<InviteCode> {
        let state = self.state.read();
        let mut codes: Vec<InviteCode> = state
            .codes
            .values()
            .filter(|c| {
                state
                    .giveaways
                    .get(&c.giveaway_id)
                    .map(Giveaway::is_active)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        codes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.code.cmp(&b.code)));
        codes
    }

    pub fn code_for(&self, owner_id: &str, giveaway_id: &str) -> Option<InviteCode> {
        self.state
            .read()
            .codes
            .values()
            .find(|c| c.owner_id == owner_id && c.giveaway_id == giveaway_id)
            .cloned()
    }

    /// Whether `invitee_id` is already attributed to any inviter.
    pub fn is_invited(&self, giveaway_id: &str, invitee_id: &str) -> bool {
        self.state.read().is_invited(giveaway_id, invitee_id)
    }

    pub fn invite_counts(&self, giveaway_id: &str) -> HashMap<UserId, u32> {
        self.state
            .read()
            .counts
            .get(giveaway_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn invitees_of(&self, giveaway_id: &str, inviter_id: &str) -> BTreeSet<UserId> {
        self.state
            .read()
            .invited
            .get(giveaway_id)
            .and_then(|m| m.get(inviter_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn tracking(&self, user_id: &str) -> Option<InviteTrackingRecord> {
        self.state.read().tracking.get(user_id).cloned()
    }

    pub fn standings(&self, giveaway_id: &str, now: DateTime<Utc>) -> Option<StandingsSnapshot> {
        let state = self.state.read();
        let giveaway = state.giveaways.get(giveaway_id)?.clone();

        let invited = state.invited.get(giveaway_id);
        let mut entries: Vec<StandingEntry> = state
            .counts
            .get(giveaway_id)
            .map(|counts| {
                counts
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(user_id, count)| StandingEntry {
                        user_id: user_id.clone(),
                        username: state.tracking.get(user_id).and_then(|t| t.username.clone()),
                        count: *count,
                        invitees: invited
                            .and_then(|m| m.get(user_id))
                            .map(BTreeSet::len)
                            .unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(b.invitees.cmp(&a.invitees))
                .then(a.user_id.cmp(&b.user_id))
        });

        let active_codes = state
            .codes
            .values()
            .filter(|c| c.giveaway_id == giveaway_id && c.expires_at > now)
            .count();
        let total_invitees = invited
            .map(|m| m.values().map(BTreeSet::len).sum())
            .unwrap_or(0);

        Some(StandingsSnapshot {
            giveaway,
            entries,
            active_codes,
            total_invitees,
        })
    }

    pub fn stats(&self) -> GiveawayStats {
        let state = self.state.read();
        let total = state.giveaways.len();
        let active = state.giveaways.values().filter(|g| g.is_active()).count();

        let total_participants: usize = state
            .giveaways
            .values()
            .map(|g| {
                let entrants = state
                    .counts
                    .get(&g.id)
                    .map(|c| c.values().filter(|n| **n > 0).count())
                    .unwrap_or(0);
                g.participants.len() + entrants
            })
            .sum();
        let total_invites: u64 = state
            .tracking
            .values()
            .map(|t| t.total_invites as u64)
            .sum();

        GiveawayStats {
            total_giveaways: total,
            active_giveaways: active,
            ended_giveaways: total - active,
            total_participants,
            total_invites,
            average_participants: if total == 0 {
                0.0
            } else {
                total_participants as f64 / total as f64
            },
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    pub async fn insert_giveaway(&self, giveaway: Giveaway) {
        self.state
            .write()
            .giveaways
            .insert(giveaway.id.clone(), giveaway.clone());

        if let Err(e) = self.repo.create_giveaway(&giveaway).await {
            error!("Failed to persist new giveaway {}: {}", giveaway.id, e);
        }
    }

    /// Apply `f` to a giveaway and persist the result. Returns the updated
    /// copy, or `None` if the id is unknown.
    pub async fn update_giveaway<F>(&self, id: &str, f: F) -> Option<Giveaway>
    where
        F: FnOnce(&mut Giveaway),
    {
        let updated = {
            let mut state = self.state.write();
            let giveaway = state.giveaways.get_mut(id)?;
            f(giveaway);
            giveaway.clone()
        };

        if let Err(e) = self.repo.update_giveaway(&updated).await {
            error!("Failed to persist giveaway {}: {}", id, e);
        }
        Some(updated)
    }

    /// Add a classic participant. Returns false if already present.
    pub async fn add_participant(&self, giveaway_id: &str, user_id: &str) -> bool {
        let inserted = {
            let mut state = self.state.write();
            match state.giveaways.get_mut(giveaway_id) {
                Some(g) if g.is_active() => g.participants.insert(user_id.to_string()),
                _ => false,
            }
        };

        if inserted {
            if let Err(e) = self.repo.add_participant(giveaway_id, user_id).await {
                error!("Failed to persist participant {} for {}: {}", user_id, giveaway_id, e);
            }
        }
        inserted
    }

    /// Register a freshly created invite code with its owner.
    pub async fn add_invite_code(&self, code: InviteCode, owner_name: Option<String>) {
        let record = {
            let mut state = self.state.write();
            state.codes.insert(code.code.clone(), code.clone());
            let record = state.tracking_mut(&code.owner_id);
            if !record.codes.contains(&code.code) {
                record.codes.push(code.code.clone());
            }
            if owner_name.is_some() {
                record.username = owner_name;
            }
            record.clone()
        };

        if let Err(e) = self.repo.create_invite_code(&code).await {
            error!("Failed to persist invite code {}: {}", code.code, e);
        }
        if let Err(e) = self.repo.update_invite_tracking(&record).await {
            error!("Failed to persist invite tracking for {}: {}", record.user_id, e);
        }
    }

    /// Store an observed use count for a code. Counts never go backwards.
    pub async fn observe_code_uses(&self, code: &str, uses: u32) -> bool {
        let advanced = {
            let mut state = self.state.write();
            state
                .codes
                .get_mut(code)
                .map(|c| c.observe_uses(uses))
                .unwrap_or(false)
        };

        if advanced {
            if let Err(e) = self.repo.update_invite_code_uses(code, uses).await {
                error!("Failed to persist uses for invite {}: {}", code, e);
            }
        }
        advanced
    }

    /// Credit `invitee` to `inviter` in one step: the duplicate check, set
    /// insert, count increment and tracking update happen under one lock.
    pub async fn record_attribution(
        &self,
        giveaway_id: &str,
        inviter_id: &str,
        inviter_name: Option<String>,
        invitee_id: &str,
        invitee_name: &str,
    ) -> Attribution {
        let (new_count, inviter_record, invitee_record) = {
            let mut state = self.state.write();
            match state.giveaways.get(giveaway_id) {
                Some(g) if g.is_active() => {}
                _ => return Attribution::GiveawayClosed,
            }
            if state.is_invited(giveaway_id, invitee_id) {
                return Attribution::AlreadyCounted;
            }

            state
                .invited
                .entry(giveaway_id.to_string())
                .or_default()
                .entry(inviter_id.to_string())
                .or_default()
                .insert(invitee_id.to_string());

            let count = state
                .counts
                .entry(giveaway_id.to_string())
                .or_default()
                .entry(inviter_id.to_string())
                .or_insert(0);
            *count += 1;
            let new_count = *count;

            let inviter = state.tracking_mut(inviter_id);
            inviter.total_invites += 1;
            if inviter_name.is_some() {
                inviter.username = inviter_name;
            }
            let inviter_record = inviter.clone();

            let invitee = state.tracking_mut(invitee_id);
            invitee.username = Some(invitee_name.to_string());
            let invitee_record = invitee.clone();

            (new_count, inviter_record, invitee_record)
        };

        debug!(
            "Credited {} to {} in {} (now {})",
            invitee_id, inviter_id, giveaway_id, new_count
        );

        if let Err(e) = self
            .repo
            .add_invited_user(giveaway_id, inviter_id, invitee_id)
            .await
        {
            error!("Failed to persist invited user {}: {}", invitee_id, e);
        }
        if let Err(e) = self
            .repo
            .update_user_invites(giveaway_id, inviter_id, new_count)
            .await
        {
            error!("Failed to persist invite count for {}: {}", inviter_id, e);
        }
        for record in [&inviter_record, &invitee_record] {
            if let Err(e) = self.repo.update_invite_tracking(record).await {
                error!("Failed to persist invite tracking for {}: {}", record.user_id, e);
            }
        }

        Attribution::Counted { new_count }
    }

    pub async fn update_settings(
        &self,
        patch: SettingsPatch,
    ) -> Result<SettingsChange, ValidationError> {
        let (change, settings) = {
            let mut state = self.state.write();
            let change = state.settings.apply(patch)?;
            (change, state.settings.clone())
        };

        if let Err(e) = self.repo.save_settings(&settings).await {
            error!("Failed to persist settings: {}", e);
        }
        Ok(change)
    }
}

fn apply_invite_state(state: &mut StoreState, invites: InviteState) {
    state.codes = invites
        .codes
        .into_iter()
        .map(|c| (c.code.clone(), c))
        .collect();
    state.tracking = invites
        .tracking
        .into_iter()
        .map(|t| (t.user_id.clone(), t))
        .collect();

    state.invited.clear();
    for (giveaway_id, inviter_id, invitee_id) in invites.invited {
        if state.is_invited(&giveaway_id, &invitee_id) {
            continue;
        }
        state
            .invited
            .entry(giveaway_id)
            .or_default()
            .entry(inviter_id)
            .or_default()
            .insert(invitee_id);
    }

    state.counts.clear();
    for (giveaway_id, user_id, count) in invites.counts {
        state
            .counts
            .entry(giveaway_id)
            .or_default()
            .insert(user_id, count);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{GiveawayKind, NewGiveaway};
    use crate::storage::SqliteRepository;
    use chrono::Duration;

    pub(crate) fn invite_giveaway(id: &str, now: DateTime<Utc>) -> Giveaway {
        Giveaway::new(
            id,
            NewGiveaway {
                title: "Invite race".into(),
                prize: "Nitro".into(),
                kind: GiveawayKind::Invite,
                winner_count: 1,
                channel_id: "announce".into(),
                ..Default::default()
            },
            now + Duration::hours(1),
            now,
        )
    }

    pub(crate) fn memory_store() -> GiveawayStore {
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        GiveawayStore::new(repo, Settings::default())
    }

    #[tokio::test]
    async fn test_attribution_is_idempotent_per_invitee() {
        let store = memory_store();
        let now = Utc::now();
        store.insert_giveaway(invite_giveaway("g1", now)).await;

        let first = store
            .record_attribution("g1", "inviter", None, "x", "xavier")
            .await;
        assert_eq!(first, Attribution::Counted { new_count: 1 });

        // Rejoin and a different inviter both leave the count alone
        let again = store
            .record_attribution("g1", "inviter", None, "x", "xavier")
            .await;
        assert_eq!(again, Attribution::AlreadyCounted);
        let other = store
            .record_attribution("g1", "someone-else", None, "x", "xavier")
            .await;
        assert_eq!(other, Attribution::AlreadyCounted);

        assert_eq!(store.invite_counts("g1").get("inviter"), Some(&1));
        assert_eq!(store.invitees_of("g1", "inviter").len(), 1);
        assert_eq!(store.tracking("inviter").unwrap().total_invites, 1);
        assert_eq!(
            store.tracking("x").unwrap().username.as_deref(),
            Some("xavier")
        );
    }

    #[tokio::test]
    async fn test_attribution_refused_after_end() {
        let store = memory_store();
        let now = Utc::now();
        store.insert_giveaway(invite_giveaway("g1", now)).await;
        store
            .update_giveaway("g1", |g| {
                g.mark_ended(vec![], now);
            })
            .await;

        let result = store.record_attribution("g1", "a", None, "b", "bob").await;
        assert_eq!(result, Attribution::GiveawayClosed);
        assert!(store.invite_counts("g1").is_empty());
    }

    #[tokio::test]
    async fn test_standings_sorted_and_counted() {
        let store = memory_store();
        let now = Utc::now();
        store.insert_giveaway(invite_giveaway("g1", now)).await;
        for invitee in ["a1", "a2", "a3"] {
            store
                .record_attribution("g1", "alice", Some("alice".into()), invitee, invitee)
                .await;
        }
        for invitee in ["b1", "b2"] {
            store
                .record_attribution("g1", "bob", Some("bob".into()), invitee, invitee)
                .await;
        }

        let snapshot = store.standings("g1", now).unwrap();
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries[0].user_id, "alice");
        assert_eq!(snapshot.entries[0].count, 3);
        assert_eq!(snapshot.entries[1].username.as_deref(), Some("bob"));
        assert_eq!(snapshot.total_invitees, 5);
        assert!((snapshot.average_invites() - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_hydrate_restores_state() {
        let repo = Arc::new(SqliteRepository::in_memory().unwrap());
        let now = Utc::now();
        {
            let store = GiveawayStore::new(repo.clone(), Settings::default());
            store.insert_giveaway(invite_giveaway("g1", now)).await;
            store
                .record_attribution("g1", "alice", None, "a1", "a1")
                .await;
            store
                .update_settings(SettingsPatch {
                    refresh_interval_secs: Some(60),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let store = GiveawayStore::new(repo, Settings::default());
        store.hydrate().await.unwrap();
        assert!(store.giveaway("g1").is_some());
        assert!(store.is_invited("g1", "a1"));
        assert_eq!(store.invite_counts("g1").get("alice"), Some(&1));
        assert_eq!(store.settings().leaderboard.refresh_interval_secs, 60);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = memory_store();
        let now = Utc::now();
        store.insert_giveaway(invite_giveaway("g1", now)).await;
        let mut classic = invite_giveaway("g2", now);
        classic.kind = GiveawayKind::Classic;
        store.insert_giveaway(classic).await;
        store.add_participant("g2", "u1").await;
        store.add_participant("g2", "u2").await;
        store.record_attribution("g1", "alice", None, "a1", "a1").await;

        let stats = store.stats();
        assert_eq!(stats.total_giveaways, 2);
        assert_eq!(stats.active_giveaways, 2);
        assert_eq!(stats.total_participants, 3);
        assert_eq!(stats.total_invites, 1);
        assert!((stats.average_participants - 1.5).abs() < 1e-9);
    }
}
