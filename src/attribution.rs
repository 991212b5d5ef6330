//! Invite attribution
//!
//! Correlates a member-joined event with the invite code that was used by
//! diffing the platform's per-code use counters against the last values we
//! saw. The fetch, compare and update steps run under one async lock so two
//! interleaved joins can never both claim the same increment.
//!
//! Every join is also kept in a short [`JoinLog`] so the join-rate check sees
//! the newest arrivals even when the platform lists members in another order.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::anticheat::{AntiCheatValidator, RejectReason, ValidationContext, Verdict};
use crate::leaderboard::LeaderboardSynchronizer;
use crate::models::{GiveawayId, InviteCode, UserId};
use crate::platform::{ChatPlatform, InviteUsage, Member};
use crate::scheduler::Clock;
use crate::store::{Attribution, GiveawayStore};

/// Members fetched for the join-rate check.
const RECENT_MEMBER_LIMIT: usize = 100;

/// Upper bound on joins kept in memory, whatever the window.
const MAX_LOGGED_JOINS: usize = 1000;

/// Guild joins seen by this process, oldest first.
#[derive(Default)]
pub struct JoinLog {
    joins: parking_lot::Mutex<VecDeque<Member>>,
}

impl JoinLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a join and forget the ones older than `window`.
    pub fn record(&self, member: &Member, now: DateTime<Utc>, window: Duration) {
        let mut entry = member.clone();
        entry.joined_at.get_or_insert(now);

        let mut joins = self.joins.lock();
        joins.retain(|m| m.id != entry.id);
        joins.push_back(entry);
        let since = now - window;
        joins.retain(|m| matches!(m.joined_at, Some(at) if at > since));
        while joins.len() > MAX_LOGGED_JOINS {
            joins.pop_front();
        }
    }

    /// Platform-reported members plus logged joins the platform did not list.
    pub fn merge_into(&self, mut fetched: Vec<Member>) -> Vec<Member> {
        let known: HashSet<UserId> = fetched.iter().map(|m| m.id.clone()).collect();
        let joins = self.joins.lock();
        fetched.extend(joins.iter().filter(|m| !known.contains(&m.id)).cloned());
        fetched
    }

    pub fn len(&self) -> usize {
        self.joins.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributionOutcome {
    /// Counted toward the inviter.
    Credited {
        giveaway_id: GiveawayId,
        inviter_id: UserId,
        count: u32,
    },
    Rejected {
        giveaway_id: GiveawayId,
        inviter_id: UserId,
        reason: RejectReason,
    },
    /// No tracked code moved by exactly one.
    Unattributed,
    /// The platform could not be queried; the event is dropped.
    Dropped,
}

pub struct InviteAttributionEngine {
    store: Arc<GiveawayStore>,
    platform: Arc<dyn ChatPlatform>,
    leaderboard: Arc<LeaderboardSynchronizer>,
    clock: Arc<dyn Clock>,
    joins: JoinLog,
    guard: Mutex<()>,
}

impl InviteAttributionEngine {
    pub fn new(
        store: Arc<GiveawayStore>,
        platform: Arc<dyn ChatPlatform>,
        leaderboard: Arc<LeaderboardSynchronizer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            platform,
            leaderboard,
            clock,
            joins: JoinLog::new(),
            guard: Mutex::new(()),
        }
    }

    pub async fn handle_join(&self, invitee: &Member) -> AttributionOutcome {
        let window = Duration::seconds(self.store.settings().anti_cheat.join_rate_window_secs);
        self.joins.record(invitee, self.clock.now(), window);

        let outcome = {
            let _guard = self.guard.lock().await;
            self.attribute(invitee).await
        };

        if let AttributionOutcome::Credited { giveaway_id, .. } = &outcome {
            self.leaderboard.refresh(giveaway_id).await;
        }
        outcome
    }

    async fn attribute(&self, invitee: &Member) -> AttributionOutcome {
        let usages = match self.platform.fetch_invites().await {
            Ok(usages) => usages,
            Err(e) => {
                warn!("Could not fetch invites for join of {}: {}", invitee.id, e);
                return AttributionOutcome::Dropped;
            }
        };

        let Some(code) = self.match_code(&usages).await else {
            debug!("Join of {} matched no tracked invite", invitee.id);
            return AttributionOutcome::Unattributed;
        };

        let Some(giveaway) = self.store.giveaway(&code.giveaway_id) else {
            return AttributionOutcome::Unattributed;
        };

        let recent = match self.platform.fetch_recent_members(RECENT_MEMBER_LIMIT).await {
            Ok(recent) => self.joins.merge_into(recent),
            Err(e) => {
                warn!("Could not fetch recent members for join of {}: {}", invitee.id, e);
                return AttributionOutcome::Dropped;
            }
        };

        let settings = self.store.settings();
        let validator = AntiCheatValidator::for_giveaway(&settings.anti_cheat, &giveaway);
        let ctx = ValidationContext {
            invitee,
            inviter_id: &code.owner_id,
            giveaway: &giveaway,
            already_invited: self.store.is_invited(&giveaway.id, &invitee.id),
            recent_joins: &recent,
            now: self.clock.now(),
        };

        if let Verdict::Reject(reason) = validator.validate(&ctx) {
            info!(
                "Rejected invite of {} by {} for {}: {}",
                invitee.id, code.owner_id, giveaway.id, reason
            );
            return AttributionOutcome::Rejected {
                giveaway_id: giveaway.id,
                inviter_id: code.owner_id,
                reason,
            };
        }

        let inviter_name = match self.store.tracking(&code.owner_id).and_then(|t| t.username) {
            Some(name) => Some(name),
            None => self
                .platform
                .fetch_member(&code.owner_id)
                .await
                .map(|m| m.username)
                .ok(),
        };

        match self
            .store
            .record_attribution(
                &giveaway.id,
                &code.owner_id,
                inviter_name,
                &invitee.id,
                &invitee.username,
            )
            .await
        {
            Attribution::Counted { new_count } => {
                info!(
                    "Credited {} to {} in {} ({} invites)",
                    invitee.id, code.owner_id, giveaway.id, new_count
                );
                AttributionOutcome::Credited {
                    giveaway_id: giveaway.id,
                    inviter_id: code.owner_id,
                    count: new_count,
                }
            }
            Attribution::AlreadyCounted => AttributionOutcome::Rejected {
                giveaway_id: giveaway.id,
                inviter_id: code.owner_id,
                reason: RejectReason::Duplicate,
            },
            Attribution::GiveawayClosed => AttributionOutcome::Unattributed,
        }
    }

    /// Find the first tracked code whose uses went up by exactly one, and
    /// record every observed increase so it is not processed twice.
    async fn match_code(&self, usages: &[InviteUsage]) -> Option<InviteCode> {
        let mut matched = None;
        for code in self.store.tracked_codes() {
            let Some(usage) = usages.iter().find(|u| u.code == code.code) else {
                continue;
            };
            if usage.uses <= code.uses {
                continue;
            }
            if matched.is_none() && usage.uses == code.uses + 1 {
                matched = Some(code.clone());
            }
            self.store.observe_code_uses(&code.code, usage.uses).await;
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageRef, Requirements};
    use crate::platform::mock::MockPlatform;
    use crate::scheduler::ManualClock;
    use crate::store::tests::{invite_giveaway, memory_store};
    use chrono::{DateTime, Duration, Utc};

    struct Fixture {
        store: Arc<GiveawayStore>,
        platform: Arc<MockPlatform>,
        clock: Arc<ManualClock>,
        engine: InviteAttributionEngine,
        now: DateTime<Utc>,
    }

    async fn fixture() -> Fixture {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let store = Arc::new(memory_store());
        let platform = Arc::new(MockPlatform::new());
        platform.add_channel("announce", None);

        let mut giveaway = invite_giveaway("g1", now);
        giveaway.announcement = Some(MessageRef::channel("announce"));
        store.insert_giveaway(giveaway).await;

        for (code, owner) in [("codeA", "alice"), ("codeB", "bob")] {
            store
                .add_invite_code(
                    InviteCode {
                        code: code.into(),
                        owner_id: owner.into(),
                        giveaway_id: "g1".into(),
                        uses: 0,
                        max_uses: 100,
                        expires_at: now + Duration::hours(1),
                        created_at: now,
                    },
                    Some(owner.into()),
                )
                .await;
            platform.set_invite_uses(code, 0);
        }

        let leaderboard = Arc::new(LeaderboardSynchronizer::new(
            store.clone(),
            platform.clone(),
            clock.clone(),
        ));
        let engine = InviteAttributionEngine::new(
            store.clone(),
            platform.clone(),
            leaderboard,
            clock.clone(),
        );
        Fixture {
            store,
            platform,
            clock,
            engine,
            now,
        }
    }

    fn newcomer(id: &str, name: &str, now: DateTime<Utc>) -> Member {
        Member {
            id: id.into(),
            username: name.into(),
            created_at: now - Duration::days(400),
            joined_at: Some(now),
            avatar: Some("a1b2".into()),
            bot: false,
            roles: vec![],
            mfa_enabled: None,
            verified: None,
        }
    }

    #[tokio::test]
    async fn test_join_credits_inviter_and_updates_board() {
        let f = fixture().await;
        f.platform.set_invite_uses("codeB", 1);

        let outcome = f.engine.handle_join(&newcomer("x", "xavier", f.now)).await;
        assert_eq!(
            outcome,
            AttributionOutcome::Credited {
                giveaway_id: "g1".into(),
                inviter_id: "bob".into(),
                count: 1
            }
        );
        assert_eq!(f.store.invite_counts("g1").get("bob"), Some(&1));
        assert!(f.store.giveaway("g1").unwrap().leaderboard.is_some());
    }

    #[tokio::test]
    async fn test_self_invite_changes_nothing_but_last_seen() {
        let f = fixture().await;
        f.platform.set_invite_uses("codeA", 1);

        let outcome = f.engine.handle_join(&newcomer("alice", "alice", f.now)).await;
        assert!(matches!(
            outcome,
            AttributionOutcome::Rejected {
                reason: RejectReason::SelfInvite,
                ..
            }
        ));
        assert!(f.store.invite_counts("g1").is_empty());
        assert_eq!(f.store.code_for("alice", "g1").unwrap().uses, 1);
    }

    #[tokio::test]
    async fn test_rejoin_counts_once() {
        let f = fixture().await;
        let x = newcomer("x", "xavier", f.now);

        f.platform.set_invite_uses("codeA", 1);
        f.engine.handle_join(&x).await;
        f.platform.set_invite_uses("codeA", 2);
        let outcome = f.engine.handle_join(&x).await;

        assert!(matches!(
            outcome,
            AttributionOutcome::Rejected {
                reason: RejectReason::Duplicate,
                ..
            }
        ));
        assert_eq!(f.store.invite_counts("g1").get("alice"), Some(&1));
        assert_eq!(f.store.invitees_of("g1", "alice").len(), 1);
    }

    #[tokio::test]
    async fn test_jump_of_more_than_one_is_not_attributed() {
        let f = fixture().await;
        f.platform.set_invite_uses("codeA", 3);

        let outcome = f.engine.handle_join(&newcomer("x", "xavier", f.now)).await;
        assert_eq!(outcome, AttributionOutcome::Unattributed);
        // The jump is still recorded so it is not replayed later
        assert_eq!(f.store.code_for("alice", "g1").unwrap().uses, 3);
    }

    #[tokio::test]
    async fn test_platform_failure_drops_event() {
        let f = fixture().await;
        f.platform.set_invite_uses("codeA", 1);
        f.platform.state.lock().fail_invites = true;

        let outcome = f.engine.handle_join(&newcomer("x", "xavier", f.now)).await;
        assert_eq!(outcome, AttributionOutcome::Dropped);
        assert_eq!(f.store.code_for("alice", "g1").unwrap().uses, 0);
    }

    #[tokio::test]
    async fn test_scenario_three_beats_two() {
        let f = fixture().await;
        f.store
            .update_giveaway("g1", |g| {
                g.requirements = Requirements {
                    min_invites: 2,
                    ..Default::default()
                }
            })
            .await;

        let mut uses_a = 0;
        let mut uses_b = 0;
        for (i, name) in ["ada", "ben", "cyd", "dot", "eve"].iter().enumerate() {
            let code = if i < 3 {
                uses_a += 1;
                f.platform.set_invite_uses("codeA", uses_a);
                "A"
            } else {
                uses_b += 1;
                f.platform.set_invite_uses("codeB", uses_b);
                "B"
            };
            // Spaced out so the join-rate guard stays quiet
            f.clock.advance(Duration::minutes(6));
            let outcome = f
                .engine
                .handle_join(&newcomer(&format!("new{}", i), name, f.clock.now()))
                .await;
            assert!(
                matches!(outcome, AttributionOutcome::Credited { .. }),
                "join via code {} was {:?}",
                code,
                outcome
            );
        }

        let counts = f.store.invite_counts("g1");
        assert_eq!(counts.get("alice"), Some(&3));
        assert_eq!(counts.get("bob"), Some(&2));
    }

    #[tokio::test]
    async fn test_interleaved_joins_claim_one_increment() {
        let f = fixture().await;
        f.platform.state.lock().yield_calls = true;
        f.platform.set_invite_uses("codeA", 1);

        let x = newcomer("x", "xavier", f.now);
        let y = newcomer("y", "yvonne", f.now);
        let (first, second) = tokio::join!(f.engine.handle_join(&x), f.engine.handle_join(&y));

        let credited = [&first, &second]
            .iter()
            .filter(|o| matches!(o, AttributionOutcome::Credited { .. }))
            .count();
        assert_eq!(credited, 1, "outcomes: {:?} / {:?}", first, second);
        assert_eq!(f.store.invite_counts("g1").get("alice"), Some(&1));
        assert_eq!(f.store.invitees_of("g1", "alice").len(), 1);
    }

    #[tokio::test]
    async fn test_logged_joins_trigger_join_rate_guard() {
        let f = fixture().await;
        // The platform reports no recent members at all
        assert!(f.platform.state.lock().recent.is_empty());

        for name in ["ana", "bea", "cleo", "dina"] {
            let outcome = f.engine.handle_join(&newcomer(name, name, f.now)).await;
            assert_eq!(outcome, AttributionOutcome::Unattributed);
        }

        f.platform.set_invite_uses("codeA", 1);
        let outcome = f.engine.handle_join(&newcomer("x", "xavier", f.now)).await;
        assert!(matches!(
            outcome,
            AttributionOutcome::Rejected {
                reason: RejectReason::JoinBurst { joins: 4, .. },
                ..
            }
        ));
        assert!(f.store.invite_counts("g1").is_empty());
    }

    #[test]
    fn test_join_log_prunes_and_merges() {
        let now = Utc::now();
        let window = Duration::minutes(5);
        let log = JoinLog::new();

        log.record(&newcomer("old", "olga", now - Duration::minutes(10)), now, window);
        assert!(log.is_empty());

        log.record(&newcomer("a", "ana", now), now, window);
        log.record(&newcomer("a", "ana", now), now, window);
        assert_eq!(log.len(), 1);

        let merged = log.merge_into(vec![newcomer("a", "ana", now), newcomer("b", "bea", now)]);
        let ids: Vec<&str> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        let merged = log.merge_into(Vec::new());
        assert_eq!(merged.len(), 1);
    }
}
