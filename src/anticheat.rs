//! Anti-cheat validation for invite attribution
//!
//! A pure decision over a prospective invitee and its context. Checks run in a
//! fixed order and stop at the first rejection:
//!
//! 1. Self-invite
//! 2. Bot account (policy)
//! 3. Account age below the minimum (policy)
//! 4. Invitee already attributed in this giveaway
//! 5. Throwaway-looking username (policy)
//! 6. Missing avatar when the giveaway requires one
//! 7. Suspicion score for very young accounts without an avatar (policy)
//! 8. Burst of guild joins in the trailing window (policy)
//!
//! Self-invites, duplicates and giveaway requirements always apply. The
//! remaining heuristics are skipped when the policy is disabled.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::AntiCheatPolicy;
use crate::models::Giveaway;
use crate::platform::Member;

const SUSPICIOUS_WORDS: [&str; 3] = ["test", "alt", "fake"];
const SHORT_PREFIX_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    SelfInvite,
    Bot,
    AccountTooYoung { age_days: i64, min_days: u32 },
    Duplicate,
    SuspiciousUsername { pattern: &'static str },
    MissingAvatar,
    Suspicious { score: u32, threshold: u32 },
    JoinBurst { joins: usize, window_secs: i64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::SelfInvite => write!(f, "self-invite"),
            RejectReason::Bot => write!(f, "bot account"),
            RejectReason::AccountTooYoung { age_days, min_days } => write!(
                f,
                "account is {} days old (minimum {})",
                age_days, min_days
            ),
            RejectReason::Duplicate => write!(f, "already counted for this giveaway"),
            RejectReason::SuspiciousUsername { pattern } => {
                write!(f, "suspicious username ({})", pattern)
            }
            RejectReason::MissingAvatar => write!(f, "no avatar but the giveaway requires one"),
            RejectReason::Suspicious { score, threshold } => write!(
                f,
                "new account without avatar (suspicion score {} >= {})",
                score, threshold
            ),
            RejectReason::JoinBurst { joins, window_secs } => write!(
                f,
                "{} other joins in the last {}s, likely coordinated alts",
                joins, window_secs
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Everything the validator looks at for one join.
pub struct ValidationContext<'a> {
    pub invitee: &'a Member,
    pub inviter_id: &'a str,
    pub giveaway: &'a Giveaway,
    /// Invitee is already attributed to some inviter in this giveaway.
    pub already_invited: bool,
    /// Recently joined guild members, as reported by the platform.
    pub recent_joins: &'a [Member],
    pub now: DateTime<Utc>,
}

pub struct AntiCheatValidator {
    policy: AntiCheatPolicy,
}

impl AntiCheatValidator {
    /// Build a validator from the global policy and the giveaway's override.
    pub fn for_giveaway(global: &AntiCheatPolicy, giveaway: &Giveaway) -> Self {
        Self {
            policy: global.with_override(giveaway.anti_cheat.as_ref()),
        }
    }

    pub fn new(policy: AntiCheatPolicy) -> Self {
        Self { policy }
    }

    pub fn validate(&self, ctx: &ValidationContext<'_>) -> Verdict {
        match self.first_rejection(ctx) {
            Some(reason) => Verdict::Reject(reason),
            None => Verdict::Accept,
        }
    }

    fn first_rejection(&self, ctx: &ValidationContext<'_>) -> Option<RejectReason> {
        let invitee = ctx.invitee;
        let heuristics = self.policy.enabled;

        if invitee.id == ctx.inviter_id {
            return Some(RejectReason::SelfInvite);
        }

        if heuristics && self.policy.block_bots && invitee.bot {
            return Some(RejectReason::Bot);
        }

        let age = invitee.account_age(ctx.now);
        if heuristics && age < Duration::days(self.policy.min_account_age_days as i64) {
            return Some(RejectReason::AccountTooYoung {
                age_days: age.num_days(),
                min_days: self.policy.min_account_age_days,
            });
        }

        if ctx.already_invited {
            return Some(RejectReason::Duplicate);
        }

        if heuristics {
            if let Some(pattern) = suspicious_username(&invitee.username) {
                return Some(RejectReason::SuspiciousUsername { pattern });
            }
        }

        if ctx.giveaway.requirements.require_avatar && invitee.avatar.is_none() {
            return Some(RejectReason::MissingAvatar);
        }

        if heuristics {
            let score = self.suspicion_score(invitee, ctx.now);
            if score >= self.policy.suspicion_threshold {
                return Some(RejectReason::Suspicious {
                    score,
                    threshold: self.policy.suspicion_threshold,
                });
            }

            let joins = recent_join_count(
                ctx.recent_joins,
                &invitee.id,
                ctx.now,
                self.policy.join_rate_window_secs,
            );
            if joins > self.policy.join_rate_threshold as usize {
                return Some(RejectReason::JoinBurst {
                    joins,
                    window_secs: self.policy.join_rate_window_secs,
                });
            }
        }

        None
    }

    /// Deterministic score for young accounts without an avatar. Zero for
    /// everyone else.
    pub fn suspicion_score(&self, member: &Member, now: DateTime<Utc>) -> u32 {
        let age = member.account_age(now);
        if member.avatar.is_some() || age >= Duration::days(self.policy.young_account_days as i64)
        {
            return 0;
        }

        let age_points = if age < Duration::days(1) {
            3
        } else if age < Duration::days(3) {
            2
        } else {
            1
        };
        2 + age_points
    }
}

/// Joins inside `(now - window, now]`, not counting `exclude_id`.
pub fn recent_join_count(
    recent: &[Member],
    exclude_id: &str,
    now: DateTime<Utc>,
    window_secs: i64,
) -> usize {
    let since = now - Duration::seconds(window_secs);
    recent
        .iter()
        .filter(|m| m.id != exclude_id)
        .filter(|m| matches!(m.joined_at, Some(at) if at > since && at <= now))
        .count()
}

/// Returns the matched pattern name for throwaway-looking usernames.
pub fn suspicious_username(username: &str) -> Option<&'static str> {
    let name = username.to_lowercase();
    let digits = name.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 || digits == name.len() {
        return None;
    }

    let stem = &name[..name.len() - digits];
    let (prefix, separator) = match stem.strip_suffix('_') {
        Some(p) => (p, Some('_')),
        None => match stem.strip_suffix('.') {
            Some(p) => (p, Some('.')),
            None => (stem, None),
        },
    };

    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    if prefix.len() <= SHORT_PREFIX_LEN && SUSPICIOUS_WORDS.iter().any(|w| prefix.contains(w)) {
        return Some("throwaway word followed by digits");
    }

    match separator {
        Some('_') => Some("name_digits"),
        Some(_) => Some("name.digits"),
        None => Some("name ending in digits"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GiveawayKind, NewGiveaway, Requirements};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn member(id: &str, username: &str, age_days: i64) -> Member {
        Member {
            id: id.to_string(),
            username: username.to_string(),
            created_at: now() - Duration::days(age_days),
            joined_at: Some(now()),
            avatar: Some("hash".to_string()),
            bot: false,
            roles: vec![],
            mfa_enabled: None,
            verified: None,
        }
    }

    fn giveaway(requirements: Requirements) -> Giveaway {
        Giveaway::new(
            "g1",
            NewGiveaway {
                title: "Invite race".into(),
                prize: "Nitro".into(),
                kind: GiveawayKind::Invite,
                winner_count: 1,
                requirements,
                ..Default::default()
            },
            now() + Duration::days(1),
            now(),
        )
    }

    fn check(policy: AntiCheatPolicy, invitee: &Member, g: &Giveaway, recent: &[Member]) -> Verdict {
        AntiCheatValidator::new(policy).validate(&ValidationContext {
            invitee,
            inviter_id: "inviter",
            giveaway: g,
            already_invited: false,
            recent_joins: recent,
            now: now(),
        })
    }

    #[test]
    fn test_accepts_ordinary_member() {
        let g = giveaway(Requirements::default());
        let v = check(AntiCheatPolicy::default(), &member("u1", "sunflower", 400), &g, &[]);
        assert_eq!(v, Verdict::Accept);
    }

    #[test]
    fn test_self_invite_rejected_even_when_disabled() {
        let g = giveaway(Requirements::default());
        let policy = AntiCheatPolicy {
            enabled: false,
            ..Default::default()
        };
        let v = check(policy, &member("inviter", "sunflower", 400), &g, &[]);
        assert_eq!(v, Verdict::Reject(RejectReason::SelfInvite));
    }

    #[test]
    fn test_bot_and_young_account() {
        let g = giveaway(Requirements::default());
        let mut bot = member("u1", "helper", 400);
        bot.bot = true;
        assert_eq!(
            check(AntiCheatPolicy::default(), &bot, &g, &[]),
            Verdict::Reject(RejectReason::Bot)
        );

        let young = member("u2", "sunflower", 2);
        assert!(matches!(
            check(AntiCheatPolicy::default(), &young, &g, &[]),
            Verdict::Reject(RejectReason::AccountTooYoung { age_days: 2, min_days: 7 })
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let g = giveaway(Requirements::default());
        let invitee = member("u1", "sunflower", 400);
        let v = AntiCheatValidator::new(AntiCheatPolicy::default()).validate(&ValidationContext {
            invitee: &invitee,
            inviter_id: "inviter",
            giveaway: &g,
            already_invited: true,
            recent_joins: &[],
            now: now(),
        });
        assert_eq!(v, Verdict::Reject(RejectReason::Duplicate));
    }

    #[test]
    fn test_username_patterns() {
        assert_eq!(suspicious_username("sunflower"), None);
        assert_eq!(suspicious_username("12345"), None);
        assert_eq!(suspicious_username("x_1a"), None);
        assert_eq!(suspicious_username("john1234"), Some("name ending in digits"));
        assert_eq!(suspicious_username("john_1234"), Some("name_digits"));
        assert_eq!(suspicious_username("John.99"), Some("name.digits"));
        assert_eq!(
            suspicious_username("alt42"),
            Some("throwaway word followed by digits")
        );
        assert_eq!(
            suspicious_username("Test_7"),
            Some("throwaway word followed by digits")
        );
    }

    #[test]
    fn test_missing_avatar_only_when_required() {
        let mut invitee = member("u1", "sunflower", 400);
        invitee.avatar = None;

        let relaxed = giveaway(Requirements::default());
        assert!(check(AntiCheatPolicy::default(), &invitee, &relaxed, &[]).is_accept());

        let strict = giveaway(Requirements {
            require_avatar: true,
            ..Default::default()
        });
        assert_eq!(
            check(AntiCheatPolicy::default(), &invitee, &strict, &[]),
            Verdict::Reject(RejectReason::MissingAvatar)
        );
    }

    #[test]
    fn test_suspicion_score_is_deterministic() {
        let policy = AntiCheatPolicy {
            min_account_age_days: 0,
            ..Default::default()
        };
        let g = giveaway(Requirements::default());

        let mut brand_new = member("u1", "sunflower", 0);
        brand_new.avatar = None;
        for _ in 0..5 {
            assert_eq!(
                check(policy.clone(), &brand_new, &g, &[]),
                Verdict::Reject(RejectReason::Suspicious {
                    score: 5,
                    threshold: 4
                })
            );
        }

        // Five days old scores 3, below the threshold
        let mut older = member("u2", "sunflower", 5);
        older.avatar = None;
        assert!(check(policy.clone(), &older, &g, &[]).is_accept());

        // Avatar clears the score entirely
        let with_avatar = member("u3", "sunflower", 0);
        assert!(check(policy, &with_avatar, &g, &[]).is_accept());
    }

    #[test]
    fn test_join_burst() {
        let g = giveaway(Requirements::default());
        let invitee = member("u1", "sunflower", 400);
        let mut recent: Vec<Member> = (0..4)
            .map(|i| {
                let mut m = member(&format!("r{}", i), "someone", 400);
                m.joined_at = Some(now() - Duration::seconds(60));
                m
            })
            .collect();
        recent.push(invitee.clone());

        assert_eq!(
            check(AntiCheatPolicy::default(), &invitee, &g, &recent),
            Verdict::Reject(RejectReason::JoinBurst {
                joins: 4,
                window_secs: 300
            })
        );

        // Joins outside the window do not count
        for m in recent.iter_mut() {
            m.joined_at = Some(now() - Duration::minutes(10));
        }
        assert!(check(AntiCheatPolicy::default(), &invitee, &g, &recent).is_accept());
    }

    #[test]
    fn test_disabled_policy_skips_heuristics() {
        let g = giveaway(Requirements::default());
        let policy = AntiCheatPolicy {
            enabled: false,
            ..Default::default()
        };
        let mut invitee = member("u1", "alt42", 0);
        invitee.bot = true;
        assert!(check(policy, &invitee, &g, &[]).is_accept());
    }
}
