//! Giveaway data model

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::platform::Member;

pub type GiveawayId = String;
pub type UserId = String;
pub type ChannelId = String;
pub type MessageId = String;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GiveawayKind {
    /// Everyone who entered has the same chance.
    #[default]
    Classic,
    /// Eligibility and ranking come from validated invites.
    Invite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GiveawayStatus {
    #[default]
    Active,
    Ended,
}

/// A channel plus the message we own in it, if one has been posted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: ChannelId,
    pub message_id: Option<MessageId>,
}

impl MessageRef {
    pub fn channel(channel_id: impl Into<ChannelId>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message_id: None,
        }
    }
}

/// Entry requirements. `min_invites` only matters for invite giveaways.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirements {
    pub min_invites: u32,
    pub min_account_age_days: Option<u32>,
    pub min_server_age_days: Option<u32>,
    pub required_roles: Vec<String>,
    pub denied_roles: Vec<String>,
    pub require_avatar: bool,
    pub require_2fa: bool,
    pub require_verified_email: bool,
    /// Whitelisted users skip every other check except the blacklist.
    pub whitelist: Vec<UserId>,
    pub blacklist: Vec<UserId>,
}

impl Requirements {
    /// Check whether `member` may enter. The error is a user-facing reason.
    pub fn check_entry(&self, member: &Member, now: DateTime<Utc>) -> Result<(), String> {
        if self.blacklist.iter().any(|id| id == &member.id) {
            return Err("you are blacklisted from this giveaway".to_string());
        }
        if self.whitelist.iter().any(|id| id == &member.id) {
            return Ok(());
        }

        if let Some(days) = self.min_account_age_days {
            if member.account_age(now) < Duration::days(days as i64) {
                return Err(format!("account must be at least {} days old", days));
            }
        }

        if let Some(days) = self.min_server_age_days {
            let joined_long_enough = member
                .joined_at
                .map(|joined| now - joined >= Duration::days(days as i64))
                .unwrap_or(false);
            if !joined_long_enough {
                return Err(format!("must have been in the server for {} days", days));
            }
        }

        if !self.required_roles.is_empty()
            && !self
                .required_roles
                .iter()
                .any(|role| member.roles.contains(role))
        {
            return Err("missing a required role".to_string());
        }

        if self
            .denied_roles
            .iter()
            .any(|role| member.roles.contains(role))
        {
            return Err("has a role that is not allowed to enter".to_string());
        }

        if self.require_avatar && member.avatar.is_none() {
            return Err("a profile picture is required".to_string());
        }
        if self.require_2fa && member.mfa_enabled != Some(true) {
            return Err("two-factor authentication is required".to_string());
        }
        if self.require_verified_email && member.verified != Some(true) {
            return Err("a verified email is required".to_string());
        }

        Ok(())
    }
}

/// Per-giveaway replacement for individual anti-cheat policy fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiCheatOverride {
    pub enabled: Option<bool>,
    pub block_bots: Option<bool>,
    pub min_account_age_days: Option<u32>,
    pub join_rate_threshold: Option<u32>,
}

/// Options accepted by `create_giveaway`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewGiveaway {
    pub title: String,
    pub description: String,
    pub prize: String,
    pub kind: GiveawayKind,
    pub winner_count: u32,
    pub end_time: Option<DateTime<Utc>>,
    pub channel_id: ChannelId,
    pub created_by: UserId,
    pub requirements: Requirements,
    pub anti_cheat: Option<AntiCheatOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Giveaway {
    pub id: GiveawayId,
    pub title: String,
    pub description: String,
    pub prize: String,
    pub kind: GiveawayKind,
    pub winner_count: u32,
    end_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub created_by: UserId,
    status: GiveawayStatus,
    #[serde(default)]
    pub participants: BTreeSet<UserId>,
    pub announcement: Option<MessageRef>,
    #[serde(default)]
    pub requirements: Requirements,
    pub anti_cheat: Option<AntiCheatOverride>,
    pub leaderboard: Option<MessageRef>,
    pub auto_leaderboard: Option<MessageRef>,
    #[serde(default)]
    winner_ids: Vec<UserId>,
    ended_at: Option<DateTime<Utc>>,
}

impl Giveaway {
    pub fn new(
        id: impl Into<GiveawayId>,
        options: NewGiveaway,
        end_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: options.title,
            description: options.description,
            prize: options.prize,
            kind: options.kind,
            winner_count: options.winner_count.max(1),
            end_time,
            created_at: now,
            created_by: options.created_by,
            status: GiveawayStatus::Active,
            participants: BTreeSet::new(),
            announcement: None,
            requirements: options.requirements,
            anti_cheat: options.anti_cheat,
            leaderboard: None,
            auto_leaderboard: None,
            winner_ids: Vec::new(),
            ended_at: None,
        }
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn status(&self) -> GiveawayStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == GiveawayStatus::Active
    }

    pub fn is_invite(&self) -> bool {
        self.kind == GiveawayKind::Invite
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }

    pub fn winner_ids(&self) -> &[UserId] {
        &self.winner_ids
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// The only transition: active -> ended. Returns false if already ended,
    /// in which case nothing changes.
    pub fn mark_ended(&mut self, winners: Vec<UserId>, now: DateTime<Utc>) -> bool {
        if self.status == GiveawayStatus::Ended {
            return false;
        }
        self.status = GiveawayStatus::Ended;
        self.winner_ids = winners;
        self.ended_at = Some(now);
        true
    }

    /// Seconds left before the end time, never negative.
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_seconds().max(0)
    }
}

/// A platform invite link scoped to one inviter and one giveaway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteCode {
    pub code: String,
    pub owner_id: UserId,
    pub giveaway_id: GiveawayId,
    /// Last observed use count.
    pub uses: u32,
    pub max_uses: u32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl InviteCode {
    /// Record an observed use count. Counts only move forward; a lower
    /// observation is ignored.
    pub fn observe_uses(&mut self, observed: u32) -> bool {
        if observed > self.uses {
            self.uses = observed;
            true
        } else {
            false
        }
    }
}

/// Global per-user invite statistics across all giveaways.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InviteTrackingRecord {
    pub user_id: UserId,
    pub total_invites: u32,
    pub codes: Vec<String>,
    pub username: Option<String>,
}

impl InviteTrackingRecord {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GiveawayStats {
    pub total_giveaways: usize,
    pub active_giveaways: usize,
    pub ended_giveaways: usize,
    pub total_participants: usize,
    pub total_invites: u64,
    pub average_participants: f64,
}
