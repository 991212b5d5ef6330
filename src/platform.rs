//! Chat platform gateway
//!
//! Everything the giveaway core needs from the chat platform, behind one
//! trait. The engine is scoped to a single guild; implementations carry the
//! guild id themselves.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlatformResult;
use crate::models::{ChannelId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: UserId,
    pub username: String,
    /// Account creation time.
    pub created_at: DateTime<Utc>,
    /// Guild join time.
    pub joined_at: Option<DateTime<Utc>>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub mfa_enabled: Option<bool>,
    #[serde(default)]
    pub verified: Option<bool>,
}

impl Member {
    pub fn account_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    pub fn mention(&self) -> String {
        mention(&self.id)
    }
}

pub fn mention(user_id: &str) -> String {
    format!("<@{}>", user_id)
}

/// Current use count of one guild invite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteUsage {
    pub code: String,
    pub uses: u32,
    pub inviter_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedInvite {
    pub code: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub parent_id: Option<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChannel {
    pub name: String,
    pub topic: Option<String>,
    pub parent_id: Option<ChannelId>,
}

/// Event delivered when someone joins the guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberJoined {
    pub member: Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    pub footer: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Embed {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn color(mut self, color: u32) -> Self {
        self.color = Some(color);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    pub fn footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            embeds: Vec::new(),
        }
    }

    pub fn embed(embed: Embed) -> Self {
        Self {
            content: None,
            embeds: vec![embed],
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Current invite codes and their use counts for the guild.
    async fn fetch_invites(&self) -> PlatformResult<Vec<InviteUsage>>;

    /// Create an invite into `channel_id` limited by age and uses.
    async fn create_invite(
        &self,
        channel_id: &str,
        max_age_secs: u64,
        max_uses: u32,
    ) -> PlatformResult<CreatedInvite>;

    async fn fetch_channel(&self, channel_id: &str) -> PlatformResult<ChannelInfo>;

    async fn create_channel(&self, channel: &NewChannel) -> PlatformResult<ChannelId>;

    async fn set_channel_topic(&self, channel_id: &str, topic: &str) -> PlatformResult<()>;

    async fn delete_channel(&self, channel_id: &str) -> PlatformResult<()>;

    async fn send_message(
        &self,
        channel_id: &str,
        message: &OutgoingMessage,
    ) -> PlatformResult<MessageId>;

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        message: &OutgoingMessage,
    ) -> PlatformResult<()>;

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> PlatformResult<()>;

    /// Most recently joined guild members, newest first.
    async fn fetch_recent_members(&self, limit: usize) -> PlatformResult<Vec<Member>>;

    async fn send_direct_message(
        &self,
        user_id: &str,
        message: &OutgoingMessage,
    ) -> PlatformResult<()>;

    async fn fetch_member(&self, user_id: &str) -> PlatformResult<Member>;

    /// Public join URL for an invite code.
    fn invite_url(&self, code: &str) -> String {
        format!("https://discord.gg/{}", code)
    }
}
