//! Discord REST client
//!
//! Implements [`ChatPlatform`] against the Discord HTTP API with a bot token.
//! Member-joined events are not read here; they are relayed to the engine
//! through the HTTP server.
//!
//! Rate limits: the client remembers the last `X-RateLimit-*` headers and
//! waits out an exhausted bucket before the next call. A 429 is retried once
//! after the advertised delay.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::DiscordConfig;
use crate::error::{PlatformError, PlatformResult};
use crate::models::{ChannelId, MessageId};
use crate::platform::{
    ChannelInfo, ChatPlatform, CreatedInvite, Embed, InviteUsage, Member, NewChannel,
    OutgoingMessage,
};

/// Milliseconds between the Unix epoch and the Discord epoch (2015-01-01).
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Longest wait we accept before giving up on a rate-limited call.
const MAX_RETRY_AFTER_MS: u64 = 10_000;

/// Page size when listing guild members.
const MEMBER_PAGE_LIMIT: usize = 1000;

/// Pages walked when looking for recent joiners. Members come back in user-id
/// order, so the whole list has to be read before sorting by join time.
const MAX_MEMBER_PAGES: usize = 20;

const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/CortexLM/invite-giveaways, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Rate limit bucket state from the last response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub remaining: u32,
    pub reset_after_secs: f64,
    pub observed_at: DateTime<Utc>,
}

impl RateLimitInfo {
    /// Time left before the bucket refills, if it is empty
    pub fn wait_needed(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.remaining > 0 {
            return None;
        }
        let elapsed = (now - self.observed_at).num_milliseconds().max(0) as f64 / 1000.0;
        let left = self.reset_after_secs - elapsed;
        (left > 0.0).then(|| Duration::from_secs_f64(left))
    }
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    bot: Option<bool>,
    #[serde(default)]
    mfa_enabled: Option<bool>,
    #[serde(default)]
    verified: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ApiMember {
    user: ApiUser,
    #[serde(default)]
    joined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    avatar: Option<String>,
}

impl From<ApiMember> for Member {
    fn from(api: ApiMember) -> Self {
        Member {
            created_at: snowflake_time(&api.user.id),
            username: api.user.global_name.unwrap_or(api.user.username),
            id: api.user.id,
            joined_at: api.joined_at,
            avatar: api.user.avatar.or(api.avatar),
            bot: api.user.bot.unwrap_or(false),
            roles: api.roles,
            mfa_enabled: api.user.mfa_enabled,
            verified: api.user.verified,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiInvite {
    code: String,
    #[serde(default)]
    uses: Option<u32>,
    #[serde(default)]
    inviter: Option<ApiUser>,
}

#[derive(Debug, Deserialize)]
struct ApiChannel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiRateLimited {
    retry_after: f64,
}

/// Account creation time encoded in a Discord snowflake
pub fn snowflake_time(id: &str) -> DateTime<Utc> {
    id.parse::<u64>()
        .ok()
        .map(|raw| ((raw >> 22) + DISCORD_EPOCH_MS) as i64)
        .and_then(DateTime::from_timestamp_millis)
        // Unknown age is treated as brand new
        .unwrap_or_else(Utc::now)
}

fn embed_json(embed: &Embed) -> Value {
    let mut value = json!({
        "title": embed.title,
        "description": embed.description,
        "color": embed.color,
        "fields": embed.fields,
    });
    if let Some(footer) = &embed.footer {
        value["footer"] = json!({ "text": footer });
    }
    if let Some(at) = embed.timestamp {
        value["timestamp"] = json!(at.to_rfc3339());
    }
    value
}

fn message_body(message: &OutgoingMessage) -> Value {
    json!({
        "content": message.content,
        "embeds": message.embeds.iter().map(embed_json).collect::<Vec<_>>(),
        "allowed_mentions": { "parse": ["users"] },
    })
}

pub struct DiscordClient {
    client: reqwest::Client,
    api_base: String,
    guild_id: String,
    token: String,
    rate_limit: Mutex<Option<RateLimitInfo>>,
}

impl DiscordClient {
    pub fn new(config: &DiscordConfig) -> Self {
        if config.token.is_empty() {
            warn!("Discord client initialized WITHOUT token - every API call will fail");
        } else {
            info!("Discord client initialized for guild {}", config.guild_id);
        }
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            guild_id: config.guild_id.clone(),
            token: config.token.clone(),
            rate_limit: Mutex::new(None),
        }
    }

    pub fn rate_limit(&self) -> Option<RateLimitInfo> {
        self.rate_limit.lock().clone()
    }

    fn build_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .header("User-Agent", USER_AGENT)
            .header("Authorization", format!("Bot {}", self.token))
    }

    fn record_rate_limit(&self, response: &Response) {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let remaining = header("x-ratelimit-remaining").and_then(|v| v.parse::<u32>().ok());
        let reset_after = header("x-ratelimit-reset-after").and_then(|v| v.parse::<f64>().ok());
        if let (Some(remaining), Some(reset_after_secs)) = (remaining, reset_after) {
            *self.rate_limit.lock() = Some(RateLimitInfo {
                remaining,
                reset_after_secs,
                observed_at: Utc::now(),
            });
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> PlatformResult<Response> {
        let mut retried = false;
        loop {
            let wait = self
                .rate_limit
                .lock()
                .as_ref()
                .and_then(|r| r.wait_needed(Utc::now()));
            if let Some(wait) = wait {
                debug!("Rate limit bucket empty, waiting {:?}", wait);
                tokio::time::sleep(wait).await;
            }

            let mut request = self.build_request(method.clone(), path);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            self.record_rate_limit(&response);

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let text = response.text().await.unwrap_or_default();
            match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after_ms = serde_json::from_str::<ApiRateLimited>(&text)
                        .map(|r| (r.retry_after * 1000.0) as u64)
                        .unwrap_or(1000);
                    if retried || retry_after_ms > MAX_RETRY_AFTER_MS {
                        return Err(PlatformError::RateLimited { retry_after_ms });
                    }
                    warn!("Rate limited on {} {}, retrying in {}ms", method, path, retry_after_ms);
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                    retried = true;
                }
                StatusCode::NOT_FOUND => return Err(PlatformError::NotFound(path.to_string())),
                StatusCode::FORBIDDEN => return Err(PlatformError::Forbidden(text)),
                _ => {
                    return Err(PlatformError::Status {
                        status: status.as_u16(),
                        body: text,
                    })
                }
            }
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> PlatformResult<T> {
        Ok(self.send(method, path, body).await?.json().await?)
    }

    async fn call_empty(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> PlatformResult<()> {
        self.send(method, path, body).await.map(|_| ())
    }
}

#[async_trait]
impl ChatPlatform for DiscordClient {
    async fn fetch_invites(&self) -> PlatformResult<Vec<InviteUsage>> {
        let path = format!("/guilds/{}/invites", self.guild_id);
        let invites: Vec<ApiInvite> = self.call(Method::GET, &path, None).await?;
        Ok(invites
            .into_iter()
            .map(|i| InviteUsage {
                code: i.code,
                uses: i.uses.unwrap_or(0),
                inviter_id: i.inviter.map(|u| u.id),
            })
            .collect())
    }

    async fn create_invite(
        &self,
        channel_id: &str,
        max_age_secs: u64,
        max_uses: u32,
    ) -> PlatformResult<CreatedInvite> {
        let path = format!("/channels/{}/invites", channel_id);
        let body = json!({
            "max_age": max_age_secs,
            "max_uses": max_uses,
            "unique": true,
        });
        let invite: ApiInvite = self.call(Method::POST, &path, Some(&body)).await?;
        Ok(CreatedInvite {
            url: format!("https://discord.gg/{}", invite.code),
            code: invite.code,
        })
    }

    async fn fetch_channel(&self, channel_id: &str) -> PlatformResult<ChannelInfo> {
        let channel: ApiChannel = self
            .call(Method::GET, &format!("/channels/{}", channel_id), None)
            .await?;
        Ok(ChannelInfo {
            id: channel.id,
            name: channel.name.unwrap_or_default(),
            parent_id: channel.parent_id,
        })
    }

    async fn create_channel(&self, channel: &NewChannel) -> PlatformResult<ChannelId> {
        let path = format!("/guilds/{}/channels", self.guild_id);
        let body = json!({
            "name": channel.name,
            "type": 0,
            "topic": channel.topic,
            "parent_id": channel.parent_id,
        });
        let created: ApiChannel = self.call(Method::POST, &path, Some(&body)).await?;
        Ok(created.id)
    }

    async fn set_channel_topic(&self, channel_id: &str, topic: &str) -> PlatformResult<()> {
        let body = json!({ "topic": topic });
        self.call_empty(Method::PATCH, &format!("/channels/{}", channel_id), Some(&body))
            .await
    }

    async fn delete_channel(&self, channel_id: &str) -> PlatformResult<()> {
        self.call_empty(Method::DELETE, &format!("/channels/{}", channel_id), None)
            .await
    }

    async fn send_message(
        &self,
        channel_id: &str,
        message: &OutgoingMessage,
    ) -> PlatformResult<MessageId> {
        let path = format!("/channels/{}/messages", channel_id);
        let sent: ApiMessage = self
            .call(Method::POST, &path, Some(&message_body(message)))
            .await?;
        Ok(sent.id)
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        message: &OutgoingMessage,
    ) -> PlatformResult<()> {
        let path = format!("/channels/{}/messages/{}", channel_id, message_id);
        self.call_empty(Method::PATCH, &path, Some(&message_body(message)))
            .await
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> PlatformResult<()> {
        let path = format!("/channels/{}/messages/{}", channel_id, message_id);
        self.call_empty(Method::DELETE, &path, None).await
    }

    async fn fetch_recent_members(&self, limit: usize) -> PlatformResult<Vec<Member>> {
        let mut members: Vec<Member> = Vec::new();
        let mut after = String::from("0");

        for page in 0..MAX_MEMBER_PAGES {
            let path = format!(
                "/guilds/{}/members?limit={}&after={}",
                self.guild_id, MEMBER_PAGE_LIMIT, after
            );
            let batch: Vec<ApiMember> = self.call(Method::GET, &path, None).await?;
            let full = batch.len() == MEMBER_PAGE_LIMIT;
            members.extend(batch.into_iter().map(Member::from));

            match members.last() {
                Some(last) if full => after = last.id.clone(),
                _ => return Ok(newest_joins(members, limit)),
            }
            if page + 1 == MAX_MEMBER_PAGES {
                warn!(
                    "Guild {} has more than {} members, recent joins may be incomplete",
                    self.guild_id,
                    MAX_MEMBER_PAGES * MEMBER_PAGE_LIMIT
                );
            }
        }
        Ok(newest_joins(members, limit))
    }

    async fn send_direct_message(
        &self,
        user_id: &str,
        message: &OutgoingMessage,
    ) -> PlatformResult<()> {
        let body = json!({ "recipient_id": user_id });
        let dm: ApiChannel = self
            .call(Method::POST, "/users/@me/channels", Some(&body))
            .await?;
        self.send_message(&dm.id, message).await.map(|_| ())
    }

    async fn fetch_member(&self, user_id: &str) -> PlatformResult<Member> {
        let path = format!("/guilds/{}/members/{}", self.guild_id, user_id);
        let member: ApiMember = self.call(Method::GET, &path, None).await?;
        Ok(member.into())
    }
}

/// Keep the `limit` most recent joiners, newest first.
fn newest_joins(mut members: Vec<Member>, limit: usize) -> Vec<Member> {
    members.sort_by(|a, b| b.joined_at.cmp(&a.joined_at));
    members.truncate(limit);
    members
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snowflake_time() {
        let created = snowflake_time("175928847299117063");
        assert_eq!(
            created,
            Utc.with_ymd_and_hms(2016, 4, 30, 11, 18, 25).unwrap()
                + chrono::Duration::milliseconds(796)
        );
    }

    #[test]
    fn test_member_from_api() {
        let raw = json!({
            "user": {
                "id": "175928847299117063",
                "username": "nelly",
                "global_name": "Nelly",
                "avatar": null,
                "bot": false
            },
            "joined_at": "2024-05-01T10:00:00Z",
            "roles": ["42"]
        });
        let member: Member = serde_json::from_value::<ApiMember>(raw).unwrap().into();
        assert_eq!(member.username, "Nelly");
        assert!(member.avatar.is_none());
        assert_eq!(member.roles, vec!["42".to_string()]);
        assert!(member.joined_at.is_some());
    }

    #[test]
    fn test_newest_joins_ignores_id_order() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        // Listed by user id: the oldest account joined last
        let members: Vec<Member> = [("1", 30), ("2", 0), ("3", 10)]
            .iter()
            .map(|(id, minutes)| Member {
                id: id.to_string(),
                username: format!("user{}", id),
                created_at: base - chrono::Duration::days(400),
                joined_at: Some(base + chrono::Duration::minutes(*minutes)),
                avatar: None,
                bot: false,
                roles: vec![],
                mfa_enabled: None,
                verified: None,
            })
            .collect();

        let newest = newest_joins(members, 2);
        let ids: Vec<&str> = newest.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["1", "3"]);
    }

    #[test]
    fn test_message_body_shapes_footer() {
        let message = OutgoingMessage::embed(Embed::new("Board").footer("Ends soon"))
            .with_content("hi");
        let body = message_body(&message);
        assert_eq!(body["content"], "hi");
        assert_eq!(body["embeds"][0]["footer"]["text"], "Ends soon");
        assert_eq!(body["embeds"][0]["title"], "Board");
    }

    #[test]
    fn test_rate_limit_wait() {
        let now = Utc::now();
        let info = RateLimitInfo {
            remaining: 0,
            reset_after_secs: 2.0,
            observed_at: now,
        };
        let wait = info.wait_needed(now + chrono::Duration::milliseconds(500)).unwrap();
        assert!(wait <= Duration::from_millis(1500));
        assert!(info.wait_needed(now + chrono::Duration::seconds(3)).is_none());

        let open = RateLimitInfo {
            remaining: 3,
            ..info
        };
        assert!(open.wait_needed(now).is_none());
    }
}
