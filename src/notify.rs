//! Winner notifications
//!
//! One public announcement per ended giveaway, then a private message to each
//! winner through a paced [`OutboundQueue`]. A winner who cannot be reached
//! privately gets a public mention with the same details instead. Delivery is
//! best-effort: failures are logged and never surface as errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::models::{Giveaway, MessageId, UserId};
use crate::platform::{mention, ChatPlatform, Embed, OutgoingMessage};

const WINNER_COLOR: u32 = 0x2ECC71;
const NO_WINNER_COLOR: u32 = 0x95A5A6;

/// Hands out send slots at most once per pacing interval.
pub struct OutboundQueue {
    pacing_ms: AtomicU64,
    last_send: Mutex<Option<Instant>>,
}

impl OutboundQueue {
    pub fn new(pacing: Duration) -> Self {
        Self {
            pacing_ms: AtomicU64::new(pacing.as_millis() as u64),
            last_send: Mutex::new(None),
        }
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms.load(Ordering::Relaxed))
    }

    pub fn set_pacing(&self, pacing: Duration) {
        self.pacing_ms
            .store(pacing.as_millis() as u64, Ordering::Relaxed);
    }

    /// Wait until the next send is allowed. Callers are served in order.
    pub async fn acquire(&self) {
        let mut last = self.last_send.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.pacing()).await;
        }
        *last = Some(Instant::now());
    }
}

/// What happened to one end-of-giveaway notification round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub announcement: Option<MessageId>,
    pub direct: Vec<UserId>,
    pub fallback: Vec<UserId>,
}

pub struct NotificationDispatcher {
    platform: Arc<dyn ChatPlatform>,
    queue: OutboundQueue,
}

impl NotificationDispatcher {
    pub fn new(platform: Arc<dyn ChatPlatform>, pacing: Duration) -> Self {
        Self {
            platform,
            queue: OutboundQueue::new(pacing),
        }
    }

    pub fn set_pacing(&self, pacing: Duration) {
        self.queue.set_pacing(pacing);
    }

    /// Announce the outcome of an ended giveaway and notify its winners.
    pub async fn announce_end(&self, giveaway: &Giveaway, dm_winners: bool) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let Some(channel_id) = giveaway.announcement.as_ref().map(|a| a.channel_id.clone()) else {
            warn!("Giveaway {} has no announcement channel, skipping notifications", giveaway.id);
            return report;
        };

        let winners = giveaway.winner_ids();
        let message = if winners.is_empty() {
            no_winner_message(giveaway)
        } else {
            winner_message(giveaway)
        };

        match self.platform.send_message(&channel_id, &message).await {
            Ok(id) => report.announcement = Some(id),
            Err(e) => warn!("Failed to announce result of {}: {}", giveaway.id, e),
        }

        if winners.is_empty() || !dm_winners {
            return report;
        }

        let dm = OutgoingMessage::embed(
            Embed::new("🎉 You won!")
                .description(format!(
                    "You won **{}** in **{}**. A host will reach out to hand over your prize.",
                    giveaway.prize, giveaway.title
                ))
                .color(WINNER_COLOR),
        );

        for winner in winners {
            self.queue.acquire().await;
            match self.platform.send_direct_message(winner, &dm).await {
                Ok(()) => report.direct.push(winner.clone()),
                Err(e) => {
                    warn!("Could not DM winner {} of {}: {}", winner, giveaway.id, e);
                    let fallback = OutgoingMessage::text(format!(
                        "{} you won **{}** in **{}**! We couldn't message you privately, so contact a host to claim it.",
                        mention(winner),
                        giveaway.prize,
                        giveaway.title
                    ));
                    match self.platform.send_message(&channel_id, &fallback).await {
                        Ok(_) => report.fallback.push(winner.clone()),
                        Err(e) => warn!("Fallback mention for {} failed: {}", winner, e),
                    }
                }
            }
        }

        info!(
            "Notified winners of {}: {} direct, {} public fallback",
            giveaway.id,
            report.direct.len(),
            report.fallback.len()
        );
        report
    }
}

fn winner_message(giveaway: &Giveaway) -> OutgoingMessage {
    let mentions: Vec<String> = giveaway.winner_ids().iter().map(|w| mention(w)).collect();
    let label = if mentions.len() == 1 { "Winner" } else { "Winners" };

    let mut embed = Embed::new(format!("🎉 Giveaway Ended: {}", giveaway.title))
        .color(WINNER_COLOR)
        .field("Prize", &giveaway.prize, true)
        .field(label, mentions.join(", "), false);
    if !giveaway.description.is_empty() {
        embed = embed.description(&giveaway.description);
    }
    if !giveaway.created_by.is_empty() {
        embed = embed.footer(format!("Hosted by {}", giveaway.created_by));
    }
    if let Some(at) = giveaway.ended_at() {
        embed = embed.timestamp(at);
    }

    OutgoingMessage::embed(embed).with_content(format!(
        "Congratulations {}! You won **{}**!",
        mentions.join(" "),
        giveaway.prize
    ))
}

fn no_winner_message(giveaway: &Giveaway) -> OutgoingMessage {
    let reason = if giveaway.is_invite() && giveaway.requirements.min_invites > 0 {
        format!(
            "Nobody reached the minimum of {} validated invites.",
            giveaway.requirements.min_invites
        )
    } else {
        "There were no eligible entries.".to_string()
    };

    let mut embed = Embed::new(format!("Giveaway Ended: {}", giveaway.title))
        .description(format!("{} No winners this time.", reason))
        .color(NO_WINNER_COLOR)
        .field("Prize", &giveaway.prize, true);
    if let Some(at) = giveaway.ended_at() {
        embed = embed.timestamp(at);
    }
    OutgoingMessage::embed(embed)
}
