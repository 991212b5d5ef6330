//! Create command

use crate::style::*;
use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use invite_giveaways::models::{GiveawayKind, NewGiveaway, Requirements};

pub struct CreateArgs {
    pub title: String,
    pub prize: String,
    pub description: Option<String>,
    pub channel: String,
    pub duration: String,
    pub winners: u32,
    pub classic: bool,
    pub min_invites: u32,
    pub created_by: String,
}

pub async fn run(server: &str, args: CreateArgs) -> Result<()> {
    let duration = parse_duration(&args.duration)?;
    let request = NewGiveaway {
        title: args.title,
        description: args.description.unwrap_or_default(),
        prize: args.prize,
        kind: if args.classic {
            GiveawayKind::Classic
        } else {
            GiveawayKind::Invite
        },
        winner_count: args.winners,
        end_time: Some(Utc::now() + duration),
        channel_id: args.channel,
        created_by: args.created_by,
        requirements: Requirements {
            min_invites: args.min_invites,
            ..Default::default()
        },
        anti_cheat: None,
    };

    let client = crate::client::GiveawayClient::new(server);
    let giveaway = client.create(&request).await?;

    print_success(&format!("Created giveaway '{}'", giveaway.title));
    println!("  ID:       {}", style_cyan(&giveaway.id));
    println!("  Ends at:  {}", giveaway.end_time().format("%Y-%m-%d %H:%M UTC"));
    println!("  Winners:  {}", giveaway.winner_count);
    Ok(())
}

/// Parse `90s`, `30m`, `2h`, `7d`, or a bare number of minutes.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let (digits, unit) = match input.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => input.split_at(idx),
        None => (input, "m"),
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| anyhow!("Invalid duration '{}'", input))?;

    match unit {
        "s" => Ok(Duration::seconds(value)),
        "m" => Ok(Duration::minutes(value)),
        "h" => Ok(Duration::hours(value)),
        "d" => Ok(Duration::days(value)),
        _ => Err(anyhow!("Unknown duration unit '{}' (use s, m, h or d)", unit)),
    }
}
