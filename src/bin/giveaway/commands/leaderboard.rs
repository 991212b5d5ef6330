//! Leaderboard command

use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, giveaway_id: &str, limit: usize) -> Result<()> {
    let client = crate::client::GiveawayClient::new(server);
    let standings = client.leaderboard(giveaway_id).await?;

    print_header(&format!("Leaderboard: {}", standings.giveaway.title));

    if standings.entries.is_empty() {
        print_info("No invites counted yet.");
        return Ok(());
    }

    let min = standings.giveaway.requirements.min_invites;
    println!();
    println!("{:>4}  {:<24}  {:>7}  {:>8}", "Rank", "Member", "Invites", "Eligible");
    println!("{}", "─".repeat(50));

    for (i, entry) in standings.entries.iter().take(limit).enumerate() {
        let rank = format!("#{}", i + 1);
        let rank_styled = if i == 0 {
            style_yellow(&rank)
        } else if i < 3 {
            style_cyan(&rank)
        } else {
            rank
        };
        let name = entry.username.as_deref().unwrap_or(&entry.user_id);
        let eligible = if entry.count >= min {
            style_green("yes")
        } else {
            style_dim("no")
        };
        println!(
            "{:>4}  {:<24}  {:>7}  {:>8}",
            rank_styled, name, entry.count, eligible
        );
    }

    println!();
    println!(
        "Entrants: {}  Total invitees: {}  Active links: {}",
        standings.entries.len(),
        standings.total_invitees,
        standings.active_codes
    );
    Ok(())
}
