//! Stats command - server health and giveaway totals

use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str) -> Result<()> {
    print_header("Giveaway Statistics");

    let client = crate::client::GiveawayClient::new(server);

    let health = client.health().await?;
    let stats = client.stats().await?;

    println!();
    println!(
        "Server:           {} (v{}, up {}s)",
        if health.healthy {
            style_green("healthy")
        } else {
            style_red("unhealthy")
        },
        health.version,
        health.uptime_secs
    );
    println!("Total giveaways:  {}", style_bold(&stats.total_giveaways.to_string()));
    println!("Active:           {}", style_green(&stats.active_giveaways.to_string()));
    println!("Ended:            {}", style_dim(&stats.ended_giveaways.to_string()));
    println!("Participants:     {}", stats.total_participants);
    println!("Counted invites:  {}", stats.total_invites);
    println!("Avg participants: {:.2}", stats.average_participants);

    Ok(())
}
