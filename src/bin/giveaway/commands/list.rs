//! List command

use crate::style::*;
use anyhow::Result;
use chrono::Utc;

pub async fn run(server: &str, active_only: bool) -> Result<()> {
    print_header("Giveaways");

    let client = crate::client::GiveawayClient::new(server);
    let giveaways: Vec<_> = client
        .list()
        .await?
        .into_iter()
        .filter(|g| !active_only || g.is_active())
        .collect();

    if giveaways.is_empty() {
        print_info("No giveaways yet.");
        return Ok(());
    }

    let now = Utc::now();
    println!();
    println!(
        "{:<10}  {:<24}  {:<7}  {:>7}  {:>12}",
        "ID", "Title", "Kind", "Winners", "Ends"
    );
    println!("{}", "─".repeat(68));

    for g in &giveaways {
        let ends = if g.is_active() {
            style_green(&format!("in {}m", g.seconds_remaining(now) / 60))
        } else {
            style_dim("ended")
        };
        let kind = format!("{:?}", g.kind).to_lowercase();
        println!(
            "{:<10}  {:<24}  {:<7}  {:>7}  {:>12}",
            short_id(&g.id),
            g.title.chars().take(24).collect::<String>(),
            kind,
            g.winner_count,
            ends
        );
    }

    println!();
    println!("Total: {}", giveaways.len());
    Ok(())
}
