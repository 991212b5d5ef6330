//! End command - end a giveaway before its end time

use crate::style::*;
use anyhow::Result;

pub async fn run(server: &str, giveaway_id: &str) -> Result<()> {
    let client = crate::client::GiveawayClient::new(server);
    let giveaway = client.end(giveaway_id).await?;

    print_success(&format!("Giveaway '{}' ended", giveaway.title));
    if giveaway.winner_ids().is_empty() {
        print_info("No eligible winners.");
    } else {
        println!();
        println!("{}", style_bold("Winners:"));
        for id in giveaway.winner_ids() {
            println!("  - {}", style_cyan(id));
        }
    }
    Ok(())
}
