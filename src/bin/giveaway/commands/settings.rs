//! Settings command - show or change runtime settings

use crate::style::*;
use anyhow::Result;
use invite_giveaways::{Settings, SettingsPatch};

pub async fn run(server: &str, patch: Option<SettingsPatch>) -> Result<()> {
    let client = crate::client::GiveawayClient::new(server);

    let settings = match patch {
        Some(patch) => {
            let settings = client.update_settings(&patch).await?;
            print_success("Settings updated");
            settings
        }
        None => client.settings().await?,
    };

    print_settings(&settings);
    Ok(())
}

fn print_settings(s: &Settings) {
    print_header("Runtime Settings");

    println!();
    println!("{}", style_bold("Limits:"));
    println!("  Duration:         {}s - {}s", s.limits.min_duration_secs, s.limits.max_duration_secs);
    println!("  Max winners:      {}", s.limits.max_winners);
    println!("  Max active:       {}", s.limits.max_active_giveaways);

    println!();
    println!("{}", style_bold("Anti-cheat:"));
    println!("  Enabled:          {}", on_off(s.anti_cheat.enabled));
    println!("  Block bots:       {}", on_off(s.anti_cheat.block_bots));
    println!("  Min account age:  {} days", s.anti_cheat.min_account_age_days);
    println!(
        "  Join burst:       {} in {}s",
        s.anti_cheat.join_rate_threshold, s.anti_cheat.join_rate_window_secs
    );

    println!();
    println!("{}", style_bold("Leaderboards:"));
    println!("  Auto-post:        {}", on_off(s.leaderboard.auto_post_enabled));
    println!("  Refresh every:    {}s", s.leaderboard.refresh_interval_secs);
    println!(
        "  Daily post at:    {}",
        s.leaderboard.daily_post_time.as_deref().unwrap_or("-")
    );

    println!();
    println!("{}", style_bold("Notifications:"));
    println!("  DM winners:       {}", on_off(s.notifications.dm_winners));
    println!("  DM pacing:        {}ms", s.notifications.dm_pacing_ms);
    println!("  Max uses/link:    {}", s.invites.max_uses_per_code);
}

fn on_off(v: bool) -> String {
    if v {
        style_green("on")
    } else {
        style_dim("off")
    }
}
