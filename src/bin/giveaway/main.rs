//! Invite Giveaways CLI
//!
//! Moderator tool that talks to a running giveaway server.

mod client;
mod commands;
mod style;

use clap::{Parser, Subcommand};
use invite_giveaways::SettingsPatch;
use style::*;

#[derive(Parser)]
#[command(name = "giveaway")]
#[command(author = "CortexLM")]
#[command(version)]
#[command(about = "Invite Giveaways - run invite contests and prize drawings", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Giveaway server URL
    #[arg(
        short,
        long,
        env = "GIVEAWAY_SERVER",
        default_value = "http://localhost:8080",
        global = true
    )]
    server: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Server health and totals (default)
    #[command(visible_alias = "st")]
    Stats,

    /// List giveaways, newest first
    #[command(visible_alias = "ls")]
    List {
        /// Only show active giveaways
        #[arg(short, long)]
        active: bool,
    },

    /// Show the invite leaderboard of a giveaway
    #[command(visible_alias = "lb")]
    Leaderboard {
        giveaway_id: String,

        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Create a giveaway
    #[command(visible_alias = "new")]
    Create {
        /// Title shown in the announcement
        #[arg(short, long)]
        title: String,

        /// Prize description
        #[arg(short, long)]
        prize: String,

        #[arg(short, long)]
        description: Option<String>,

        /// Announcement channel ID
        #[arg(short, long)]
        channel: String,

        /// How long it runs: 90s, 30m, 2h, 7d
        #[arg(long, default_value = "1d")]
        duration: String,

        #[arg(short, long, default_value = "1")]
        winners: u32,

        /// Random draw among entrants instead of an invite contest
        #[arg(long)]
        classic: bool,

        /// Invites needed to be eligible
        #[arg(long, default_value = "0")]
        min_invites: u32,

        /// Moderator user ID recorded as the creator
        #[arg(long, env = "GIVEAWAY_MODERATOR", default_value = "")]
        created_by: String,
    },

    /// End a giveaway now and draw winners
    End { giveaway_id: String },

    /// Show or change runtime settings
    Settings {
        #[arg(long)]
        max_winners: Option<u32>,
        #[arg(long)]
        max_active: Option<usize>,
        #[arg(long)]
        anti_cheat: Option<bool>,
        #[arg(long)]
        min_account_age_days: Option<u32>,
        #[arg(long)]
        auto_post: Option<bool>,
        /// Category the live leaderboard channels are created in
        #[arg(long)]
        category: Option<String>,
        /// Auto-post refresh interval in seconds (10-3600)
        #[arg(long)]
        refresh_interval: Option<u64>,
        /// Daily leaderboard post time, HH:MM in UTC
        #[arg(long)]
        daily_post_time: Option<String>,
        #[arg(long)]
        dm_winners: Option<bool>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }

    let command = cli.command.unwrap_or(Commands::Stats);

    let result = match command {
        Commands::Stats => commands::stats::run(&cli.server).await,
        Commands::List { active } => commands::list::run(&cli.server, active).await,
        Commands::Leaderboard { giveaway_id, limit } => {
            commands::leaderboard::run(&cli.server, &giveaway_id, limit).await
        }
        Commands::Create {
            title,
            prize,
            description,
            channel,
            duration,
            winners,
            classic,
            min_invites,
            created_by,
        } => {
            let args = commands::create::CreateArgs {
                title,
                prize,
                description,
                channel,
                duration,
                winners,
                classic,
                min_invites,
                created_by,
            };
            commands::create::run(&cli.server, args).await
        }
        Commands::End { giveaway_id } => commands::end::run(&cli.server, &giveaway_id).await,
        Commands::Settings {
            max_winners,
            max_active,
            anti_cheat,
            min_account_age_days,
            auto_post,
            category,
            refresh_interval,
            daily_post_time,
            dm_winners,
        } => {
            let patch = SettingsPatch {
                max_winners,
                max_active_giveaways: max_active,
                anti_cheat_enabled: anti_cheat,
                min_account_age_days,
                auto_post_enabled: auto_post,
                auto_post_category_id: category,
                refresh_interval_secs: refresh_interval,
                daily_post_time,
                dm_winners,
                ..Default::default()
            };
            let changed = has_changes(&patch);
            commands::settings::run(&cli.server, changed.then_some(patch)).await
        }
    };

    if let Err(e) = result {
        print_error(&format!("{}", e));
        std::process::exit(1);
    }
}

fn has_changes(patch: &SettingsPatch) -> bool {
    serde_json::to_value(patch)
        .ok()
        .and_then(|v| v.as_object().map(|o| o.values().any(|v| !v.is_null())))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_patch_has_no_changes() {
        assert!(!has_changes(&SettingsPatch::default()));
        let patch = SettingsPatch {
            dm_winners: Some(false),
            ..Default::default()
        };
        assert!(has_changes(&patch));
    }

    #[test]
    fn test_cli_parses_create() {
        let cli = Cli::parse_from([
            "giveaway", "create", "-t", "Nitro", "-p", "Nitro", "-c", "123", "--duration", "2h",
        ]);
        match cli.command {
            Some(Commands::Create { duration, winners, classic, .. }) => {
                assert_eq!(duration, "2h");
                assert_eq!(winners, 1);
                assert!(!classic);
            }
            _ => panic!("expected create"),
        }
    }
}
