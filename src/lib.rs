//! Invite Giveaways - time-boxed prize drawings for chat communities
//!
//! Members enter a giveaway or share a personal invite link. New members who
//! join through a tracked link credit their inviter, unless the join looks
//! like farming. When a giveaway expires the engine draws winners, announces
//! them and cleans up its leaderboard channels.
//!
//! # How it works
//!
//! 1. A moderator creates a giveaway, which is announced in its channel
//! 2. Participants request invite links bound to the giveaway
//! 3. Each member join is matched to the link whose use count went up by one
//! 4. Anti-cheat decides whether the join counts for the inviter
//! 5. Leaderboards are refreshed after every credited invite and on a timer
//! 6. At expiry the top inviters (or random entrants) win
//!
//! # Anti-abuse measures
//!
//! - Bots and accounts younger than the configured age never count
//! - Throwaway-looking names and bursts of guild joins are rejected outright
//! - Very young accounts without an avatar are rejected by a fixed score
//! - Each invitee is counted at most once per giveaway

pub mod anticheat;
pub mod attribution;
pub mod config;
pub mod discord;
pub mod error;
pub mod leaderboard;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod platform;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod storage;
pub mod store;
pub mod winners;

pub use config::{Config, Settings, SettingsPatch};
pub use discord::DiscordClient;
pub use error::{PlatformError, StorageError, ValidationError};
pub use models::{Giveaway, GiveawayKind, GiveawayStatus, NewGiveaway};
pub use platform::{ChatPlatform, Member, MemberJoined};
pub use service::GiveawayService;
pub use store::GiveawayStore;
