pub mod create;
pub mod end;
pub mod leaderboard;
pub mod list;
pub mod settings;
pub mod stats;
