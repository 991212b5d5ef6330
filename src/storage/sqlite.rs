//! Local file storage for giveaways

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use super::{GiveawayRepository, InviteState};
use crate::config::Settings;
use crate::error::StorageResult;
use crate::models::{Giveaway, InviteCode, InviteTrackingRecord, UserId};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS giveaways (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    end_time TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS participants (
    giveaway_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    entered_at TEXT NOT NULL,
    PRIMARY KEY (giveaway_id, user_id)
);
CREATE TABLE IF NOT EXISTS invite_codes (
    code TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    giveaway_id TEXT NOT NULL,
    uses INTEGER NOT NULL DEFAULT 0,
    max_uses INTEGER NOT NULL,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS invite_tracking (
    user_id TEXT PRIMARY KEY,
    total_invites INTEGER NOT NULL DEFAULT 0,
    codes TEXT NOT NULL DEFAULT '[]',
    username TEXT
);
CREATE TABLE IF NOT EXISTS invited_users (
    giveaway_id TEXT NOT NULL,
    inviter_id TEXT NOT NULL,
    invitee_id TEXT NOT NULL,
    invited_at TEXT NOT NULL,
    PRIMARY KEY (giveaway_id, invitee_id)
);
CREATE TABLE IF NOT EXISTS user_invites (
    giveaway_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (giveaway_id, user_id)
);
"#;

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.run_migrations()?;
        Ok(storage)
    }

    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.run_migrations()?;
        Ok(storage)
    }

    fn run_migrations(&self) -> StorageResult<()> {
        self.conn.lock().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn upsert_giveaway(&self, giveaway: &Giveaway) -> StorageResult<()> {
        let data = serde_json::to_string(giveaway)?;
        let status = serde_json::to_value(giveaway.status())?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO giveaways (id, status, end_time, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data",
            params![
                giveaway.id,
                status.as_str().unwrap_or("active"),
                giveaway.end_time().to_rfc3339(),
                data,
            ],
        )?;
        Ok(())
    }
}

fn parse_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[async_trait]
impl GiveawayRepository for SqliteRepository {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn load_settings(&self) -> StorageResult<Option<Settings>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = 'settings'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    async fn save_settings(&self, settings: &Settings) -> StorageResult<()> {
        let value = serde_json::to_string(settings)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('settings', ?1)",
            params![value],
        )?;
        Ok(())
    }

    async fn load_all_giveaways(&self) -> StorageResult<Vec<Giveaway>> {
        let rows: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT data FROM giveaways ORDER BY end_time")?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut giveaways = Vec::with_capacity(rows.len());
        for data in rows {
            let mut giveaway: Giveaway = serde_json::from_str(&data)?;
            let participants = self.load_participants(&giveaway.id).await?;
            giveaway.participants.extend(participants);
            giveaways.push(giveaway);
        }
        Ok(giveaways)
    }

    async fn create_giveaway(&self, giveaway: &Giveaway) -> StorageResult<()> {
        self.upsert_giveaway(giveaway)
    }

    async fn update_giveaway(&self, giveaway: &Giveaway) -> StorageResult<()> {
        self.upsert_giveaway(giveaway)
    }

    async fn load_participants(&self, giveaway_id: &str) -> StorageResult<Vec<UserId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM participants WHERE giveaway_id = ?1 ORDER BY entered_at",
        )?;
        let users = stmt
            .query_map(params![giveaway_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    async fn add_participant(&self, giveaway_id: &str, user_id: &str) -> StorageResult<()> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO participants (giveaway_id, user_id, entered_at) VALUES (?1, ?2, ?3)",
            params![giveaway_id, user_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn load_invite_state(&self) -> StorageResult<InviteState> {
        let conn = self.conn.lock();

        let mut stmt =
            conn.prepare("SELECT user_id, total_invites, codes, username FROM invite_tracking")?;
        let raw_tracking = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut tracking = Vec::with_capacity(raw_tracking.len());
        for (user_id, total_invites, codes, username) in raw_tracking {
            tracking.push(InviteTrackingRecord {
                user_id,
                total_invites,
                codes: serde_json::from_str(&codes)?,
                username,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT code, owner_id, giveaway_id, uses, max_uses, expires_at, created_at FROM invite_codes",
        )?;
        let codes = stmt
            .query_map([], |row| {
                Ok(InviteCode {
                    code: row.get(0)?,
                    owner_id: row.get(1)?,
                    giveaway_id: row.get(2)?,
                    uses: row.get(3)?,
                    max_uses: row.get(4)?,
                    expires_at: parse_time(5, row.get(5)?)?,
                    created_at: parse_time(6, row.get(6)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT giveaway_id, inviter_id, invitee_id FROM invited_users ORDER BY invited_at",
        )?;
        let invited = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare("SELECT giveaway_id, user_id, count FROM user_invites")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(InviteState {
            tracking,
            codes,
            invited,
            counts,
        })
    }

    async fn update_invite_tracking(&self, record: &InviteTrackingRecord) -> StorageResult<()> {
        let codes = serde_json::to_string(&record.codes)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO invite_tracking (user_id, total_invites, codes, username) VALUES (?1, ?2, ?3, ?4)",
            params![record.user_id, record.total_invites, codes, record.username],
        )?;
        Ok(())
    }

    async fn add_invited_user(
        &self,
        giveaway_id: &str,
        inviter_id: &str,
        invitee_id: &str,
    ) -> StorageResult<()> {
        // The primary key keeps an invitee under at most one inviter
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO invited_users (giveaway_id, inviter_id, invitee_id, invited_at) VALUES (?1, ?2, ?3, ?4)",
            params![giveaway_id, inviter_id, invitee_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn update_user_invites(
        &self,
        giveaway_id: &str,
        user_id: &str,
        count: u32,
    ) -> StorageResult<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO user_invites (giveaway_id, user_id, count) VALUES (?1, ?2, ?3)",
            params![giveaway_id, user_id, count],
        )?;
        Ok(())
    }

    async fn create_invite_code(&self, code: &InviteCode) -> StorageResult<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO invite_codes (code, owner_id, giveaway_id, uses, max_uses, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                code.code,
                code.owner_id,
                code.giveaway_id,
                code.uses,
                code.max_uses,
                code.expires_at.to_rfc3339(),
                code.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn update_invite_code_uses(&self, code: &str, uses: u32) -> StorageResult<()> {
        // Never move a stored count backwards
        self.conn.lock().execute(
            "UPDATE invite_codes SET uses = ?2 WHERE code = ?1 AND uses < ?2",
            params![code, uses],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GiveawayKind, NewGiveaway};
    use chrono::Duration;

    fn sample(id: &str) -> Giveaway {
        let now = Utc::now();
        Giveaway::new(
            id,
            NewGiveaway {
                title: "Invite race".into(),
                prize: "Nitro".into(),
                kind: GiveawayKind::Invite,
                winner_count: 2,
                ..Default::default()
            },
            now + Duration::days(1),
            now,
        )
    }

    #[tokio::test]
    async fn test_giveaway_roundtrip_with_participants() {
        let repo = SqliteRepository::in_memory().unwrap();
        let mut g = sample("g1");
        repo.create_giveaway(&g).await.unwrap();
        repo.add_participant("g1", "u1").await.unwrap();
        repo.add_participant("g1", "u1").await.unwrap();

        g.mark_ended(vec!["u1".into()], Utc::now());
        repo.update_giveaway(&g).await.unwrap();

        let loaded = repo.load_all_giveaways().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].is_active());
        assert_eq!(loaded[0].winner_ids(), ["u1".to_string()]);
        assert_eq!(loaded[0].participants.len(), 1);
    }

    #[tokio::test]
    async fn test_settings_roundtrip() {
        let repo = SqliteRepository::in_memory().unwrap();
        assert!(repo.load_settings().await.unwrap().is_none());

        let mut settings = Settings::default();
        settings.leaderboard.refresh_interval_secs = 60;
        repo.save_settings(&settings).await.unwrap();
        assert_eq!(repo.load_settings().await.unwrap(), Some(settings));
    }

    #[tokio::test]
    async fn test_invite_state() {
        let repo = SqliteRepository::in_memory().unwrap();
        let now = Utc::now();
        repo.create_invite_code(&InviteCode {
            code: "abc".into(),
            owner_id: "u1".into(),
            giveaway_id: "g1".into(),
            uses: 0,
            max_uses: 100,
            expires_at: now,
            created_at: now,
        })
        .await
        .unwrap();
        repo.update_invite_code_uses("abc", 2).await.unwrap();
        repo.update_invite_code_uses("abc", 1).await.unwrap();

        repo.add_invited_user("g1", "u1", "u2").await.unwrap();
        // Same invitee under another inviter is ignored
        repo.add_invited_user("g1", "u3", "u2").await.unwrap();
        repo.update_user_invites("g1", "u1", 1).await.unwrap();
        repo.update_invite_tracking(&InviteTrackingRecord {
            user_id: "u1".into(),
            total_invites: 1,
            codes: vec!["abc".into()],
            username: Some("alice".into()),
        })
        .await
        .unwrap();

        let state = repo.load_invite_state().await.unwrap();
        assert_eq!(state.codes[0].uses, 2);
        assert_eq!(
            state.invited,
            vec![("g1".to_string(), "u1".to_string(), "u2".to_string())]
        );
        assert_eq!(state.counts, vec![("g1".to_string(), "u1".to_string(), 1)]);
        assert_eq!(state.tracking[0].codes, vec!["abc".to_string()]);
    }
}
