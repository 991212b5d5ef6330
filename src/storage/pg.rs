//! PostgreSQL storage for giveaways
//!
//! Remote backend. Connects with DATABASE_URL and applies embedded
//! migrations on startup.

use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use super::{GiveawayRepository, InviteState};
use crate::config::Settings;
use crate::error::{StorageError, StorageResult};
use crate::models::{Giveaway, InviteCode, InviteTrackingRecord, UserId};

/// Database pool configuration
const DB_POOL_MAX_SIZE: usize = 10;
const DB_QUERY_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct PgRepository {
    pool: Pool,
}

impl PgRepository {
    /// Create storage from DATABASE_URL
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        use deadpool_postgres::{ManagerConfig, PoolConfig, RecyclingMethod};
        use std::time::Duration;

        let mut config = Config::new();
        config.url = Some(database_url.to_string());

        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        config.pool = Some(PoolConfig {
            max_size: DB_POOL_MAX_SIZE,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(Duration::from_secs(DB_QUERY_TIMEOUT_SECS)),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });

        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Test connection
        let client = pool.get().await?;
        client
            .execute(
                &format!("SET statement_timeout = '{}s'", DB_QUERY_TIMEOUT_SECS),
                &[],
            )
            .await?;

        info!(
            "Connected to PostgreSQL (pool_size: {}, query_timeout: {}s)",
            DB_POOL_MAX_SIZE, DB_QUERY_TIMEOUT_SECS
        );

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run embedded migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        let client = self.pool.get().await?;

        let exists: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = 'schema_migrations')",
                &[],
            )
            .await?
            .get(0);

        if !exists {
            let migration_sql = include_str!("../../migrations/001_schema.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 001_schema");
        }

        Ok(())
    }

    async fn upsert_giveaway(&self, giveaway: &Giveaway) -> StorageResult<()> {
        let client = self.pool.get().await?;
        let data = serde_json::to_value(giveaway)?;
        let status = serde_json::to_value(giveaway.status())?
            .as_str()
            .unwrap_or("active")
            .to_string();

        client
            .execute(
                "INSERT INTO giveaways (id, status, end_time, data)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, data = EXCLUDED.data, updated_at = NOW()",
                &[&giveaway.id, &status, &giveaway.end_time(), &data],
            )
            .await?;
        Ok(())
    }
}

fn to_u32(value: i64) -> StorageResult<u32> {
    u32::try_from(value).map_err(|_| StorageError::Other(format!("count out of range: {}", value)))
}

#[async_trait]
impl GiveawayRepository for PgRepository {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn load_settings(&self) -> StorageResult<Option<Settings>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT value FROM settings WHERE key = 'settings'", &[])
            .await?;

        match row {
            Some(r) => {
                let value: serde_json::Value = r.get(0);
                Ok(Some(serde_json::from_value(value)?))
            }
            None => Ok(None),
        }
    }

    async fn save_settings(&self, settings: &Settings) -> StorageResult<()> {
        let client = self.pool.get().await?;
        let value = serde_json::to_value(settings)?;
        client
            .execute(
                "INSERT INTO settings (key, value) VALUES ('settings', $1)
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
                &[&value],
            )
            .await?;
        Ok(())
    }

    async fn load_all_giveaways(&self) -> StorageResult<Vec<Giveaway>> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT data FROM giveaways ORDER BY end_time", &[])
            .await?;
        let participant_rows = client
            .query("SELECT giveaway_id, user_id FROM participants", &[])
            .await?;

        let mut giveaways = Vec::with_capacity(rows.len());
        for row in rows {
            let value: serde_json::Value = row.get(0);
            let mut giveaway: Giveaway = serde_json::from_value(value)?;
            giveaway.participants.extend(
                participant_rows
                    .iter()
                    .filter(|p| p.get::<_, String>(0) == giveaway.id)
                    .map(|p| p.get::<_, String>(1)),
            );
            giveaways.push(giveaway);
        }

        debug!("Loaded {} giveaways from PostgreSQL", giveaways.len());
        Ok(giveaways)
    }

    async fn create_giveaway(&self, giveaway: &Giveaway) -> StorageResult<()> {
        self.upsert_giveaway(giveaway).await
    }

    async fn update_giveaway(&self, giveaway: &Giveaway) -> StorageResult<()> {
        self.upsert_giveaway(giveaway).await
    }

    async fn load_participants(&self, giveaway_id: &str) -> StorageResult<Vec<UserId>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT user_id FROM participants WHERE giveaway_id = $1 ORDER BY entered_at",
                &[&giveaway_id],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn add_participant(&self, giveaway_id: &str, user_id: &str) -> StorageResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO participants (giveaway_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                &[&giveaway_id, &user_id],
            )
            .await?;
        Ok(())
    }

    async fn load_invite_state(&self) -> StorageResult<InviteState> {
        let client = self.pool.get().await?;

        let tracking = client
            .query(
                "SELECT user_id, total_invites, codes, username FROM invite_tracking",
                &[],
            )
            .await?
            .iter()
            .map(|r| {
                Ok(InviteTrackingRecord {
                    user_id: r.get(0),
                    total_invites: to_u32(r.get(1))?,
                    codes: r.get(2),
                    username: r.get(3),
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let codes = client
            .query(
                "SELECT code, owner_id, giveaway_id, uses, max_uses, expires_at, created_at FROM invite_codes",
                &[],
            )
            .await?
            .iter()
            .map(|r| {
                Ok(InviteCode {
                    code: r.get(0),
                    owner_id: r.get(1),
                    giveaway_id: r.get(2),
                    uses: to_u32(r.get(3))?,
                    max_uses: to_u32(r.get(4))?,
                    expires_at: r.get(5),
                    created_at: r.get(6),
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let invited = client
            .query(
                "SELECT giveaway_id, inviter_id, invitee_id FROM invited_users ORDER BY invited_at",
                &[],
            )
            .await?
            .iter()
            .map(|r| (r.get(0), r.get(1), r.get(2)))
            .collect();

        let counts = client
            .query("SELECT giveaway_id, user_id, count FROM user_invites", &[])
            .await?
            .iter()
            .map(|r| Ok((r.get(0), r.get(1), to_u32(r.get(2))?)))
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(InviteState {
            tracking,
            codes,
            invited,
            counts,
        })
    }

    async fn update_invite_tracking(&self, record: &InviteTrackingRecord) -> StorageResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO invite_tracking (user_id, total_invites, codes, username)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (user_id) DO UPDATE SET
                    total_invites = EXCLUDED.total_invites,
                    codes = EXCLUDED.codes,
                    username = COALESCE(EXCLUDED.username, invite_tracking.username)",
                &[
                    &record.user_id,
                    &(record.total_invites as i64),
                    &record.codes,
                    &record.username,
                ],
            )
            .await?;
        Ok(())
    }

    async fn add_invited_user(
        &self,
        giveaway_id: &str,
        inviter_id: &str,
        invitee_id: &str,
    ) -> StorageResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO invited_users (giveaway_id, inviter_id, invitee_id)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (giveaway_id, invitee_id) DO NOTHING",
                &[&giveaway_id, &inviter_id, &invitee_id],
            )
            .await?;
        Ok(())
    }

    async fn update_user_invites(
        &self,
        giveaway_id: &str,
        user_id: &str,
        count: u32,
    ) -> StorageResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO user_invites (giveaway_id, user_id, count) VALUES ($1, $2, $3)
                 ON CONFLICT (giveaway_id, user_id) DO UPDATE SET count = EXCLUDED.count",
                &[&giveaway_id, &user_id, &(count as i64)],
            )
            .await?;
        Ok(())
    }

    async fn create_invite_code(&self, code: &InviteCode) -> StorageResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO invite_codes (code, owner_id, giveaway_id, uses, max_uses, expires_at, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (code) DO NOTHING",
                &[
                    &code.code,
                    &code.owner_id,
                    &code.giveaway_id,
                    &(code.uses as i64),
                    &(code.max_uses as i64),
                    &code.expires_at,
                    &code.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_invite_code_uses(&self, code: &str, uses: u32) -> StorageResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE invite_codes SET uses = $2 WHERE code = $1 AND uses < $2",
                &[&code, &(uses as i64)],
            )
            .await?;
        Ok(())
    }
}
