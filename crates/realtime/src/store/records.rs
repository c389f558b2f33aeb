// Daily usage record persistence.
//
// Both backends share one contract: `load_*` returns the record for a
// (user, tenant, day) key if it exists, and `save_*` is a compare-and-swap on
// `version`. A record with version 0 is inserted; anything else is updated
// only if the stored version still matches. Losing either race yields
// `TrackingError::ConcurrencyConflict`, which the retry guard consumes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Context;
use atelier_common::usage::{
    DailyModuleUsageRecord, DailyPresenceRecord, FeatureModule, ModuleSession, Session,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{types::Json, PgPool};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::TrackingError;

#[derive(Clone)]
pub enum RecordStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryRecords>>),
}

type PresenceKey = (Uuid, Uuid, NaiveDate);
type ModuleKey = (Uuid, Uuid, FeatureModule, NaiveDate);

#[derive(Default)]
pub struct MemoryRecords {
    presence: HashMap<PresenceKey, DailyPresenceRecord>,
    modules: HashMap<ModuleKey, DailyModuleUsageRecord>,
    /// Saves that will fail with a version conflict before touching state.
    forced_conflicts: u32,
}

impl RecordStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryRecords::default())))
    }

    pub async fn load_presence(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<DailyPresenceRecord>, TrackingError> {
        match self {
            Self::Postgres(pool) => load_presence_pg(pool, user_id, tenant_id, date).await,
            Self::Memory(store) => {
                Ok(store.read().await.presence.get(&(user_id, tenant_id, date)).cloned())
            }
        }
    }

    pub async fn save_presence(&self, record: DailyPresenceRecord) -> Result<(), TrackingError> {
        match self {
            Self::Postgres(pool) => save_presence_pg(pool, &record).await,
            Self::Memory(store) => save_presence_mem(&mut *store.write().await, record),
        }
    }

    pub async fn load_module_usage(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        module: FeatureModule,
        date: NaiveDate,
    ) -> Result<Option<DailyModuleUsageRecord>, TrackingError> {
        match self {
            Self::Postgres(pool) => {
                load_module_usage_pg(pool, user_id, tenant_id, module, date).await
            }
            Self::Memory(store) => {
                Ok(store.read().await.modules.get(&(user_id, tenant_id, module, date)).cloned())
            }
        }
    }

    pub async fn save_module_usage(
        &self,
        record: DailyModuleUsageRecord,
    ) -> Result<(), TrackingError> {
        match self {
            Self::Postgres(pool) => save_module_usage_pg(pool, &record).await,
            Self::Memory(store) => save_module_usage_mem(&mut *store.write().await, record),
        }
    }

    /// Every module record of one user for one day, ordered by module name.
    pub async fn list_module_usage(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<DailyModuleUsageRecord>, TrackingError> {
        match self {
            Self::Postgres(pool) => list_module_usage_pg(pool, user_id, tenant_id, date).await,
            Self::Memory(store) => {
                let store = store.read().await;
                let mut records: Vec<_> = store
                    .modules
                    .values()
                    .filter(|record| {
                        record.user_id == user_id
                            && record.tenant_id == tenant_id
                            && record.date == date
                    })
                    .cloned()
                    .collect();
                records.sort_by_key(|record| record.module.as_str());
                Ok(records)
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn force_conflicts(&self, count: u32) {
        if let Self::Memory(store) = self {
            store.write().await.forced_conflicts = count;
        }
    }
}

// ── Postgres ───────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct PresenceRow {
    id: Uuid,
    user_id: Uuid,
    tenant_id: Uuid,
    day: NaiveDate,
    total_time_ms: i64,
    sessions: Json<Vec<Session>>,
    is_currently_online: bool,
    last_activity: DateTime<Utc>,
    version: i64,
}

impl From<PresenceRow> for DailyPresenceRecord {
    fn from(row: PresenceRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            tenant_id: row.tenant_id,
            date: row.day,
            total_time: row.total_time_ms,
            sessions: row.sessions.0,
            is_currently_online: row.is_currently_online,
            last_activity: row.last_activity,
            version: row.version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ModuleUsageRow {
    id: Uuid,
    user_id: Uuid,
    tenant_id: Uuid,
    module: String,
    day: NaiveDate,
    socket_ids: Json<BTreeSet<String>>,
    sessions: Json<Vec<ModuleSession>>,
    total_time_ms: i64,
    last_activity: DateTime<Utc>,
    version: i64,
}

impl TryFrom<ModuleUsageRow> for DailyModuleUsageRecord {
    type Error = TrackingError;

    fn try_from(row: ModuleUsageRow) -> Result<Self, Self::Error> {
        let module = row
            .module
            .parse::<FeatureModule>()
            .with_context(|| format!("daily_module_usage row {} has unknown module", row.id))?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            tenant_id: row.tenant_id,
            module,
            date: row.day,
            socket_ids: row.socket_ids.0,
            sessions: row.sessions.0,
            total_time: row.total_time_ms,
            last_activity: row.last_activity,
            version: row.version,
        })
    }
}

async fn load_presence_pg(
    pool: &PgPool,
    user_id: Uuid,
    tenant_id: Uuid,
    date: NaiveDate,
) -> Result<Option<DailyPresenceRecord>, TrackingError> {
    let row = sqlx::query_as::<_, PresenceRow>(
        r#"
        SELECT id, user_id, tenant_id, day, total_time_ms, sessions,
               is_currently_online, last_activity, version
        FROM daily_presence
        WHERE user_id = $1 AND tenant_id = $2 AND day = $3
        "#,
    )
    .bind(user_id)
    .bind(tenant_id)
    .bind(date)
    .fetch_optional(pool)
    .await
    .map_err(map_sqlx_error)?;

    Ok(row.map(Into::into))
}

async fn save_presence_pg(
    pool: &PgPool,
    record: &DailyPresenceRecord,
) -> Result<(), TrackingError> {
    let sessions = Json(&record.sessions);

    let rows_affected = if record.is_persisted() {
        sqlx::query(
            r#"
            UPDATE daily_presence
            SET total_time_ms = $3,
                sessions = $4,
                is_currently_online = $5,
                last_activity = $6,
                version = version + 1,
                updated_at = now()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(record.id)
        .bind(record.version)
        .bind(record.total_time)
        .bind(sessions)
        .bind(record.is_currently_online)
        .bind(record.last_activity)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected()
    } else {
        sqlx::query(
            r#"
            INSERT INTO daily_presence
                (id, user_id, tenant_id, day, total_time_ms, sessions,
                 is_currently_online, last_activity, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.tenant_id)
        .bind(record.date)
        .bind(record.total_time)
        .bind(sessions)
        .bind(record.is_currently_online)
        .bind(record.last_activity)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected()
    };

    if rows_affected == 0 {
        return Err(TrackingError::ConcurrencyConflict);
    }
    Ok(())
}

const MODULE_USAGE_COLUMNS: &str = "id, user_id, tenant_id, module, day, socket_ids, sessions, \
                                    total_time_ms, last_activity, version";

async fn load_module_usage_pg(
    pool: &PgPool,
    user_id: Uuid,
    tenant_id: Uuid,
    module: FeatureModule,
    date: NaiveDate,
) -> Result<Option<DailyModuleUsageRecord>, TrackingError> {
    let row = sqlx::query_as::<_, ModuleUsageRow>(&format!(
        "SELECT {MODULE_USAGE_COLUMNS} FROM daily_module_usage \
         WHERE user_id = $1 AND tenant_id = $2 AND module = $3 AND day = $4"
    ))
    .bind(user_id)
    .bind(tenant_id)
    .bind(module.as_str())
    .bind(date)
    .fetch_optional(pool)
    .await
    .map_err(map_sqlx_error)?;

    row.map(TryInto::try_into).transpose()
}

async fn list_module_usage_pg(
    pool: &PgPool,
    user_id: Uuid,
    tenant_id: Uuid,
    date: NaiveDate,
) -> Result<Vec<DailyModuleUsageRecord>, TrackingError> {
    let rows = sqlx::query_as::<_, ModuleUsageRow>(&format!(
        "SELECT {MODULE_USAGE_COLUMNS} FROM daily_module_usage \
         WHERE user_id = $1 AND tenant_id = $2 AND day = $3 \
         ORDER BY module"
    ))
    .bind(user_id)
    .bind(tenant_id)
    .bind(date)
    .fetch_all(pool)
    .await
    .map_err(map_sqlx_error)?;

    rows.into_iter().map(TryInto::try_into).collect()
}

async fn save_module_usage_pg(
    pool: &PgPool,
    record: &DailyModuleUsageRecord,
) -> Result<(), TrackingError> {
    let socket_ids = Json(&record.socket_ids);
    let sessions = Json(&record.sessions);

    let rows_affected = if record.is_persisted() {
        sqlx::query(
            r#"
            UPDATE daily_module_usage
            SET socket_ids = $3,
                sessions = $4,
                total_time_ms = $5,
                last_activity = $6,
                version = version + 1,
                updated_at = now()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(record.id)
        .bind(record.version)
        .bind(socket_ids)
        .bind(sessions)
        .bind(record.total_time)
        .bind(record.last_activity)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected()
    } else {
        sqlx::query(
            r#"
            INSERT INTO daily_module_usage
                (id, user_id, tenant_id, module, day, socket_ids, sessions,
                 total_time_ms, last_activity, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 1)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.tenant_id)
        .bind(record.module.as_str())
        .bind(record.date)
        .bind(socket_ids)
        .bind(sessions)
        .bind(record.total_time)
        .bind(record.last_activity)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected()
    };

    if rows_affected == 0 {
        return Err(TrackingError::ConcurrencyConflict);
    }
    Ok(())
}

fn map_sqlx_error(error: sqlx::Error) -> TrackingError {
    if let sqlx::Error::Database(db_error) = &error {
        // Another writer inserted the same (user, tenant, day) first.
        if db_error.code().as_deref() == Some("23505") {
            return TrackingError::ConcurrencyConflict;
        }
    }
    TrackingError::Store(error.into())
}

// ── Memory ─────────────────────────────────────────────────────────

impl MemoryRecords {
    fn take_forced_conflict(&mut self) -> bool {
        if self.forced_conflicts == 0 {
            return false;
        }
        self.forced_conflicts -= 1;
        true
    }
}

fn save_presence_mem(
    store: &mut MemoryRecords,
    mut record: DailyPresenceRecord,
) -> Result<(), TrackingError> {
    if store.take_forced_conflict() {
        return Err(TrackingError::ConcurrencyConflict);
    }

    let key = (record.user_id, record.tenant_id, record.date);
    let stored_version = store.presence.get(&key).map(|current| (current.id, current.version));
    check_version(stored_version, record.id, record.version)?;

    record.version += 1;
    store.presence.insert(key, record);
    Ok(())
}

fn save_module_usage_mem(
    store: &mut MemoryRecords,
    mut record: DailyModuleUsageRecord,
) -> Result<(), TrackingError> {
    if store.take_forced_conflict() {
        return Err(TrackingError::ConcurrencyConflict);
    }

    let key = (record.user_id, record.tenant_id, record.module, record.date);
    let stored_version = store.modules.get(&key).map(|current| (current.id, current.version));
    check_version(stored_version, record.id, record.version)?;

    record.version += 1;
    store.modules.insert(key, record);
    Ok(())
}

fn check_version(
    stored: Option<(Uuid, i64)>,
    id: Uuid,
    expected_version: i64,
) -> Result<(), TrackingError> {
    match stored {
        None if expected_version == 0 => Ok(()),
        Some((stored_id, stored_version))
            if stored_id == id && stored_version == expected_version =>
        {
            Ok(())
        }
        _ => Err(TrackingError::ConcurrencyConflict),
    }
}

#[cfg(test)]
mod tests {
    use super::RecordStore;
    use crate::error::TrackingError;
    use atelier_common::usage::{
        DailyModuleUsageRecord, DailyPresenceRecord, FeatureModule, ModuleSession,
    };
    use chrono::{NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    fn fresh_presence(user_id: Uuid, tenant_id: Uuid) -> DailyPresenceRecord {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
        DailyPresenceRecord::first_of_day(user_id, tenant_id, day(), now)
    }

    #[tokio::test]
    async fn first_save_inserts_with_version_one() {
        let store = RecordStore::in_memory();
        let (user_id, tenant_id) = (Uuid::new_v4(), Uuid::new_v4());

        store.save_presence(fresh_presence(user_id, tenant_id)).await.expect("insert");

        let loaded = store
            .load_presence(user_id, tenant_id, day())
            .await
            .expect("load")
            .expect("record should exist");
        assert_eq!(loaded.version, 1);
        assert!(loaded.is_persisted());
    }

    #[tokio::test]
    async fn second_insert_for_same_day_conflicts() {
        let store = RecordStore::in_memory();
        let (user_id, tenant_id) = (Uuid::new_v4(), Uuid::new_v4());

        store.save_presence(fresh_presence(user_id, tenant_id)).await.expect("insert");
        let error = store
            .save_presence(fresh_presence(user_id, tenant_id))
            .await
            .expect_err("duplicate insert should conflict");
        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn stale_version_update_conflicts_and_leaves_record_untouched() {
        let store = RecordStore::in_memory();
        let (user_id, tenant_id) = (Uuid::new_v4(), Uuid::new_v4());
        store.save_presence(fresh_presence(user_id, tenant_id)).await.expect("insert");

        let loaded = store.load_presence(user_id, tenant_id, day()).await.unwrap().unwrap();
        let mut winner = loaded.clone();
        winner.is_currently_online = false;
        store.save_presence(winner).await.expect("first update wins");

        let mut loser = loaded;
        loser.total_time = 42;
        assert!(matches!(
            store.save_presence(loser).await,
            Err(TrackingError::ConcurrencyConflict)
        ));

        let current = store.load_presence(user_id, tenant_id, day()).await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.total_time, 0);
        assert!(!current.is_currently_online);
    }

    #[tokio::test]
    async fn records_are_scoped_per_tenant() {
        let store = RecordStore::in_memory();
        let user_id = Uuid::new_v4();
        let (tenant_a, tenant_b) = (Uuid::new_v4(), Uuid::new_v4());

        store.save_presence(fresh_presence(user_id, tenant_a)).await.expect("tenant a");
        store.save_presence(fresh_presence(user_id, tenant_b)).await.expect("tenant b");

        assert!(store.load_presence(user_id, tenant_a, day()).await.unwrap().is_some());
        assert!(store.load_presence(user_id, tenant_b, day()).await.unwrap().is_some());
        assert!(store.load_presence(Uuid::new_v4(), tenant_a, day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn module_records_list_sorted_by_module() {
        let store = RecordStore::in_memory();
        let (user_id, tenant_id) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();

        for module in [FeatureModule::VideoGeneration, FeatureModule::Gallery] {
            let mut record = DailyModuleUsageRecord::empty(user_id, tenant_id, module, day(), now);
            record.socket_ids.insert("tab-1".into());
            record.sessions.push(ModuleSession::open("tab-1", now));
            store.save_module_usage(record).await.expect("insert module usage");
        }

        let listed = store.list_module_usage(user_id, tenant_id, day()).await.expect("list");
        let modules: Vec<_> = listed.iter().map(|record| record.module).collect();
        assert_eq!(modules, vec![FeatureModule::Gallery, FeatureModule::VideoGeneration]);
        assert!(listed.iter().all(|record| record.version == 1));
    }

    #[tokio::test]
    async fn forced_conflicts_are_consumed_one_save_at_a_time() {
        let store = RecordStore::in_memory();
        let (user_id, tenant_id) = (Uuid::new_v4(), Uuid::new_v4());
        store.force_conflicts(1).await;

        assert!(store.save_presence(fresh_presence(user_id, tenant_id)).await.is_err());
        assert!(store.save_presence(fresh_presence(user_id, tenant_id)).await.is_ok());
    }
}
