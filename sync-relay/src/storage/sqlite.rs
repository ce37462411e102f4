//! SQLite storage backend for offsync-relay.

use super::SyncStorage;
use crate::error::StorageError;
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use sync_core::LeaseError;
use sync_types::{
    decode, encode, CachedRecord, ChangeNotification, ChangesPage, DeviceId, EntityKey,
    LockHolder, LockId, MutationAck, MutationConflict, MutationRequest, OperationType, RecordLock,
    Sequence, TenantId, Timestamp, UserId, Version,
};

const LOCK_COLUMNS: &str = "lock_id, tenant_id, entity_type, entity_id, holder_user_id, \
                            holder_device_id, expires_at, created_at";

/// SQLite-based remote store.
///
/// Uses WAL mode for concurrent reads/writes. Every write transaction opens
/// with a write statement so it holds the database write lock for its whole
/// read-check-write sequence.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage from a database path.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_sequences (
                tenant_id TEXT PRIMARY KEY,
                last_sequence INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                tenant_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload BLOB NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, entity_type, entity_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS changes (
                tenant_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                notification BLOB NOT NULL,
                PRIMARY KEY (tenant_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mutations (
                mutation_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                ack BLOB NOT NULL,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks (
                lock_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                holder_user_id TEXT NOT NULL,
                holder_device_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (tenant_id, entity_type, entity_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_locks_expires ON locks(expires_at)")
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn find_lock(&self, lock_id: &LockId) -> Result<Option<RecordLock>, StorageError> {
        let row = sqlx::query_as::<_, LockRow>(&format!(
            "SELECT {LOCK_COLUMNS} FROM locks WHERE lock_id = ?1"
        ))
        .bind(lock_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        row.map(RecordLock::try_from).transpose()
    }
}

#[async_trait]
impl SyncStorage for SqliteStorage {
    async fn apply_mutation(
        &self,
        request: &MutationRequest,
        now: Timestamp,
    ) -> Result<MutationAck, StorageError> {
        if request.entity.entity_type.is_empty() || request.entity.entity_id.is_empty() {
            return Err(StorageError::Rejected(
                "entity type and id are required".into(),
            ));
        }
        let tenant = request.tenant_id.as_str();
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            INSERT INTO tenant_sequences (tenant_id, last_sequence) VALUES (?1, 0)
            ON CONFLICT(tenant_id) DO NOTHING
            "#,
        )
        .bind(tenant)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        let replayed: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT ack FROM mutations WHERE mutation_id = ?1")
                .bind(request.mutation_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(StorageError::Database)?;
        if let Some(bytes) = replayed {
            tracing::debug!(mutation_id = %request.mutation_id, "replayed mutation, returning original ack");
            return Ok(decode(&bytes)?);
        }

        let current = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT version, payload, deleted, updated_at FROM entities
            WHERE tenant_id = ?1 AND entity_type = ?2 AND entity_id = ?3
            "#,
        )
        .bind(tenant)
        .bind(&request.entity.entity_type)
        .bind(&request.entity.entity_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        let current_version = current.as_ref().map(|r| Version::new(r.version as u64));
        let conflict = match request.operation {
            OperationType::Create => current.as_ref().is_some_and(|r| !r.deleted),
            OperationType::Update | OperationType::Delete => {
                current_version != request.base_version
            }
        };
        if conflict {
            return Err(StorageError::Conflict(MutationConflict {
                mutation_id: request.mutation_id,
                current_version,
                current_payload: current.map(|r| r.payload),
            }));
        }

        let version = current_version.map_or(Version::new(1), |v| v.next());
        let sequence: i64 = sqlx::query_scalar(
            r#"
            UPDATE tenant_sequences SET last_sequence = last_sequence + 1
            WHERE tenant_id = ?1
            RETURNING last_sequence
            "#,
        )
        .bind(tenant)
        .fetch_one(&mut *tx)
        .await
        .map_err(StorageError::Database)?;
        let sequence = Sequence::new(sequence as u64);

        let deleted = request.operation == OperationType::Delete;
        let payload = if deleted {
            Vec::new()
        } else {
            request.payload.clone()
        };

        sqlx::query(
            r#"
            INSERT INTO entities (tenant_id, entity_type, entity_id, version, payload, deleted, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(tenant_id, entity_type, entity_id) DO UPDATE SET
                version = excluded.version,
                payload = excluded.payload,
                deleted = excluded.deleted,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant)
        .bind(&request.entity.entity_type)
        .bind(&request.entity.entity_id)
        .bind(version.value() as i64)
        .bind(&payload)
        .bind(deleted)
        .bind(now as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        let ack = MutationAck {
            mutation_id: request.mutation_id,
            version,
            applied_at: now,
            sequence,
        };
        let change = ChangeNotification {
            tenant_id: request.tenant_id.clone(),
            entity: request.entity.clone(),
            operation: request.operation,
            version,
            sequence,
            payload,
            origin_user_id: request.user_id.clone(),
            origin_device_id: request.device_id,
            mutation_id: request.mutation_id,
        };

        sqlx::query("INSERT INTO changes (tenant_id, sequence, notification) VALUES (?1, ?2, ?3)")
            .bind(tenant)
            .bind(sequence.value() as i64)
            .bind(encode(&change)?)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?;

        sqlx::query(
            "INSERT INTO mutations (mutation_id, tenant_id, ack, applied_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(request.mutation_id.to_string())
        .bind(tenant)
        .bind(encode(&ack)?)
        .bind(now as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        tx.commit().await.map_err(StorageError::Database)?;
        Ok(ack)
    }

    async fn get_record(
        &self,
        tenant_id: &TenantId,
        entity: &EntityKey,
    ) -> Result<Option<CachedRecord>, StorageError> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT version, payload, deleted, updated_at FROM entities
            WHERE tenant_id = ?1 AND entity_type = ?2 AND entity_id = ?3
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(row.map(|r| CachedRecord {
            entity: entity.clone(),
            version: Some(Version::new(r.version as u64)),
            payload: r.payload,
            deleted: r.deleted,
            updated_at: r.updated_at as u64,
        }))
    }

    async fn changes_since(
        &self,
        tenant_id: &TenantId,
        after: Sequence,
        limit: u32,
    ) -> Result<ChangesPage, StorageError> {
        // One read transaction so the page and max_sequence share a snapshot.
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        let rows: Vec<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT notification FROM changes
            WHERE tenant_id = ?1 AND sequence > ?2
            ORDER BY sequence ASC
            LIMIT ?3
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(after.value() as i64)
        .bind(i64::from(limit) + 1)
        .fetch_all(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        let max_sequence: Option<i64> =
            sqlx::query_scalar("SELECT last_sequence FROM tenant_sequences WHERE tenant_id = ?1")
                .bind(tenant_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(StorageError::Database)?;

        tx.commit().await.map_err(StorageError::Database)?;

        let has_more = rows.len() > limit as usize;
        let changes = rows
            .iter()
            .take(limit as usize)
            .map(|bytes| decode::<ChangeNotification>(bytes))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ChangesPage {
            changes,
            max_sequence: Sequence::new(max_sequence.unwrap_or(0) as u64),
            has_more,
        })
    }

    async fn max_sequence(&self, tenant_id: &TenantId) -> Result<Sequence, StorageError> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT last_sequence FROM tenant_sequences WHERE tenant_id = ?1")
                .bind(tenant_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::Database)?;

        Ok(Sequence::new(last.unwrap_or(0) as u64))
    }

    async fn acquire_lock(
        &self,
        tenant_id: &TenantId,
        entity: &EntityKey,
        holder: &LockHolder,
        ttl_ms: u64,
        now: Timestamp,
    ) -> Result<RecordLock, StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            DELETE FROM locks
            WHERE tenant_id = ?1 AND entity_type = ?2 AND entity_id = ?3 AND expires_at <= ?4
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .bind(now as i64)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        let existing = sqlx::query_as::<_, LockRow>(&format!(
            "SELECT {LOCK_COLUMNS} FROM locks \
             WHERE tenant_id = ?1 AND entity_type = ?2 AND entity_id = ?3"
        ))
        .bind(tenant_id.as_str())
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        let expires_at = now.saturating_add(ttl_ms);
        let lock = match existing {
            Some(row) => {
                let current = RecordLock::try_from(row)?;
                if &current.holder() != holder {
                    return Err(LeaseError::Held {
                        holder: current.holder(),
                        expires_at: current.expires_at,
                    }
                    .into());
                }
                sqlx::query("UPDATE locks SET expires_at = ?1 WHERE lock_id = ?2")
                    .bind(expires_at as i64)
                    .bind(current.id.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::Database)?;
                RecordLock {
                    expires_at,
                    ..current
                }
            }
            None => {
                let lock = RecordLock {
                    id: LockId::new(),
                    tenant_id: tenant_id.clone(),
                    entity: entity.clone(),
                    holder_user_id: holder.user_id.clone(),
                    holder_device_id: holder.device_id,
                    expires_at,
                    created_at: now,
                };
                sqlx::query(&format!(
                    "INSERT INTO locks ({LOCK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ))
                .bind(lock.id.to_string())
                .bind(tenant_id.as_str())
                .bind(&entity.entity_type)
                .bind(&entity.entity_id)
                .bind(holder.user_id.as_str())
                .bind(holder.device_id.to_string())
                .bind(expires_at as i64)
                .bind(now as i64)
                .execute(&mut *tx)
                .await
                .map_err(StorageError::Database)?;
                lock
            }
        };

        tx.commit().await.map_err(StorageError::Database)?;
        Ok(lock)
    }

    async fn renew_lock(
        &self,
        lock_id: &LockId,
        holder: &LockHolder,
        ttl_ms: u64,
        now: Timestamp,
    ) -> Result<RecordLock, StorageError> {
        let renewed = sqlx::query_as::<_, LockRow>(&format!(
            "UPDATE locks SET expires_at = ?1 \
             WHERE lock_id = ?2 AND holder_user_id = ?3 AND holder_device_id = ?4 AND expires_at > ?5 \
             RETURNING {LOCK_COLUMNS}"
        ))
        .bind(now.saturating_add(ttl_ms) as i64)
        .bind(lock_id.to_string())
        .bind(holder.user_id.as_str())
        .bind(holder.device_id.to_string())
        .bind(now as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        if let Some(row) = renewed {
            return RecordLock::try_from(row);
        }
        let error = match self.find_lock(lock_id).await? {
            None => LeaseError::NotFound(*lock_id),
            Some(lock) if &lock.holder() != holder => LeaseError::NotHolder(*lock_id),
            Some(_) => LeaseError::Expired(*lock_id),
        };
        Err(error.into())
    }

    async fn release_lock(
        &self,
        lock_id: &LockId,
        holder: &LockHolder,
    ) -> Result<RecordLock, StorageError> {
        let released = sqlx::query_as::<_, LockRow>(&format!(
            "DELETE FROM locks \
             WHERE lock_id = ?1 AND holder_user_id = ?2 AND holder_device_id = ?3 \
             RETURNING {LOCK_COLUMNS}"
        ))
        .bind(lock_id.to_string())
        .bind(holder.user_id.as_str())
        .bind(holder.device_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        if let Some(row) = released {
            return RecordLock::try_from(row);
        }
        let error = match self.find_lock(lock_id).await? {
            None => LeaseError::NotFound(*lock_id),
            Some(_) => LeaseError::NotHolder(*lock_id),
        };
        Err(error.into())
    }

    async fn purge_expired_locks(&self, now: Timestamp) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM locks WHERE expires_at <= ?1")
            .bind(now as i64)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    version: i64,
    payload: Vec<u8>,
    deleted: bool,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct LockRow {
    lock_id: String,
    tenant_id: String,
    entity_type: String,
    entity_id: String,
    holder_user_id: String,
    holder_device_id: String,
    expires_at: i64,
    created_at: i64,
}

impl TryFrom<LockRow> for RecordLock {
    type Error = StorageError;

    fn try_from(row: LockRow) -> Result<Self, Self::Error> {
        Ok(RecordLock {
            id: LockId::parse(&row.lock_id)
                .ok_or_else(|| StorageError::InvalidRow(format!("lock_id {}", row.lock_id)))?,
            tenant_id: TenantId::new(row.tenant_id),
            entity: EntityKey::new(row.entity_type, row.entity_id),
            holder_user_id: UserId::new(row.holder_user_id),
            holder_device_id: DeviceId::parse(&row.holder_device_id).ok_or_else(|| {
                StorageError::InvalidRow(format!("holder_device_id {}", row.holder_device_id))
            })?,
            expires_at: row.expires_at as u64,
            created_at: row.created_at as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("acme")
    }

    fn request(
        operation: OperationType,
        id: &str,
        payload: &[u8],
        base_version: Option<u64>,
    ) -> MutationRequest {
        MutationRequest {
            mutation_id: sync_types::MutationId::new(),
            tenant_id: tenant(),
            operation,
            entity: EntityKey::new("invoice", id),
            payload: payload.to_vec(),
            base_version: base_version.map(Version::new),
            user_id: UserId::new("alice"),
            device_id: DeviceId::new(),
        }
    }

    fn holder(user: &str) -> LockHolder {
        LockHolder {
            user_id: UserId::new(user),
            device_id: DeviceId::new(),
        }
    }

    #[tokio::test]
    async fn create_then_update_bumps_version_and_sequence() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        let created = storage
            .apply_mutation(&request(OperationType::Create, "R1", b"{\"amount\":10}", None), 100)
            .await
            .unwrap();
        assert_eq!(created.version, Version::new(1));
        assert_eq!(created.sequence, Sequence::new(1));

        let updated = storage
            .apply_mutation(&request(OperationType::Update, "R1", b"{\"amount\":50}", Some(1)), 200)
            .await
            .unwrap();
        assert_eq!(updated.version, Version::new(2));
        assert_eq!(updated.sequence, Sequence::new(2));

        let record = storage
            .get_record(&tenant(), &EntityKey::new("invoice", "R1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.payload, b"{\"amount\":50}");
        assert_eq!(record.updated_at, 200);
    }

    #[tokio::test]
    async fn replayed_mutation_returns_original_ack() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let create = request(OperationType::Create, "R1", b"{}", None);

        let first = storage.apply_mutation(&create, 100).await.unwrap();
        let again = storage.apply_mutation(&create, 900).await.unwrap();
        assert_eq!(first, again);

        let page = storage.changes_since(&tenant(), Sequence::zero(), 10).await.unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.max_sequence, Sequence::new(1));
    }

    #[tokio::test]
    async fn stale_base_version_conflicts() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .apply_mutation(&request(OperationType::Create, "R1", b"v1", None), 100)
            .await
            .unwrap();
        storage
            .apply_mutation(&request(OperationType::Update, "R1", b"v2", Some(1)), 110)
            .await
            .unwrap();

        let err = storage
            .apply_mutation(&request(OperationType::Update, "R1", b"mine", Some(1)), 120)
            .await
            .unwrap_err();
        match err {
            StorageError::Conflict(conflict) => {
                assert_eq!(conflict.current_version, Some(Version::new(2)));
                assert_eq!(conflict.current_payload.as_deref(), Some(&b"v2"[..]));
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // The failed attempt consumed no sequence.
        assert_eq!(storage.max_sequence(&tenant()).await.unwrap(), Sequence::new(2));
    }

    #[tokio::test]
    async fn create_over_live_record_conflicts() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .apply_mutation(&request(OperationType::Create, "R1", b"a", None), 100)
            .await
            .unwrap();

        let err = storage
            .apply_mutation(&request(OperationType::Create, "R1", b"b", None), 110)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_leaves_tombstone_that_can_be_recreated() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .apply_mutation(&request(OperationType::Create, "R1", b"a", None), 100)
            .await
            .unwrap();
        storage
            .apply_mutation(&request(OperationType::Delete, "R1", b"ignored", Some(1)), 110)
            .await
            .unwrap();

        let key = EntityKey::new("invoice", "R1");
        let tombstone = storage.get_record(&tenant(), &key).await.unwrap().unwrap();
        assert!(tombstone.deleted);
        assert!(tombstone.payload.is_empty());

        let recreated = storage
            .apply_mutation(&request(OperationType::Create, "R1", b"again", None), 120)
            .await
            .unwrap();
        assert_eq!(recreated.version, Version::new(3));
    }

    #[tokio::test]
    async fn empty_entity_id_is_rejected() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let err = storage
            .apply_mutation(&request(OperationType::Create, "", b"{}", None), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Rejected(_)));
    }

    #[tokio::test]
    async fn changes_page_in_sequence_order() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        for id in ["R1", "R2", "R3"] {
            storage
                .apply_mutation(&request(OperationType::Create, id, b"{}", None), 100)
                .await
                .unwrap();
        }

        let first = storage.changes_since(&tenant(), Sequence::zero(), 2).await.unwrap();
        assert!(first.has_more);
        assert_eq!(first.max_sequence, Sequence::new(3));
        let ids: Vec<_> = first.changes.iter().map(|c| c.entity.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["R1", "R2"]);

        let rest = storage.changes_since(&tenant(), Sequence::new(2), 2).await.unwrap();
        assert!(!rest.has_more);
        assert_eq!(rest.changes.len(), 1);
        assert_eq!(rest.changes[0].sequence, Sequence::new(3));
    }

    #[tokio::test]
    async fn sequences_are_per_tenant() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .apply_mutation(&request(OperationType::Create, "R1", b"{}", None), 100)
            .await
            .unwrap();

        let mut other = request(OperationType::Create, "R1", b"{}", None);
        other.tenant_id = TenantId::new("globex");
        let ack = storage.apply_mutation(&other, 100).await.unwrap();
        assert_eq!(ack.sequence, Sequence::new(1));

        let page = storage
            .changes_since(&TenantId::new("globex"), Sequence::zero(), 10)
            .await
            .unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.changes[0].tenant_id, TenantId::new("globex"));
        assert_eq!(
            storage.max_sequence(&TenantId::new("initech")).await.unwrap(),
            Sequence::zero()
        );
    }

    #[tokio::test]
    async fn second_holder_sees_live_lease() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let key = EntityKey::new("invoice", "R1");
        let alice = holder("alice");

        let lock = storage.acquire_lock(&tenant(), &key, &alice, 1_000, 100).await.unwrap();
        assert_eq!(lock.expires_at, 1_100);

        let err = storage
            .acquire_lock(&tenant(), &key, &holder("bob"), 1_000, 200)
            .await
            .unwrap_err();
        match err {
            StorageError::Lease(LeaseError::Held { holder, expires_at }) => {
                assert_eq!(holder, alice);
                assert_eq!(expires_at, 1_100);
            }
            other => panic!("expected held, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_holder_reacquire_refreshes_lease() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let key = EntityKey::new("invoice", "R1");
        let alice = holder("alice");

        let first = storage.acquire_lock(&tenant(), &key, &alice, 1_000, 100).await.unwrap();
        let second = storage.acquire_lock(&tenant(), &key, &alice, 1_000, 600).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.expires_at, 1_600);
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let key = EntityKey::new("invoice", "R1");

        let old = storage
            .acquire_lock(&tenant(), &key, &holder("alice"), 1_000, 100)
            .await
            .unwrap();
        let bob = holder("bob");
        let new = storage.acquire_lock(&tenant(), &key, &bob, 1_000, 1_100).await.unwrap();
        assert_ne!(old.id, new.id);
        assert_eq!(new.holder(), bob);
    }

    #[tokio::test]
    async fn renew_checks_existence_then_holder_then_expiry() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let key = EntityKey::new("invoice", "R1");
        let alice = holder("alice");
        let lock = storage.acquire_lock(&tenant(), &key, &alice, 1_000, 100).await.unwrap();

        let renewed = storage.renew_lock(&lock.id, &alice, 1_000, 500).await.unwrap();
        assert_eq!(renewed.expires_at, 1_500);

        let missing = LockId::new();
        assert!(matches!(
            storage.renew_lock(&missing, &alice, 1_000, 600).await,
            Err(StorageError::Lease(LeaseError::NotFound(id))) if id == missing
        ));
        assert!(matches!(
            storage.renew_lock(&lock.id, &holder("bob"), 1_000, 600).await,
            Err(StorageError::Lease(LeaseError::NotHolder(_)))
        ));
        assert!(matches!(
            storage.renew_lock(&lock.id, &alice, 1_000, 1_500).await,
            Err(StorageError::Lease(LeaseError::Expired(_)))
        ));
    }

    #[tokio::test]
    async fn release_requires_holder() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let key = EntityKey::new("invoice", "R1");
        let alice = holder("alice");
        let lock = storage.acquire_lock(&tenant(), &key, &alice, 1_000, 100).await.unwrap();

        assert!(matches!(
            storage.release_lock(&lock.id, &holder("bob")).await,
            Err(StorageError::Lease(LeaseError::NotHolder(_)))
        ));

        let released = storage.release_lock(&lock.id, &alice).await.unwrap();
        assert_eq!(released.id, lock.id);
        assert!(matches!(
            storage.release_lock(&lock.id, &alice).await,
            Err(StorageError::Lease(LeaseError::NotFound(_)))
        ));

        // The record is free again.
        storage
            .acquire_lock(&tenant(), &key, &holder("bob"), 1_000, 200)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn purge_removes_only_expired_locks() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .acquire_lock(&tenant(), &EntityKey::new("invoice", "R1"), &holder("a"), 100, 0)
            .await
            .unwrap();
        let live = storage
            .acquire_lock(&tenant(), &EntityKey::new("invoice", "R2"), &holder("b"), 10_000, 0)
            .await
            .unwrap();

        assert_eq!(storage.purge_expired_locks(500).await.unwrap(), 1);
        assert!(storage.find_lock(&live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");

        let create = request(OperationType::Create, "R1", b"{}", None);
        {
            let storage = SqliteStorage::new(&path).await.unwrap();
            storage.apply_mutation(&create, 100).await.unwrap();
        }

        let storage = SqliteStorage::new(&path).await.unwrap();
        let replay = storage.apply_mutation(&create, 200).await.unwrap();
        assert_eq!(replay.sequence, Sequence::new(1));

        let next = storage
            .apply_mutation(&request(OperationType::Update, "R1", b"{}", Some(1)), 300)
            .await
            .unwrap();
        assert_eq!(next.sequence, Sequence::new(2));
    }
}
