//! Postgres-backed responder directory
//!
//! Each load change runs in one transaction: the operation token is claimed
//! in `responder_load_ops` first, then the counter moves with a single
//! conditional `UPDATE`. A duplicate token leaves the counters untouched.

use async_trait::async_trait;
use livedesk_shared::{ResponderAvailability, ResponderId};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    check_target, AvailabilityUpdate, DirectoryError, LoadChange, OperationToken,
    ResponderDirectory, ResponderFilter,
};

const RESPONDER_COLUMNS: &str = "id, display_name, on_call, active, load, capacity, last_assigned_at";

#[derive(Clone)]
pub struct PgResponderDirectory {
    pool: PgPool,
}

impl PgResponderDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct ResponderRow {
    id: Uuid,
    display_name: String,
    on_call: bool,
    active: bool,
    load: i32,
    capacity: i32,
    last_assigned_at: Option<OffsetDateTime>,
}

impl From<ResponderRow> for ResponderAvailability {
    fn from(row: ResponderRow) -> Self {
        Self {
            id: ResponderId(row.id),
            display_name: row.display_name,
            on_call: row.on_call,
            active: row.active,
            load: u32::try_from(row.load).unwrap_or(0),
            capacity: u32::try_from(row.capacity).unwrap_or(0),
            last_assigned_at: row.last_assigned_at,
        }
    }
}

fn to_db(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl PgResponderDirectory {
    /// Record the token; `false` means it was applied before
    async fn claim_token(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        token: &OperationToken,
    ) -> Result<bool, DirectoryError> {
        let result = sqlx::query(
            "INSERT INTO responder_load_ops (token) VALUES ($1) ON CONFLICT (token) DO NOTHING",
        )
        .bind(token.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Explain why a conditional increment matched no row
    async fn diagnose(
        &self,
        id: ResponderId,
        expected_load: Option<u32>,
    ) -> DirectoryError {
        match self.get(id).await {
            Ok(current) => match check_target(&current, expected_load) {
                Err(err) => err,
                Ok(()) => DirectoryError::LoadChanged {
                    id,
                    current: current.load,
                },
            },
            Err(err) => err,
        }
    }
}

#[async_trait]
impl ResponderDirectory for PgResponderDirectory {
    async fn list(
        &self,
        filter: &ResponderFilter,
    ) -> Result<Vec<ResponderAvailability>, DirectoryError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM responders WHERE TRUE",
            RESPONDER_COLUMNS
        ));
        if let Some(on_call) = filter.on_call {
            qb.push(" AND on_call = ").push_bind(on_call);
        }
        if let Some(active) = filter.active {
            qb.push(" AND active = ").push_bind(active);
        }
        match filter.has_capacity {
            Some(true) => {
                qb.push(" AND load < capacity");
            }
            Some(false) => {
                qb.push(" AND load >= capacity");
            }
            None => {}
        }
        qb.push(" ORDER BY display_name ASC, id ASC");

        let rows: Vec<ResponderRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get(&self, id: ResponderId) -> Result<ResponderAvailability, DirectoryError> {
        let row: Option<ResponderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM responders WHERE id = $1",
            RESPONDER_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into).ok_or(DirectoryError::NotFound(id))
    }

    async fn upsert(
        &self,
        responder: ResponderAvailability,
    ) -> Result<ResponderAvailability, DirectoryError> {
        let row: ResponderRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO responders (id, display_name, on_call, active, load, capacity)
            VALUES ($1, $2, $3, $4, 0, $5)
            ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                on_call = EXCLUDED.on_call,
                active = EXCLUDED.active,
                capacity = EXCLUDED.capacity
            RETURNING {}
            "#,
            RESPONDER_COLUMNS
        ))
        .bind(responder.id.0)
        .bind(&responder.display_name)
        .bind(responder.on_call)
        .bind(responder.active)
        .bind(to_db(responder.capacity))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn set_availability(
        &self,
        id: ResponderId,
        update: AvailabilityUpdate,
    ) -> Result<ResponderAvailability, DirectoryError> {
        let row: Option<ResponderRow> = sqlx::query_as(&format!(
            r#"
            UPDATE responders
            SET on_call = COALESCE($2, on_call), active = COALESCE($3, active)
            WHERE id = $1
            RETURNING {}
            "#,
            RESPONDER_COLUMNS
        ))
        .bind(id.0)
        .bind(update.on_call)
        .bind(update.active)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into).ok_or(DirectoryError::NotFound(id))
    }

    async fn increment_load(
        &self,
        id: ResponderId,
        expected_load: u32,
        token: &OperationToken,
        now: OffsetDateTime,
    ) -> Result<LoadChange, DirectoryError> {
        let mut tx = self.pool.begin().await?;
        if !Self::claim_token(&mut tx, token).await? {
            return Ok(LoadChange::AlreadyApplied);
        }

        let row: Option<ResponderRow> = sqlx::query_as(&format!(
            r#"
            UPDATE responders
            SET load = load + 1, last_assigned_at = $3
            WHERE id = $1 AND load = $2 AND on_call AND active AND load < capacity
            RETURNING {}
            "#,
            RESPONDER_COLUMNS
        ))
        .bind(id.0)
        .bind(to_db(expected_load))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) => {
                tx.commit().await?;
                Ok(LoadChange::Applied(row.into()))
            }
            None => {
                drop(tx);
                Err(self.diagnose(id, Some(expected_load)).await)
            }
        }
    }

    async fn decrement_load(
        &self,
        id: ResponderId,
        token: &OperationToken,
    ) -> Result<LoadChange, DirectoryError> {
        let mut tx = self.pool.begin().await?;
        if !Self::claim_token(&mut tx, token).await? {
            return Ok(LoadChange::AlreadyApplied);
        }

        let row: Option<ResponderRow> = sqlx::query_as(&format!(
            "UPDATE responders SET load = GREATEST(load - 1, 0) WHERE id = $1 RETURNING {}",
            RESPONDER_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) => {
                tx.commit().await?;
                Ok(LoadChange::Applied(row.into()))
            }
            None => Err(DirectoryError::NotFound(id)),
        }
    }

    async fn transfer_load(
        &self,
        from: Option<ResponderId>,
        to: ResponderId,
        expected_to_load: Option<u32>,
        token: &OperationToken,
        now: OffsetDateTime,
    ) -> Result<LoadChange, DirectoryError> {
        let mut tx = self.pool.begin().await?;
        if !Self::claim_token(&mut tx, token).await? {
            return Ok(LoadChange::AlreadyApplied);
        }

        let row: Option<ResponderRow> = sqlx::query_as(&format!(
            r#"
            UPDATE responders
            SET load = load + 1, last_assigned_at = $3
            WHERE id = $1 AND on_call AND active AND load < capacity
              AND ($2::INTEGER IS NULL OR load = $2)
            RETURNING {}
            "#,
            RESPONDER_COLUMNS
        ))
        .bind(to.0)
        .bind(expected_to_load.map(to_db))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            drop(tx);
            return Err(self.diagnose(to, expected_to_load).await);
        };

        if let Some(from) = from {
            let released = sqlx::query(
                "UPDATE responders SET load = GREATEST(load - 1, 0) WHERE id = $1",
            )
            .bind(from.0)
            .execute(&mut *tx)
            .await?;
            if released.rows_affected() == 0 {
                return Err(DirectoryError::NotFound(from));
            }
        }

        tx.commit().await?;
        Ok(LoadChange::Applied(row.into()))
    }

    async fn prune_operations(&self, older_than: OffsetDateTime) -> Result<u64, DirectoryError> {
        let result = sqlx::query("DELETE FROM responder_load_ops WHERE applied_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
