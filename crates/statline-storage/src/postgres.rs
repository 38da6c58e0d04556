//! Postgres-backed stores. Each record is one JSONB document in
//! `entity_records`, addressed by `(entity, natural_key)`.

use std::marker::PhantomData;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use statline_core::{Entity, EntityKind};

use crate::{EntityStore, FixtureFilter, ScopeSource, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entity_records (
    entity      TEXT        NOT NULL,
    natural_key TEXT        NOT NULL,
    payload     JSONB       NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (entity, natural_key)
)
"#;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

/// Create the record table if it is missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(SCHEMA).execute(pool).await?;
    Ok(())
}

pub struct PgEntityStore<R> {
    pool: PgPool,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for PgEntityStore<R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _record: PhantomData,
        }
    }
}

impl<R: Entity> PgEntityStore<R> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _record: PhantomData,
        }
    }
}

#[async_trait]
impl<R: Entity> EntityStore<R> for PgEntityStore<R> {
    async fn find(&self, key: &R::Key) -> Result<Option<R>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT payload
              FROM entity_records
             WHERE entity = $1
               AND natural_key = $2
            "#,
        )
        .bind(R::KIND.as_str())
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let payload: serde_json::Value = row.try_get("payload")?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn insert(&self, record: &R) -> Result<(), StoreError> {
        let key = record.key().to_string();
        let audit = record.audit();
        let res = sqlx::query(
            r#"
            INSERT INTO entity_records (entity, natural_key, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity, natural_key) DO NOTHING
            "#,
        )
        .bind(R::KIND.as_str())
        .bind(&key)
        .bind(serde_json::to_value(record)?)
        .bind(audit.created_at)
        .bind(audit.updated_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                entity: R::KIND,
                key,
            });
        }
        Ok(())
    }

    async fn update(&self, record: &R) -> Result<(), StoreError> {
        let key = record.key().to_string();
        let res = sqlx::query(
            r#"
            UPDATE entity_records
               SET payload = $3,
                   updated_at = $4
             WHERE entity = $1
               AND natural_key = $2
            "#,
        )
        .bind(R::KIND.as_str())
        .bind(&key)
        .bind(serde_json::to_value(record)?)
        .bind(record.audit().updated_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: R::KIND,
                key,
            });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgScopeSource {
    pool: PgPool,
}

impl PgScopeSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ids(&self, query: Query<'_, Postgres, PgArguments>) -> Result<Vec<u64>, StoreError> {
        let rows = query.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            if let Ok(id) = u64::try_from(id) {
                out.push(id);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ScopeSource for PgScopeSource {
    async fn season_ids(&self, current_only: bool) -> Result<Vec<u64>, StoreError> {
        self.ids(
            sqlx::query(
                r#"
                SELECT (payload->>'id')::BIGINT AS id
                  FROM entity_records
                 WHERE entity = $1
                   AND ($2 = FALSE OR (payload->>'is_current')::BOOLEAN)
                 ORDER BY id
                "#,
            )
            .bind(EntityKind::Season.as_str())
            .bind(current_only),
        )
        .await
    }

    async fn squad_player_ids(&self, current_only: bool) -> Result<Vec<u64>, StoreError> {
        self.ids(
            sqlx::query(
                r#"
                SELECT DISTINCT (jsonb_array_elements_text(sq.payload->'player_ids'))::BIGINT AS id
                  FROM entity_records sq
                 WHERE sq.entity = $1
                   AND (
                        $3 = FALSE
                        OR (sq.payload->>'season_id')::BIGINT IN (
                            SELECT (s.payload->>'id')::BIGINT
                              FROM entity_records s
                             WHERE s.entity = $2
                               AND (s.payload->>'is_current')::BOOLEAN
                        )
                   )
                 ORDER BY id
                "#,
            )
            .bind(EntityKind::Squad.as_str())
            .bind(EntityKind::Season.as_str())
            .bind(current_only),
        )
        .await
    }

    async fn fixture_ids(&self, filter: FixtureFilter) -> Result<Vec<u64>, StoreError> {
        match filter {
            FixtureFilter::All => {
                self.ids(
                    sqlx::query(
                        r#"
                        SELECT (payload->>'id')::BIGINT AS id
                          FROM entity_records
                         WHERE entity = $1
                         ORDER BY id
                        "#,
                    )
                    .bind(EntityKind::Fixture.as_str()),
                )
                .await
            }
            FixtureFilter::CurrentSeasons => {
                self.ids(
                    sqlx::query(
                        r#"
                        SELECT (f.payload->>'id')::BIGINT AS id
                          FROM entity_records f
                         WHERE f.entity = $1
                           AND (f.payload->>'season_id')::BIGINT IN (
                               SELECT (s.payload->>'id')::BIGINT
                                 FROM entity_records s
                                WHERE s.entity = $2
                                  AND (s.payload->>'is_current')::BOOLEAN
                           )
                         ORDER BY id
                        "#,
                    )
                    .bind(EntityKind::Fixture.as_str())
                    .bind(EntityKind::Season.as_str()),
                )
                .await
            }
            FixtureFilter::Between(from, to) => {
                self.ids(
                    sqlx::query(
                        r#"
                        SELECT (payload->>'id')::BIGINT AS id
                          FROM entity_records
                         WHERE entity = $1
                           AND (payload->>'date')::TIMESTAMPTZ >= $2
                           AND (payload->>'date')::TIMESTAMPTZ < $3
                         ORDER BY id
                        "#,
                    )
                    .bind(EntityKind::Fixture.as_str())
                    .bind(from)
                    .bind(to),
                )
                .await
            }
        }
    }
}
