//! PostgreSQL command store.
//!
//! Every multi-statement write runs in one READ COMMITTED transaction. Claims
//! lock candidate rows with `FOR UPDATE SKIP LOCKED`, so concurrent
//! connectors never receive the same command.
//!
//! Writes that callers may want to compose are exposed as `*_tx` functions
//! taking the open transaction; the trait methods are thin wrappers that
//! begin and commit around them.
//!
//! This module uses dynamic queries (sqlx::query) instead of compile-time
//! checked macros (sqlx::query!) to allow compilation without DATABASE_URL.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use msq_domain::{
    Balance, Command, CommandId, CommandRecord, CommandStatus, ConnectorId, DictId, Dictionaries,
    Dictionary, ExchangeId, HistoryEntry, NewCommand, Order, StatusIds,
};

use crate::error::StoreError;
use crate::repository::{CommandStore, Finish, EXPIRED_DESCRIPTION};

const COMMAND_COLUMNS: &str = "id, exchange_id, instrument_name, direction_id, order_type_id, \
     limit_price, amount, status_id, connector_id, execution_type_id, execute_till_time, \
     ref_position_id, time_in_force_id, update_timestamp, account_id, api_key, secret_key, \
     finger_print";

// =============================================================================
// Pool
// =============================================================================

/// Connection pool sizing for one long-lived task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    /// Pool of at most `max_connections`, keeping one warm connection.
    pub fn sized(max_connections: u32) -> Self {
        Self {
            max_connections: max_connections.max(1),
            min_connections: 1,
            max_lifetime: Duration::from_secs(3600),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::sized(5)
    }
}

/// Open a sized pool.
pub async fn connect(url: &str, settings: &PoolSettings) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .max_lifetime(settings.max_lifetime)
        .acquire_timeout(settings.acquire_timeout)
        .connect(url)
        .await
        .map_err(|e| StoreError::Connection(format!("Failed to connect to PostgreSQL: {}", e)))
}

/// Begin a READ COMMITTED transaction.
pub async fn begin(pool: &PgPool) -> Result<Transaction<'static, Postgres>, StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

// =============================================================================
// Store
// =============================================================================

/// PostgreSQL-backed [`CommandStore`].
#[derive(Clone)]
pub struct PgCommandStore {
    pool: PgPool,
    statuses: StatusIds,
}

impl PgCommandStore {
    /// Wrap a pool whose status ids are already known.
    pub fn new(pool: PgPool, statuses: StatusIds) -> Self {
        Self { pool, statuses }
    }

    /// Wrap a pool, resolving status ids from the dictionary tables.
    pub async fn open(pool: PgPool) -> Result<Self, StoreError> {
        let dictionaries = load_dictionaries(&pool).await?;
        let statuses = StatusIds::resolve(&dictionaries)?;
        info!(
            pool_size = pool.options().get_max_connections(),
            "PostgreSQL command store ready"
        );
        Ok(Self { pool, statuses })
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Status ids used by this store
    pub fn statuses(&self) -> StatusIds {
        self.statuses
    }
}

#[async_trait]
impl CommandStore for PgCommandStore {
    async fn insert_command(&self, command: NewCommand) -> Result<CommandId, StoreError> {
        let mut tx = begin(&self.pool).await?;
        let id = insert_command_tx(&mut tx, self.statuses, &command).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn claim_for_execution(
        &self,
        exchange_id: ExchangeId,
        connector_id: ConnectorId,
        not_after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError> {
        let created = self.statuses.id(CommandStatus::Created);
        let executing = self.statuses.id(CommandStatus::Executing);

        let mut tx = begin(&self.pool).await?;
        let sql = format!(
            r#"
            WITH claimed AS (
                SELECT id AS claimed_id
                FROM execution
                WHERE exchange_id = $1
                  AND status_id = $2
                  AND connector_id IS NULL
                  AND execute_till_time > $3
                ORDER BY id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE execution
            SET status_id = $5, connector_id = $6, update_timestamp = now()
            FROM claimed
            WHERE id = claimed_id
            RETURNING {}
            "#,
            COMMAND_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(exchange_id)
            .bind(created)
            .bind(not_after)
            .bind(limit)
            .bind(executing)
            .bind(connector_id)
            .fetch_all(&mut *tx)
            .await?;

        let mut claimed = rows.iter().map(parse_command).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|c| c.id);

        for command in &claimed {
            insert_history_tx(&mut tx, command.id, Some(created), executing, None).await?;
        }
        tx.commit().await?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), connector_id, "Claimed commands for execution");
        }
        Ok(claimed)
    }

    async fn claim_for_recovery(
        &self,
        exchange_id: ExchangeId,
        connector_id: ConnectorId,
        older_than: DateTime<Utc>,
    ) -> Result<Option<Command>, StoreError> {
        let executing = self.statuses.id(CommandStatus::Executing);

        let mut tx = begin(&self.pool).await?;
        let sql = format!(
            r#"
            WITH stale AS (
                SELECT id AS stale_id
                FROM execution
                WHERE exchange_id = $1
                  AND connector_id = $2
                  AND status_id = $3
                  AND update_timestamp < $4
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE execution
            SET update_timestamp = now()
            FROM stale
            WHERE id = stale_id
            RETURNING {}
            "#,
            COMMAND_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(exchange_id)
            .bind(connector_id)
            .bind(executing)
            .bind(older_than)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(row.as_ref().map(parse_command).transpose()?)
    }

    async fn finish(&self, finish: Finish) -> Result<(), StoreError> {
        let mut tx = begin(&self.pool).await?;
        finish_tx(&mut tx, self.statuses, finish).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn expire_stale(
        &self,
        baseline: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError> {
        let created = self.statuses.id(CommandStatus::Created);

        let mut tx = begin(&self.pool).await?;
        let sql = format!(
            r#"
            SELECT {}
            FROM execution
            WHERE status_id = $1 AND execute_till_time < $2
            ORDER BY id
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
            COMMAND_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(created)
            .bind(baseline)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;
        let stale = rows.iter().map(parse_command).collect::<Result<Vec<_>, _>>()?;

        let timed_out = self.statuses.id(CommandStatus::TimedOut);
        let mut expired = Vec::with_capacity(stale.len());
        for mut command in stale {
            let finish = Finish::transition(
                command.id,
                CommandStatus::Created,
                CommandStatus::TimedOut,
                EXPIRED_DESCRIPTION,
            );
            finish_tx(&mut tx, self.statuses, finish).await?;
            command.status_id = timed_out;
            expired.push(command);
        }
        tx.commit().await?;

        Ok(expired)
    }

    async fn load_by_id(&self, id: CommandId) -> Result<Option<CommandRecord>, StoreError> {
        let sql = format!("SELECT {} FROM execution WHERE id = $1", COMMAND_COLUMNS);
        let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let command = parse_command(&row)?;

        let order = sqlx::query(
            r#"
            SELECT external_order_id, execution_id, price, commission, commission_asset
            FROM execution_order
            WHERE execution_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| -> Result<Order, sqlx::Error> {
            Ok(Order {
                external_order_id: row.try_get("external_order_id")?,
                execution_id: row.try_get("execution_id")?,
                price: row.try_get("price")?,
                commission: row.try_get("commission")?,
                commission_asset: row.try_get("commission_asset")?,
            })
        })
        .transpose()?;

        let balances = sqlx::query(
            r#"
            SELECT asset, free, locked
            FROM execution_balance
            WHERE execution_id = $1
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> Result<Balance, sqlx::Error> {
            Ok(Balance {
                asset: row.try_get("asset")?,
                free: row.try_get("free")?,
                locked: row.try_get("locked")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(CommandRecord { command, order, balances }))
    }

    async fn history(&self, id: CommandId) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, status_from_id, status_to_id, "timestamp", description
            FROM execution_history
            WHERE execution_id = $1
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<HistoryEntry, StoreError> {
                Ok(HistoryEntry {
                    execution_id: row.try_get("execution_id")?,
                    from_status_id: row.try_get("status_from_id")?,
                    to_status_id: row.try_get("status_to_id")?,
                    timestamp: row.try_get("timestamp")?,
                    description: row.try_get("description")?,
                })
            })
            .collect()
    }

    async fn load_dictionaries(&self) -> Result<Dictionaries, StoreError> {
        load_dictionaries(&self.pool).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// =============================================================================
// Units of work
// =============================================================================

/// Insert a command in CREATED inside `tx`, or return the id already stored
/// under its fingerprint.
pub async fn insert_command_tx(
    tx: &mut Transaction<'_, Postgres>,
    statuses: StatusIds,
    command: &NewCommand,
) -> Result<CommandId, StoreError> {
    let created = statuses.id(CommandStatus::Created);

    let inserted: Option<CommandId> = sqlx::query_scalar(
        r#"
        INSERT INTO execution (
            exchange_id, instrument_name, direction_id, order_type_id, limit_price, amount,
            status_id, execution_type_id, execute_till_time, ref_position_id,
            time_in_force_id, account_id, api_key, secret_key, finger_print
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (finger_print) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(command.exchange_id)
    .bind(&command.instrument_name)
    .bind(command.direction_id)
    .bind(command.order_type_id)
    .bind(command.limit_price)
    .bind(command.amount)
    .bind(created)
    .bind(command.execution_type_id)
    .bind(command.execute_till)
    .bind(&command.ref_position_id)
    .bind(command.time_in_force_id)
    .bind(command.account_id)
    .bind(&command.api_key)
    .bind(&command.secret_key)
    .bind(&command.fingerprint)
    .fetch_optional(&mut **tx)
    .await?;

    match inserted {
        Some(id) => {
            insert_history_tx(tx, id, None, created, None).await?;
            Ok(id)
        },
        None => {
            let existing: CommandId =
                sqlx::query_scalar("SELECT id FROM execution WHERE finger_print = $1")
                    .bind(&command.fingerprint)
                    .fetch_one(&mut **tx)
                    .await?;
            debug!(execution_id = existing, "Duplicate fingerprint, returning existing command");
            Ok(existing)
        },
    }
}

/// Apply a [`Finish`] inside `tx`.
pub async fn finish_tx(
    tx: &mut Transaction<'_, Postgres>,
    statuses: StatusIds,
    finish: Finish,
) -> Result<(), StoreError> {
    finish
        .from
        .transition_to(finish.to)
        .map_err(|e| StoreError::invalid_state(e.to_string()))?;

    let from_id = statuses.id(finish.from);
    let to_id = statuses.id(finish.to);

    let updated = sqlx::query(
        r#"
        UPDATE execution
        SET status_id = $1,
            connector_id = COALESCE($2, connector_id),
            update_timestamp = now()
        WHERE id = $3 AND status_id = $4
        "#,
    )
    .bind(to_id)
    .bind(finish.connector_id)
    .bind(finish.execution_id)
    .bind(from_id)
    .execute(&mut **tx)
    .await?;

    if updated.rows_affected() == 0 {
        let current: Option<DictId> =
            sqlx::query_scalar("SELECT status_id FROM execution WHERE id = $1")
                .bind(finish.execution_id)
                .fetch_optional(&mut **tx)
                .await?;
        return Err(match current {
            None => StoreError::not_found("execution", finish.execution_id.to_string()),
            Some(status_id) => StoreError::invalid_state(format!(
                "execution {} is {}, expected {}",
                finish.execution_id,
                statuses.status(status_id).map(|s| s.name()).unwrap_or("UNKNOWN"),
                finish.from
            )),
        });
    }

    let description = Some(finish.description.as_str());
    insert_history_tx(tx, finish.execution_id, Some(from_id), to_id, description).await?;

    if let Some(order) = &finish.order {
        sqlx::query(
            r#"
            INSERT INTO execution_order
                (execution_id, external_order_id, price, commission, commission_asset)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(finish.execution_id)
        .bind(order.external_order_id)
        .bind(order.price)
        .bind(order.commission)
        .bind(&order.commission_asset)
        .execute(&mut **tx)
        .await?;
    }

    for balance in &finish.balances {
        sqlx::query(
            r#"
            INSERT INTO execution_balance (execution_id, asset, free, locked)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(finish.execution_id)
        .bind(&balance.asset)
        .bind(balance.free)
        .bind(balance.locked)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

async fn insert_history_tx(
    tx: &mut Transaction<'_, Postgres>,
    execution_id: CommandId,
    from: Option<DictId>,
    to: DictId,
    description: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO execution_history (execution_id, status_from_id, status_to_id, description)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(execution_id)
    .bind(from)
    .bind(to)
    .bind(description)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// =============================================================================
// Dictionaries
// =============================================================================

/// Load the six dictionaries in one read-only transaction.
///
/// # Errors
/// Fails if any table is empty.
pub async fn load_dictionaries(pool: &PgPool) -> Result<Dictionaries, StoreError> {
    let mut tx = begin(pool).await?;

    let mut tables = Vec::with_capacity(6);
    for table in [
        "exchange",
        "direction",
        "order_type",
        "time_in_force",
        "execution_type",
        "execution_status",
    ] {
        let rows: Vec<(DictId, String)> =
            sqlx::query_as(&format!("SELECT id, name FROM {} ORDER BY id", table))
                .fetch_all(&mut *tx)
                .await?;
        tables.push(Dictionary::from_rows(table, rows)?);
    }
    tx.commit().await?;

    let mut tables = tables.into_iter();
    let mut next = || tables.next().unwrap_or_default();
    let dictionaries = Dictionaries::new(next(), next(), next(), next(), next(), next())?;

    info!(
        exchanges = dictionaries.exchanges().len(),
        statuses = dictionaries.execution_statuses().len(),
        "Dictionaries loaded"
    );
    Ok(dictionaries)
}

// =============================================================================
// Row mapping
// =============================================================================

fn parse_command(row: &PgRow) -> Result<Command, sqlx::Error> {
    Ok(Command {
        id: row.try_get("id")?,
        exchange_id: row.try_get("exchange_id")?,
        instrument_name: row.try_get("instrument_name")?,
        direction_id: row.try_get("direction_id")?,
        order_type_id: row.try_get("order_type_id")?,
        limit_price: row.try_get("limit_price")?,
        amount: row.try_get("amount")?,
        status_id: row.try_get("status_id")?,
        connector_id: row.try_get("connector_id")?,
        execution_type_id: row.try_get("execution_type_id")?,
        execute_till: row.try_get("execute_till_time")?,
        ref_position_id: row.try_get("ref_position_id")?,
        time_in_force_id: row.try_get("time_in_force_id")?,
        update_timestamp: row.try_get("update_timestamp")?,
        account_id: row.try_get("account_id")?,
        api_key: row.try_get("api_key")?,
        secret_key: row.try_get("secret_key")?,
        fingerprint: row.try_get("finger_print")?,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    fn new_command(fingerprint: &str, deadline: DateTime<Utc>) -> NewCommand {
        NewCommand {
            exchange_id: 1,
            instrument_name: "ABC".to_string(),
            direction_id: 1,
            order_type_id: 1,
            limit_price: None,
            amount: Some(dec!(10)),
            execution_type_id: 1,
            execute_till: deadline,
            ref_position_id: None,
            time_in_force_id: 1,
            account_id: 7,
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }

    #[test]
    fn test_pool_settings_floor() {
        let settings = PoolSettings::sized(0);
        assert_eq!(settings.max_connections, 1);
        assert_eq!(settings.max_lifetime, Duration::from_secs(3600));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_dictionaries_seeded(pool: PgPool) -> anyhow::Result<()> {
        let dictionaries = load_dictionaries(&pool).await?;
        assert_eq!(StatusIds::resolve(&dictionaries)?, StatusIds::builtin());
        assert_eq!(dictionaries.exchanges().id_by_name("BINANCE"), 1);
        Ok(())
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_insert_idempotent(pool: PgPool) -> anyhow::Result<()> {
        let store = PgCommandStore::open(pool).await?;
        let deadline = Utc::now() + ChronoDuration::seconds(60);

        let first = store.insert_command(new_command("fp-1", deadline)).await?;
        let second = store.insert_command(new_command("fp-1", deadline)).await?;

        assert_eq!(first, second);
        assert_eq!(store.history(first).await?.len(), 1);
        Ok(())
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_claim_finish_cycle(pool: PgPool) -> anyhow::Result<()> {
        let store = PgCommandStore::open(pool).await?;
        let id = store
            .insert_command(new_command("fp-1", Utc::now() + ChronoDuration::seconds(60)))
            .await?;

        let claimed = store.claim_for_execution(1, 2, Utc::now(), 1).await?;
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].connector_id, Some(2));
        assert!(store.claim_for_execution(1, 2, Utc::now(), 1).await?.is_empty());

        let mut finish =
            Finish::transition(id, CommandStatus::Executing, CommandStatus::Completed, "");
        finish.connector_id = Some(2);
        finish.order = Some(Order {
            external_order_id: 900,
            execution_id: id,
            price: dec!(100.5),
            commission: dec!(0.1),
            commission_asset: "BNB".to_string(),
        });
        store.finish(finish.clone()).await?;

        let record = store.load_by_id(id).await?.expect("command exists");
        assert_eq!(record.order.map(|o| o.external_order_id), Some(900));
        assert_eq!(record.command.status_id, store.statuses().id(CommandStatus::Completed));
        assert!(matches!(store.finish(finish).await, Err(StoreError::InvalidState { .. })));
        assert_eq!(store.history(id).await?.len(), 3);
        Ok(())
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_expire_stale(pool: PgPool) -> anyhow::Result<()> {
        let store = PgCommandStore::open(pool).await?;
        let id = store
            .insert_command(new_command("old", Utc::now() - ChronoDuration::seconds(5)))
            .await?;

        let expired = store.expire_stale(Utc::now(), 10).await?;
        assert_eq!(expired.iter().map(|c| c.id).collect::<Vec<_>>(), vec![id]);
        assert!(store.expire_stale(Utc::now(), 10).await?.is_empty());

        let history = store.history(id).await?;
        let last = history.last().and_then(|h| h.description.clone());
        assert_eq!(last.as_deref(), Some(EXPIRED_DESCRIPTION));
        Ok(())
    }
}
