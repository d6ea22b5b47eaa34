//! Test helper functions for database seeding.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use msq_domain::{Command, CommandId};

use crate::Result;

/// Insert a command exactly as given (status, connector and timestamps
/// included), bypassing the CREATED-only insert path.
///
/// Used to reproduce rows left behind by a crashed connector. The id is
/// assigned by the database; `command.id` is ignored.
pub async fn seed_command(pool: &PgPool, command: &Command) -> Result<CommandId> {
    let id: CommandId = sqlx::query_scalar(
        r#"
        INSERT INTO execution (
            exchange_id, instrument_name, direction_id, order_type_id, limit_price, amount,
            status_id, connector_id, execution_type_id, execute_till_time, ref_position_id,
            time_in_force_id, update_timestamp, account_id, api_key, secret_key, finger_print
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        RETURNING id
        "#,
    )
    .bind(command.exchange_id)
    .bind(&command.instrument_name)
    .bind(command.direction_id)
    .bind(command.order_type_id)
    .bind(command.limit_price)
    .bind(command.amount)
    .bind(command.status_id)
    .bind(command.connector_id)
    .bind(command.execution_type_id)
    .bind(command.execute_till)
    .bind(&command.ref_position_id)
    .bind(command.time_in_force_id)
    .bind(command.update_timestamp)
    .bind(command.account_id)
    .bind(&command.api_key)
    .bind(&command.secret_key)
    .bind(&command.fingerprint)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Move a command's update timestamp, e.g. to make it look stale.
pub async fn backdate_update(pool: &PgPool, id: CommandId, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE execution SET update_timestamp = $1 WHERE id = $2")
        .bind(at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Current status name of a command.
pub async fn status_name(pool: &PgPool, id: CommandId) -> Result<String> {
    let name: String = sqlx::query_scalar(
        r#"
        SELECT s.name
        FROM execution e
        JOIN execution_status s ON s.id = e.status_id
        WHERE e.id = $1
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await?;
    Ok(name)
}
