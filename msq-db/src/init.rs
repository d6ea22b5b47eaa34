//! Dictionary seeding.
//!
//! Ensures the reference rows the engine depends on exist, and registers
//! additional exchanges. Uses INSERT ... ON CONFLICT DO NOTHING, so it is
//! safe to run repeatedly.

use msq_domain::{DictId, Dictionaries};
use sqlx::PgPool;
use tracing::info;

use super::Result;

/// Rows written by [`init_dictionaries`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InitReport {
    /// Builtin reference rows that were missing
    pub reference_rows: u64,
    /// Exchanges registered by name, with their ids
    pub exchanges: Vec<(DictId, String)>,
}

/// Seed the builtin dictionary rows and register `extra_exchanges`.
///
/// New exchanges get the next free id. Names are upper-cased.
pub async fn init_dictionaries(pool: &PgPool, extra_exchanges: &[String]) -> Result<InitReport> {
    let builtin = Dictionaries::builtin();
    let tables = [
        ("exchange", builtin.exchanges()),
        ("direction", builtin.directions()),
        ("order_type", builtin.order_types()),
        ("time_in_force", builtin.time_in_force()),
        ("execution_type", builtin.execution_types()),
        ("execution_status", builtin.execution_statuses()),
    ];

    let mut report = InitReport::default();
    let mut tx = pool.begin().await?;

    for (table, dictionary) in tables {
        for id in 1..=DictId::try_from(dictionary.len())? {
            let name = dictionary.name_by_id(id);
            if name.is_empty() {
                continue;
            }
            let inserted = sqlx::query(&format!(
                "INSERT INTO {} (id, name) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                table
            ))
            .bind(id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
            report.reference_rows += inserted.rows_affected();
        }
    }

    for name in extra_exchanges {
        let name = name.trim().to_uppercase();
        if name.is_empty() {
            continue;
        }

        let id: DictId = sqlx::query_scalar(
            r#"
            INSERT INTO exchange (id, name)
            SELECT COALESCE(MAX(id), 0) + 1, $1 FROM exchange
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(&name)
        .fetch_one(&mut *tx)
        .await?;

        info!(exchange = %name, id, "Exchange registered");
        report.exchanges.push((id, name));
    }

    tx.commit().await?;

    info!(reference_rows = report.reference_rows, "Dictionaries initialized");
    Ok(report)
}
