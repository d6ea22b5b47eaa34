//! Database CLI subcommands for msqd.
//!
//! Provides `db migrate`, `db status`, and `db init` commands.

use anyhow::{anyhow, Result};
use std::env;
use tracing::info;

use msq_db::{init_dictionaries, migrate, status};

/// Run database CLI subcommands.
///
/// Supported commands:
/// - `msqd db migrate` - Run pending migrations
/// - `msqd db status` - Check migration status
/// - `msqd db init [--exchange NAME]...` - Seed dictionaries, registering extra exchanges
pub async fn run_db_command(args: Vec<String>) -> Result<()> {
    if args.len() < 3 {
        return Err(anyhow!("Usage: msqd db <migrate|status|init> [options]"));
    }

    let database_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow!("DATABASE_URL environment variable is required for db commands"))?;

    let pool = sqlx::PgPool::connect(&database_url).await?;

    match args[2].as_str() {
        "migrate" => {
            migrate(&pool).await?;
        },
        "status" => {
            status(&pool).await?;
        },
        "init" => {
            let exchanges = parse_init_args(&args[3..])?;
            let report = init_dictionaries(&pool, &exchanges).await?;
            info!(
                reference_rows = report.reference_rows,
                exchanges = ?report.exchanges,
                "Dictionaries initialized"
            );
        },
        _ => {
            return Err(anyhow!("Unknown db command: {}. Use migrate, status, or init", args[2]));
        },
    }

    Ok(())
}

fn parse_init_args(args: &[String]) -> Result<Vec<String>> {
    let mut exchanges = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--exchange" => {
                let name = args.get(i + 1).ok_or_else(|| anyhow!("--exchange requires a value"))?;
                exchanges.push(name.clone());
                i += 2;
            },
            other => {
                return Err(anyhow!("Unknown option: {}", other));
            },
        }
    }
    Ok(exchanges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_init_args() {
        let parsed = parse_init_args(&args(&["--exchange", "kraken", "--exchange", "ftx"])).unwrap();
        assert_eq!(parsed, vec!["kraken".to_string(), "ftx".to_string()]);
        assert!(parse_init_args(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_init_args_errors() {
        assert!(parse_init_args(&args(&["--exchange"])).is_err());
        assert!(parse_init_args(&args(&["--tenant-id", "x"])).is_err());
    }
}
