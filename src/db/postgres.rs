use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

use super::{LedgerError, OrderLedger};
use crate::config::DatabaseConfig;
use crate::models::{OrderRecord, OrderSide, OrderState, STATE_SOLD_OUT};

/// Postgres-backed order ledger
///
/// Expects an `orders` table keyed by `(instrument, order_id, strategy_flag)`;
/// schema creation is handled outside this process.
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Connect to Postgres
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await?;

        tracing::info!("Connected to Postgres order ledger");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_decimal(value: Option<f64>) -> Option<Decimal> {
    value.and_then(Decimal::from_f64)
}

fn record_from_row(row: &PgRow) -> Result<OrderRecord, LedgerError> {
    let side: String = row.try_get("side")?;
    let side = match side.as_str() {
        "buy" => OrderSide::Buy,
        "sell" => OrderSide::Sell,
        other => return Err(LedgerError::Malformed(format!("unknown side '{}'", other))),
    };

    let state: String = row.try_get("state")?;
    let price: Option<Decimal> = row.try_get("price")?;
    let size: Option<Decimal> = row.try_get("size")?;
    let sell_price: Option<Decimal> = row.try_get("sell_price")?;

    Ok(OrderRecord {
        instrument: row.try_get("instrument")?,
        order_id: row.try_get("order_id")?,
        strategy_flag: row.try_get("strategy_flag")?,
        create_time: row.try_get("create_time")?,
        order_type: row.try_get("order_type")?,
        side,
        state: OrderState::parse(&state),
        price: price.and_then(|d| d.to_f64()),
        size: size.and_then(|d| d.to_f64()),
        sell_time: row.try_get("sell_time")?,
        sell_price: sell_price.and_then(|d| d.to_f64()),
    })
}

impl OrderLedger for PostgresLedger {
    async fn open_positions(&self, strategy_flag: &str) -> Result<Vec<OrderRecord>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT instrument, order_id, strategy_flag, create_time, order_type,
                   side, state, price, size, sell_time, sell_price
            FROM orders
            WHERE strategy_flag = $1
              AND state IN ('filled', 'partially_filled')
              AND sell_price IS NULL
            ORDER BY create_time DESC
            "#,
        )
        .bind(strategy_flag)
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            "Loaded {} open positions for {} from Postgres",
            records.len(),
            strategy_flag
        );

        Ok(records)
    }

    async fn insert_order(&self, record: &OrderRecord) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                instrument, order_id, strategy_flag, create_time, order_type,
                side, state, price, size, sell_time, sell_price
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&record.instrument)
        .bind(&record.order_id)
        .bind(&record.strategy_flag)
        .bind(record.create_time)
        .bind(&record.order_type)
        .bind(record.side.as_str())
        .bind(record.state.as_str())
        .bind(to_decimal(record.price))
        .bind(to_decimal(record.size))
        .bind(record.sell_time)
        .bind(to_decimal(record.sell_price))
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved order {} for {} ({}) to Postgres",
            record.order_id,
            record.instrument,
            record.strategy_flag
        );

        Ok(())
    }

    async fn mark_sold(
        &self,
        instrument: &str,
        order_id: &str,
        strategy_flag: &str,
        sell_price: f64,
        sell_time: i64,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET state = $1, sell_price = $2, sell_time = $3
            WHERE instrument = $4 AND order_id = $5 AND strategy_flag = $6
            "#,
        )
        .bind(STATE_SOLD_OUT)
        .bind(to_decimal(Some(sell_price)))
        .bind(sell_time)
        .bind(instrument)
        .bind(order_id)
        .bind(strategy_flag)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
