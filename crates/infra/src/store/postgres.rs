//! Postgres-backed lot store.
//!
//! Concurrency is pessimistic here: `list_available_lots` and `has_lots` lock
//! every lot row of the item with `SELECT ... FOR UPDATE`, so concurrent
//! issuances of the same item serialize while disjoint items proceed in
//! parallel. Issuance itself runs through `allocate_issue` exactly as for the
//! in-memory store.
//!
//! The store traits are synchronous. Each call drives the underlying sqlx
//! future to completion on the runtime handle given at construction, so
//! callers on an async runtime must go through `spawn_blocking` (or another
//! thread outside the runtime's workers).
//!
//! Expected tables (schema is managed outside this crate):
//!
//! | table | columns |
//! |-------|---------|
//! | `stock_lots` | `lot_id uuid pk`, `item_key text`, `quantity_on_hand bigint check (>= 0)`, `received_order bigint`, `received_at timestamptz`, `version bigint` |
//! | `stock_movements` | `movement_id uuid pk`, `lot_id uuid fk`, `quantity bigint`, `direction text`, `reason_code text`, `actor_id uuid`, `recorded_at timestamptz`, `issue_id uuid null` |
//! | `issued_items` | `issue_id uuid pk`, `item_key text`, `quantity bigint`, `first_lot_id uuid`, `issued_by uuid`, `notes text null`, `issued_at timestamptz` |
//! | `item_thresholds` | `item_key text pk`, `minimum_stock bigint check (>= 0)` |
//!
//! plus the sequence `stock_lot_received_order_seq` for FIFO positions.
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | `StoreError` |
//! |------------|----------|--------------|
//! | Database (serialization failure / deadlock) | `40001`, `40P01` | `Conflict` |
//! | Database (check violation) | `23514` | `Invariant` |
//! | anything else | | `Backend` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{FromRow, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use lotkeeper_core::{IssueId, LotId, MovementId, UserId, Versioned};
use lotkeeper_inventory::{Direction, IssueRecord, ItemKey, MinimumStock, MovementRecord, StockLot};

use super::{LotStore, MovementLedger, StockTransaction, StoreError, TransactionSource};

const LOT_COLUMNS: &str = "lot_id, item_key, quantity_on_hand, received_order, received_at, version";

/// Postgres-backed lot store and movement ledger.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresStockStore {
    /// `runtime` drives every query; it must outlive the store.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect on the current runtime.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }
}

impl TransactionSource for PostgresStockStore {
    type Tx = PostgresTransaction;

    fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .runtime
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTransaction {
            tx: Some(tx),
            runtime: self.runtime.clone(),
        })
    }
}

/// One database transaction.
///
/// Dropping it without `commit` rolls the transaction back when the
/// connection returns to the pool.
#[derive(Debug)]
pub struct PostgresTransaction {
    /// `None` once committed or rolled back.
    tx: Option<Transaction<'static, Postgres>>,
    runtime: Handle,
}

impl PostgresTransaction {
    fn parts(&mut self) -> Result<(&Handle, &mut PgConnection), StoreError> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StoreError::Backend("transaction already finished".to_string()))?;
        Ok((&self.runtime, &mut **tx))
    }

    fn finish(mut self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.tx
            .take()
            .ok_or_else(|| StoreError::Backend("transaction already finished".to_string()))
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            // Returning the connection to the pool spawns onto the runtime.
            let _entered = self.runtime.enter();
            drop(tx);
            tracing::debug!("transaction dropped without commit; rolled back");
        }
    }
}

impl LotStore for PostgresTransaction {
    #[instrument(skip(self), err)]
    fn list_available_lots(&mut self, item_key: &ItemKey) -> Result<Vec<StockLot>, StoreError> {
        let (runtime, conn) = self.parts()?;
        let mut lots = runtime.block_on(lock_item_lots(conn, item_key))?;
        lots.retain(|l| l.quantity_on_hand() > 0);
        Ok(lots)
    }

    fn has_lots(&mut self, item_key: &ItemKey) -> Result<bool, StoreError> {
        let (runtime, conn) = self.parts()?;
        let lots = runtime.block_on(lock_item_lots(conn, item_key))?;
        Ok(!lots.is_empty())
    }

    fn lots_for_item(&mut self, item_key: &ItemKey) -> Result<Vec<StockLot>, StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(select_item_lots(conn, item_key))
    }

    fn get_lot(&mut self, lot_id: LotId) -> Result<Option<StockLot>, StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(lock_lot(conn, lot_id))
    }

    #[instrument(skip(self), err)]
    fn apply_deduction(&mut self, lot_id: LotId, amount: i64) -> Result<(), StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(deduct(conn, lot_id, amount))
    }

    fn save_lot(&mut self, lot: StockLot) -> Result<(), StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(upsert_lot(conn, &lot))
    }

    fn next_received_order(&mut self) -> Result<u64, StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(next_order(conn))
    }

    fn all_lots(&mut self) -> Result<Vec<StockLot>, StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(select_all_lots(conn))
    }

    fn minimum_stocks(&mut self) -> Result<Vec<MinimumStock>, StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(select_thresholds(conn))
    }

    fn set_minimum_stock(&mut self, threshold: MinimumStock) -> Result<(), StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(upsert_threshold(conn, &threshold))
    }
}

impl MovementLedger for PostgresTransaction {
    fn append(&mut self, movement: MovementRecord) -> Result<(), StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(insert_movement(conn, &movement))
    }

    fn record_issue(&mut self, record: IssueRecord) -> Result<(), StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(insert_issue_record(conn, &record))
    }

    fn movements_for_lot(&mut self, lot_id: LotId) -> Result<Vec<MovementRecord>, StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(select_lot_movements(conn, lot_id))
    }

    fn issue_records(&mut self) -> Result<Vec<IssueRecord>, StoreError> {
        let (runtime, conn) = self.parts()?;
        runtime.block_on(select_issue_records(conn))
    }
}

impl StockTransaction for PostgresTransaction {
    fn commit(self) -> Result<(), StoreError> {
        let runtime = self.runtime.clone();
        let tx = self.finish()?;
        runtime
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    fn rollback(self) -> Result<(), StoreError> {
        let runtime = self.runtime.clone();
        let tx = self.finish()?;
        runtime
            .block_on(tx.rollback())
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

async fn select_item_lots(conn: &mut PgConnection, item_key: &ItemKey) -> Result<Vec<StockLot>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {LOT_COLUMNS} FROM stock_lots WHERE item_key = $1 \
         ORDER BY received_order ASC, lot_id ASC"
    ))
    .bind(item_key.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("lots_for_item", e))?;

    rows_to_lots(&rows)
}

async fn select_all_lots(conn: &mut PgConnection) -> Result<Vec<StockLot>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {LOT_COLUMNS} FROM stock_lots ORDER BY item_key ASC, received_order ASC, lot_id ASC"
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("all_lots", e))?;

    rows_to_lots(&rows)
}

async fn lock_lot(conn: &mut PgConnection, lot_id: LotId) -> Result<Option<StockLot>, StoreError> {
    let row = sqlx::query(&format!("SELECT {LOT_COLUMNS} FROM stock_lots WHERE lot_id = $1 FOR UPDATE"))
        .bind(lot_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_lot", e))?;

    row.as_ref().map(decode_lot).transpose()
}

async fn upsert_lot(conn: &mut PgConnection, lot: &StockLot) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO stock_lots (lot_id, item_key, quantity_on_hand, received_order, received_at, version)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (lot_id) DO UPDATE
        SET quantity_on_hand = EXCLUDED.quantity_on_hand, version = EXCLUDED.version
        "#,
    )
    .bind(lot.lot_id().as_uuid())
    .bind(lot.item_key().as_str())
    .bind(lot.quantity_on_hand())
    .bind(to_i64("received_order", lot.received_order())?)
    .bind(lot.received_at())
    .bind(to_i64("version", lot.version())?)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("save_lot", e))?;
    Ok(())
}

async fn next_order(conn: &mut PgConnection) -> Result<u64, StoreError> {
    let order: i64 = sqlx::query_scalar("SELECT nextval('stock_lot_received_order_seq')")
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("next_received_order", e))?;
    to_u64("received_order", order)
}

async fn select_thresholds(conn: &mut PgConnection) -> Result<Vec<MinimumStock>, StoreError> {
    let rows = sqlx::query("SELECT item_key, minimum_stock FROM item_thresholds ORDER BY item_key ASC")
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("minimum_stocks", e))?;

    let mut thresholds = Vec::with_capacity(rows.len());
    for row in &rows {
        let item_key: String = row
            .try_get("item_key")
            .map_err(|e| map_sqlx_error("minimum_stocks", e))?;
        let minimum: i64 = row
            .try_get("minimum_stock")
            .map_err(|e| map_sqlx_error("minimum_stocks", e))?;
        thresholds.push(MinimumStock::new(ItemKey::parse(&item_key)?, minimum)?);
    }
    Ok(thresholds)
}

async fn upsert_threshold(conn: &mut PgConnection, threshold: &MinimumStock) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO item_thresholds (item_key, minimum_stock)
        VALUES ($1, $2)
        ON CONFLICT (item_key) DO UPDATE SET minimum_stock = EXCLUDED.minimum_stock
        "#,
    )
    .bind(threshold.item_key.as_str())
    .bind(threshold.minimum)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("set_minimum_stock", e))?;
    Ok(())
}

async fn select_lot_movements(conn: &mut PgConnection, lot_id: LotId) -> Result<Vec<MovementRecord>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT movement_id, lot_id, quantity, direction, reason_code, actor_id, recorded_at, issue_id
        FROM stock_movements
        WHERE lot_id = $1
        ORDER BY recorded_at ASC, movement_id ASC
        "#,
    )
    .bind(lot_id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("movements_for_lot", e))?;

    let mut movements = Vec::with_capacity(rows.len());
    for row in &rows {
        let row = MovementRow::from_row(row)
            .map_err(|e| StoreError::Backend(format!("failed to decode movement row: {e}")))?;
        movements.push(MovementRecord::try_from(row)?);
    }
    Ok(movements)
}

async fn select_issue_records(conn: &mut PgConnection) -> Result<Vec<IssueRecord>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT issue_id, item_key, quantity, first_lot_id, issued_by, notes, issued_at
        FROM issued_items
        ORDER BY issued_at DESC, issue_id DESC
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("issue_records", e))?;

    rows.iter().map(decode_issue_record).collect()
}

async fn lock_item_lots(conn: &mut PgConnection, item_key: &ItemKey) -> Result<Vec<StockLot>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {LOT_COLUMNS} FROM stock_lots WHERE item_key = $1 \
         ORDER BY received_order ASC, lot_id ASC FOR UPDATE"
    ))
    .bind(item_key.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("lock_item_lots", e))?;

    rows_to_lots(&rows)
}

async fn deduct(conn: &mut PgConnection, lot_id: LotId, amount: i64) -> Result<(), StoreError> {
    if amount <= 0 {
        return Err(StoreError::Invariant(format!("deduction must be positive, got {amount}")));
    }
    let result = sqlx::query(
        r#"
        UPDATE stock_lots
        SET quantity_on_hand = quantity_on_hand - $1, version = version + 1
        WHERE lot_id = $2 AND quantity_on_hand >= $1
        "#,
    )
    .bind(amount)
    .bind(lot_id.as_uuid())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("deduct", e))?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let exists: Option<i64> = sqlx::query_scalar("SELECT quantity_on_hand FROM stock_lots WHERE lot_id = $1")
        .bind(lot_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("deduct", e))?;
    match exists {
        None => Err(StoreError::LotNotFound(lot_id)),
        Some(on_hand) => Err(StoreError::Invariant(format!(
            "lot {lot_id} holds {on_hand}, cannot deduct {amount}"
        ))),
    }
}

async fn insert_movement(conn: &mut PgConnection, movement: &MovementRecord) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO stock_movements (
            movement_id, lot_id, quantity, direction, reason_code, actor_id, recorded_at, issue_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(movement.movement_id.as_uuid())
    .bind(movement.lot_id.as_uuid())
    .bind(movement.quantity_delta)
    .bind(movement.direction.as_str())
    .bind(&movement.reason_code)
    .bind(movement.actor_id.as_uuid())
    .bind(movement.recorded_at)
    .bind(movement.issue_id.map(Uuid::from))
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_movement", e))?;
    Ok(())
}

async fn insert_issue_record(conn: &mut PgConnection, record: &IssueRecord) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO issued_items (issue_id, item_key, quantity, first_lot_id, issued_by, notes, issued_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(record.issue_id.as_uuid())
    .bind(record.item_key.as_str())
    .bind(record.quantity)
    .bind(record.first_lot_id.as_uuid())
    .bind(record.issued_by.as_uuid())
    .bind(record.notes.as_deref())
    .bind(record.issued_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_issue_record", e))?;
    Ok(())
}

fn decode_lot(row: &PgRow) -> Result<StockLot, StoreError> {
    let row = LotRow::from_row(row).map_err(|e| StoreError::Backend(format!("failed to decode lot row: {e}")))?;
    StockLot::try_from(row)
}

fn rows_to_lots(rows: &[PgRow]) -> Result<Vec<StockLot>, StoreError> {
    rows.iter().map(decode_lot).collect()
}

fn decode_issue_record(row: &PgRow) -> Result<IssueRecord, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Backend(format!("failed to decode issue row: {e}"));
    let item_key: String = row.try_get("item_key").map_err(decode)?;
    Ok(IssueRecord {
        issue_id: IssueId::from_uuid(row.try_get("issue_id").map_err(decode)?),
        item_key: ItemKey::parse(&item_key)?,
        quantity: row.try_get("quantity").map_err(decode)?,
        first_lot_id: LotId::from_uuid(row.try_get("first_lot_id").map_err(decode)?),
        issued_by: UserId::from_uuid(row.try_get("issued_by").map_err(decode)?),
        notes: row.try_get("notes").map_err(decode)?,
        issued_at: row.try_get("issued_at").map_err(decode)?,
    })
}

fn to_u64(column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Invariant(format!("{column} is negative: {value}")))
}

fn to_i64(column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Invariant(format!("{column} out of range: {value}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Serialization failure / deadlock detected.
                Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                Some("23514") => StoreError::Invariant(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {operation}")),
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct LotRow {
    lot_id: Uuid,
    item_key: String,
    quantity_on_hand: i64,
    received_order: i64,
    received_at: DateTime<Utc>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for LotRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LotRow {
            lot_id: row.try_get("lot_id")?,
            item_key: row.try_get("item_key")?,
            quantity_on_hand: row.try_get("quantity_on_hand")?,
            received_order: row.try_get("received_order")?,
            received_at: row.try_get("received_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<LotRow> for StockLot {
    type Error = StoreError;

    fn try_from(row: LotRow) -> Result<Self, Self::Error> {
        let item_key = ItemKey::parse(&row.item_key)?;
        StockLot::restore(
            LotId::from_uuid(row.lot_id),
            item_key,
            row.quantity_on_hand,
            to_u64("received_order", row.received_order)?,
            row.received_at,
            to_u64("version", row.version)?,
        )
        .map_err(StoreError::from)
    }
}

#[derive(Debug)]
struct MovementRow {
    movement_id: Uuid,
    lot_id: Uuid,
    quantity: i64,
    direction: String,
    reason_code: String,
    actor_id: Uuid,
    recorded_at: DateTime<Utc>,
    issue_id: Option<Uuid>,
}

impl<'r> FromRow<'r, PgRow> for MovementRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MovementRow {
            movement_id: row.try_get("movement_id")?,
            lot_id: row.try_get("lot_id")?,
            quantity: row.try_get("quantity")?,
            direction: row.try_get("direction")?,
            reason_code: row.try_get("reason_code")?,
            actor_id: row.try_get("actor_id")?,
            recorded_at: row.try_get("recorded_at")?,
            issue_id: row.try_get("issue_id")?,
        })
    }
}

impl TryFrom<MovementRow> for MovementRecord {
    type Error = StoreError;

    fn try_from(row: MovementRow) -> Result<Self, Self::Error> {
        if row.quantity <= 0 {
            return Err(StoreError::Invariant(format!(
                "movement {} has non-positive quantity {}",
                row.movement_id, row.quantity
            )));
        }
        Ok(MovementRecord {
            movement_id: MovementId::from_uuid(row.movement_id),
            lot_id: LotId::from_uuid(row.lot_id),
            quantity_delta: row.quantity,
            direction: Direction::parse(&row.direction)?,
            reason_code: row.reason_code,
            actor_id: UserId::from_uuid(row.actor_id),
            recorded_at: row.recorded_at,
            issue_id: row.issue_id.map(IssueId::from_uuid),
        })
    }
}
