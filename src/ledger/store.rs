// =============================================================================
// Ledger Store — transactional SQLite persistence for the position ledger
// =============================================================================
//
// The store is the sole writer for positions and pending orders. Compound
// updates (averaging, partial close, close) each run inside one SQLite
// transaction so a crash can never leave entry/quantity/notional inconsistent.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{liquidation_price, realized_pnl, PendingOrder, Position, TradeExecution};
use crate::types::{now_ms, OrderKind, OrderStatus, PositionStatus, Side};

#[derive(Clone)]
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open ledger db")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ledger db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id                 TEXT PRIMARY KEY,
                sub_account        TEXT NOT NULL,
                symbol             TEXT NOT NULL,
                side               TEXT NOT NULL,
                entry_price        REAL NOT NULL,
                quantity           REAL NOT NULL,
                notional           REAL NOT NULL,
                leverage           INTEGER NOT NULL,
                margin             REAL NOT NULL,
                liquidation_price  REAL NOT NULL,
                status             TEXT NOT NULL,
                babysitter_excluded INTEGER NOT NULL DEFAULT 0,
                realized_pnl       REAL NOT NULL DEFAULT 0,
                opened_at          INTEGER NOT NULL,
                closed_at          INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_open
             ON positions(sub_account, symbol, side, status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pending_orders (
                id                TEXT PRIMARY KEY,
                sub_account       TEXT NOT NULL,
                symbol            TEXT NOT NULL,
                side              TEXT NOT NULL,
                kind              TEXT NOT NULL,
                price             REAL NOT NULL,
                quantity          REAL NOT NULL,
                leverage          INTEGER NOT NULL,
                status            TEXT NOT NULL,
                exchange_order_id INTEGER,
                created_at        INTEGER NOT NULL,
                filled_at         INTEGER,
                cancelled_at      INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_exchange
             ON pending_orders(exchange_order_id, sub_account, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_pending
             ON pending_orders(status, kind, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trade_executions (
                id           TEXT PRIMARY KEY,
                sub_account  TEXT NOT NULL,
                kind         TEXT NOT NULL,
                order_id     TEXT NOT NULL,
                symbol       TEXT NOT NULL,
                side         TEXT NOT NULL,
                price        REAL NOT NULL,
                quantity     REAL NOT NULL,
                realized_pnl REAL,
                signature    TEXT NOT NULL,
                ts           INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_order ON trade_executions(order_id)",
            [],
        )?;

        info!("ledger store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Open a brand-new position from a fill.
    pub async fn create_position(
        &self,
        sub_account: &str,
        symbol: &str,
        side: Side,
        entry_price: f64,
        quantity: f64,
        leverage: u32,
    ) -> Result<Position> {
        let notional = entry_price * quantity;
        let pos = Position {
            id: Uuid::new_v4().to_string(),
            sub_account: sub_account.to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            quantity,
            notional,
            leverage,
            margin: notional / leverage.max(1) as f64,
            liquidation_price: liquidation_price(entry_price, side, leverage),
            status: PositionStatus::Open,
            babysitter_excluded: false,
            realized_pnl: 0.0,
            opened_at: now_ms(),
            closed_at: None,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions (id, sub_account, symbol, side, entry_price, quantity,
                notional, leverage, margin, liquidation_price, status, babysitter_excluded,
                realized_pnl, opened_at, closed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                pos.id,
                pos.sub_account,
                pos.symbol,
                pos.side.as_str(),
                pos.entry_price,
                pos.quantity,
                pos.notional,
                pos.leverage,
                pos.margin,
                pos.liquidation_price,
                pos.status.as_str(),
                pos.babysitter_excluded as i64,
                pos.realized_pnl,
                pos.opened_at,
                pos.closed_at,
            ],
        )
        .context("insert position")?;

        info!(
            position_id = %pos.id,
            sub_account,
            symbol,
            side = %side,
            entry_price,
            quantity,
            "position opened"
        );
        Ok(pos)
    }

    pub async fn get_position(&self, id: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        Self::query_one_position(&conn, "SELECT * FROM positions WHERE id = ?1", params![id])
    }

    /// The open position for (account, symbol, side), if any.
    pub async fn find_open_position(
        &self,
        sub_account: &str,
        symbol: &str,
        side: Side,
    ) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        Self::query_one_position(
            &conn,
            "SELECT * FROM positions
             WHERE sub_account = ?1 AND symbol = ?2 AND side = ?3 AND status = 'OPEN'
             ORDER BY opened_at DESC LIMIT 1",
            params![sub_account, symbol, side.as_str()],
        )
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        Self::query_positions(
            &conn,
            "SELECT * FROM positions WHERE status = 'OPEN' ORDER BY opened_at",
            params![],
        )
    }

    /// Average a new fill into an existing open position. Transactional.
    pub async fn average_into(
        &self,
        position_id: &str,
        fill_price: f64,
        fill_qty: f64,
    ) -> Result<Position> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin average_into")?;

        let pos = Self::query_one_position(
            &tx,
            "SELECT * FROM positions WHERE id = ?1 AND status = 'OPEN'",
            params![position_id],
        )?
        .with_context(|| format!("open position {position_id} not found"))?;

        let new_qty = pos.quantity + fill_qty;
        let new_entry = (pos.entry_price * pos.quantity + fill_price * fill_qty) / new_qty;
        let new_notional = new_entry * new_qty;
        let new_margin = new_notional / pos.leverage.max(1) as f64;
        let new_liq = liquidation_price(new_entry, pos.side, pos.leverage);

        tx.execute(
            "UPDATE positions
             SET entry_price = ?2, quantity = ?3, notional = ?4, margin = ?5,
                 liquidation_price = ?6
             WHERE id = ?1",
            params![position_id, new_entry, new_qty, new_notional, new_margin, new_liq],
        )
        .context("update averaged position")?;
        tx.commit().context("commit average_into")?;

        debug!(
            position_id,
            fill_price,
            fill_qty,
            new_entry,
            new_qty,
            "fill averaged into position"
        );

        Ok(Position {
            entry_price: new_entry,
            quantity: new_qty,
            notional: new_notional,
            margin: new_margin,
            liquidation_price: new_liq,
            ..pos
        })
    }

    /// Close `fraction` (0 < fraction < 1) of a position at `close_price`.
    /// Returns the updated position and the realized PnL of the closed slice.
    pub async fn partial_close(
        &self,
        position_id: &str,
        fraction: f64,
        close_price: f64,
    ) -> Result<(Position, f64)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin partial_close")?;

        let pos = Self::query_one_position(
            &tx,
            "SELECT * FROM positions WHERE id = ?1 AND status = 'OPEN'",
            params![position_id],
        )?
        .with_context(|| format!("open position {position_id} not found"))?;

        let close_qty = pos.quantity * fraction.clamp(0.0, 1.0);
        let pnl = realized_pnl(pos.entry_price, close_price, close_qty, pos.side);
        let new_qty = pos.quantity - close_qty;
        let new_notional = pos.entry_price * new_qty;
        let new_margin = new_notional / pos.leverage.max(1) as f64;
        let new_realized = pos.realized_pnl + pnl;

        tx.execute(
            "UPDATE positions
             SET quantity = ?2, notional = ?3, margin = ?4, realized_pnl = ?5
             WHERE id = ?1",
            params![position_id, new_qty, new_notional, new_margin, new_realized],
        )
        .context("update partially closed position")?;
        tx.commit().context("commit partial_close")?;

        info!(
            position_id,
            close_qty,
            remaining_qty = new_qty,
            close_price,
            pnl,
            "position partially closed"
        );

        Ok((
            Position {
                quantity: new_qty,
                notional: new_notional,
                margin: new_margin,
                realized_pnl: new_realized,
                ..pos
            },
            pnl,
        ))
    }

    /// Fully close a position at `close_price`. Returns the final record and
    /// the realized PnL of the remaining quantity.
    pub async fn close_by_price(
        &self,
        position_id: &str,
        close_price: f64,
    ) -> Result<(Position, f64)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin close_by_price")?;

        let pos = Self::query_one_position(
            &tx,
            "SELECT * FROM positions WHERE id = ?1 AND status = 'OPEN'",
            params![position_id],
        )?
        .with_context(|| format!("open position {position_id} not found"))?;

        let pnl = realized_pnl(pos.entry_price, close_price, pos.quantity, pos.side);
        let new_realized = pos.realized_pnl + pnl;
        let closed_at = now_ms();

        tx.execute(
            "UPDATE positions
             SET quantity = 0, notional = 0, margin = 0, realized_pnl = ?2,
                 status = 'CLOSED', closed_at = ?3
             WHERE id = ?1",
            params![position_id, new_realized, closed_at],
        )
        .context("update closed position")?;
        tx.commit().context("commit close_by_price")?;

        info!(position_id, close_price, pnl, "position closed");

        Ok((
            Position {
                quantity: 0.0,
                notional: 0.0,
                margin: 0.0,
                realized_pnl: new_realized,
                status: PositionStatus::Closed,
                closed_at: Some(closed_at),
                ..pos
            },
            pnl,
        ))
    }

    pub async fn set_babysitter_excluded(&self, position_id: &str, excluded: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET babysitter_excluded = ?2 WHERE id = ?1",
            params![position_id, excluded as i64],
        )
        .context("update babysitter_excluded")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pending orders
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_pending_order(
        &self,
        sub_account: &str,
        symbol: &str,
        side: Side,
        kind: OrderKind,
        price: f64,
        quantity: f64,
        leverage: u32,
        exchange_order_id: Option<u64>,
    ) -> Result<PendingOrder> {
        let order = PendingOrder {
            id: Uuid::new_v4().to_string(),
            sub_account: sub_account.to_string(),
            symbol: symbol.to_string(),
            side,
            kind,
            price,
            quantity,
            leverage,
            status: OrderStatus::Pending,
            exchange_order_id,
            created_at: now_ms(),
            filled_at: None,
            cancelled_at: None,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pending_orders (id, sub_account, symbol, side, kind, price, quantity,
                leverage, status, exchange_order_id, created_at, filled_at, cancelled_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                order.id,
                order.sub_account,
                order.symbol,
                order.side.as_str(),
                order.kind.as_str(),
                order.price,
                order.quantity,
                order.leverage,
                order.status.as_str(),
                order.exchange_order_id.map(|v| v as i64),
                order.created_at,
                order.filled_at,
                order.cancelled_at,
            ],
        )
        .context("insert pending order")?;

        debug!(order_id = %order.id, symbol, kind = %kind, "pending order recorded");
        Ok(order)
    }

    pub async fn get_pending_order(&self, id: &str) -> Result<Option<PendingOrder>> {
        let conn = self.conn.lock().await;
        Self::query_one_order(&conn, "SELECT * FROM pending_orders WHERE id = ?1", params![id])
    }

    /// Look up a PENDING order by its live exchange id, optionally pinned to
    /// one order kind or explicitly excluding chase orders (the stream path
    /// routes those through their own entry point).
    pub async fn find_pending_by_exchange_id(
        &self,
        exchange_order_id: u64,
        kind: Option<OrderKind>,
        exclude_chase: bool,
    ) -> Result<Option<PendingOrder>> {
        let conn = self.conn.lock().await;
        match (kind, exclude_chase) {
            (Some(k), _) => Self::query_one_order(
                &conn,
                "SELECT * FROM pending_orders
                 WHERE exchange_order_id = ?1 AND status = 'PENDING' AND kind = ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![exchange_order_id as i64, k.as_str()],
            ),
            (None, true) => Self::query_one_order(
                &conn,
                "SELECT * FROM pending_orders
                 WHERE exchange_order_id = ?1 AND status = 'PENDING' AND kind != 'CHASE_LIMIT'
                 ORDER BY created_at DESC LIMIT 1",
                params![exchange_order_id as i64],
            ),
            (None, false) => Self::query_one_order(
                &conn,
                "SELECT * FROM pending_orders
                 WHERE exchange_order_id = ?1 AND status = 'PENDING'
                 ORDER BY created_at DESC LIMIT 1",
                params![exchange_order_id as i64],
            ),
        }
    }

    /// Most recent PENDING chase order for (account, symbol). Fallback lookup
    /// for fills whose stored exchange id is stale after a reprice.
    pub async fn latest_pending_chase(
        &self,
        sub_account: &str,
        symbol: &str,
    ) -> Result<Option<PendingOrder>> {
        let conn = self.conn.lock().await;
        Self::query_one_order(
            &conn,
            "SELECT * FROM pending_orders
             WHERE sub_account = ?1 AND symbol = ?2 AND kind = 'CHASE_LIMIT' AND status = 'PENDING'
             ORDER BY created_at DESC LIMIT 1",
            params![sub_account, symbol],
        )
    }

    /// PENDING non-chase orders, oldest first (the reconciler's poll input).
    pub async fn pending_orders_excluding_chase(&self) -> Result<Vec<PendingOrder>> {
        let conn = self.conn.lock().await;
        Self::query_orders(
            &conn,
            "SELECT * FROM pending_orders
             WHERE status = 'PENDING' AND kind != 'CHASE_LIMIT'
             ORDER BY created_at ASC",
            params![],
        )
    }

    pub async fn update_order_status(&self, id: &str, status: OrderStatus) -> Result<()> {
        let ts = now_ms();
        let conn = self.conn.lock().await;
        match status {
            OrderStatus::Filled => conn.execute(
                "UPDATE pending_orders SET status = ?2, filled_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), ts],
            ),
            OrderStatus::Cancelled | OrderStatus::Expired => conn.execute(
                "UPDATE pending_orders SET status = ?2, cancelled_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), ts],
            ),
            OrderStatus::Pending => conn.execute(
                "UPDATE pending_orders SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            ),
        }
        .context("update order status")?;
        Ok(())
    }

    /// Upsert the live exchange order id (chase reprices move it).
    pub async fn set_exchange_order_id(&self, id: &str, exchange_order_id: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE pending_orders SET exchange_order_id = ?2 WHERE id = ?1",
            params![id, exchange_order_id as i64],
        )
        .context("update exchange order id")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trade executions
    // -------------------------------------------------------------------------

    pub async fn insert_execution(&self, exec: &TradeExecution) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trade_executions (id, sub_account, kind, order_id, symbol, side,
                price, quantity, realized_pnl, signature, ts)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                exec.id,
                exec.sub_account,
                exec.kind,
                exec.order_id,
                exec.symbol,
                exec.side.as_str(),
                exec.price,
                exec.quantity,
                exec.realized_pnl,
                exec.signature,
                exec.ts,
            ],
        )
        .context("insert trade execution")?;
        Ok(())
    }

    pub async fn executions_for_order(&self, order_id: &str) -> Result<Vec<TradeExecution>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM trade_executions WHERE order_id = ?1 ORDER BY ts")
            .context("prepare executions query")?;
        let rows = stmt
            .query_map(params![order_id], Self::row_to_execution)
            .context("query executions")?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Row mapping
    // -------------------------------------------------------------------------

    fn query_one_position(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<Position>> {
        let mut stmt = conn.prepare(sql).context("prepare position query")?;
        stmt.query_row(params, Self::row_to_position)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("query position")
    }

    fn query_positions(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Position>> {
        let mut stmt = conn.prepare(sql).context("prepare positions query")?;
        let rows = stmt
            .query_map(params, Self::row_to_position)
            .context("query positions")?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
        let side: String = row.get("side")?;
        let status: String = row.get("status")?;
        Ok(Position {
            id: row.get("id")?,
            sub_account: row.get("sub_account")?,
            symbol: row.get("symbol")?,
            side: Side::parse(&side).unwrap_or(Side::Long),
            entry_price: row.get("entry_price")?,
            quantity: row.get("quantity")?,
            notional: row.get("notional")?,
            leverage: row.get("leverage")?,
            margin: row.get("margin")?,
            liquidation_price: row.get("liquidation_price")?,
            status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Open),
            babysitter_excluded: row.get::<_, i64>("babysitter_excluded")? != 0,
            realized_pnl: row.get("realized_pnl")?,
            opened_at: row.get("opened_at")?,
            closed_at: row.get("closed_at")?,
        })
    }

    fn query_one_order(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<PendingOrder>> {
        let mut stmt = conn.prepare(sql).context("prepare order query")?;
        stmt.query_row(params, Self::row_to_order)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("query order")
    }

    fn query_orders(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<PendingOrder>> {
        let mut stmt = conn.prepare(sql).context("prepare orders query")?;
        let rows = stmt
            .query_map(params, Self::row_to_order)
            .context("query orders")?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_order(row: &Row<'_>) -> rusqlite::Result<PendingOrder> {
        let side: String = row.get("side")?;
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        Ok(PendingOrder {
            id: row.get("id")?,
            sub_account: row.get("sub_account")?,
            symbol: row.get("symbol")?,
            side: Side::parse(&side).unwrap_or(Side::Long),
            kind: OrderKind::parse(&kind).unwrap_or(OrderKind::Limit),
            price: row.get("price")?,
            quantity: row.get("quantity")?,
            leverage: row.get("leverage")?,
            status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Pending),
            exchange_order_id: row
                .get::<_, Option<i64>>("exchange_order_id")?
                .map(|v| v as u64),
            created_at: row.get("created_at")?,
            filled_at: row.get("filled_at")?,
            cancelled_at: row.get("cancelled_at")?,
        })
    }

    fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<TradeExecution> {
        let side: String = row.get("side")?;
        Ok(TradeExecution {
            id: row.get("id")?,
            sub_account: row.get("sub_account")?,
            kind: row.get("kind")?,
            order_id: row.get("order_id")?,
            symbol: row.get("symbol")?,
            side: Side::parse(&side).unwrap_or(Side::Long),
            price: row.get("price")?,
            quantity: row.get("quantity")?,
            realized_pnl: row.get("realized_pnl")?,
            signature: row.get("signature")?,
            ts: row.get("ts")?,
        })
    }
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> LedgerStore {
        LedgerStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn position_invariant_holds_after_open_and_average() {
        let store = store().await;
        let pos = store
            .create_position("acct", "BTC/USDT:USDT", Side::Long, 100.0, 2.0, 10)
            .await
            .unwrap();
        assert!((pos.notional - 200.0).abs() < 1e-9);
        assert!((pos.margin - 20.0).abs() < 1e-9);

        // Average in 1 @ 130 -> entry (100*2 + 130*1)/3 = 110.
        let pos = store.average_into(&pos.id, 130.0, 1.0).await.unwrap();
        assert!((pos.entry_price - 110.0).abs() < 1e-9);
        assert!((pos.quantity - 3.0).abs() < 1e-9);
        assert!((pos.notional - pos.entry_price * pos.quantity).abs() < 1e-6);
    }

    #[tokio::test]
    async fn partial_close_realizes_fractional_pnl() {
        let store = store().await;
        let pos = store
            .create_position("acct", "ETH/USDT:USDT", Side::Long, 100.0, 5.0, 5)
            .await
            .unwrap();

        // Close 2/5 at 110: pnl = 10 * 2 = 20.
        let (pos, pnl) = store.partial_close(&pos.id, 2.0 / 5.0, 110.0).await.unwrap();
        assert!((pnl - 20.0).abs() < 1e-9);
        assert!((pos.quantity - 3.0).abs() < 1e-9);
        assert_eq!(pos.status, PositionStatus::Open);
        assert!((pos.notional - pos.entry_price * pos.quantity).abs() < 1e-6);
    }

    #[tokio::test]
    async fn open_close_round_trip_nets_to_zero() {
        let store = store().await;
        let pos = store
            .create_position("acct", "SOL/USDT:USDT", Side::Short, 100.0, 4.0, 3)
            .await
            .unwrap();
        let (closed, pnl) = store.close_by_price(&pos.id, 90.0).await.unwrap();
        // SHORT: pnl = -(90 − 100) × 4 = 40.
        assert!((pnl - 40.0).abs() < 1e-9);
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.quantity, 0.0);
        assert!(store
            .find_open_position("acct", "SOL/USDT:USDT", Side::Short)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn pending_order_lookups_respect_kind_filters() {
        let store = store().await;
        let chase = store
            .create_pending_order("acct", "BTC/USDT:USDT", Side::Long, OrderKind::ChaseLimit,
                100.0, 1.0, 10, Some(111))
            .await
            .unwrap();
        let plain = store
            .create_pending_order("acct", "BTC/USDT:USDT", Side::Long, OrderKind::Limit,
                100.0, 1.0, 10, Some(222))
            .await
            .unwrap();

        // Stream path excludes chase orders.
        let found = store
            .find_pending_by_exchange_id(111, None, true)
            .await
            .unwrap();
        assert!(found.is_none());
        let found = store
            .find_pending_by_exchange_id(222, None, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, plain.id);

        // Chase entry point pins the kind.
        let found = store
            .find_pending_by_exchange_id(111, Some(OrderKind::ChaseLimit), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, chase.id);

        // Fallback by most-recent pending chase for symbol+account.
        let found = store
            .latest_pending_chase("acct", "BTC/USDT:USDT")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, chase.id);

        // Poll input excludes chase orders and sorts oldest first.
        let polled = store.pending_orders_excluding_chase().await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].id, plain.id);
    }

    #[tokio::test]
    async fn order_status_transitions_stamp_timestamps() {
        let store = store().await;
        let order = store
            .create_pending_order("acct", "X/USDT:USDT", Side::Short, OrderKind::Limit,
                5.0, 10.0, 2, None)
            .await
            .unwrap();
        store
            .update_order_status(&order.id, OrderStatus::Filled)
            .await
            .unwrap();
        let got = store.get_pending_order(&order.id).await.unwrap().unwrap();
        assert_eq!(got.status, OrderStatus::Filled);
        assert!(got.filled_at.is_some());
        assert!(got.cancelled_at.is_none());

        store.set_exchange_order_id(&order.id, 987).await.unwrap();
        let got = store.get_pending_order(&order.id).await.unwrap().unwrap();
        assert_eq!(got.exchange_order_id, Some(987));
    }

    #[tokio::test]
    async fn executions_are_append_only_per_order() {
        let store = store().await;
        let exec = TradeExecution {
            id: "e1".into(),
            sub_account: "acct".into(),
            kind: "open".into(),
            order_id: "o1".into(),
            symbol: "BTC/USDT:USDT".into(),
            side: Side::Long,
            price: 100.0,
            quantity: 1.0,
            realized_pnl: None,
            signature: "sig".into(),
            ts: now_ms(),
        };
        store.insert_execution(&exec).await.unwrap();
        let got = store.executions_for_order("o1").await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].signature, "sig");
    }
}
