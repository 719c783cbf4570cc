//! SQLite-backed durable state for the live paper-trading pipeline.
//!
//! Positions, orders, run log and shadow-strategy records all survive process
//! restarts here so that the executor can recover mid-day without replaying
//! fills. Schema is created on connect via hand-written `CREATE TABLE IF NOT
//! EXISTS` statements rather than a migrations directory, mirroring the
//! original Python state store's runtime schema bootstrap.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use eg_schemas::{
    ExitReason, Order, OrderIntent, OrderStatus, PersistentPosition, RunLog, RunPhase, Side,
    ShadowPosition, ShadowSignalRecord,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

pub const ENV_DB_PATH: &str = "EG_DATABASE_PATH";

/// Opens (creating if needed) the sqlite file named by `EG_DATABASE_PATH`,
/// defaulting to `eg_state.db` in the working directory.
pub async fn connect_from_env() -> Result<SqlitePool> {
    let path = std::env::var(ENV_DB_PATH).unwrap_or_else(|_| "eg_state.db".to_string());
    connect(&path).await
}

pub async fn connect(path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open state store at {path}"))?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Creates every table if absent and applies any forward-only column
/// additions needed by an older database file. No down-migrations; the state
/// store only ever grows.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        create table if not exists positions (
            position_id integer primary key autoincrement,
            ticker text not null,
            entry_date text not null,
            entry_price real not null,
            shares integer not null,
            stop_price real,
            stop_order_id text,
            exit_date text,
            exit_price real,
            exit_reason text,
            status text not null default 'open'
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create positions table failed")?;

    sqlx::query(
        r#"
        create table if not exists orders (
            order_id integer primary key autoincrement,
            client_order_id text not null unique,
            ticker text not null,
            side text not null,
            intent text not null,
            trade_date text not null,
            run_id text,
            qty integer not null,
            status text not null,
            broker_order_id text,
            filled_qty integer not null default 0,
            filled_avg_price real,
            reject_reason text,
            created_at text not null default (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create orders table failed")?;

    sqlx::query(
        r#"
        create table if not exists run_log (
            run_id text not null,
            phase text not null,
            trade_date text not null,
            started_at text not null,
            completed_at text,
            summary text,
            primary key (run_id, phase)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create run_log table failed")?;

    sqlx::query(
        r#"
        create table if not exists shadow_positions (
            shadow_id integer primary key autoincrement,
            ticker text not null,
            entry_date text not null,
            entry_price real not null,
            score real,
            exit_date text,
            exit_price real,
            exit_reason text
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create shadow_positions table failed")?;

    sqlx::query(
        r#"
        create table if not exists shadow_signals (
            ticker text not null,
            trade_date text not null,
            score real,
            action text not null,
            primary key (ticker, trade_date)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create shadow_signals table failed")?;

    sqlx::query(
        r#"
        create table if not exists system_config (
            sentinel_id integer primary key check (sentinel_id = 1),
            kill_switch integer not null default 0
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create system_config table failed")?;

    sqlx::query(
        r#"insert into system_config (sentinel_id, kill_switch) values (1, 0)
           on conflict (sentinel_id) do nothing"#,
    )
    .execute(pool)
    .await
    .context("seed system_config failed")?;

    let has_planned_stop: bool = sqlx::query_scalar(
        r#"select count(*) > 0 from pragma_table_info('orders') where name = 'planned_stop_price'"#,
    )
    .fetch_one(pool)
    .await
    .context("planned_stop_price probe failed")?;
    if !has_planned_stop {
        sqlx::query("alter table orders add column planned_stop_price real")
            .execute(pool)
            .await
            .context("add planned_stop_price column failed")?;
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStatus {
    pub ok: bool,
    pub has_positions_table: bool,
}

pub async fn status(pool: &SqlitePool) -> Result<DbStatus> {
    let (one,): (i64,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let exists: Option<String> =
        sqlx::query_scalar("select name from sqlite_master where type = 'table' and name = 'positions'")
            .fetch_optional(pool)
            .await
            .context("status table probe failed")?;
    Ok(DbStatus { ok: one == 1, has_positions_table: exists.is_some() })
}

// ---- kill switch -----------------------------------------------------

pub async fn kill_switch_engaged(pool: &SqlitePool) -> Result<bool> {
    let engaged: i64 = sqlx::query_scalar("select kill_switch from system_config where sentinel_id = 1")
        .fetch_one(pool)
        .await
        .context("kill_switch_engaged failed")?;
    Ok(engaged != 0)
}

pub async fn set_kill_switch(pool: &SqlitePool, engaged: bool) -> Result<()> {
    sqlx::query("update system_config set kill_switch = ? where sentinel_id = 1")
        .bind(engaged as i64)
        .execute(pool)
        .await
        .context("set_kill_switch failed")?;
    Ok(())
}

// ---- positions --------------------------------------------------------

pub struct NewPosition {
    pub ticker: String,
    pub entry_date: NaiveDate,
    pub entry_price: f64,
    pub shares: u64,
    pub stop_price: Option<f64>,
}

pub async fn insert_position(pool: &SqlitePool, pos: &NewPosition) -> Result<i64> {
    let result = sqlx::query(
        r#"insert into positions (ticker, entry_date, entry_price, shares, stop_price, status)
           values (?, ?, ?, ?, ?, 'open')"#,
    )
    .bind(&pos.ticker)
    .bind(pos.entry_date.to_string())
    .bind(pos.entry_price)
    .bind(pos.shares as i64)
    .bind(pos.stop_price)
    .execute(pool)
    .await
    .context("insert_position failed")?;
    Ok(result.last_insert_rowid())
}

pub async fn get_open_positions(pool: &SqlitePool) -> Result<Vec<PersistentPosition>> {
    let rows = sqlx::query(
        r#"select position_id, ticker, entry_date, entry_price, shares, stop_price, stop_order_id,
                  exit_date, exit_price, exit_reason
           from positions where status = 'open' order by position_id asc"#,
    )
    .fetch_all(pool)
    .await
    .context("get_open_positions failed")?;
    rows.iter().map(row_to_position).collect()
}

pub async fn get_position_by_ticker(
    pool: &SqlitePool,
    ticker: &str,
) -> Result<Option<PersistentPosition>> {
    let row = sqlx::query(
        r#"select position_id, ticker, entry_date, entry_price, shares, stop_price, stop_order_id,
                  exit_date, exit_price, exit_reason
           from positions where ticker = ? and status = 'open'"#,
    )
    .bind(ticker)
    .fetch_optional(pool)
    .await
    .context("get_position_by_ticker failed")?;
    row.as_ref().map(row_to_position).transpose()
}

pub async fn update_position_stop(
    pool: &SqlitePool,
    position_id: i64,
    stop_price: f64,
    stop_order_id: &str,
) -> Result<()> {
    sqlx::query("update positions set stop_price = ?, stop_order_id = ? where position_id = ?")
        .bind(stop_price)
        .bind(stop_order_id)
        .bind(position_id)
        .execute(pool)
        .await
        .context("update_position_stop failed")?;
    Ok(())
}

pub async fn close_position(
    pool: &SqlitePool,
    position_id: i64,
    exit_date: NaiveDate,
    exit_price: f64,
    exit_reason: ExitReason,
) -> Result<()> {
    sqlx::query(
        r#"update positions
           set status = 'closed', exit_date = ?, exit_price = ?, exit_reason = ?
           where position_id = ?"#,
    )
    .bind(exit_date.to_string())
    .bind(exit_price)
    .bind(exit_reason_to_str(exit_reason))
    .bind(position_id)
    .execute(pool)
    .await
    .context("close_position failed")?;
    Ok(())
}

// ---- orders -------------------------------------------------------------

pub struct NewOrder {
    pub client_order_id: String,
    pub ticker: String,
    pub side: Side,
    pub intent: OrderIntent,
    pub trade_date: NaiveDate,
    pub run_id: Option<String>,
    pub qty: u64,
    pub broker_order_id: Option<String>,
    pub planned_stop_price: Option<f64>,
}

/// Idempotent insert keyed on `client_order_id`. A retry that reuses the same
/// id (the `{trade_date}_{ticker}_{kind}` grammar) returns the row already on
/// disk instead of erroring, so the executor can replay a step after a crash
/// without double-submitting to the brokerage.
pub async fn insert_order_idempotent(pool: &SqlitePool, order: &NewOrder) -> Result<Order> {
    if let Some(existing) = get_order_by_client_id(pool, &order.client_order_id).await? {
        return Ok(existing);
    }
    sqlx::query(
        r#"insert into orders
             (client_order_id, ticker, side, intent, trade_date, run_id, qty,
              status, broker_order_id, planned_stop_price)
           values (?, ?, ?, ?, ?, ?, ?, 'new', ?, ?)
           on conflict (client_order_id) do nothing"#,
    )
    .bind(&order.client_order_id)
    .bind(&order.ticker)
    .bind(side_to_str(order.side))
    .bind(intent_to_str(order.intent))
    .bind(order.trade_date.to_string())
    .bind(&order.run_id)
    .bind(order.qty as i64)
    .bind(&order.broker_order_id)
    .bind(order.planned_stop_price)
    .execute(pool)
    .await
    .context("insert_order_idempotent failed")?;

    get_order_by_client_id(pool, &order.client_order_id)
        .await?
        .context("order missing immediately after insert")
}

const ORDER_COLUMNS: &str = r#"order_id, client_order_id, ticker, side, intent, trade_date, run_id,
           qty, status, broker_order_id, filled_qty, filled_avg_price, reject_reason,
           planned_stop_price"#;

pub async fn get_order_by_client_id(pool: &SqlitePool, client_order_id: &str) -> Result<Option<Order>> {
    let row = sqlx::query(&format!("select {ORDER_COLUMNS} from orders where client_order_id = ?"))
        .bind(client_order_id)
        .fetch_optional(pool)
        .await
        .context("get_order_by_client_id failed")?;
    row.as_ref().map(row_to_order).transpose()
}

/// Count of orders placed for `trade_date` with the given intent, used to
/// enforce `max_daily_trade_orders` / `max_daily_stop_orders`.
pub async fn get_daily_order_count(
    pool: &SqlitePool,
    trade_date: NaiveDate,
    intent: OrderIntent,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("select count(*) from orders where trade_date = ? and intent = ?")
        .bind(trade_date.to_string())
        .bind(intent_to_str(intent))
        .fetch_one(pool)
        .await
        .context("get_daily_order_count failed")?;
    Ok(count)
}

/// Non-terminal orders for `trade_date` matching intent and side, e.g. the
/// OPG poll phase's `entry`/`buy` sweep.
pub async fn get_pending_orders(
    pool: &SqlitePool,
    trade_date: NaiveDate,
    intent: OrderIntent,
    side: Side,
) -> Result<Vec<Order>> {
    let rows = sqlx::query(&format!(
        r#"select {ORDER_COLUMNS} from orders
           where trade_date = ? and intent = ? and side = ?
             and status not in ('filled','canceled','expired','rejected','done_for_day','suspended')
           order by order_id asc"#
    ))
    .bind(trade_date.to_string())
    .bind(intent_to_str(intent))
    .bind(side_to_str(side))
    .fetch_all(pool)
    .await
    .context("get_pending_orders failed")?;
    rows.iter().map(row_to_order).collect()
}

#[allow(clippy::too_many_arguments)]
pub async fn update_order_status(
    pool: &SqlitePool,
    client_order_id: &str,
    status: OrderStatus,
    broker_order_id: Option<&str>,
    filled_qty: u64,
    filled_avg_price: Option<f64>,
    reject_reason: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"update orders
           set status = ?, broker_order_id = coalesce(?, broker_order_id),
               filled_qty = ?, filled_avg_price = ?, reject_reason = ?
           where client_order_id = ?"#,
    )
    .bind(status_to_str(status))
    .bind(broker_order_id)
    .bind(filled_qty as i64)
    .bind(filled_avg_price)
    .bind(reject_reason)
    .bind(client_order_id)
    .execute(pool)
    .await
    .context("update_order_status failed")?;
    Ok(())
}

pub async fn list_open_orders(pool: &SqlitePool) -> Result<Vec<Order>> {
    let rows = sqlx::query(&format!(
        r#"select {ORDER_COLUMNS} from orders
           where status not in ('filled','canceled','expired','rejected','done_for_day','suspended')
           order by order_id asc"#
    ))
    .fetch_all(pool)
    .await
    .context("list_open_orders failed")?;
    rows.iter().map(row_to_order).collect()
}

// ---- run log --------------------------------------------------------------

pub async fn start_run_log(
    pool: &SqlitePool,
    run_id: &str,
    phase: RunPhase,
    trade_date: NaiveDate,
    started_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"insert into run_log (run_id, phase, trade_date, started_at)
           values (?, ?, ?, ?)
           on conflict (run_id, phase) do update set started_at = excluded.started_at"#,
    )
    .bind(run_id)
    .bind(phase_to_str(phase))
    .bind(trade_date.to_string())
    .bind(started_at.to_rfc3339())
    .execute(pool)
    .await
    .context("start_run_log failed")?;
    Ok(())
}

pub async fn complete_run_log(
    pool: &SqlitePool,
    run_id: &str,
    phase: RunPhase,
    completed_at: DateTime<Utc>,
    summary: Option<serde_json::Value>,
) -> Result<()> {
    sqlx::query("update run_log set completed_at = ?, summary = ? where run_id = ? and phase = ?")
        .bind(completed_at.to_rfc3339())
        .bind(summary.map(|v| v.to_string()))
        .bind(run_id)
        .bind(phase_to_str(phase))
        .execute(pool)
        .await
        .context("complete_run_log failed")?;
    Ok(())
}

pub async fn run_log_for_date(pool: &SqlitePool, trade_date: NaiveDate) -> Result<Vec<RunLog>> {
    let rows = sqlx::query(
        r#"select run_id, phase, trade_date, started_at, completed_at, summary
           from run_log where trade_date = ? order by started_at asc"#,
    )
    .bind(trade_date.to_string())
    .fetch_all(pool)
    .await
    .context("run_log_for_date failed")?;
    rows.iter().map(row_to_run_log).collect()
}

// ---- shadow strategy --------------------------------------------------

pub struct NewShadowPosition {
    pub ticker: String,
    pub entry_date: NaiveDate,
    pub entry_price: f64,
    pub score: Option<f64>,
}

pub async fn insert_shadow_position(pool: &SqlitePool, pos: &NewShadowPosition) -> Result<i64> {
    let result = sqlx::query(
        "insert into shadow_positions (ticker, entry_date, entry_price, score) values (?, ?, ?, ?)",
    )
    .bind(&pos.ticker)
    .bind(pos.entry_date.to_string())
    .bind(pos.entry_price)
    .bind(pos.score)
    .execute(pool)
    .await
    .context("insert_shadow_position failed")?;
    Ok(result.last_insert_rowid())
}

pub async fn close_shadow_position(
    pool: &SqlitePool,
    shadow_id: i64,
    exit_date: NaiveDate,
    exit_price: f64,
    exit_reason: ExitReason,
) -> Result<()> {
    sqlx::query(
        "update shadow_positions set exit_date = ?, exit_price = ?, exit_reason = ? where shadow_id = ?",
    )
    .bind(exit_date.to_string())
    .bind(exit_price)
    .bind(exit_reason_to_str(exit_reason))
    .bind(shadow_id)
    .execute(pool)
    .await
    .context("close_shadow_position failed")?;
    Ok(())
}

pub async fn list_open_shadow_positions(pool: &SqlitePool) -> Result<Vec<ShadowPosition>> {
    let rows = sqlx::query(
        r#"select shadow_id, ticker, entry_date, entry_price, score, exit_date, exit_price, exit_reason
           from shadow_positions where exit_date is null order by shadow_id asc"#,
    )
    .fetch_all(pool)
    .await
    .context("list_open_shadow_positions failed")?;
    rows.iter().map(row_to_shadow_position).collect()
}

pub async fn insert_shadow_signal(pool: &SqlitePool, signal: &ShadowSignalRecord) -> Result<()> {
    sqlx::query(
        r#"insert into shadow_signals (ticker, trade_date, score, action)
           values (?, ?, ?, ?)
           on conflict (ticker, trade_date) do update set score = excluded.score, action = excluded.action"#,
    )
    .bind(&signal.ticker)
    .bind(signal.trade_date.to_string())
    .bind(signal.score)
    .bind(&signal.action)
    .execute(pool)
    .await
    .context("insert_shadow_signal failed")?;
    Ok(())
}

pub async fn shadow_signals_for_date(
    pool: &SqlitePool,
    trade_date: NaiveDate,
) -> Result<Vec<ShadowSignalRecord>> {
    let rows = sqlx::query(
        "select ticker, trade_date, score, action from shadow_signals where trade_date = ? order by ticker asc",
    )
    .bind(trade_date.to_string())
    .fetch_all(pool)
    .await
    .context("shadow_signals_for_date failed")?;
    rows.iter().map(row_to_shadow_signal).collect()
}

// ---- row mapping --------------------------------------------------------

fn parse_date(s: String) -> Result<NaiveDate> {
    s.parse().with_context(|| format!("invalid date: {s}"))
}

fn parse_datetime(s: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp: {s}"))
}

fn row_to_position(row: &SqliteRow) -> Result<PersistentPosition> {
    Ok(PersistentPosition {
        position_id: row.try_get("position_id")?,
        ticker: row.try_get("ticker")?,
        entry_date: parse_date(row.try_get("entry_date")?)?,
        entry_price: row.try_get("entry_price")?,
        shares: row.try_get::<i64, _>("shares")? as u64,
        stop_price: row.try_get("stop_price")?,
        stop_order_id: row.try_get("stop_order_id")?,
        exit_date: row
            .try_get::<Option<String>, _>("exit_date")?
            .map(parse_date)
            .transpose()?,
        exit_price: row.try_get("exit_price")?,
        exit_reason: row
            .try_get::<Option<String>, _>("exit_reason")?
            .map(|s| parse_exit_reason(&s))
            .transpose()?,
    })
}

fn row_to_order(row: &SqliteRow) -> Result<Order> {
    Ok(Order {
        order_id: row.try_get("order_id")?,
        client_order_id: row.try_get("client_order_id")?,
        ticker: row.try_get("ticker")?,
        side: parse_side(&row.try_get::<String, _>("side")?)?,
        intent: parse_intent(&row.try_get::<String, _>("intent")?)?,
        trade_date: parse_date(row.try_get("trade_date")?)?,
        run_id: row.try_get("run_id")?,
        qty: row.try_get::<i64, _>("qty")? as u64,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        broker_order_id: row.try_get("broker_order_id")?,
        filled_qty: row.try_get::<i64, _>("filled_qty")? as u64,
        filled_avg_price: row.try_get("filled_avg_price")?,
        reject_reason: row.try_get("reject_reason")?,
        planned_stop_price: row.try_get("planned_stop_price")?,
    })
}

fn row_to_run_log(row: &SqliteRow) -> Result<RunLog> {
    Ok(RunLog {
        run_id: row.try_get("run_id")?,
        phase: parse_phase(&row.try_get::<String, _>("phase")?)?,
        trade_date: parse_date(row.try_get("trade_date")?)?,
        started_at: parse_datetime(row.try_get("started_at")?)?,
        completed_at: row
            .try_get::<Option<String>, _>("completed_at")?
            .map(parse_datetime)
            .transpose()?,
        summary: row
            .try_get::<Option<String>, _>("summary")?
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .context("invalid run_log summary json")?,
    })
}

fn row_to_shadow_position(row: &SqliteRow) -> Result<ShadowPosition> {
    Ok(ShadowPosition {
        shadow_id: row.try_get("shadow_id")?,
        ticker: row.try_get("ticker")?,
        entry_date: parse_date(row.try_get("entry_date")?)?,
        entry_price: row.try_get("entry_price")?,
        score: row.try_get("score")?,
        exit_date: row
            .try_get::<Option<String>, _>("exit_date")?
            .map(parse_date)
            .transpose()?,
        exit_price: row.try_get("exit_price")?,
        exit_reason: row
            .try_get::<Option<String>, _>("exit_reason")?
            .map(|s| parse_exit_reason(&s))
            .transpose()?,
    })
}

fn row_to_shadow_signal(row: &SqliteRow) -> Result<ShadowSignalRecord> {
    Ok(ShadowSignalRecord {
        ticker: row.try_get("ticker")?,
        trade_date: parse_date(row.try_get("trade_date")?)?,
        score: row.try_get("score")?,
        action: row.try_get("action")?,
    })
}

fn exit_reason_to_str(r: ExitReason) -> &'static str {
    match r {
        ExitReason::StopLoss => "stop_loss",
        ExitReason::MaxHolding => "max_holding",
        ExitReason::EndOfData => "end_of_data",
        ExitReason::TrendBreak => "trend_break",
        ExitReason::RotatedOut => "rotated_out",
    }
}

fn parse_exit_reason(s: &str) -> Result<ExitReason> {
    match s {
        "stop_loss" => Ok(ExitReason::StopLoss),
        "max_holding" => Ok(ExitReason::MaxHolding),
        "end_of_data" => Ok(ExitReason::EndOfData),
        "trend_break" => Ok(ExitReason::TrendBreak),
        "rotated_out" => Ok(ExitReason::RotatedOut),
        other => Err(anyhow!("invalid exit_reason: {other}")),
    }
}

fn side_to_str(s: Side) -> &'static str {
    match s {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

fn parse_side(s: &str) -> Result<Side> {
    match s {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(anyhow!("invalid side: {other}")),
    }
}

fn intent_to_str(i: OrderIntent) -> &'static str {
    match i {
        OrderIntent::Entry => "entry",
        OrderIntent::Exit => "exit",
        OrderIntent::Stop => "stop",
    }
}

fn parse_intent(s: &str) -> Result<OrderIntent> {
    match s {
        "entry" => Ok(OrderIntent::Entry),
        "exit" => Ok(OrderIntent::Exit),
        "stop" => Ok(OrderIntent::Stop),
        other => Err(anyhow!("invalid order intent: {other}")),
    }
}

fn status_to_str(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::New => "new",
        OrderStatus::PendingNew => "pending_new",
        OrderStatus::Accepted => "accepted",
        OrderStatus::PartiallyFilled => "partially_filled",
        OrderStatus::Filled => "filled",
        OrderStatus::Canceled => "canceled",
        OrderStatus::Expired => "expired",
        OrderStatus::Rejected => "rejected",
        OrderStatus::DoneForDay => "done_for_day",
        OrderStatus::Suspended => "suspended",
    }
}

fn parse_status(s: &str) -> Result<OrderStatus> {
    match s {
        "new" => Ok(OrderStatus::New),
        "pending_new" => Ok(OrderStatus::PendingNew),
        "accepted" => Ok(OrderStatus::Accepted),
        "partially_filled" => Ok(OrderStatus::PartiallyFilled),
        "filled" => Ok(OrderStatus::Filled),
        "canceled" => Ok(OrderStatus::Canceled),
        "expired" => Ok(OrderStatus::Expired),
        "rejected" => Ok(OrderStatus::Rejected),
        "done_for_day" => Ok(OrderStatus::DoneForDay),
        "suspended" => Ok(OrderStatus::Suspended),
        other => Err(anyhow!("invalid order status: {other}")),
    }
}

fn phase_to_str(p: RunPhase) -> &'static str {
    match p {
        RunPhase::Place => "place",
        RunPhase::Poll => "poll",
        RunPhase::Execute => "execute",
    }
}

fn parse_phase(s: &str) -> Result<RunPhase> {
    match s {
        "place" => Ok(RunPhase::Place),
        "poll" => Ok(RunPhase::Poll),
        "execute" => Ok(RunPhase::Execute),
        other => Err(anyhow!("invalid run phase: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn status_reports_ok_and_positions_table_present() {
        let pool = memory_pool().await;
        let status = status(&pool).await.unwrap();
        assert!(status.ok);
        assert!(status.has_positions_table);
    }

    #[tokio::test]
    async fn kill_switch_defaults_off_and_round_trips() {
        let pool = memory_pool().await;
        assert!(!kill_switch_engaged(&pool).await.unwrap());
        set_kill_switch(&pool, true).await.unwrap();
        assert!(kill_switch_engaged(&pool).await.unwrap());
        set_kill_switch(&pool, false).await.unwrap();
        assert!(!kill_switch_engaged(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn order_insert_is_idempotent_on_client_order_id() {
        let pool = memory_pool().await;
        let new_order = NewOrder {
            client_order_id: "2026-01-05_ACME_entry".to_string(),
            ticker: "ACME".to_string(),
            side: Side::Buy,
            intent: OrderIntent::Entry,
            trade_date: "2026-01-05".parse().unwrap(),
            run_id: Some("exec-2026-01-05-test".to_string()),
            qty: 10,
            broker_order_id: None,
            planned_stop_price: None,
        };
        let first = insert_order_idempotent(&pool, &new_order).await.unwrap();
        let second = insert_order_idempotent(&pool, &new_order).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(list_open_orders(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn position_lifecycle_opens_and_closes() {
        let pool = memory_pool().await;
        let entry_date: NaiveDate = "2026-01-05".parse().unwrap();
        let id = insert_position(
            &pool,
            &NewPosition {
                ticker: "ACME".to_string(),
                entry_date,
                entry_price: 10.0,
                shares: 100,
                stop_price: Some(9.0),
            },
        )
        .await
        .unwrap();

        assert!(get_position_by_ticker(&pool, "ACME").await.unwrap().is_some());
        assert_eq!(get_open_positions(&pool).await.unwrap().len(), 1);

        let exit_date: NaiveDate = "2026-01-10".parse().unwrap();
        close_position(&pool, id, exit_date, 11.0, ExitReason::MaxHolding)
            .await
            .unwrap();

        assert!(get_position_by_ticker(&pool, "ACME").await.unwrap().is_none());
        assert!(get_open_positions(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shadow_signal_upsert_overwrites_same_day() {
        let pool = memory_pool().await;
        let trade_date: NaiveDate = "2026-01-05".parse().unwrap();
        insert_shadow_signal(
            &pool,
            &ShadowSignalRecord {
                ticker: "ACME".to_string(),
                trade_date,
                score: Some(1.0),
                action: "enter".to_string(),
            },
        )
        .await
        .unwrap();
        insert_shadow_signal(
            &pool,
            &ShadowSignalRecord {
                ticker: "ACME".to_string(),
                trade_date,
                score: Some(2.0),
                action: "hold".to_string(),
            },
        )
        .await
        .unwrap();

        let signals = shadow_signals_for_date(&pool, trade_date).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, "hold");
    }

    #[tokio::test]
    async fn daily_order_count_and_pending_orders_filter_by_intent_and_side() {
        let pool = memory_pool().await;
        let trade_date: NaiveDate = "2026-02-02".parse().unwrap();

        insert_order_idempotent(
            &pool,
            &NewOrder {
                client_order_id: "2026-02-02_ACME_entry_buy".to_string(),
                ticker: "ACME".to_string(),
                side: Side::Buy,
                intent: OrderIntent::Entry,
                trade_date,
                run_id: Some("exec-2026-02-02-a".to_string()),
                qty: 10,
                broker_order_id: None,
                planned_stop_price: Some(9.0),
            },
        )
        .await
        .unwrap();
        insert_order_idempotent(
            &pool,
            &NewOrder {
                client_order_id: "2026-02-02_WIDG_exit_sell".to_string(),
                ticker: "WIDG".to_string(),
                side: Side::Sell,
                intent: OrderIntent::Exit,
                trade_date,
                run_id: Some("exec-2026-02-02-a".to_string()),
                qty: 5,
                broker_order_id: None,
                planned_stop_price: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            get_daily_order_count(&pool, trade_date, OrderIntent::Entry).await.unwrap(),
            1
        );
        assert_eq!(
            get_daily_order_count(&pool, trade_date, OrderIntent::Exit).await.unwrap(),
            1
        );
        assert_eq!(
            get_daily_order_count(&pool, trade_date, OrderIntent::Stop).await.unwrap(),
            0
        );

        let pending_buys = get_pending_orders(&pool, trade_date, OrderIntent::Entry, Side::Buy)
            .await
            .unwrap();
        assert_eq!(pending_buys.len(), 1);
        assert_eq!(pending_buys[0].ticker, "ACME");
        assert_eq!(pending_buys[0].planned_stop_price, Some(9.0));

        update_order_status(
            &pool,
            "2026-02-02_ACME_entry_buy",
            OrderStatus::Filled,
            Some("alp-1"),
            10,
            Some(10.5),
            None,
        )
        .await
        .unwrap();
        let pending_after_fill = get_pending_orders(&pool, trade_date, OrderIntent::Entry, Side::Buy)
            .await
            .unwrap();
        assert!(pending_after_fill.is_empty());
    }
}
