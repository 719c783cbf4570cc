//! eg-executor
//!
//! Turns a day's signal file into brokerage orders through a phased
//! pipeline, replaying safely after a crash because every order is keyed by
//! a deterministic `client_order_id` and checked against the DB (then the
//! brokerage) before ever being placed again.
//!
//! Grounded on `live/executor.py`'s `execute_signals` / `execute_poll_phase`,
//! with a single choke-point for broker calls in the style of
//! `mqk-execution::gateway` — here that choke point is `place_order_idempotent`,
//! which every entry/exit/stop path routes through.

use anyhow::Result;
use chrono::{NaiveDate, Timelike, Utc};
use eg_broker::{AlpacaClient, CancelOutcome, Side as BrokerSide};
use eg_config::LiveConfig;
use eg_schemas::{ExitReason, Order, OrderIntent, OrderStatus, RunPhase, Side};
use eg_signals::{SignalEntry, SignalExit, SignalFile};
use sqlx::SqlitePool;
use std::time::Duration;

const POLL_INTERVAL_SECS: u64 = 5;
const POLL_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionSummary {
    pub exits_executed: u32,
    pub entries_executed: u32,
    pub skipped: u32,
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed(ExecutionSummary),
    KillSwitchEngaged,
    WrongStrategy(String),
    /// `entry_tif == "opg"` with `--phase all`; caller must split into
    /// separate `place` and `poll` invocations.
    OpgAllPhaseIncompatible,
    KillSwitchTripped {
        reason: String,
        partial: ExecutionSummary,
    },
}

pub fn generate_run_id(trade_date: NaiveDate) -> String {
    eg_artifacts::deterministic_run_id("exec", trade_date, "executor")
}

fn client_id(trade_date: NaiveDate, ticker: &str, kind: &str) -> String {
    format!("{trade_date}_{ticker}_{kind}")
}

/// Places an order if no record exists for `client_order_id` yet, consulting
/// the DB first and the brokerage second so a crash between the two never
/// results in a duplicate submission.
async fn place_order_idempotent(
    pool: &SqlitePool,
    broker: Option<&AlpacaClient>,
    trade_date: NaiveDate,
    run_id: &str,
    client_order_id: &str,
    ticker: &str,
    side: Side,
    intent: OrderIntent,
    qty: u64,
    time_in_force: &str,
    stop_price: Option<f64>,
    bracket_stop_price: Option<f64>,
    dry_run: bool,
) -> Result<Order> {
    if let Some(existing) = eg_store::get_order_by_client_id(pool, client_order_id).await? {
        return Ok(existing);
    }

    let mut broker_order_id = None;
    if !dry_run {
        if let Some(broker) = broker {
            if let Some(existing) = broker.get_order_by_client_id(client_order_id)? {
                broker_order_id = Some(existing.id);
            } else {
                let broker_side = match side {
                    Side::Buy => BrokerSide::Buy,
                    Side::Sell => BrokerSide::Sell,
                };
                let placed = if let Some(bracket_stop) = bracket_stop_price {
                    broker
                        .place_bracket_order(ticker, qty, broker_side, time_in_force, bracket_stop, Some(client_order_id))
                        .or_else(|err| {
                            tracing::warn!(ticker, %err, "bracket order failed, falling back to plain market order");
                            broker.place_order(eg_broker::PlaceOrderRequest {
                                symbol: ticker.to_string(),
                                qty,
                                side: broker_side,
                                order_type: eg_broker::OrderType::Market,
                                time_in_force: time_in_force.to_string(),
                                client_order_id: Some(client_order_id.to_string()),
                                stop_price: None,
                                order_class: None,
                                stop_loss_price: None,
                            })
                        })?
                } else {
                    broker.place_order(eg_broker::PlaceOrderRequest {
                        symbol: ticker.to_string(),
                        qty,
                        side: broker_side,
                        order_type: eg_broker::OrderType::Market,
                        time_in_force: time_in_force.to_string(),
                        client_order_id: Some(client_order_id.to_string()),
                        stop_price,
                        order_class: None,
                        stop_loss_price: None,
                    })?
                };
                broker_order_id = Some(placed.id);
            }
        }
    }

    eg_store::insert_order_idempotent(
        pool,
        &eg_store::NewOrder {
            client_order_id: client_order_id.to_string(),
            ticker: ticker.to_string(),
            side,
            intent,
            trade_date,
            run_id: Some(run_id.to_string()),
            qty,
            broker_order_id,
            planned_stop_price: bracket_stop_price.or(stop_price),
        },
    )
    .await
}

/// Places a protective GTC stop if none is on record for `client_order_id`,
/// consulting the DB then the brokerage first — the same two-step check
/// `place_order_idempotent` uses for entries and exits, kept as its own
/// function since a stop is its own order rather than a bracket leg and so
/// needs `OrderType::Stop`, which `place_order_idempotent` never places.
async fn place_stop_idempotent(
    pool: &SqlitePool,
    broker: &AlpacaClient,
    trade_date: NaiveDate,
    run_id: &str,
    client_order_id: &str,
    ticker: &str,
    qty: u64,
    stop_price: f64,
) -> Result<Option<String>> {
    if let Some(existing) = eg_store::get_order_by_client_id(pool, client_order_id).await? {
        return Ok(existing.broker_order_id);
    }
    let broker_order_id = if let Some(existing) = broker.get_order_by_client_id(client_order_id)? {
        existing.id
    } else {
        broker
            .place_order(eg_broker::PlaceOrderRequest {
                symbol: ticker.to_string(),
                qty,
                side: eg_broker::Side::Sell,
                order_type: eg_broker::OrderType::Stop,
                time_in_force: "gtc".to_string(),
                client_order_id: Some(client_order_id.to_string()),
                stop_price: Some(stop_price),
                order_class: None,
                stop_loss_price: None,
            })?
            .id
    };

    eg_store::insert_order_idempotent(
        pool,
        &eg_store::NewOrder {
            client_order_id: client_order_id.to_string(),
            ticker: ticker.to_string(),
            side: Side::Sell,
            intent: OrderIntent::Stop,
            trade_date,
            run_id: Some(run_id.to_string()),
            qty,
            broker_order_id: Some(broker_order_id.clone()),
            planned_stop_price: Some(stop_price),
        },
    )
    .await?;
    Ok(Some(broker_order_id))
}

fn is_market_hours_et(clock: Option<&eg_broker::Clock>) -> bool {
    use chrono_tz::America::New_York;
    let et_now = match clock {
        Some(c) => c.timestamp.with_timezone(&New_York),
        None => Utc::now().with_timezone(&New_York),
    };
    let (hour, minute) = (et_now.hour(), et_now.minute());
    let after_928 = hour > 9 || (hour == 9 && minute >= 28);
    let before_1900 = hour < 19;
    after_928 && before_1900
}

/// Phase A-D (or A-E with polling): executes a signal file's exits then
/// entries. `skip_poll` makes this the "place" half of a split OPG run.
#[allow(clippy::too_many_arguments)]
pub async fn execute_signals(
    pool: &SqlitePool,
    config: &LiveConfig,
    broker: Option<&AlpacaClient>,
    signals: &SignalFile,
    trade_date: NaiveDate,
    run_id: &str,
    dry_run: bool,
    skip_time_check: bool,
    skip_poll: bool,
) -> Result<ExecutionOutcome> {
    if eg_store::kill_switch_engaged(pool).await? {
        return Ok(ExecutionOutcome::KillSwitchEngaged);
    }
    if signals.strategy != "ema_p10" {
        return Ok(ExecutionOutcome::WrongStrategy(signals.strategy.clone()));
    }

    let is_opg = config.entry_tif == "opg";
    if is_opg && !skip_poll {
        return Ok(ExecutionOutcome::OpgAllPhaseIncompatible);
    }

    eg_store::start_run_log(
        pool,
        run_id,
        if skip_poll { RunPhase::Place } else { RunPhase::Execute },
        trade_date,
        Utc::now(),
    )
    .await?;

    let mut summary = ExecutionSummary::default();

    // Phase A: cancel existing protective stops and sell exited positions.
    let mut sell_orders = Vec::new();
    let mut sell_exit_reasons = std::collections::HashMap::new();
    for exit in &signals.exits {
        match execute_exit(pool, broker, trade_date, run_id, exit, dry_run).await {
            Ok(ExitOutcome::Placed(order)) => {
                sell_exit_reasons.insert(order.client_order_id.clone(), exit_reason_from_signal(&exit.reason));
                sell_orders.push(order);
            }
            Ok(ExitOutcome::ClosedByStopFill) => summary.exits_executed += 1,
            Err(err) => {
                tracing::error!(ticker = %exit.ticker, %err, "exit order failed");
                summary.skipped += 1;
            }
        }
    }

    // Phase B: poll sells to completion (day mode only — OPG place phase
    // defers fills to the poll phase).
    if !skip_poll && !dry_run {
        if let Some(broker) = broker {
            poll_sell_orders(pool, broker, &sell_orders).await?;
        }
    }
    for order in &sell_orders {
        if let Some(updated) = eg_store::get_order_by_client_id(pool, &order.client_order_id).await? {
            if updated.status == OrderStatus::Filled {
                if let Some(pos) = eg_store::get_position_by_ticker(pool, &updated.ticker).await? {
                    let exit_reason = sell_exit_reasons
                        .get(&updated.client_order_id)
                        .copied()
                        .unwrap_or(ExitReason::TrendBreak);
                    eg_store::close_position(
                        pool,
                        pos.position_id,
                        trade_date,
                        updated.filled_avg_price.unwrap_or(pos.entry_price),
                        exit_reason,
                    )
                    .await?;
                }
                summary.exits_executed += 1;
            }
        }
    }

    // Phase C: recount open slots. Day mode trusts the brokerage; OPG place
    // mode has no fills yet, so it subtracts exits already executed from the
    // DB's own open-position count.
    let db_positions = eg_store::get_open_positions(pool).await?;
    let open_count = if is_opg {
        db_positions.len().saturating_sub(summary.exits_executed as usize)
    } else if let Some(broker) = broker {
        broker.get_positions()?.len()
    } else {
        db_positions.len().saturating_sub(summary.exits_executed as usize)
    };
    let available_slots = (config.max_positions as i64 - open_count as i64).max(0) as usize;

    // Phase D: entries, subject to the time guard and daily limits.
    let time_ok = skip_time_check || time_guard_ok(config, broker, is_opg);
    if !time_ok {
        tracing::warn!("entry time guard blocked this run; skipping all entries");
        summary.skipped += signals.entries.len() as u32;
    } else {
        let daily_count = eg_store::get_daily_order_count(pool, trade_date, OrderIntent::Entry).await?;
        let mut remaining_daily = (config.max_daily_trade_orders as i64 - daily_count).max(0) as usize;
        let buying_power_ok = dry_run
            || broker
                .map(|b| b.get_account().map(|a| a.buying_power >= config.min_buying_power))
                .transpose()?
                .unwrap_or(true);

        if !buying_power_ok {
            tracing::warn!("buying power below minimum; skipping all entries");
            summary.skipped += signals.entries.len() as u32;
        } else {
            let take = available_slots.min(remaining_daily);
            for entry in signals.entries.iter().take(take) {
                match execute_entry(pool, broker, trade_date, run_id, entry, config, dry_run, is_opg).await {
                    Ok(placed) => {
                        if placed {
                            summary.entries_executed += 1;
                            remaining_daily -= 1;
                        }
                    }
                    Err(err) => {
                        tracing::error!(ticker = %entry.ticker, %err, "entry order failed");
                        summary.skipped += 1;
                    }
                }
            }
            summary.skipped += signals.entries.len().saturating_sub(take) as u32;
        }
    }

    // Phase E: poll buys, protect with a GTC stop, engage the kill switch if
    // a stop can't be placed for a filled entry.
    if !skip_poll && !dry_run {
        if let Some(broker) = broker {
            match poll_buys_and_protect(pool, broker, trade_date, run_id, signals, config).await {
                Ok(()) => {}
                Err(kill_reason) => {
                    eg_store::set_kill_switch(pool, true).await?;
                    eg_store::complete_run_log(
                        pool,
                        run_id,
                        if skip_poll { RunPhase::Place } else { RunPhase::Execute },
                        Utc::now(),
                        Some(serde_json::json!({"kill_switch_reason": kill_reason})),
                    )
                    .await?;
                    return Ok(ExecutionOutcome::KillSwitchTripped { reason: kill_reason, partial: summary });
                }
            }
        }
    }

    eg_store::complete_run_log(
        pool,
        run_id,
        if skip_poll { RunPhase::Place } else { RunPhase::Execute },
        Utc::now(),
        Some(serde_json::json!({
            "exits_executed": summary.exits_executed,
            "entries_executed": summary.entries_executed,
            "skipped": summary.skipped,
        })),
    )
    .await?;

    Ok(ExecutionOutcome::Completed(summary))
}

enum ExitOutcome {
    Placed(Order),
    /// The protective stop had already filled by the time we tried to cancel
    /// it; the position is closed here at the stop's price and no market
    /// sell is placed for it.
    ClosedByStopFill,
}

fn exit_reason_from_signal(reason: &str) -> ExitReason {
    match reason {
        "rotated_out" => ExitReason::RotatedOut,
        "trend_break" => ExitReason::TrendBreak,
        other => {
            tracing::warn!(reason = other, "unrecognized signal exit reason; recording as trend_break");
            ExitReason::TrendBreak
        }
    }
}

async fn execute_exit(
    pool: &SqlitePool,
    broker: Option<&AlpacaClient>,
    trade_date: NaiveDate,
    run_id: &str,
    exit: &SignalExit,
    dry_run: bool,
) -> Result<ExitOutcome> {
    if let Some(stop_id) = &exit.stop_order_id {
        if !dry_run {
            if let Some(broker) = broker {
                match broker.cancel_order(stop_id) {
                    Ok(CancelOutcome::Cancelled) => {}
                    Ok(CancelOutcome::AlreadyFilled) => {
                        tracing::info!(ticker = %exit.ticker, %stop_id, "stop already filled, skipping market sell");
                        if let Some(position_id) = exit.position_id {
                            let stop_price = eg_store::get_position_by_ticker(pool, &exit.ticker)
                                .await?
                                .and_then(|pos| pos.stop_price)
                                .unwrap_or(exit.entry_price);
                            eg_store::close_position(pool, position_id, trade_date, stop_price, ExitReason::StopLoss)
                                .await?;
                        }
                        return Ok(ExitOutcome::ClosedByStopFill);
                    }
                    Err(err) => {
                        tracing::error!(ticker = %exit.ticker, %stop_id, %err, "failed to cancel stop order");
                    }
                }
            }
        }
    }
    let cid = client_id(trade_date, &exit.ticker, "exit_sell");
    let order = place_order_idempotent(
        pool,
        broker,
        trade_date,
        run_id,
        &cid,
        &exit.ticker,
        Side::Sell,
        OrderIntent::Exit,
        exit.qty,
        "day",
        None,
        None,
        dry_run,
    )
    .await?;
    Ok(ExitOutcome::Placed(order))
}

#[allow(clippy::too_many_arguments)]
async fn execute_entry(
    pool: &SqlitePool,
    broker: Option<&AlpacaClient>,
    trade_date: NaiveDate,
    run_id: &str,
    entry: &SignalEntry,
    config: &LiveConfig,
    dry_run: bool,
    is_opg: bool,
) -> Result<bool> {
    if entry.qty == 0 {
        return Ok(false);
    }
    let cid = client_id(trade_date, &entry.ticker, "entry_buy");
    let tif = if is_opg { "opg" } else { "day" };
    place_order_idempotent(
        pool,
        broker,
        trade_date,
        run_id,
        &cid,
        &entry.ticker,
        Side::Buy,
        OrderIntent::Entry,
        entry.qty,
        tif,
        None,
        Some(entry.stop_price),
        dry_run,
    )
    .await?;
    let _ = config;
    Ok(true)
}

fn time_guard_ok(config: &LiveConfig, broker: Option<&AlpacaClient>, is_opg: bool) -> bool {
    if is_opg {
        let clock = broker.and_then(|b| b.get_clock().ok());
        !is_market_hours_et(clock.as_ref())
    } else {
        let clock = broker.and_then(|b| b.get_clock().ok());
        let now_et = match &clock {
            Some(c) => c.timestamp.with_timezone(&chrono_tz::America::New_York),
            None => Utc::now().with_timezone(&chrono_tz::America::New_York),
        };
        let open = now_et.date_naive().and_hms_opt(9, 30, 0).unwrap();
        let cutoff = open + chrono::Duration::minutes(config.entry_cutoff_minutes);
        let naive_now = now_et.naive_local();
        naive_now <= cutoff
    }
}

async fn poll_sell_orders(pool: &SqlitePool, broker: &AlpacaClient, orders: &[Order]) -> Result<()> {
    poll_orders(pool, broker, orders).await
}

async fn poll_orders(pool: &SqlitePool, broker: &AlpacaClient, orders: &[Order]) -> Result<()> {
    let mut pending: Vec<&Order> = orders
        .iter()
        .filter(|o| o.broker_order_id.is_some() && !o.status.is_terminal())
        .collect();
    let mut elapsed = 0u64;

    while !pending.is_empty() && elapsed < POLL_TIMEOUT_SECS {
        tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
        elapsed += POLL_INTERVAL_SECS;
        let mut still_pending = Vec::new();
        for order in pending {
            let broker_id = order.broker_order_id.as_deref().unwrap();
            let remote = match broker.get_order(broker_id) {
                Ok(o) => o,
                Err(err) => {
                    tracing::error!(ticker = %order.ticker, %err, "failed to poll order");
                    still_pending.push(order);
                    continue;
                }
            };
            let status = parse_order_status(&remote.status);
            eg_store::update_order_status(
                pool,
                &order.client_order_id,
                status,
                None,
                remote.filled_qty,
                remote.filled_avg_price,
                remote.reject_reason.as_deref(),
            )
            .await?;
            if !status.is_terminal() {
                still_pending.push(order);
            }
        }
        pending = still_pending;
    }
    for order in pending {
        tracing::warn!(ticker = %order.ticker, "order poll timed out");
    }
    Ok(())
}

fn parse_order_status(status: &str) -> OrderStatus {
    match status {
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "canceled" => OrderStatus::Canceled,
        "expired" => OrderStatus::Expired,
        "rejected" => OrderStatus::Rejected,
        "done_for_day" => OrderStatus::DoneForDay,
        "suspended" => OrderStatus::Suspended,
        "pending_new" => OrderStatus::PendingNew,
        "accepted" | "new" => OrderStatus::Accepted,
        _ => OrderStatus::New,
    }
}

/// Phase E for a single run: poll entry buys, place a GTC stop for every
/// fill not already protected by a bracket leg, and record the resulting
/// position. Returns `Err(reason)` (not `anyhow::Error`) when a stop can't
/// be placed for a filled entry — the kill switch must engage on that path.
async fn poll_buys_and_protect(
    pool: &SqlitePool,
    broker: &AlpacaClient,
    trade_date: NaiveDate,
    run_id: &str,
    signals: &SignalFile,
    config: &LiveConfig,
) -> std::result::Result<(), String> {
    for entry in &signals.entries {
        let cid = client_id(trade_date, &entry.ticker, "entry_buy");
        let order = match eg_store::get_order_by_client_id(pool, &cid).await {
            Ok(Some(o)) => o,
            Ok(None) => continue,
            Err(err) => return Err(format!("db lookup failed for {}: {err}", entry.ticker)),
        };
        let Some(broker_id) = &order.broker_order_id else { continue };

        let remote = match poll_single_order(broker, broker_id) {
            Ok(o) => o,
            Err(err) => return Err(format!("poll failed for {}: {err}", entry.ticker)),
        };
        let status = parse_order_status(&remote.status);
        if let Err(err) = eg_store::update_order_status(
            pool,
            &cid,
            status,
            None,
            remote.filled_qty,
            remote.filled_avg_price,
            remote.reject_reason.as_deref(),
        )
        .await
        {
            return Err(format!("order status update failed for {}: {err}", entry.ticker));
        }
        if status != OrderStatus::Filled {
            continue;
        }

        let has_bracket_stop = remote.legs.as_ref().map(|l| !l.is_empty()).unwrap_or(false);
        let mut stop_order_id = None;
        if !has_bracket_stop {
            let stop_cid = client_id(trade_date, &entry.ticker, "stop_sell");
            stop_order_id = match place_stop_idempotent(
                pool,
                broker,
                trade_date,
                run_id,
                &stop_cid,
                &entry.ticker,
                remote.filled_qty,
                entry.stop_price,
            )
            .await
            {
                Ok(id) => id,
                Err(err) => {
                    return Err(format!(
                        "failed to place protective stop for {} after fill: {err}",
                        entry.ticker
                    ))
                }
            };
        }

        let fill_price = remote.filled_avg_price.unwrap_or(entry.stop_price / (1.0 - config.stop_loss_pct / 100.0));
        if let Err(err) = record_position_if_missing(
            pool,
            &entry.ticker,
            trade_date,
            fill_price,
            remote.filled_qty,
            Some(entry.stop_price),
            stop_order_id,
        )
        .await
        {
            return Err(format!("failed to record position for {}: {err}", entry.ticker));
        }
        tracing::info!(run_id, ticker = %entry.ticker, "position recorded");
    }
    Ok(())
}

/// Blocks the calling worker thread for up to `POLL_TIMEOUT_SECS` — wrapped
/// in `block_in_place` so tokio can hand this thread's other work to a
/// standby worker for the duration, same as every other brokerage round
/// trip in this crate.
fn poll_single_order(broker: &AlpacaClient, broker_id: &str) -> Result<eg_broker::AlpacaOrder> {
    tokio::task::block_in_place(|| {
        let deadline = std::time::Instant::now() + Duration::from_secs(POLL_TIMEOUT_SECS);
        loop {
            let order = broker.get_order(broker_id)?;
            if order.is_terminal() || std::time::Instant::now() >= deadline {
                return Ok(order);
            }
            std::thread::sleep(Duration::from_secs(POLL_INTERVAL_SECS));
        }
    })
}

async fn record_position_if_missing(
    pool: &SqlitePool,
    ticker: &str,
    trade_date: NaiveDate,
    fill_price: f64,
    shares: u64,
    stop_price: Option<f64>,
    _stop_order_id: Option<String>,
) -> Result<()> {
    if eg_store::get_position_by_ticker(pool, ticker).await?.is_some() {
        return Ok(());
    }
    eg_store::insert_position(
        pool,
        &eg_store::NewPosition {
            ticker: ticker.to_string(),
            entry_date: trade_date,
            entry_price: fill_price,
            shares,
            stop_price,
        },
    )
    .await?;
    Ok(())
}

/// Phase F: the OPG poll phase. DB-driven sweep of pending entry buys placed
/// during the `place` phase's `opg` submission, re-checking/placing stops
/// idempotently. Unlike `execute_signals`, this has no signal file to read
/// stop prices from, so it relies on `planned_stop_price` captured on the
/// order row at placement time.
pub async fn execute_poll_phase(
    pool: &SqlitePool,
    broker: Option<&AlpacaClient>,
    trade_date: NaiveDate,
    run_id: &str,
    dry_run: bool,
) -> Result<ExecutionOutcome> {
    if eg_store::kill_switch_engaged(pool).await? {
        return Ok(ExecutionOutcome::KillSwitchEngaged);
    }

    eg_store::start_run_log(pool, run_id, RunPhase::Poll, trade_date, Utc::now()).await?;
    let mut summary = ExecutionSummary::default();

    let Some(broker) = broker else {
        if !dry_run {
            anyhow::bail!("poll phase requires a brokerage client outside dry-run mode");
        }
        eg_store::complete_run_log(pool, run_id, RunPhase::Poll, Utc::now(), None).await?;
        return Ok(ExecutionOutcome::Completed(summary));
    };

    let pending_buys = eg_store::get_pending_orders(pool, trade_date, OrderIntent::Entry, Side::Buy).await?;
    for order in &pending_buys {
        let Some(broker_id) = &order.broker_order_id else { continue };
        let remote = match poll_single_order(broker, broker_id) {
            Ok(o) => o,
            Err(err) => {
                tracing::error!(ticker = %order.ticker, %err, "poll failed for pending entry");
                continue;
            }
        };
        let status = parse_order_status(&remote.status);
        eg_store::update_order_status(
            pool,
            &order.client_order_id,
            status,
            None,
            remote.filled_qty,
            remote.filled_avg_price,
            remote.reject_reason.as_deref(),
        )
        .await?;
        if status != OrderStatus::Filled {
            continue;
        }

        let stop_price = order.planned_stop_price.unwrap_or(remote.filled_avg_price.unwrap_or(0.0) * 0.9);
        let has_bracket_stop = remote.legs.as_ref().map(|l| !l.is_empty()).unwrap_or(false);

        // Idempotent re-check: if a stop was already placed for this entry
        // and is in a terminal state (e.g. already filled on a prior crash
        // recovery), retry placement under a distinct client id instead of
        // silently leaving the position unprotected.
        let stop_cid_base = client_id(trade_date, &order.ticker, "stop_sell");
        let mut stop_order_id = None;
        if !has_bracket_stop {
            let existing_stop = eg_store::get_order_by_client_id(pool, &stop_cid_base).await?;
            let needs_retry = existing_stop
                .as_ref()
                .map(|s| s.status.is_terminal() && s.status != OrderStatus::Filled)
                .unwrap_or(false);
            let stop_cid = if needs_retry {
                client_id(trade_date, &order.ticker, "stop_sell_retry")
            } else {
                stop_cid_base.clone()
            };

            if existing_stop.is_none() || needs_retry {
                match place_stop_idempotent(
                    pool,
                    broker,
                    trade_date,
                    run_id,
                    &stop_cid,
                    &order.ticker,
                    remote.filled_qty,
                    stop_price,
                )
                .await
                {
                    Ok(id) => stop_order_id = id,
                    Err(err) => {
                        eg_store::set_kill_switch(pool, true).await?;
                        tracing::error!(ticker = %order.ticker, %err, "stop placement failed in OPG poll phase, kill switch engaged");
                        // Position is recorded unprotected rather than lost entirely.
                        record_position_if_missing(
                            pool,
                            &order.ticker,
                            trade_date,
                            remote.filled_avg_price.unwrap_or(stop_price),
                            remote.filled_qty,
                            None,
                            None,
                        )
                        .await?;
                        eg_store::complete_run_log(
                            pool,
                            run_id,
                            RunPhase::Poll,
                            Utc::now(),
                            Some(serde_json::json!({"kill_switch_reason": err.to_string()})),
                        )
                        .await?;
                        return Ok(ExecutionOutcome::KillSwitchTripped { reason: err.to_string(), partial: summary });
                    }
                }
            } else if let Some(existing) = existing_stop {
                stop_order_id = existing.broker_order_id;
            }
        }

        record_position_if_missing(
            pool,
            &order.ticker,
            trade_date,
            remote.filled_avg_price.unwrap_or(stop_price),
            remote.filled_qty,
            Some(stop_price),
            stop_order_id,
        )
        .await?;
        summary.entries_executed += 1;
    }

    eg_store::complete_run_log(
        pool,
        run_id,
        RunPhase::Poll,
        Utc::now(),
        Some(serde_json::json!({"entries_executed": summary.entries_executed})),
    )
    .await?;

    Ok(ExecutionOutcome::Completed(summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_is_deterministic_and_readable() {
        let date: NaiveDate = "2026-01-05".parse().unwrap();
        assert_eq!(client_id(date, "ACME", "entry_buy"), "2026-01-05_ACME_entry_buy");
        assert_eq!(client_id(date, "ACME", "entry_buy"), client_id(date, "ACME", "entry_buy"));
    }

    #[test]
    fn client_id_kinds_match_the_documented_grammar() {
        let date: NaiveDate = "2026-01-05".parse().unwrap();
        for kind in ["entry_buy", "exit_sell", "stop_sell", "stop_sell_retry"] {
            assert_eq!(client_id(date, "ACME", kind), format!("2026-01-05_ACME_{kind}"));
        }
    }

    #[test]
    fn run_id_is_stable_for_same_trade_date() {
        let date: NaiveDate = "2026-01-05".parse().unwrap();
        assert_eq!(generate_run_id(date), generate_run_id(date));
        assert!(generate_run_id(date).starts_with("exec-2026-01-05-"));
    }

    #[test]
    fn parse_order_status_maps_alpaca_strings() {
        assert_eq!(parse_order_status("filled"), OrderStatus::Filled);
        assert_eq!(parse_order_status("partially_filled"), OrderStatus::PartiallyFilled);
        assert_eq!(parse_order_status("unknown_status"), OrderStatus::New);
    }

    #[test]
    fn exit_reason_from_signal_maps_known_reasons() {
        assert_eq!(exit_reason_from_signal("trend_break"), ExitReason::TrendBreak);
        assert_eq!(exit_reason_from_signal("rotated_out"), ExitReason::RotatedOut);
        assert_eq!(exit_reason_from_signal("something_else"), ExitReason::TrendBreak);
    }

    fn empty_signal_file(trade_date: NaiveDate, strategy: &str) -> SignalFile {
        SignalFile {
            trade_date,
            strategy: strategy.to_string(),
            run_id: "test-run".to_string(),
            generated_at: Utc::now(),
            exits: vec![],
            entries: vec![],
            skipped: vec![],
            summary: eg_signals::SignalSummary { total_exits: 0, total_entries: 0, total_skipped: 0 },
        }
    }

    #[tokio::test]
    async fn execute_signals_rejects_wrong_strategy() {
        let pool = eg_testkit::memory_pool().await;
        let trade_date: NaiveDate = "2026-01-05".parse().unwrap();
        let signals = empty_signal_file(trade_date, "nwl_p4");
        let outcome =
            execute_signals(&pool, &LiveConfig::default(), None, &signals, trade_date, "test-run", true, true, true)
                .await
                .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::WrongStrategy(s) if s == "nwl_p4"));
    }

    #[tokio::test]
    async fn execute_signals_rejects_all_phase_with_opg_entry_tif() {
        let pool = eg_testkit::memory_pool().await;
        let trade_date: NaiveDate = "2026-01-05".parse().unwrap();
        let mut config = LiveConfig::default();
        config.entry_tif = "opg".to_string();
        let signals = empty_signal_file(trade_date, "ema_p10");
        let outcome =
            execute_signals(&pool, &config, None, &signals, trade_date, "test-run", true, true, false)
                .await
                .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::OpgAllPhaseIncompatible));
    }

    #[tokio::test]
    async fn execute_signals_dry_run_places_entries_without_a_broker() {
        let pool = eg_testkit::memory_pool().await;
        let trade_date: NaiveDate = "2026-01-05".parse().unwrap();
        let mut signals = empty_signal_file(trade_date, "ema_p10");
        signals.entries.push(SignalEntry {
            ticker: "ACME".to_string(),
            side: "buy".to_string(),
            qty: 10,
            score: 91.0,
            grade: eg_schemas::Grade::A,
            report_date: trade_date,
            company_name: None,
            stop_price: 9.0,
        });
        signals.summary.total_entries = 1;

        let outcome = execute_signals(
            &pool,
            &LiveConfig::default(),
            None,
            &signals,
            trade_date,
            "test-run",
            true,
            true,
            true,
        )
        .await
        .unwrap();

        let ExecutionOutcome::Completed(summary) = outcome else { panic!("expected Completed, got {outcome:?}") };
        assert_eq!(summary.entries_executed, 1);
        assert_eq!(summary.skipped, 0);

        let order = eg_store::get_order_by_client_id(&pool, &client_id(trade_date, "ACME", "entry_buy"))
            .await
            .unwrap()
            .expect("entry order persisted");
        assert_eq!(order.intent, OrderIntent::Entry);
        assert!(order.broker_order_id.is_none());
    }

    #[tokio::test]
    async fn execute_signals_closes_a_rotated_out_exit_with_the_right_reason() {
        let pool = eg_testkit::memory_pool().await;
        let trade_date: NaiveDate = "2026-01-05".parse().unwrap();

        let position_id = eg_store::insert_position(
            &pool,
            &eg_store::NewPosition {
                ticker: "RUTA".to_string(),
                entry_date: trade_date,
                entry_price: 10.0,
                shares: 10,
                stop_price: Some(9.0),
            },
        )
        .await
        .unwrap();

        let mut signals = empty_signal_file(trade_date, "ema_p10");
        signals.exits.push(SignalExit {
            ticker: "RUTA".to_string(),
            position_id: Some(position_id),
            reason: "rotated_out".to_string(),
            qty: 10,
            entry_price: 10.0,
            stop_order_id: None,
        });
        signals.summary.total_exits = 1;

        // First pass: dry run, no broker, so the sell order is inserted as
        // 'new' and never reaches the fill check below.
        execute_signals(&pool, &LiveConfig::default(), None, &signals, trade_date, "test-run", true, true, true)
            .await
            .unwrap();

        let cid = client_id(trade_date, "RUTA", "exit_sell");
        eg_store::update_order_status(&pool, &cid, OrderStatus::Filled, None, 10, Some(9.5), None)
            .await
            .unwrap();

        // Second pass: the idempotent insert finds the now-filled order and
        // this run's exit reason (re-derived from the signal file, not stored
        // on the order row) must drive the close.
        execute_signals(&pool, &LiveConfig::default(), None, &signals, trade_date, "test-run", true, true, true)
            .await
            .unwrap();

        let position = eg_store::get_position_by_ticker(&pool, "RUTA").await.unwrap();
        assert!(position.is_none(), "position should be closed");

        let exit_reason: String = sqlx::query_scalar("select exit_reason from positions where position_id = ?")
            .bind(position_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(exit_reason, "rotated_out");
    }
}
