//! Strategy engine
//!
//! One task owns the whole trading loop: poll a quote, update the
//! volatility estimate, flag exits, extend the grid, sweep stale orders,
//! report. Orders are confirmed-at-placement: a limit order at the current
//! price is treated as filled once the venue acknowledges it, and any
//! resting remainder is swept by the stale-order cancellation pass.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, StrategyBand};
use crate::events::{EngineSnapshot, EventKind, EventSink, TradeEvent};
use crate::exchange::{Balance, ErrorKind, ExchangeAdapter, ExchangeError, Quote, Side};

use super::backoff::{FailureBackoff, OpCategory};
use super::book::{ExitCandidate, PositionBook};
use super::rate::RateGovernor;
use super::volatility::VolatilityEstimator;

/// Pause after a failed poll before the next cycle
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Retry interval while waiting for the first usable quote
const STARTUP_RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Throttle for the periodic status line and snapshot
const STATUS_EVERY: Duration = Duration::from_secs(30);

/// How often the open-order sweep runs
const SWEEP_EVERY: Duration = Duration::from_secs(15);

/// Upper bound on the random addition to each cycle pause
const SLEEP_JITTER_MAX: f64 = 0.3;

/// Lifecycle phase, reported in the status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Starting,
    Polling,
    Evaluating,
    Submitting,
    Paused,
    Stopped,
}

/// An order we placed (or adopted) that may still be resting on the venue
#[derive(Debug, Clone)]
struct PendingOrder {
    placed_at: Instant,
    side: Side,
}

/// Per-day realized PnL accumulator, reset when the local calendar date
/// changes
#[derive(Debug, Clone)]
struct DailyStats {
    date: NaiveDate,
    realized_pnl: f64,
    buys: u32,
    sells: u32,
    wins: u32,
    losses: u32,
}

impl DailyStats {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            realized_pnl: 0.0,
            buys: 0,
            sells: 0,
            wins: 0,
            losses: 0,
        }
    }

    /// Log yesterday's summary and start a fresh day when the date moved
    fn roll_over(&mut self, today: NaiveDate) {
        if today == self.date {
            return;
        }
        info!(
            date = %self.date,
            realized_pnl = self.realized_pnl,
            buys = self.buys,
            sells = self.sells,
            wins = self.wins,
            losses = self.losses,
            "daily summary"
        );
        *self = Self::new(today);
    }

    fn record_buy(&mut self) {
        self.buys += 1;
    }

    fn record_sell(&mut self, pnl: f64) {
        self.sells += 1;
        self.realized_pnl += pnl;
        if pnl >= 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
    }
}

/// The trading loop
pub struct StrategyEngine {
    band: StrategyBand,
    adapter: Box<dyn ExchangeAdapter>,
    sink: Box<dyn EventSink>,
    state: EngineState,
    book: Option<PositionBook>,
    vol: VolatilityEstimator,
    rate: RateGovernor,
    buy_backoff: FailureBackoff,
    sell_backoff: FailureBackoff,
    post_fill_until: Option<Instant>,
    extra_cooldown_until: Option<Instant>,
    pending: HashMap<String, PendingOrder>,
    daily: DailyStats,
    last_error: Option<String>,
    /// Set on an authentication failure; trading stays parked until the
    /// operator restarts with fixed credentials, polling continues
    auth_parked: bool,
    last_status_at: Option<Instant>,
    last_sweep_at: Option<Instant>,
    price: f64,
    volume_24h: f64,
}

impl StrategyEngine {
    pub fn new(config: &Config, adapter: Box<dyn ExchangeAdapter>, sink: Box<dyn EventSink>) -> Self {
        let band = config.active_band().clone();
        Self {
            vol: VolatilityEstimator::new(band.vol_halflife, band.vol_min, band.vol_max),
            rate: RateGovernor::new(&band),
            buy_backoff: FailureBackoff::from_band(&band),
            sell_backoff: FailureBackoff::from_band(&band),
            band,
            adapter,
            sink,
            state: EngineState::Starting,
            book: None,
            post_fill_until: None,
            extra_cooldown_until: None,
            pending: HashMap::new(),
            daily: DailyStats::new(Local::now().date_naive()),
            last_error: None,
            auth_parked: false,
            last_status_at: None,
            last_sweep_at: None,
            price: 0.0,
            volume_24h: 0.0,
        }
    }

    /// Run until the token is cancelled
    pub async fn run(&mut self, shutdown: CancellationToken) -> crate::Result<()> {
        self.state = EngineState::Starting;
        info!(
            venue = self.adapter.venue(),
            buy_step = self.band.buy_step,
            max_steps = self.band.max_steps,
            "engine starting"
        );

        let Some(first) = self.first_quote(&shutdown).await else {
            self.state = EngineState::Stopped;
            return Ok(());
        };
        self.price = first.price;
        self.volume_24h = first.volume_24h;
        self.book = Some(PositionBook::new(first.price, &self.band, Utc::now()));
        info!(base = first.price, "grid anchored");
        self.reconcile().await;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let extra_pause = self.run_cycle(Instant::now()).await;

            let jitter = rand::thread_rng().gen_range(0.0..SLEEP_JITTER_MAX);
            let pause = Duration::from_secs_f64(self.band.sleep_seconds + jitter) + extra_pause;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.state = EngineState::Stopped;
        info!(
            today_pnl = self.daily.realized_pnl,
            positions = self.book.as_ref().map_or(0, |b| b.len()),
            "engine stopped"
        );
        Ok(())
    }

    /// Block until a usable price exists; None when shut down first
    async fn first_quote(&mut self, shutdown: &CancellationToken) -> Option<Quote> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            match self.adapter.get_quote().await {
                Ok(quote) if quote.price > 0.0 => return Some(quote),
                Ok(quote) => warn!(price = quote.price, "startup quote unusable"),
                Err(err) => warn!(error = %err, "startup quote failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(STARTUP_RETRY_PAUSE) => {}
            }
        }
    }

    /// Log what the account looks like before the first cycle. Resting
    /// orders from a previous run are left alone; the stale sweep adopts
    /// and cancels them once they age out.
    async fn reconcile(&mut self) {
        match self.adapter.get_balance().await {
            Ok(balance) => info!(cash = balance.cash, asset = balance.asset, "account balance"),
            Err(err) => warn!(error = %err, "balance check failed at startup"),
        }
        match self.adapter.get_open_orders().await {
            Ok(orders) if orders.is_empty() => {}
            Ok(orders) => warn!(
                count = orders.len(),
                "resting orders found from a previous run"
            ),
            Err(err) => warn!(error = %err, "open-order check failed at startup"),
        }
    }

    /// One poll/evaluate/submit cycle. Returns an extra pause to add on
    /// top of the regular sleep.
    async fn run_cycle(&mut self, now: Instant) -> Duration {
        self.state = EngineState::Polling;
        let quote = match self.adapter.get_quote().await {
            Ok(quote) if quote.price > 0.0 => quote,
            Ok(quote) => {
                self.note_cycle_error(format!("non-positive quote price {}", quote.price));
                return POLL_ERROR_PAUSE;
            }
            Err(err) => {
                self.note_cycle_error(err.to_string());
                return POLL_ERROR_PAUSE;
            }
        };
        self.price = quote.price;
        self.volume_24h = quote.volume_24h;

        let balance = match self.adapter.get_balance().await {
            Ok(balance) => Some(balance),
            Err(err) => {
                warn!(error = %err, "balance fetch failed; buys proceed unchecked");
                None
            }
        };

        self.state = EngineState::Evaluating;
        self.daily.roll_over(Local::now().date_naive());
        let vol = self.vol.consume(self.price, now);
        let tp = self.band.tp_floor.max(vol * self.band.tp_multiplier);
        let sl = self.band.sl_floor.max(vol * self.band.sl_multiplier);

        let exits = {
            let Some(book) = self.book.as_mut() else {
                return Duration::ZERO;
            };
            if book.reset_if_stale(self.price, Utc::now(), self.band.base_reset_minutes) {
                info!(base = book.base_price(), "grid base re-anchored after idle window");
            }
            book.evaluate_exits(self.price, tp, sl)
        };

        if self.auth_parked {
            self.state = EngineState::Paused;
        } else {
            self.state = EngineState::Submitting;
            self.submit_sells(&exits, now).await;
            if !self.auth_parked {
                self.submit_buys(balance.as_ref(), now).await;
            }
            self.sweep_stale_orders(now).await;
        }

        self.maybe_report(now, vol, tp, sl);
        Duration::ZERO
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        let post_fill = self.post_fill_until.is_some_and(|until| now < until);
        let extra = self.extra_cooldown_until.is_some_and(|until| now < until);
        post_fill || extra
    }

    /// Close flagged positions, lowest entry first
    async fn submit_sells(&mut self, exits: &[ExitCandidate], now: Instant) {
        for exit in exits {
            if self.sell_backoff.is_blocked(now) || self.in_cooldown(now) {
                break;
            }
            if !self.rate.may_submit(now) {
                debug!("order-rate window full, deferring sells");
                break;
            }
            let qty = self.adapter.round_quantity(exit.quantity);
            if qty <= 0.0 {
                continue;
            }
            let px = self.adapter.round_price(self.price);

            // an attempt counts against the rate window whether or not the
            // venue accepts it
            self.rate.record(now);
            match self.adapter.place_order(Side::Sell, qty, px).await {
                Ok(result) => {
                    let pnl = self
                        .book
                        .as_mut()
                        .and_then(|book| book.remove(exit.id, px, Utc::now()))
                        .unwrap_or(0.0);
                    self.daily.record_sell(pnl);
                    self.sell_backoff.on_success();
                    self.post_fill_until =
                        Some(now + Duration::from_secs_f64(self.band.post_fill_pause_seconds));
                    self.pending.insert(
                        result.order_id,
                        PendingOrder {
                            placed_at: now,
                            side: Side::Sell,
                        },
                    );

                    let positions = self.book.as_ref().map_or(0, |b| b.len());
                    info!(
                        price = px,
                        qty,
                        pnl,
                        reason = exit.reason.as_str(),
                        positions,
                        "position closed"
                    );
                    let event = TradeEvent::new(EventKind::Sell, px, qty, positions)
                        .with_pnl(pnl)
                        .with_note(exit.reason.as_str());
                    self.sink.trade(&event);
                }
                Err(err) => {
                    self.note_order_failure(OpCategory::Sell, &err, now, px, qty);
                    if self.auth_parked {
                        break;
                    }
                }
            }
        }
    }

    /// Extend the grid by one step when the price reaches the next trigger
    async fn submit_buys(&mut self, balance: Option<&Balance>, now: Instant) {
        let (step, trigger, order_value) = {
            let Some(book) = self.book.as_ref() else {
                return;
            };
            if book.is_full() {
                return;
            }
            let step = book.next_step();
            (step, book.next_buy_trigger(step), book.next_order_value(step))
        };
        if self.price > trigger {
            return;
        }
        if self.buy_backoff.is_blocked(now) || self.in_cooldown(now) {
            return;
        }
        if !self.rate.may_submit(now) {
            debug!("order-rate window full, deferring buy");
            return;
        }

        let qty = self
            .adapter
            .round_quantity(self.adapter.value_to_quantity(order_value, self.price));
        let px = self.adapter.round_price(self.price);
        let notional = qty * px;
        if !self.adapter.is_notional_sufficient(notional, qty) {
            debug!(step, qty, notional, "rounded order below venue minimum, skipped");
            return;
        }
        if let Some(balance) = balance {
            if balance.cash < notional {
                warn!(
                    cash = balance.cash,
                    notional, step, "insufficient funds for next grid step"
                );
                return;
            }
        }

        self.rate.record(now);
        match self.adapter.place_order(Side::Buy, qty, px).await {
            Ok(result) => {
                let positions = {
                    let Some(book) = self.book.as_mut() else {
                        return;
                    };
                    book.register_fill(px, qty, Utc::now());
                    book.len()
                };
                self.daily.record_buy();
                self.buy_backoff.on_success();
                self.post_fill_until =
                    Some(now + Duration::from_secs_f64(self.band.post_fill_pause_seconds));
                self.pending.insert(
                    result.order_id,
                    PendingOrder {
                        placed_at: now,
                        side: Side::Buy,
                    },
                );

                info!(price = px, qty, step = step + 1, positions, "grid step bought");
                let event = TradeEvent::new(EventKind::Buy, px, qty, positions)
                    .with_note(format!("step={}", step + 1));
                self.sink.trade(&event);
            }
            Err(err) => self.note_order_failure(OpCategory::Buy, &err, now, px, qty),
        }
    }

    /// Cancel resting orders that outlived the liquidity-scaled wait.
    /// Orders the venue reports but we did not place are adopted first and
    /// aged from the moment they were seen.
    async fn sweep_stale_orders(&mut self, now: Instant) {
        let due = match self.last_sweep_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= SWEEP_EVERY,
        };
        if !due {
            return;
        }
        self.last_sweep_at = Some(now);

        let open = match self.adapter.get_open_orders().await {
            Ok(orders) => orders,
            Err(err) => {
                warn!(error = %err, "open-order poll failed, sweep skipped");
                return;
            }
        };

        // anything no longer resting has filled or been cancelled
        // elsewhere; freshly placed orders get one sweep interval of grace
        // before the venue is expected to list them
        self.pending.retain(|id, p| {
            open.iter().any(|o| o.order_id == *id)
                || now.saturating_duration_since(p.placed_at) < SWEEP_EVERY
        });
        for order in &open {
            self.pending
                .entry(order.order_id.clone())
                .or_insert(PendingOrder {
                    placed_at: now,
                    side: order.side,
                });
        }

        let wait = self.rate.stale_wait(self.volume_24h);
        let stale: Vec<(String, Side)> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.placed_at) >= wait)
            .map(|(id, p)| (id.clone(), p.side))
            .collect();

        for (order_id, side) in stale {
            match self.adapter.cancel_order(&order_id, side).await {
                Ok(()) => {
                    self.pending.remove(&order_id);
                    info!(order_id = %order_id, wait_secs = wait.as_secs_f64(), "stale order cancelled");
                }
                Err(err) => {
                    warn!(order_id = %order_id, error = %err, "stale-order cancel failed");
                    if err.kind() == ErrorKind::Auth {
                        self.park(&err);
                    }
                    break;
                }
            }
        }
    }

    /// A failed poll keeps the loop alive but leaves a trace everywhere
    fn note_cycle_error(&mut self, message: String) {
        error!(error = %message, "quote poll failed");
        self.last_error = Some(message.clone());
        let positions = self.book.as_ref().map_or(0, |b| b.len());
        let event =
            TradeEvent::new(EventKind::Error, self.price, 0.0, positions).with_note(message);
        self.sink.trade(&event);
        self.sink.snapshot(&self.snapshot());
    }

    fn backoff_mut(&mut self, category: OpCategory) -> &mut FailureBackoff {
        match category {
            OpCategory::Buy => &mut self.buy_backoff,
            OpCategory::Sell => &mut self.sell_backoff,
        }
    }

    fn park(&mut self, err: &ExchangeError) {
        error!(error = %err, "authentication failed, trading parked until restart");
        self.auth_parked = true;
        self.state = EngineState::Paused;
    }

    /// Classify an order failure into its operational response
    fn note_order_failure(
        &mut self,
        category: OpCategory,
        err: &ExchangeError,
        now: Instant,
        price: f64,
        qty: f64,
    ) {
        self.last_error = Some(err.to_string());
        let positions = self.book.as_ref().map_or(0, |b| b.len());
        let event = TradeEvent::new(EventKind::Error, price, qty, positions)
            .with_note(format!("{} failed: {err}", category.as_str()));
        self.sink.trade(&event);

        match err.kind() {
            // semantic decline: the order was wrong, the category is fine
            ErrorKind::Rejected => {
                warn!(category = category.as_str(), error = %err, "order rejected");
            }
            ErrorKind::Auth => self.park(err),
            ErrorKind::RateLimited => {
                let pause = self.backoff_mut(category).on_failure(now);
                self.extra_cooldown_until =
                    Some(now + Duration::from_secs_f64(self.band.order_cooldown));
                warn!(
                    category = category.as_str(),
                    pause_secs = pause.as_secs_f64(),
                    error = %err,
                    "rate limited by venue"
                );
            }
            ErrorKind::Network | ErrorKind::Unknown => {
                let pause = self.backoff_mut(category).on_failure(now);
                let failures = self.backoff_mut(category).consecutive_failures();
                warn!(
                    category = category.as_str(),
                    failures,
                    pause_secs = pause.as_secs_f64(),
                    error = %err,
                    "order failed"
                );
            }
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        let (positions, avg_price) = match &self.book {
            Some(book) => (book.len(), book.avg_entry_price()),
            None => (0, 0.0),
        };
        EngineSnapshot {
            price: self.price,
            positions,
            avg_price,
            today_realized_pnl: self.daily.realized_pnl,
            volatility: self.vol.volatility(),
            last_error: self.last_error.clone(),
        }
    }

    /// Throttled status line plus snapshot emission
    fn maybe_report(&mut self, now: Instant, vol: f64, tp: f64, sl: f64) {
        let due = match self.last_status_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= STATUS_EVERY,
        };
        if !due {
            return;
        }
        self.last_status_at = Some(now);

        let (positions, base, avg) = match &self.book {
            Some(book) => (book.len(), book.base_price(), book.avg_entry_price()),
            None => (0, 0.0, 0.0),
        };
        info!(
            state = ?self.state,
            price = self.price,
            positions,
            base,
            avg,
            vol,
            tp,
            sl,
            today_pnl = self.daily.realized_pnl,
            pending = self.pending.len(),
            "status"
        );
        self.sink.snapshot(&self.snapshot());
    }
}
