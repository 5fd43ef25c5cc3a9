//! Per-principal privacy budget ledger.
//!
//! Budgets compose sequentially: every committed release adds its epsilon
//! and delta to the principal's spent total. Amounts are held as integer
//! units (10^-15 per unit) so composition and rollback are exact. Spending is
//! two-phase: [`PrivacyLedger::authorize`] reserves against the ceiling under
//! the principal's lock and returns a [`Reservation`]; the reservation is
//! either committed or rolled back, and dropping it unsettled rolls it back.

use std::{
    collections::HashMap,
    fmt,
    ops::{Add, Sub},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{config::BudgetConfig, types::Principal};

pub const UNITS_PER_EPSILON: f64 = 1e15;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error(
        "privacy budget exceeded for {principal}: requested epsilon {requested_epsilon}, \
         {remaining_epsilon} remaining"
    )]
    BudgetExceeded {
        principal: Principal,
        requested_epsilon: f64,
        remaining_epsilon: f64,
        requested_delta: f64,
        remaining_delta: f64,
    },
    #[error("invalid budget request: {0}")]
    InvalidRequest(String),
    #[error("principal {0} is already registered")]
    AlreadyRegistered(Principal),
}

impl LedgerError {
    /// Stable rejection code.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            LedgerError::InvalidRequest(_) | LedgerError::AlreadyRegistered(_) => {
                "INVALID_REQUEST"
            }
        }
    }
}

/// Fixed-point privacy amount.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PrivacyUnits(pub u64);

impl PrivacyUnits {
    pub const ZERO: Self = Self(0);

    pub fn from_f64(value: f64) -> Result<Self, LedgerError> {
        if !value.is_finite() || value < 0.0 {
            return Err(LedgerError::InvalidRequest(format!(
                "privacy amount must be finite and non-negative (got {value})"
            )));
        }
        let scaled = (value * UNITS_PER_EPSILON).round();
        if scaled >= u64::MAX as f64 {
            return Err(LedgerError::InvalidRequest(format!(
                "privacy amount {value} is too large"
            )));
        }
        Ok(Self(scaled as u64))
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / UNITS_PER_EPSILON
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PrivacyUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_f64())
    }
}

/// An (epsilon, delta) pair in ledger units.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PrivacyCost {
    pub epsilon: PrivacyUnits,
    pub delta: PrivacyUnits,
}

impl PrivacyCost {
    pub const ZERO: Self = Self {
        epsilon: PrivacyUnits::ZERO,
        delta: PrivacyUnits::ZERO,
    };

    pub fn new(epsilon: f64, delta: f64) -> Result<Self, LedgerError> {
        Ok(Self {
            epsilon: PrivacyUnits::from_f64(epsilon)?,
            delta: PrivacyUnits::from_f64(delta)?,
        })
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon.as_f64()
    }

    pub fn delta(&self) -> f64 {
        self.delta.as_f64()
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        Some(Self {
            epsilon: PrivacyUnits(self.epsilon.0.checked_add(other.epsilon.0)?),
            delta: PrivacyUnits(self.delta.0.checked_add(other.delta.0)?),
        })
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self {
            epsilon: PrivacyUnits(self.epsilon.0.saturating_sub(other.epsilon.0)),
            delta: PrivacyUnits(self.delta.0.saturating_sub(other.delta.0)),
        }
    }

    /// Even share for each of `parts` sub-releases, rounded down so the
    /// parts never sum to more than `self`.
    pub fn split(self, parts: usize) -> Self {
        let parts = parts.max(1) as u64;
        Self {
            epsilon: PrivacyUnits(self.epsilon.0 / parts),
            delta: PrivacyUnits(self.delta.0 / parts),
        }
    }

    pub fn checked_mul(self, times: usize) -> Option<Self> {
        let times = u64::try_from(times).ok()?;
        Some(Self {
            epsilon: PrivacyUnits(self.epsilon.0.checked_mul(times)?),
            delta: PrivacyUnits(self.delta.0.checked_mul(times)?),
        })
    }

    /// Component-wise `self <= other`.
    pub fn fits_within(&self, other: &Self) -> bool {
        self.epsilon <= other.epsilon && self.delta <= other.delta
    }
}

impl Add for PrivacyCost {
    type Output = PrivacyCost;

    fn add(self, other: Self) -> Self {
        Self {
            epsilon: PrivacyUnits(self.epsilon.0.saturating_add(other.epsilon.0)),
            delta: PrivacyUnits(self.delta.0.saturating_add(other.delta.0)),
        }
    }
}

impl Sub for PrivacyCost {
    type Output = PrivacyCost;

    fn sub(self, other: Self) -> Self {
        self.saturating_sub(other)
    }
}

/// Ceiling for a principal, fixed when it is registered.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrincipalLimits {
    pub total_epsilon: f64,
    pub total_delta: f64,
}

impl PrincipalLimits {
    fn to_cost(self) -> Result<PrivacyCost, LedgerError> {
        if self.total_epsilon <= 0.0 {
            return Err(LedgerError::InvalidRequest(format!(
                "total epsilon must be > 0 (got {})",
                self.total_epsilon
            )));
        }
        PrivacyCost::new(self.total_epsilon, self.total_delta)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub principal: Principal,
    pub total_epsilon: f64,
    pub total_delta: f64,
    pub spent_epsilon: f64,
    pub spent_delta: f64,
    pub reserved_epsilon: f64,
    pub reserved_delta: f64,
    pub remaining_epsilon: f64,
    pub remaining_delta: f64,
    pub releases: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: Option<DateTime<Utc>>,
}

impl BudgetSnapshot {
    /// Fraction of the epsilon ceiling committed so far, in `[0, 1]`.
    pub fn used_fraction(&self) -> f64 {
        if self.total_epsilon <= 0.0 {
            return 1.0;
        }
        (self.spent_epsilon / self.total_epsilon).clamp(0.0, 1.0)
    }

    /// Fraction of the epsilon ceiling neither spent nor reserved.
    pub fn remaining_fraction(&self) -> f64 {
        if self.total_epsilon <= 0.0 {
            return 0.0;
        }
        (self.remaining_epsilon / self.total_epsilon).clamp(0.0, 1.0)
    }
}

/// Persistable view of one principal, used by export/restore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrincipalState {
    pub principal: Principal,
    pub total: PrivacyCost,
    pub spent: PrivacyCost,
    pub releases: u64,
    pub window_start: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub principals: Vec<PrincipalState>,
}

#[derive(Debug)]
struct PrincipalBudget {
    total: PrivacyCost,
    spent: PrivacyCost,
    reserved: PrivacyCost,
    outstanding: HashMap<u64, PrivacyCost>,
    releases: u64,
    window_start: DateTime<Utc>,
}

impl PrincipalBudget {
    fn new(total: PrivacyCost, now: DateTime<Utc>) -> Self {
        Self {
            total,
            spent: PrivacyCost::ZERO,
            reserved: PrivacyCost::ZERO,
            outstanding: HashMap::new(),
            releases: 0,
            window_start: now,
        }
    }

    fn remaining(&self) -> PrivacyCost {
        self.total - self.spent - self.reserved
    }

    // Reservations in flight carry over into the new window.
    fn roll_window(&mut self, now: DateTime<Utc>, window: Option<Duration>) -> bool {
        let Some(window) = window else {
            return false;
        };
        let elapsed = (now - self.window_start).to_std().unwrap_or_default();
        if elapsed < window {
            return false;
        }
        self.spent = PrivacyCost::ZERO;
        self.window_start = now;
        true
    }

    fn snapshot(&self, principal: &Principal, window: Option<Duration>) -> BudgetSnapshot {
        let remaining = self.remaining();
        let window_end = window
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .and_then(|window| self.window_start.checked_add_signed(window));
        BudgetSnapshot {
            principal: principal.clone(),
            total_epsilon: self.total.epsilon(),
            total_delta: self.total.delta(),
            spent_epsilon: self.spent.epsilon(),
            spent_delta: self.spent.delta(),
            reserved_epsilon: self.reserved.epsilon(),
            reserved_delta: self.reserved.delta(),
            remaining_epsilon: remaining.epsilon(),
            remaining_delta: remaining.delta(),
            releases: self.releases,
            window_start: self.window_start,
            window_end,
        }
    }
}

struct LedgerInner {
    defaults: BudgetConfig,
    default_total: PrivacyCost,
    principals: DashMap<Principal, Arc<Mutex<PrincipalBudget>>>,
    next_reservation: AtomicU64,
}

/// Single writer of budget state. Cloning shares the same ledger.
#[derive(Clone)]
pub struct PrivacyLedger {
    inner: Arc<LedgerInner>,
}

impl PrivacyLedger {
    /// Fails when the default ceiling is not representable in ledger units.
    pub fn new(defaults: BudgetConfig) -> Result<Self, LedgerError> {
        let default_total = PrincipalLimits {
            total_epsilon: defaults.total_epsilon,
            total_delta: defaults.total_delta,
        }
        .to_cost()?;
        Ok(Self {
            inner: Arc::new(LedgerInner {
                defaults,
                default_total,
                principals: DashMap::new(),
                next_reservation: AtomicU64::new(1),
            }),
        })
    }

    /// Rebuilds a ledger from an exported state.
    pub fn restore(defaults: BudgetConfig, state: LedgerState) -> Result<Self, LedgerError> {
        let ledger = Self::new(defaults)?;
        for entry in state.principals {
            let mut budget = PrincipalBudget::new(entry.total, entry.window_start);
            budget.spent = entry.spent;
            budget.releases = entry.releases;
            ledger
                .inner
                .principals
                .insert(entry.principal, Arc::new(Mutex::new(budget)));
        }
        Ok(ledger)
    }

    pub fn export_state(&self) -> LedgerState {
        let mut principals: Vec<PrincipalState> = self
            .inner
            .principals
            .iter()
            .map(|entry| {
                let budget = entry.value().lock();
                PrincipalState {
                    principal: entry.key().clone(),
                    total: budget.total,
                    spent: budget.spent,
                    releases: budget.releases,
                    window_start: budget.window_start,
                }
            })
            .collect();
        principals.sort_by(|a, b| a.principal.cmp(&b.principal));
        LedgerState { principals }
    }

    pub fn defaults(&self) -> &BudgetConfig {
        &self.inner.defaults
    }

    fn window(&self) -> Option<Duration> {
        self.inner.defaults.window_secs.map(Duration::from_secs)
    }

    /// Creates a principal with an explicit ceiling. Ceilings never change
    /// afterwards.
    pub fn register(
        &self,
        principal: &Principal,
        limits: PrincipalLimits,
    ) -> Result<BudgetSnapshot, LedgerError> {
        let total = limits.to_cost()?;
        match self.inner.principals.entry(principal.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(LedgerError::AlreadyRegistered(principal.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let budget = PrincipalBudget::new(total, Utc::now());
                let snapshot = budget.snapshot(principal, self.window());
                vacant.insert(Arc::new(Mutex::new(budget)));
                info!(%principal, total_epsilon = limits.total_epsilon, "registered principal budget");
                Ok(snapshot)
            }
        }
    }

    fn budget(&self, principal: &Principal) -> Arc<Mutex<PrincipalBudget>> {
        self.inner
            .principals
            .entry(principal.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(PrincipalBudget::new(
                    self.inner.default_total,
                    Utc::now(),
                )))
            })
            .clone()
    }

    /// Reserves `epsilon`/`delta` for `principal`.
    pub fn authorize(
        &self,
        principal: &Principal,
        epsilon: f64,
        delta: f64,
    ) -> Result<Reservation, LedgerError> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(LedgerError::InvalidRequest(format!(
                "epsilon must be > 0 (got {epsilon})"
            )));
        }
        self.authorize_cost(principal, PrivacyCost::new(epsilon, delta)?)
    }

    pub fn authorize_cost(
        &self,
        principal: &Principal,
        cost: PrivacyCost,
    ) -> Result<Reservation, LedgerError> {
        self.authorize_cost_at(principal, cost, Utc::now())
    }

    pub(crate) fn authorize_cost_at(
        &self,
        principal: &Principal,
        cost: PrivacyCost,
        now: DateTime<Utc>,
    ) -> Result<Reservation, LedgerError> {
        if cost.epsilon.is_zero() {
            return Err(LedgerError::InvalidRequest("epsilon must be > 0".into()));
        }
        let window = self.window();
        let budget = self.budget(principal);
        let mut state = budget.lock();
        if !cost.delta.is_zero() && state.total.delta.is_zero() {
            return Err(LedgerError::InvalidRequest(format!(
                "principal {principal} is limited to pure epsilon-DP (delta cap is 0)"
            )));
        }
        if state.roll_window(now, window) {
            info!(%principal, "privacy budget window rolled over");
        }
        let remaining = state.remaining();
        if !cost.fits_within(&remaining) {
            warn!(
                %principal,
                requested_epsilon = cost.epsilon(),
                remaining_epsilon = remaining.epsilon(),
                "privacy budget exceeded"
            );
            return Err(LedgerError::BudgetExceeded {
                principal: principal.clone(),
                requested_epsilon: cost.epsilon(),
                remaining_epsilon: remaining.epsilon(),
                requested_delta: cost.delta(),
                remaining_delta: remaining.delta(),
            });
        }
        let id = self.inner.next_reservation.fetch_add(1, Ordering::Relaxed);
        state.reserved = state.reserved + cost;
        state.outstanding.insert(id, cost);
        debug!(%principal, reservation = id, epsilon = cost.epsilon(), "reserved privacy budget");
        Ok(Reservation {
            ledger: self.clone(),
            principal: principal.clone(),
            id,
            cost,
            settled: false,
        })
    }

    pub fn commit(&self, reservation: Reservation) -> BudgetSnapshot {
        reservation.commit()
    }

    pub fn rollback(&self, reservation: Reservation) -> BudgetSnapshot {
        reservation.rollback()
    }

    // Removing the id first makes a second settle of the same reservation a no-op.
    fn settle(&self, principal: &Principal, id: u64, commit: bool) -> BudgetSnapshot {
        let budget = self.budget(principal);
        let mut state = budget.lock();
        if let Some(cost) = state.outstanding.remove(&id) {
            state.reserved = state.reserved - cost;
            if commit {
                state.spent = state.spent + cost;
                state.releases += 1;
                debug!(%principal, reservation = id, "committed privacy budget");
            } else {
                warn!(%principal, reservation = id, epsilon = cost.epsilon(), "rolled back privacy budget");
            }
        }
        state.snapshot(principal, self.window())
    }

    // Reads see the current window, so an expired one is rolled first.
    fn read<T>(&self, principal: &Principal, view: impl FnOnce(&PrincipalBudget) -> T) -> T {
        let budget = self.budget(principal);
        let mut state = budget.lock();
        if state.roll_window(Utc::now(), self.window()) {
            info!(%principal, "privacy budget window rolled over");
        }
        view(&state)
    }

    /// `(epsilon_left, delta_left)`, net of in-flight reservations.
    pub fn remaining(&self, principal: &Principal) -> (f64, f64) {
        let remaining = self.read(principal, PrincipalBudget::remaining);
        (remaining.epsilon(), remaining.delta())
    }

    /// Committed spend in exact ledger units.
    pub fn spent(&self, principal: &Principal) -> PrivacyCost {
        self.read(principal, |state| state.spent)
    }

    pub fn snapshot(&self, principal: &Principal) -> BudgetSnapshot {
        let window = self.window();
        self.read(principal, |state| state.snapshot(principal, window))
    }

    /// Administrative reset: clears committed spend and opens a new window.
    /// In-flight reservations stay reserved.
    pub fn reset(&self, principal: &Principal) -> BudgetSnapshot {
        let budget = self.budget(principal);
        let mut state = budget.lock();
        state.spent = PrivacyCost::ZERO;
        state.window_start = Utc::now();
        info!(%principal, "privacy budget reset");
        state.snapshot(principal, self.window())
    }
}

/// Budget held for one release. Commit to make the spend permanent;
/// dropping an unsettled reservation rolls it back.
#[must_use = "dropping a reservation rolls it back"]
pub struct Reservation {
    ledger: PrivacyLedger,
    principal: Principal,
    id: u64,
    cost: PrivacyCost,
    settled: bool,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("principal", &self.principal)
            .field("id", &self.id)
            .field("cost", &self.cost)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Reservation {
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn cost(&self) -> PrivacyCost {
        self.cost
    }

    pub fn commit(mut self) -> BudgetSnapshot {
        self.settled = true;
        self.ledger.settle(&self.principal, self.id, true)
    }

    pub fn rollback(mut self) -> BudgetSnapshot {
        self.settled = true;
        self.ledger.settle(&self.principal, self.id, false)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.settle(&self.principal, self.id, false);
        }
    }
}
