//! Date → time → summary booking flow.
//!
//! [`WizardState`] holds the guarded, synchronous part: which step the user
//! is on and what they picked. [`BookingWizard`] drives confirmation against
//! a [`BookingStore`]: advisory check, then the authoritative lock, then the
//! booking. Every failure lands back on the time step as a [`WizardError`].

use std::sync::{Arc, LazyLock};

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::api::{ApiError, BookingStore};
use crate::availability::{DateStatus, date_status};
use crate::config::BookingPolicy;
use crate::detector::{Advisory, ConflictDetector, Signature};
use crate::model::*;
use crate::pricing::Quote;
use crate::selection::SelectedRange;
use crate::slots::{LocalNow, TimeSlot, generate_slots};
use crate::store::{StoreError, now_ms, saturated_spans};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Date,
    Time,
    Summary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiscalField {
    TaxId,
    /// Businesses need a PEC address or an SDI code.
    PecOrSdi,
    PecEmail,
    SdiCode,
    Address,
    City,
    Province,
    PostalCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardViolation {
    #[error("no date selected")]
    NoDate,
    #[error("{date} cannot be booked ({status:?})")]
    DateNotSelectable { date: NaiveDate, status: DateStatus },
    #[error("no time range selected")]
    NoRange,
    #[error("cancellation policy not accepted")]
    PolicyNotAccepted,
    #[error("invoice details invalid: {0:?}")]
    InvalidFiscal(Vec<FiscalField>),
    #[error("a confirmation is already in progress")]
    ConfirmInFlight,
    #[error("not allowed on the {0:?} step")]
    WrongStep(Step),
}

/// Failures of a confirmation attempt, as the user should see them.
#[derive(Debug, Error)]
pub enum WizardError {
    #[error("booking service unreachable: {0}")]
    Offline(String),
    #[error("the selected time is no longer available")]
    Conflict {
        conflicts: Vec<Claim>,
        alternatives: Vec<TimeSlot>,
    },
    #[error("the reservation expired before the booking was created")]
    LockExpired,
    #[error(transparent)]
    Guard(#[from] GuardViolation),
    #[error("booking rejected: {0}")]
    Rejected(String),
}

impl From<ApiError> for WizardError {
    fn from(e: ApiError) -> Self {
        if e.is_unreachable() {
            return WizardError::Offline(e.to_string());
        }
        match e.store_error() {
            Some(StoreError::Expired { .. }) => WizardError::LockExpired,
            Some(StoreError::Conflict { conflicts } | StoreError::CapacityExceeded { conflicts, .. }) => {
                WizardError::Conflict {
                    conflicts: conflicts.clone(),
                    alternatives: Vec::new(),
                }
            }
            _ => WizardError::Rejected(e.to_string()),
        }
    }
}

static TAX_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z]{6}[0-9]{2}[A-Z][0-9]{2}[A-Z][0-9]{3}[A-Z]$").unwrap()
});
static VAT_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^IT[0-9]{11}$").unwrap());
static PEC_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.(pec|PEC)(\.[a-zA-Z]{2,})?$").unwrap()
});
static SDI_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]{7}$").unwrap());
static PROVINCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z]{2}$").unwrap());
static POSTAL_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]{5}$").unwrap());

/// Billing details for an invoice request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalData {
    pub is_business: bool,
    /// Personal tax code for individuals, VAT number for businesses.
    pub tax_id: String,
    pub pec_email: Option<String>,
    pub sdi_code: Option<String>,
    pub billing_address: String,
    pub billing_city: String,
    pub billing_province: String,
    pub billing_postal_code: String,
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl FiscalData {
    /// Every field that fails its rule; empty when the data is usable.
    pub fn invalid_fields(&self) -> Vec<FiscalField> {
        let mut bad = Vec::new();
        let tax_id = self.tax_id.trim().to_uppercase();
        let tax_ok = if self.is_business {
            VAT_NUMBER.is_match(&tax_id)
        } else {
            TAX_CODE.is_match(&tax_id)
        };
        if !tax_ok {
            bad.push(FiscalField::TaxId);
        }

        if self.is_business {
            let pec = present(&self.pec_email);
            let sdi = present(&self.sdi_code);
            if pec.is_none() && sdi.is_none() {
                bad.push(FiscalField::PecOrSdi);
            }
            if pec.is_some_and(|p| !PEC_EMAIL.is_match(p)) {
                bad.push(FiscalField::PecEmail);
            }
            if sdi.is_some_and(|s| !SDI_CODE.is_match(s)) {
                bad.push(FiscalField::SdiCode);
            }
        }

        let address = self.billing_address.trim();
        if !(5..=200).contains(&address.chars().count()) {
            bad.push(FiscalField::Address);
        }
        let city = self.billing_city.trim();
        if !(2..=100).contains(&city.chars().count()) {
            bad.push(FiscalField::City);
        }
        if !PROVINCE.is_match(self.billing_province.trim()) {
            bad.push(FiscalField::Province);
        }
        if !POSTAL_CODE.is_match(self.billing_postal_code.trim()) {
            bad.push(FiscalField::PostalCode);
        }
        bad
    }

    pub fn validate(&self) -> Result<(), GuardViolation> {
        let bad = self.invalid_fields();
        if bad.is_empty() {
            Ok(())
        } else {
            Err(GuardViolation::InvalidFiscal(bad))
        }
    }
}

/// Picks and position of one booking flow.
#[derive(Debug, Clone)]
pub struct WizardState {
    step: Step,
    date: Option<NaiveDate>,
    range: Option<SelectedRange>,
    seats: u32,
    cancellation_policy: Option<String>,
    policy_accepted: bool,
    invoice: Option<FiscalData>,
    confirming: bool,
}

impl WizardState {
    pub fn new(cancellation_policy: Option<String>) -> Self {
        Self {
            step: Step::Date,
            date: None,
            range: None,
            seats: 1,
            cancellation_policy: cancellation_policy.filter(|p| !p.trim().is_empty()),
            policy_accepted: false,
            invoice: None,
            confirming: false,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    pub fn range(&self) -> Option<SelectedRange> {
        self.range
    }

    pub fn seats(&self) -> u32 {
        self.seats
    }

    pub fn is_confirming(&self) -> bool {
        self.confirming
    }

    fn editable(&self) -> Result<(), GuardViolation> {
        if self.confirming {
            return Err(GuardViolation::ConfirmInFlight);
        }
        Ok(())
    }

    /// Pick a date. A new date drops the range picked for the old one.
    pub fn select_date(&mut self, date: NaiveDate, status: DateStatus) -> Result<(), GuardViolation> {
        self.editable()?;
        if self.step != Step::Date {
            return Err(GuardViolation::WrongStep(self.step));
        }
        if !status.is_selectable() {
            return Err(GuardViolation::DateNotSelectable { date, status });
        }
        if self.date != Some(date) {
            self.range = None;
        }
        self.date = Some(date);
        Ok(())
    }

    pub fn select_range(&mut self, range: Option<SelectedRange>) -> Result<(), GuardViolation> {
        self.editable()?;
        if self.step != Step::Time {
            return Err(GuardViolation::WrongStep(self.step));
        }
        self.range = range;
        Ok(())
    }

    pub fn set_seats(&mut self, seats: u32) -> Result<(), GuardViolation> {
        self.editable()?;
        self.seats = seats.max(1);
        Ok(())
    }

    pub fn accept_policy(&mut self, accepted: bool) {
        self.policy_accepted = accepted;
    }

    pub fn request_invoice(&mut self, invoice: Option<FiscalData>) {
        self.invoice = invoice;
    }

    pub fn next(&mut self) -> Result<Step, GuardViolation> {
        self.editable()?;
        self.step = match self.step {
            Step::Date if self.date.is_none() => return Err(GuardViolation::NoDate),
            Step::Date => Step::Time,
            Step::Time if self.range.is_none() => return Err(GuardViolation::NoRange),
            Step::Time => Step::Summary,
            Step::Summary => return Err(GuardViolation::WrongStep(Step::Summary)),
        };
        Ok(self.step)
    }

    pub fn back(&mut self) -> Result<Step, GuardViolation> {
        self.editable()?;
        self.step = match self.step {
            Step::Date => Step::Date,
            Step::Time => Step::Date,
            Step::Summary => Step::Time,
        };
        Ok(self.step)
    }

    /// Guards for leaving the summary step. Returns the date and range to
    /// book.
    pub fn check_confirmable(&self) -> Result<(NaiveDate, SelectedRange), GuardViolation> {
        self.editable()?;
        if self.step != Step::Summary {
            return Err(GuardViolation::WrongStep(self.step));
        }
        let date = self.date.ok_or(GuardViolation::NoDate)?;
        let range = self.range.ok_or(GuardViolation::NoRange)?;
        if self.cancellation_policy.is_some() && !self.policy_accepted {
            return Err(GuardViolation::PolicyNotAccepted);
        }
        if let Some(invoice) = &self.invoice {
            invoice.validate()?;
        }
        Ok((date, range))
    }

    fn begin_confirm(&mut self) -> Result<(NaiveDate, SelectedRange), GuardViolation> {
        let picked = self.check_confirmable()?;
        self.confirming = true;
        Ok(picked)
    }

    fn confirm_succeeded(&mut self) {
        self.confirming = false;
    }

    /// Back to the time step. The range survives unless it was taken.
    fn confirm_failed(&mut self, range_taken: bool) {
        self.confirming = false;
        self.step = Step::Time;
        if range_taken {
            self.range = None;
        }
    }
}

/// Runs one user's booking flow for one space.
pub struct BookingWizard {
    store: Arc<dyn BookingStore>,
    detector: ConflictDetector,
    space: SpaceInfo,
    user_id: String,
    policy: BookingPolicy,
    state: WizardState,
}

impl BookingWizard {
    pub fn new(
        store: Arc<dyn BookingStore>,
        space: SpaceInfo,
        user_id: impl Into<String>,
        policy: BookingPolicy,
        cancellation_policy: Option<String>,
    ) -> Self {
        Self {
            detector: ConflictDetector::new(store.clone(), &policy),
            store,
            space,
            user_id: user_id.into(),
            policy,
            state: WizardState::new(cancellation_policy),
        }
    }

    /// Fetch the space and start a flow for it.
    pub async fn load(
        store: Arc<dyn BookingStore>,
        space_id: SpaceId,
        user_id: impl Into<String>,
        policy: BookingPolicy,
        cancellation_policy: Option<String>,
    ) -> Result<Self, WizardError> {
        let space = store.get_space(space_id).await?;
        Ok(Self::new(store, space, user_id, policy, cancellation_policy))
    }

    pub fn state(&self) -> &WizardState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut WizardState {
        &mut self.state
    }

    pub fn space(&self) -> &SpaceInfo {
        &self.space
    }

    /// The debounced checker for live feedback while the user picks times.
    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    fn local_now(&self) -> LocalNow {
        LocalNow::at(self.space.settings.timezone, now_ms())
    }

    pub fn date_status(&self, date: NaiveDate) -> DateStatus {
        date_status(&self.space.availability, date, self.local_now().date, self.policy.horizon_days)
    }

    pub fn select_date(&mut self, date: NaiveDate) -> Result<(), GuardViolation> {
        let status = self.date_status(date);
        self.state.select_date(date, status)
    }

    /// Slots of `date` from current availability and the store's claims.
    /// Call again whenever the store reports a change.
    pub async fn slots_for(&self, date: NaiveDate) -> Result<Vec<TimeSlot>, WizardError> {
        let claims = self.store.day_bookings(self.space.id, date).await?;
        let allocs: Vec<(TimeRange, u32)> = claims.iter().map(|c| (c.range(), c.seats())).collect();
        let settings = &self.space.settings;
        Ok(generate_slots(
            date,
            &self.space.availability.effective(date).intervals_or_fallback(),
            settings.slot_interval_minutes,
            settings.buffer_minutes,
            &saturated_spans(&allocs, settings.capacity),
            self.local_now(),
        ))
    }

    /// Price estimate for the current range, computed the same way the
    /// store prices the booking.
    pub fn quote(&self) -> Option<Quote> {
        let range = self.state.range()?;
        self.space.settings.rates.quote(range.duration_minutes())
    }

    fn signature(&self, date: NaiveDate, range: &SelectedRange) -> Signature {
        Signature {
            space_id: self.space.id,
            date,
            range: range.range(),
            seats: self.state.seats(),
        }
    }

    /// Check, lock, book. On failure the wizard is back on the time step,
    /// and so it is when the returned future is dropped before finishing.
    pub async fn confirm(&mut self, payment_required: bool) -> Result<Booking, WizardError> {
        let (date, range) = self.state.begin_confirm()?;
        let sig = self.signature(date, &range);
        let flow = ConfirmFlow {
            store: &*self.store,
            detector: &self.detector,
            policy: &self.policy,
            user_id: &self.user_id,
        };
        let pending = PendingConfirm { state: &mut self.state };
        match flow.run(&sig, payment_required).await {
            Ok(booking) => {
                pending.succeeded();
                info!(booking = %booking.id, status = %booking.status, "booking created");
                Ok(booking)
            }
            Err(e) => {
                pending.failed(matches!(e, WizardError::Conflict { .. }));
                warn!(space = %sig.space_id, "confirmation failed: {e}");
                Err(e)
            }
        }
    }
}

/// Clears the in-flight flag on every exit from [`BookingWizard::confirm`].
/// An abandoned confirmation counts as a failure that left the range free.
struct PendingConfirm<'a> {
    state: &'a mut WizardState,
}

impl PendingConfirm<'_> {
    fn succeeded(self) {
        self.state.confirm_succeeded();
    }

    fn failed(self, range_taken: bool) {
        self.state.confirm_failed(range_taken);
    }
}

impl Drop for PendingConfirm<'_> {
    fn drop(&mut self) {
        if self.state.confirming {
            debug!("confirmation abandoned");
            self.state.confirm_failed(false);
        }
    }
}

/// The parts of a wizard a confirmation reads.
struct ConfirmFlow<'a> {
    store: &'a dyn BookingStore,
    detector: &'a ConflictDetector,
    policy: &'a BookingPolicy,
    user_id: &'a str,
}

impl ConfirmFlow<'_> {
    async fn run(&self, sig: &Signature, payment_required: bool) -> Result<Booking, WizardError> {
        // The advisory answer can only stop a doomed attempt early. An
        // unknown answer stops it too: confirmation needs the store.
        match self.detector.check_now(sig).await {
            Advisory::Clear => {}
            Advisory::Conflict { conflicts, alternatives } => {
                return Err(WizardError::Conflict { conflicts, alternatives });
            }
            Advisory::Rejected(verdict) => return Err(ApiError::from(verdict).into()),
            Advisory::Unknown(reason) => return Err(WizardError::Offline(reason)),
        }

        let token = self.lock(sig).await?;
        match self.promote(token, payment_required).await {
            Err(WizardError::LockExpired) => {
                debug!(%token, "hold lapsed before promotion, locking again");
                let token = self.lock(sig).await?;
                self.promote(token, payment_required).await
            }
            other => other,
        }
    }

    async fn lock(&self, sig: &Signature) -> Result<Ulid, WizardError> {
        let req = LockRequest {
            space_id: sig.space_id,
            date: sig.date,
            start_time: sig.range.start,
            end_time: sig.range.end,
            token: Ulid::new(),
            user_id: self.user_id.to_owned(),
            seats: sig.seats,
            ttl_ms: None,
        };
        let token = req.token;
        let result = self.with_timeout(self.store.acquire_reservation_lock(req)).await?;
        if !result.valid {
            return Err(WizardError::Conflict {
                conflicts: result.conflicts,
                alternatives: self.detector.alternatives(sig).await,
            });
        }
        Ok(token)
    }

    async fn promote(&self, token: Ulid, payment_required: bool) -> Result<Booking, WizardError> {
        let req = PromoteRequest {
            token,
            user_id: self.user_id.to_owned(),
            payment_required,
        };
        let result = self.with_timeout(self.store.promote_hold(req)).await;
        if let Err(e) = &result
            && !matches!(e, WizardError::LockExpired | WizardError::Offline(_))
        {
            // Leave nothing behind for a booking that will not happen.
            if let Err(release) = self.store.release_hold(token).await {
                debug!(%token, "release after failed promotion: {release}");
            }
        }
        result
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, WizardError> {
        match tokio::time::timeout(self.policy.request_timeout, call).await {
            Ok(result) => result.map_err(WizardError::from),
            Err(_) => Err(WizardError::Offline(format!(
                "no answer within {:?}",
                self.policy.request_timeout
            ))),
        }
    }
}
