//! The booking store as the booking flow sees it. Implemented in-process by
//! [`Store`] and over TCP by [`RemoteStore`](crate::client::RemoteStore).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::availability::AvailabilityPayload;
use crate::client::ClientError;
use crate::model::*;
use crate::slots::TimeSlot;
use crate::store::{Store, StoreError, now_ms};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl ApiError {
    /// The store's verdict, whether it was reached locally or remotely.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            ApiError::Store(e) | ApiError::Client(ClientError::Remote(e)) => Some(e),
            ApiError::Client(_) => None,
        }
    }

    /// The store could not be reached at all, so nothing is known.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ApiError::Client(ClientError::Io(_) | ClientError::Timeout(_) | ClientError::Closed)
        )
    }
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get_space(&self, space_id: SpaceId) -> Result<SpaceInfo, ApiError>;

    async fn get_availability(&self, space_id: SpaceId) -> Result<AvailabilityPayload, ApiError>;

    /// Advisory only. A clear answer does not reserve anything.
    async fn check_conflicts(
        &self,
        space_id: SpaceId,
        date: NaiveDate,
        start: Clock,
        end: Clock,
        seats: u32,
    ) -> Result<ConflictReport, ApiError>;

    /// Authoritative, atomic claim of a window.
    async fn acquire_reservation_lock(&self, req: LockRequest) -> Result<LockResult, ApiError>;

    async fn release_hold(&self, token: Ulid) -> Result<(), ApiError>;

    async fn promote_hold(&self, req: PromoteRequest) -> Result<Booking, ApiError>;

    async fn get_alternative_slots(
        &self,
        space_id: SpaceId,
        date: NaiveDate,
        duration_minutes: u32,
    ) -> Result<Vec<TimeSlot>, ApiError>;

    async fn batch_check_availability(
        &self,
        space_ids: &[SpaceId],
        date: NaiveDate,
        start: Clock,
        end: Clock,
    ) -> Result<HashMap<SpaceId, SpotAvailability>, ApiError>;

    async fn day_bookings(&self, space_id: SpaceId, date: NaiveDate) -> Result<Vec<Claim>, ApiError>;
}

#[async_trait]
impl BookingStore for Store {
    async fn get_space(&self, space_id: SpaceId) -> Result<SpaceInfo, ApiError> {
        Ok(Store::get_space(self, space_id).await?)
    }

    async fn get_availability(&self, space_id: SpaceId) -> Result<AvailabilityPayload, ApiError> {
        Ok(Store::get_availability(self, space_id).await?)
    }

    async fn check_conflicts(
        &self,
        space_id: SpaceId,
        date: NaiveDate,
        start: Clock,
        end: Clock,
        seats: u32,
    ) -> Result<ConflictReport, ApiError> {
        Ok(Store::check_conflicts(self, space_id, date, start, end, seats, now_ms()).await?)
    }

    async fn acquire_reservation_lock(&self, req: LockRequest) -> Result<LockResult, ApiError> {
        Ok(self.acquire_lock(req, now_ms()).await?)
    }

    async fn release_hold(&self, token: Ulid) -> Result<(), ApiError> {
        Store::release_hold(self, token).await?;
        Ok(())
    }

    async fn promote_hold(&self, req: PromoteRequest) -> Result<Booking, ApiError> {
        Ok(Store::promote_hold(self, req, now_ms()).await?)
    }

    async fn get_alternative_slots(
        &self,
        space_id: SpaceId,
        date: NaiveDate,
        duration_minutes: u32,
    ) -> Result<Vec<TimeSlot>, ApiError> {
        Ok(self.alternative_slots(space_id, date, duration_minutes, now_ms()).await?)
    }

    async fn batch_check_availability(
        &self,
        space_ids: &[SpaceId],
        date: NaiveDate,
        start: Clock,
        end: Clock,
    ) -> Result<HashMap<SpaceId, SpotAvailability>, ApiError> {
        Ok(self.batch_check(space_ids, date, start, end, now_ms()).await?)
    }

    async fn day_bookings(&self, space_id: SpaceId, date: NaiveDate) -> Result<Vec<Claim>, ApiError> {
        Ok(self.day_claims(space_id, date, now_ms()).await?)
    }
}
