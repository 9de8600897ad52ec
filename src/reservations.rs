use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::{
    error::AppError,
    models::{CreateReservationEntity, ReservationEntity, ReservationStatus},
    store::Store,
};

#[derive(Debug, Clone, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct SlotQuery {
    pub date: NaiveDate,
    #[param(value_type = String, example = "19:30:00")]
    pub time: NaiveTime,
    pub party_size: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub available: bool,
    pub seats_taken: i64,
    pub seats_left: i64,
    pub capacity: i64,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewReservation {
    pub customer_name: String,
    pub date: NaiveDate,
    #[schema(value_type = String, example = "19:30:00")]
    pub time: NaiveTime,
    pub party_size: i32,
}

#[derive(Clone)]
pub struct ReservationService {
    store: Arc<dyn Store>,
    capacity: i64,
}

impl ReservationService {
    pub fn new(store: Arc<dyn Store>, capacity: i64) -> Self {
        Self { store, capacity }
    }

    pub async fn check_availability(
        &self,
        date: NaiveDate,
        time: NaiveTime,
        party_size: i32,
    ) -> Result<Availability, AppError> {
        if party_size <= 0 {
            return Err(AppError::Validation("Party size must be positive".into()));
        }

        let seats_taken = self.store.reserved_seats(date, time).await?;
        let seats_left = (self.capacity - seats_taken).max(0);
        Ok(Availability {
            available: i64::from(party_size) <= seats_left,
            seats_taken,
            seats_left,
            capacity: self.capacity,
        })
    }

    pub async fn create_reservation(
        &self,
        reservation: NewReservation,
    ) -> Result<ReservationEntity, AppError> {
        if reservation.customer_name.trim().is_empty() {
            return Err(AppError::Validation("Customer name is required".into()));
        }

        let availability = self
            .check_availability(reservation.date, reservation.time, reservation.party_size)
            .await?;
        if !availability.available {
            return Err(AppError::Conflict(format!(
                "Only {} seats left at {} {}",
                availability.seats_left, reservation.date, reservation.time
            )));
        }

        let created = self
            .store
            .create_reservation(CreateReservationEntity {
                customer_name: reservation.customer_name,
                reservation_date: reservation.date,
                reservation_time: reservation.time,
                party_size: reservation.party_size,
                status: ReservationStatus::Pending.as_str().to_string(),
            })
            .await?;

        info!(
            id = created.id,
            date = %created.reservation_date,
            time = %created.reservation_time,
            party = created.party_size,
            "Reservation created"
        );
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, store::MemoryStore};

    fn slot() -> (NaiveDate, NaiveTime) {
        (
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            NaiveTime::from_hms_opt(19, 30, 0).unwrap(),
        )
    }

    fn booking(party_size: i32) -> NewReservation {
        let (date, time) = slot();
        NewReservation {
            customer_name: "Grace".into(),
            date,
            time,
            party_size,
        }
    }

    #[tokio::test]
    async fn full_slot_refuses_new_bookings() {
        let svc = ReservationService::new(Arc::new(MemoryStore::new()), 10);
        svc.create_reservation(booking(6)).await.unwrap();

        let err = svc.create_reservation(booking(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        svc.create_reservation(booking(4)).await.unwrap();
        let (date, time) = slot();
        let availability = svc.check_availability(date, time, 1).await.unwrap();
        assert!(!availability.available);
        assert_eq!(availability.seats_taken, 10);
    }

    #[tokio::test]
    async fn other_slots_are_independent() {
        let svc = ReservationService::new(Arc::new(MemoryStore::new()), 4);
        svc.create_reservation(booking(4)).await.unwrap();

        let (date, _) = slot();
        let later = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
        let availability = svc.check_availability(date, later, 4).await.unwrap();
        assert!(availability.available);
        assert_eq!(availability.seats_left, 4);
    }

    #[tokio::test]
    async fn party_size_must_be_positive() {
        let svc = ReservationService::new(Arc::new(MemoryStore::new()), 4);
        let (date, time) = slot();
        let err = svc.check_availability(date, time, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }
}
