//! Persistence gateway.
//!
//! Every lifecycle, cash, lock and maintenance operation goes through the
//! [`Store`] trait. [`PgStore`] is the PostgreSQL implementation used in
//! production; [`MemoryStore`] keeps everything in process and backs the
//! tests and database-less local runs.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    CashSummaryEntity, CashTransactionEntity, CreateAuditLogEntity, CreateCashSummaryEntity,
    CreateCashTransactionEntity, CreateCronLockEntity, CreateDriverEntity,
    CreateNotificationLogEntity, CreateOrderEntity, CreateOrderItemEntity,
    CreateReservationEntity, CronLockEntity, DriverEntity, DriverStatus, NotificationLogEntity,
    NotificationStatus, OrderAssignment, OrderEntity, OrderItemEntity, OrderStatus,
    ReservationEntity, WebhookEntity,
};

pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Serialization failures, dropped connections and pool timeouts.
    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Query failed: {0}")]
    Query(DieselError),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => StoreError::NotFound,
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::UniqueViolation(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, info)
            | DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                StoreError::Transient(info.message().to_string())
            }
            other => StoreError::Query(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Fields written by an admin sign-off.
#[derive(Debug, Clone, Default)]
pub struct CashVerification {
    pub admin_verified: bool,
    /// `None` keeps the discrepancy recorded so far.
    pub discrepancy_amount: Option<f64>,
    pub discrepancy_notes: Option<String>,
}

/// A retention sweep. Each variant runs as one transaction.
#[derive(Debug, Clone)]
pub enum Purge {
    /// Clears tracking codes whose expiry has passed.
    ExpiredTrackingCodes { now: DateTime<Utc> },
    /// Deletes orders still PENDING that were created before the cutoff.
    OrphanedOrders { created_before: DateTime<Utc> },
    StaleLocks { locked_before: DateTime<Utc> },
    /// Confirmed and verified cash transactions plus summaries past retention.
    CashData {
        transactions_before: DateTime<Utc>,
        summaries_before: NaiveDate,
    },
    /// Reservations in a terminal status dated before the cutoff.
    Reservations { before: NaiveDate },
    Sessions { expired_before: DateTime<Utc> },
    NotificationLogs {
        notifications_before: DateTime<Utc>,
        audit_before: DateTime<Utc>,
        webhooks_deleted_before: DateTime<Utc>,
    },
    /// Inactive drivers without a user link and without orders.
    InactiveDrivers,
}

/// Rows affected per table.
pub type PurgeCounts = Vec<(&'static str, usize)>;

#[async_trait]
pub trait Store: Send + Sync {
    // Orders

    async fn create_order_with_items(
        &self,
        order: CreateOrderEntity,
        items: Vec<CreateOrderItemEntity>,
    ) -> StoreResult<(OrderEntity, Vec<OrderItemEntity>)>;

    async fn find_order_by_number(&self, order_number: &str) -> StoreResult<Option<OrderEntity>>;

    async fn find_order_items(&self, order_id: i32) -> StoreResult<Vec<OrderItemEntity>>;

    /// Moves an order from `from` to `to` together with the assignment columns.
    ///
    /// Returns `None` when the order is no longer in `from`.
    async fn update_order_status_by_number(
        &self,
        order_number: &str,
        from: OrderStatus,
        to: OrderStatus,
        assignment: OrderAssignment,
    ) -> StoreResult<Option<OrderEntity>>;

    /// Same as [`Store::update_order_status_by_number`] but also inserts the
    /// order's cash transaction in the same transaction. Neither write lands
    /// unless both do.
    async fn update_order_status_with_cash(
        &self,
        order_number: &str,
        from: OrderStatus,
        to: OrderStatus,
        assignment: OrderAssignment,
        cash: CreateCashTransactionEntity,
    ) -> StoreResult<Option<(OrderEntity, CashTransactionEntity)>>;

    async fn set_order_tracking(
        &self,
        order_id: i32,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Returns the order only when `code` matches and has not expired at `now`.
    async fn get_order_for_tracking(
        &self,
        order_number: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OrderEntity>>;

    async fn insert_audit_log(&self, entry: CreateAuditLogEntity) -> StoreResult<()>;

    /// Orders created in `[from, to)`, optionally limited to one driver.
    async fn list_orders_between(
        &self,
        driver_id: Option<i32>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<OrderEntity>>;

    // Drivers

    async fn create_driver(&self, driver: CreateDriverEntity) -> StoreResult<DriverEntity>;

    async fn find_driver(&self, id: i32) -> StoreResult<Option<DriverEntity>>;

    async fn set_driver_status(&self, id: i32, status: DriverStatus) -> StoreResult<()>;

    // Cash

    /// Fails with [`StoreError::UniqueViolation`] when the order already has one.
    async fn create_cash_transaction(
        &self,
        txn: CreateCashTransactionEntity,
    ) -> StoreResult<CashTransactionEntity>;

    async fn find_cash_transaction(
        &self,
        order_id: i32,
    ) -> StoreResult<Option<CashTransactionEntity>>;

    async fn confirm_cash_transaction(
        &self,
        order_id: i32,
        payment_timestamp: DateTime<Utc>,
    ) -> StoreResult<Option<CashTransactionEntity>>;

    /// Applies an admin sign-off. Only touches confirmed transactions.
    async fn verify_cash_transaction(
        &self,
        order_id: i32,
        verification: CashVerification,
    ) -> StoreResult<Option<CashTransactionEntity>>;

    async fn list_cash_transactions_for_orders(
        &self,
        order_ids: &[i32],
    ) -> StoreResult<Vec<CashTransactionEntity>>;

    /// Replaces the cached summary for the same date and driver.
    async fn replace_cash_summary(
        &self,
        summary: CreateCashSummaryEntity,
    ) -> StoreResult<CashSummaryEntity>;

    // Reservations

    /// Seats taken by non-cancelled reservations in the slot.
    async fn reserved_seats(&self, date: NaiveDate, time: NaiveTime) -> StoreResult<i64>;

    async fn create_reservation(
        &self,
        reservation: CreateReservationEntity,
    ) -> StoreResult<ReservationEntity>;

    // Locks

    /// Insert-or-fail keyed by task name.
    async fn insert_lock(&self, lock: CreateCronLockEntity) -> StoreResult<CronLockEntity>;

    async fn find_lock(&self, task_name: &str) -> StoreResult<Option<CronLockEntity>>;

    /// Hands the lock to `instance_id` only if it was taken before `stale_before`.
    async fn replace_stale_lock(
        &self,
        task_name: &str,
        instance_id: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Returns whether a row was deleted.
    async fn delete_lock(&self, task_name: &str) -> StoreResult<bool>;

    // Webhooks and notification logs

    async fn list_active_webhooks(&self) -> StoreResult<Vec<WebhookEntity>>;

    async fn find_webhook(&self, id: Uuid) -> StoreResult<Option<WebhookEntity>>;

    /// Marks the subscription FAILED and stores the failure details.
    async fn record_webhook_failure(&self, id: Uuid, details: Value) -> StoreResult<()>;

    /// Puts a FAILED subscription back to ACTIVE. Other statuses are left alone.
    async fn restore_webhook(&self, id: Uuid) -> StoreResult<()>;

    async fn insert_notification_log(
        &self,
        log: CreateNotificationLogEntity,
    ) -> StoreResult<NotificationLogEntity>;

    /// Failed webhook deliveries created after the cutoff that can still be retried.
    async fn list_failed_webhook_notifications(
        &self,
        created_after: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> StoreResult<Vec<NotificationLogEntity>>;

    async fn update_notification_log(
        &self,
        id: Uuid,
        status: NotificationStatus,
        attempts: i32,
        last_error: Option<String>,
    ) -> StoreResult<()>;

    // Retention

    async fn purge(&self, purge: Purge) -> StoreResult<PurgeCounts>;
}
