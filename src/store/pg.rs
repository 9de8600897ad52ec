use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use diesel::{
    AsChangeset, ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper,
};
use diesel_async::{
    AsyncConnection, AsyncPgConnection, RunQueryDsl,
    pooled_connection::{AsyncDieselConnectionManager, bb8::Pool},
};
use serde_json::Value;
use uuid::Uuid;

use super::{CashVerification, Purge, PurgeCounts, Store, StoreError, StoreResult};
use crate::{
    models::{
        CashSummaryEntity, CashTransactionEntity, CreateAuditLogEntity, CreateCashSummaryEntity,
        CreateCashTransactionEntity, CreateCronLockEntity, CreateDriverEntity,
        CreateNotificationLogEntity, CreateOrderEntity, CreateOrderItemEntity,
        CreateReservationEntity, CronLockEntity, DriverEntity, DriverStatus, NotificationKind,
        NotificationLogEntity, NotificationStatus, OrderAssignment, OrderEntity,
        OrderItemEntity, OrderStatus, ReservationEntity, ReservationStatus, WebhookEntity,
        WebhookStatus,
    },
    schema::{
        audit_logs, cash_summaries, cash_transactions, cron_locks, drivers, notification_logs,
        order_items, orders, reservations, sessions, webhooks,
    },
};

pub type DbPool = Pool<AsyncPgConnection>;

/// Builds the bb8 connection pool for `database_url`.
pub async fn connect(database_url: &str) -> anyhow::Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder().build(manager).await?;
    Ok(pool)
}

fn pool_error(err: impl Display) -> StoreError {
    StoreError::Transient(format!("Failed to obtain a DB connection: {err}"))
}

#[derive(AsChangeset)]
#[diesel(table_name = orders)]
struct OrderStatusChangeset {
    status: String,
    driver_id: Option<i32>,
    cook_id: Option<i32>,
    cashier_id: Option<i32>,
    waiter_id: Option<i32>,
    updated_at: DateTime<Utc>,
}

#[derive(AsChangeset)]
#[diesel(table_name = cash_transactions)]
struct CashVerificationChangeset {
    admin_verified: bool,
    discrepancy_amount: Option<f64>,
    discrepancy_notes: Option<String>,
    updated_at: DateTime<Utc>,
}

/// Compare-and-set on the current status.
async fn move_order(
    conn: &mut AsyncPgConnection,
    order_number: &str,
    from: OrderStatus,
    to: OrderStatus,
    assignment: OrderAssignment,
) -> Result<Option<OrderEntity>, diesel::result::Error> {
    let changes = OrderStatusChangeset {
        status: to.as_str().to_string(),
        driver_id: assignment.driver_id,
        cook_id: assignment.cook_id,
        cashier_id: assignment.cashier_id,
        waiter_id: assignment.waiter_id,
        updated_at: Utc::now(),
    };

    diesel::update(
        orders::table
            .filter(orders::order_number.eq(order_number))
            .filter(orders::status.eq(from.as_str())),
    )
    .set(&changes)
    .returning(OrderEntity::as_returning())
    .get_result(conn)
    .await
    .optional()
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_order_with_items(
        &self,
        order: CreateOrderEntity,
        items: Vec<CreateOrderItemEntity>,
    ) -> StoreResult<(OrderEntity, Vec<OrderItemEntity>)> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        conn.transaction(move |conn| {
            Box::pin(async move {
                let order = diesel::insert_into(orders::table)
                    .values(&order)
                    .returning(OrderEntity::as_returning())
                    .get_result(conn)
                    .await?;

                if items.is_empty() {
                    return Ok((order, Vec::new()));
                }

                let items: Vec<CreateOrderItemEntity> = items
                    .into_iter()
                    .map(|item| CreateOrderItemEntity {
                        order_id: order.id,
                        ..item
                    })
                    .collect();

                let items = diesel::insert_into(order_items::table)
                    .values(&items)
                    .returning(OrderItemEntity::as_returning())
                    .get_results(conn)
                    .await?;

                Ok::<(OrderEntity, Vec<OrderItemEntity>), StoreError>((order, items))
            })
        })
        .await
    }

    async fn find_order_by_number(&self, order_number: &str) -> StoreResult<Option<OrderEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(orders::table
            .filter(orders::order_number.eq(order_number))
            .select(OrderEntity::as_select())
            .first(conn)
            .await
            .optional()?)
    }

    async fn find_order_items(&self, order_id: i32) -> StoreResult<Vec<OrderItemEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(order_items::table
            .filter(order_items::order_id.eq(order_id))
            .select(OrderItemEntity::as_select())
            .get_results(conn)
            .await?)
    }

    async fn update_order_status_by_number(
        &self,
        order_number: &str,
        from: OrderStatus,
        to: OrderStatus,
        assignment: OrderAssignment,
    ) -> StoreResult<Option<OrderEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(move_order(conn, order_number, from, to, assignment).await?)
    }

    async fn update_order_status_with_cash(
        &self,
        order_number: &str,
        from: OrderStatus,
        to: OrderStatus,
        assignment: OrderAssignment,
        cash: CreateCashTransactionEntity,
    ) -> StoreResult<Option<(OrderEntity, CashTransactionEntity)>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;
        let order_number = order_number.to_string();

        conn.transaction(move |conn| {
            Box::pin(async move {
                let Some(order) = move_order(conn, &order_number, from, to, assignment).await?
                else {
                    return Ok(None);
                };

                let txn = diesel::insert_into(cash_transactions::table)
                    .values(&cash)
                    .returning(CashTransactionEntity::as_returning())
                    .get_result(conn)
                    .await?;

                Ok::<Option<(OrderEntity, CashTransactionEntity)>, StoreError>(Some((order, txn)))
            })
        })
        .await
    }

    async fn set_order_tracking(
        &self,
        order_id: i32,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        let updated = diesel::update(orders::table.find(order_id))
            .set((
                orders::tracking_code.eq(code),
                orders::tracking_code_expires_at.eq(expires_at),
                orders::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn get_order_for_tracking(
        &self,
        order_number: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OrderEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(orders::table
            .filter(orders::order_number.eq(order_number))
            .filter(orders::tracking_code.eq(code))
            .filter(orders::tracking_code_expires_at.gt(now))
            .select(OrderEntity::as_select())
            .first(conn)
            .await
            .optional()?)
    }

    async fn insert_audit_log(&self, entry: CreateAuditLogEntity) -> StoreResult<()> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        diesel::insert_into(audit_logs::table)
            .values(&entry)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn list_orders_between(
        &self,
        driver_id: Option<i32>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<OrderEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        let mut query = orders::table
            .filter(orders::created_at.ge(from))
            .filter(orders::created_at.lt(to))
            .into_boxed();
        if let Some(driver_id) = driver_id {
            query = query.filter(orders::driver_id.eq(driver_id));
        }

        Ok(query
            .select(OrderEntity::as_select())
            .load(conn)
            .await?)
    }

    async fn create_driver(&self, driver: CreateDriverEntity) -> StoreResult<DriverEntity> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(diesel::insert_into(drivers::table)
            .values(&driver)
            .returning(DriverEntity::as_returning())
            .get_result(conn)
            .await?)
    }

    async fn find_driver(&self, id: i32) -> StoreResult<Option<DriverEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(drivers::table
            .find(id)
            .select(DriverEntity::as_select())
            .first(conn)
            .await
            .optional()?)
    }

    async fn set_driver_status(&self, id: i32, status: DriverStatus) -> StoreResult<()> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        let updated = diesel::update(drivers::table.find(id))
            .set((
                drivers::current_status.eq(status.as_str()),
                drivers::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn create_cash_transaction(
        &self,
        txn: CreateCashTransactionEntity,
    ) -> StoreResult<CashTransactionEntity> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(diesel::insert_into(cash_transactions::table)
            .values(&txn)
            .returning(CashTransactionEntity::as_returning())
            .get_result(conn)
            .await?)
    }

    async fn find_cash_transaction(
        &self,
        order_id: i32,
    ) -> StoreResult<Option<CashTransactionEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(cash_transactions::table
            .filter(cash_transactions::order_id.eq(order_id))
            .select(CashTransactionEntity::as_select())
            .first(conn)
            .await
            .optional()?)
    }

    async fn confirm_cash_transaction(
        &self,
        order_id: i32,
        payment_timestamp: DateTime<Utc>,
    ) -> StoreResult<Option<CashTransactionEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(diesel::update(cash_transactions::table)
            .filter(cash_transactions::order_id.eq(order_id))
            .set((
                cash_transactions::confirmed.eq(true),
                cash_transactions::payment_timestamp.eq(payment_timestamp),
                cash_transactions::updated_at.eq(Utc::now()),
            ))
            .returning(CashTransactionEntity::as_returning())
            .get_result(conn)
            .await
            .optional()?)
    }

    async fn verify_cash_transaction(
        &self,
        order_id: i32,
        verification: CashVerification,
    ) -> StoreResult<Option<CashTransactionEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        let changes = CashVerificationChangeset {
            admin_verified: verification.admin_verified,
            discrepancy_amount: verification.discrepancy_amount,
            discrepancy_notes: verification.discrepancy_notes,
            updated_at: Utc::now(),
        };

        Ok(diesel::update(cash_transactions::table)
            .filter(cash_transactions::order_id.eq(order_id))
            .filter(cash_transactions::confirmed.eq(true))
            .set(&changes)
            .returning(CashTransactionEntity::as_returning())
            .get_result(conn)
            .await
            .optional()?)
    }

    async fn list_cash_transactions_for_orders(
        &self,
        order_ids: &[i32],
    ) -> StoreResult<Vec<CashTransactionEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(cash_transactions::table
            .filter(cash_transactions::order_id.eq_any(order_ids.to_vec()))
            .select(CashTransactionEntity::as_select())
            .get_results(conn)
            .await?)
    }

    async fn replace_cash_summary(
        &self,
        summary: CreateCashSummaryEntity,
    ) -> StoreResult<CashSummaryEntity> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        conn.transaction(move |conn| {
            Box::pin(async move {
                let same_day = cash_summaries::table
                    .filter(cash_summaries::summary_date.eq(summary.summary_date));
                match summary.driver_id {
                    Some(driver_id) => {
                        diesel::delete(same_day.filter(cash_summaries::driver_id.eq(driver_id)))
                            .execute(conn)
                            .await?
                    }
                    None => {
                        diesel::delete(same_day.filter(cash_summaries::driver_id.is_null()))
                            .execute(conn)
                            .await?
                    }
                };

                let summary = diesel::insert_into(cash_summaries::table)
                    .values(&summary)
                    .returning(CashSummaryEntity::as_returning())
                    .get_result(conn)
                    .await?;

                Ok::<CashSummaryEntity, StoreError>(summary)
            })
        })
        .await
    }

    async fn reserved_seats(&self, date: NaiveDate, time: NaiveTime) -> StoreResult<i64> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        let seats: Option<i64> = reservations::table
            .filter(reservations::reservation_date.eq(date))
            .filter(reservations::reservation_time.eq(time))
            .filter(reservations::status.ne(ReservationStatus::Cancelled.as_str()))
            .select(diesel::dsl::sum(reservations::party_size))
            .first(conn)
            .await?;

        Ok(seats.unwrap_or(0))
    }

    async fn create_reservation(
        &self,
        reservation: CreateReservationEntity,
    ) -> StoreResult<ReservationEntity> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(diesel::insert_into(reservations::table)
            .values(&reservation)
            .returning(ReservationEntity::as_returning())
            .get_result(conn)
            .await?)
    }

    async fn insert_lock(&self, lock: CreateCronLockEntity) -> StoreResult<CronLockEntity> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(diesel::insert_into(cron_locks::table)
            .values(&lock)
            .returning(CronLockEntity::as_returning())
            .get_result(conn)
            .await?)
    }

    async fn find_lock(&self, task_name: &str) -> StoreResult<Option<CronLockEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(cron_locks::table
            .filter(cron_locks::task_name.eq(task_name))
            .select(CronLockEntity::as_select())
            .first(conn)
            .await
            .optional()?)
    }

    async fn replace_stale_lock(
        &self,
        task_name: &str,
        instance_id: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        // Conditional update so two instances cannot both seize the same stale row.
        let updated = diesel::update(cron_locks::table)
            .filter(cron_locks::task_name.eq(task_name))
            .filter(cron_locks::locked_at.lt(stale_before))
            .set((
                cron_locks::instance_id.eq(instance_id),
                cron_locks::locked_at.eq(now),
            ))
            .execute(conn)
            .await?;

        Ok(updated == 1)
    }

    async fn delete_lock(&self, task_name: &str) -> StoreResult<bool> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        let deleted = diesel::delete(cron_locks::table.filter(cron_locks::task_name.eq(task_name)))
            .execute(conn)
            .await?;

        Ok(deleted > 0)
    }

    async fn list_active_webhooks(&self) -> StoreResult<Vec<WebhookEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(webhooks::table
            .filter(webhooks::status.eq(WebhookStatus::Active.as_str()))
            .filter(webhooks::deleted_at.is_null())
            .select(WebhookEntity::as_select())
            .get_results(conn)
            .await?)
    }

    async fn find_webhook(&self, id: Uuid) -> StoreResult<Option<WebhookEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(webhooks::table
            .find(id)
            .select(WebhookEntity::as_select())
            .first(conn)
            .await
            .optional()?)
    }

    async fn record_webhook_failure(&self, id: Uuid, details: Value) -> StoreResult<()> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        diesel::update(webhooks::table.find(id))
            .set((
                webhooks::status.eq(WebhookStatus::Failed.as_str()),
                webhooks::details.eq(Some(details)),
                webhooks::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn restore_webhook(&self, id: Uuid) -> StoreResult<()> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        diesel::update(
            webhooks::table
                .find(id)
                .filter(webhooks::status.eq(WebhookStatus::Failed.as_str())),
        )
        .set((
            webhooks::status.eq(WebhookStatus::Active.as_str()),
            webhooks::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn insert_notification_log(
        &self,
        log: CreateNotificationLogEntity,
    ) -> StoreResult<NotificationLogEntity> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(diesel::insert_into(notification_logs::table)
            .values(&log)
            .returning(NotificationLogEntity::as_returning())
            .get_result(conn)
            .await?)
    }

    async fn list_failed_webhook_notifications(
        &self,
        created_after: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> StoreResult<Vec<NotificationLogEntity>> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        Ok(notification_logs::table
            .filter(notification_logs::kind.eq(NotificationKind::Webhook.as_str()))
            .filter(notification_logs::status.eq(NotificationStatus::Failed.as_str()))
            .filter(notification_logs::webhook_id.is_not_null())
            .filter(notification_logs::created_at.gt(created_after))
            .filter(notification_logs::attempts.lt(max_attempts))
            .order_by(notification_logs::created_at.asc())
            .limit(limit)
            .select(NotificationLogEntity::as_select())
            .get_results(conn)
            .await?)
    }

    async fn update_notification_log(
        &self,
        id: Uuid,
        status: NotificationStatus,
        attempts: i32,
        last_error: Option<String>,
    ) -> StoreResult<()> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        diesel::update(notification_logs::table.find(id))
            .set((
                notification_logs::status.eq(status.as_str()),
                notification_logs::attempts.eq(attempts),
                notification_logs::last_error.eq(last_error),
                notification_logs::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn purge(&self, purge: Purge) -> StoreResult<PurgeCounts> {
        let conn = &mut self.pool.get().await.map_err(pool_error)?;

        conn.transaction(move |conn| {
            Box::pin(async move {
                let counts = match purge {
                    Purge::ExpiredTrackingCodes { now } => {
                        let cleared = diesel::update(orders::table)
                            .filter(orders::tracking_code_expires_at.le(now))
                            .set((
                                orders::tracking_code.eq(None::<String>),
                                orders::tracking_code_expires_at.eq(None::<DateTime<Utc>>),
                            ))
                            .execute(conn)
                            .await?;
                        vec![("orders", cleared)]
                    }
                    Purge::OrphanedOrders { created_before } => {
                        let doomed: Vec<i32> = orders::table
                            .filter(orders::status.eq(OrderStatus::Pending.as_str()))
                            .filter(orders::created_at.lt(created_before))
                            .select(orders::id)
                            .get_results(conn)
                            .await?;

                        let items = diesel::delete(
                            order_items::table.filter(order_items::order_id.eq_any(doomed.clone())),
                        )
                        .execute(conn)
                        .await?;
                        diesel::delete(
                            audit_logs::table.filter(audit_logs::order_id.eq_any(doomed.clone())),
                        )
                        .execute(conn)
                        .await?;
                        let orders = diesel::delete(orders::table.filter(orders::id.eq_any(doomed)))
                            .execute(conn)
                            .await?;
                        vec![("orders", orders), ("order_items", items)]
                    }
                    Purge::StaleLocks { locked_before } => {
                        let locks = diesel::delete(
                            cron_locks::table.filter(cron_locks::locked_at.lt(locked_before)),
                        )
                        .execute(conn)
                        .await?;
                        vec![("cron_locks", locks)]
                    }
                    Purge::CashData {
                        transactions_before,
                        summaries_before,
                    } => {
                        let txns = diesel::delete(
                            cash_transactions::table
                                .filter(cash_transactions::confirmed.eq(true))
                                .filter(cash_transactions::admin_verified.eq(true))
                                .filter(cash_transactions::created_at.lt(transactions_before)),
                        )
                        .execute(conn)
                        .await?;
                        let summaries = diesel::delete(
                            cash_summaries::table
                                .filter(cash_summaries::summary_date.lt(summaries_before)),
                        )
                        .execute(conn)
                        .await?;
                        vec![("cash_transactions", txns), ("cash_summaries", summaries)]
                    }
                    Purge::Reservations { before } => {
                        let terminal: Vec<&str> = ReservationStatus::ALL
                            .iter()
                            .filter(|s| s.is_terminal())
                            .map(|s| s.as_str())
                            .collect();
                        let removed = diesel::delete(
                            reservations::table
                                .filter(reservations::status.eq_any(terminal))
                                .filter(reservations::reservation_date.lt(before)),
                        )
                        .execute(conn)
                        .await?;
                        vec![("reservations", removed)]
                    }
                    Purge::Sessions { expired_before } => {
                        let removed = diesel::delete(
                            sessions::table.filter(sessions::expires_at.lt(expired_before)),
                        )
                        .execute(conn)
                        .await?;
                        vec![("sessions", removed)]
                    }
                    Purge::NotificationLogs {
                        notifications_before,
                        audit_before,
                        webhooks_deleted_before,
                    } => {
                        let logs = diesel::delete(
                            notification_logs::table
                                .filter(notification_logs::created_at.lt(notifications_before)),
                        )
                        .execute(conn)
                        .await?;
                        let audits = diesel::delete(
                            audit_logs::table.filter(audit_logs::created_at.lt(audit_before)),
                        )
                        .execute(conn)
                        .await?;
                        let hooks = diesel::delete(
                            webhooks::table.filter(webhooks::deleted_at.lt(webhooks_deleted_before)),
                        )
                        .execute(conn)
                        .await?;
                        vec![
                            ("notification_logs", logs),
                            ("audit_logs", audits),
                            ("webhooks", hooks),
                        ]
                    }
                    Purge::InactiveDrivers => {
                        let mut owning: Vec<Option<i32>> = orders::table
                            .filter(orders::driver_id.is_not_null())
                            .select(orders::driver_id)
                            .distinct()
                            .get_results(conn)
                            .await?;
                        let collectors: Vec<Option<i32>> = cash_transactions::table
                            .filter(cash_transactions::driver_id.is_not_null())
                            .select(cash_transactions::driver_id)
                            .distinct()
                            .get_results(conn)
                            .await?;
                        owning.extend(collectors);
                        let owning: Vec<i32> = owning.into_iter().flatten().collect();

                        let removed = diesel::delete(
                            drivers::table
                                .filter(drivers::active.eq(false))
                                .filter(drivers::user_id.is_null())
                                .filter(drivers::id.ne_all(owning)),
                        )
                        .execute(conn)
                        .await?;
                        vec![("drivers", removed)]
                    }
                };

                Ok::<PurgeCounts, StoreError>(counts)
            })
        })
        .await
    }
}
