use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{CashVerification, Purge, PurgeCounts, Store, StoreError, StoreResult};
use crate::models::{
    AuditLogEntity, CashSummaryEntity, CashTransactionEntity, CreateAuditLogEntity,
    CreateCashSummaryEntity, CreateCashTransactionEntity, CreateCronLockEntity,
    CreateDriverEntity, CreateNotificationLogEntity, CreateOrderEntity, CreateOrderItemEntity,
    CreateReservationEntity, CronLockEntity, DriverEntity, DriverStatus, NotificationKind,
    NotificationLogEntity, NotificationStatus, OrderAssignment, OrderEntity, OrderItemEntity,
    OrderStatus, ReservationEntity, ReservationStatus, WebhookEntity, WebhookStatus,
};

#[derive(Default)]
struct Tables {
    next_id: i32,
    orders: Vec<OrderEntity>,
    order_items: Vec<OrderItemEntity>,
    audit_logs: Vec<AuditLogEntity>,
    drivers: Vec<DriverEntity>,
    cash_transactions: Vec<CashTransactionEntity>,
    cash_summaries: Vec<CashSummaryEntity>,
    reservations: Vec<ReservationEntity>,
    cron_locks: HashMap<String, CronLockEntity>,
    webhooks: Vec<WebhookEntity>,
    notification_logs: Vec<NotificationLogEntity>,
    sessions: Vec<(Uuid, i32, DateTime<Utc>)>,
}

impl Tables {
    fn next_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    fn movable_order(&self, order_number: &str, from: OrderStatus) -> Option<usize> {
        self.orders
            .iter()
            .position(|o| o.order_number == order_number && o.status == from.as_str())
    }

    fn move_order(&mut self, index: usize, to: OrderStatus, assignment: OrderAssignment) -> OrderEntity {
        let order = &mut self.orders[index];
        order.status = to.as_str().to_string();
        if assignment.driver_id.is_some() {
            order.driver_id = assignment.driver_id;
        }
        if assignment.cook_id.is_some() {
            order.cook_id = assignment.cook_id;
        }
        if assignment.cashier_id.is_some() {
            order.cashier_id = assignment.cashier_id;
        }
        if assignment.waiter_id.is_some() {
            order.waiter_id = assignment.waiter_id;
        }
        order.updated_at = Utc::now();
        order.clone()
    }

    fn check_cash_unique(&self, order_id: i32) -> StoreResult<()> {
        if self.cash_transactions.iter().any(|c| c.order_id == order_id) {
            return Err(StoreError::UniqueViolation(format!(
                "cash transaction for order {order_id} already exists"
            )));
        }
        Ok(())
    }

    fn insert_cash(&mut self, txn: CreateCashTransactionEntity) -> CashTransactionEntity {
        let now = Utc::now();
        let txn = CashTransactionEntity {
            id: self.next_id(),
            order_id: txn.order_id,
            driver_id: txn.driver_id,
            amount: txn.amount,
            confirmed: false,
            admin_verified: false,
            discrepancy_amount: txn.discrepancy_amount,
            customer_notes: txn.customer_notes,
            discrepancy_notes: None,
            payment_timestamp: None,
            created_at: now,
            updated_at: now,
        };
        self.cash_transactions.push(txn.clone());
        txn
    }
}

/// In-process [`Store`] with the same constraint semantics as the SQL schema.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    transient_lock_failures: AtomicU32,
    transient_cash_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        // A poisoned lock only means another test thread panicked mid-write.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next `count` lock inserts fail with a serialization error.
    pub fn fail_next_lock_inserts(&self, count: u32) {
        self.transient_lock_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` cash inserts fail with a dropped connection.
    pub fn fail_next_cash_inserts(&self, count: u32) {
        self.transient_cash_failures.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32, message: &str) -> StoreResult<()> {
        let pending = counter.load(Ordering::SeqCst);
        if pending > 0 {
            counter.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Transient(message.to_string()));
        }
        Ok(())
    }

    pub fn add_webhook(&self, url: &str, integration_id: Option<&str>) -> WebhookEntity {
        let now = Utc::now();
        let webhook = WebhookEntity {
            id: Uuid::new_v4(),
            url: url.to_string(),
            status: WebhookStatus::Active.as_str().to_string(),
            integration_id: integration_id.map(str::to_string),
            details: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.tables().webhooks.push(webhook.clone());
        webhook
    }

    pub fn add_session(&self, user_id: i32, expires_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.tables().sessions.push((id, user_id, expires_at));
        id
    }

    pub fn audit_logs(&self) -> Vec<AuditLogEntity> {
        self.tables().audit_logs.clone()
    }

    pub fn notification_logs(&self) -> Vec<NotificationLogEntity> {
        self.tables().notification_logs.clone()
    }

    pub fn webhooks(&self) -> Vec<WebhookEntity> {
        self.tables().webhooks.clone()
    }

    pub fn cash_summaries(&self) -> Vec<CashSummaryEntity> {
        self.tables().cash_summaries.clone()
    }

    pub fn session_count(&self) -> usize {
        self.tables().sessions.len()
    }
}

fn retain_counting<T>(rows: &mut Vec<T>, mut keep: impl FnMut(&T) -> bool) -> usize {
    let before = rows.len();
    rows.retain(|row| keep(row));
    before - rows.len()
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_order_with_items(
        &self,
        order: CreateOrderEntity,
        items: Vec<CreateOrderItemEntity>,
    ) -> StoreResult<(OrderEntity, Vec<OrderItemEntity>)> {
        let mut t = self.tables();
        if t.orders.iter().any(|o| o.order_number == order.order_number) {
            return Err(StoreError::UniqueViolation(format!(
                "order_number {} already exists",
                order.order_number
            )));
        }

        let now = Utc::now();
        let order = OrderEntity {
            id: t.next_id(),
            order_number: order.order_number,
            order_type: order.order_type,
            status: order.status,
            total: order.total,
            customer_name: order.customer_name,
            customer_phone: order.customer_phone,
            customer_email: order.customer_email,
            delivery_address: order.delivery_address,
            driver_id: None,
            cook_id: None,
            cashier_id: None,
            waiter_id: None,
            tracking_code: order.tracking_code,
            tracking_code_expires_at: order.tracking_code_expires_at,
            table_number: order.table_number,
            guest_count: order.guest_count,
            created_at: now,
            updated_at: now,
        };

        let mut created_items = Vec::with_capacity(items.len());
        for item in items {
            let item = OrderItemEntity {
                id: t.next_id(),
                order_id: order.id,
                menu_item_id: item.menu_item_id,
                name: item.name,
                quantity: item.quantity,
                unit_price: item.unit_price,
            };
            created_items.push(item);
        }

        t.orders.push(order.clone());
        t.order_items.extend(created_items.iter().cloned());
        Ok((order, created_items))
    }

    async fn find_order_by_number(&self, order_number: &str) -> StoreResult<Option<OrderEntity>> {
        Ok(self
            .tables()
            .orders
            .iter()
            .find(|o| o.order_number == order_number)
            .cloned())
    }

    async fn find_order_items(&self, order_id: i32) -> StoreResult<Vec<OrderItemEntity>> {
        Ok(self
            .tables()
            .order_items
            .iter()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn update_order_status_by_number(
        &self,
        order_number: &str,
        from: OrderStatus,
        to: OrderStatus,
        assignment: OrderAssignment,
    ) -> StoreResult<Option<OrderEntity>> {
        let mut t = self.tables();
        Ok(t
            .movable_order(order_number, from)
            .map(|index| t.move_order(index, to, assignment)))
    }

    async fn update_order_status_with_cash(
        &self,
        order_number: &str,
        from: OrderStatus,
        to: OrderStatus,
        assignment: OrderAssignment,
        cash: CreateCashTransactionEntity,
    ) -> StoreResult<Option<(OrderEntity, CashTransactionEntity)>> {
        let mut t = self.tables();
        let Some(index) = t.movable_order(order_number, from) else {
            return Ok(None);
        };
        Self::take_failure(&self.transient_cash_failures, "connection closed during cash insert")?;
        t.check_cash_unique(cash.order_id)?;

        let order = t.move_order(index, to, assignment);
        let txn = t.insert_cash(cash);
        Ok(Some((order, txn)))
    }

    async fn set_order_tracking(
        &self,
        order_id: i32,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut t = self.tables();
        let order = t
            .orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or(StoreError::NotFound)?;
        order.tracking_code = Some(code.to_string());
        order.tracking_code_expires_at = Some(expires_at);
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn get_order_for_tracking(
        &self,
        order_number: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OrderEntity>> {
        Ok(self
            .tables()
            .orders
            .iter()
            .find(|o| {
                o.order_number == order_number
                    && o.tracking_code.as_deref() == Some(code)
                    && o.tracking_code_expires_at.is_some_and(|exp| exp > now)
            })
            .cloned())
    }

    async fn insert_audit_log(&self, entry: CreateAuditLogEntity) -> StoreResult<()> {
        let mut t = self.tables();
        let id = t.next_id();
        t.audit_logs.push(AuditLogEntity {
            id,
            order_id: entry.order_id,
            actor_role: entry.actor_role,
            actor_id: entry.actor_id,
            from_status: entry.from_status,
            to_status: entry.to_status,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_orders_between(
        &self,
        driver_id: Option<i32>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<OrderEntity>> {
        Ok(self
            .tables()
            .orders
            .iter()
            .filter(|o| o.created_at >= from && o.created_at < to)
            .filter(|o| driver_id.is_none() || o.driver_id == driver_id)
            .cloned()
            .collect())
    }

    async fn create_driver(&self, driver: CreateDriverEntity) -> StoreResult<DriverEntity> {
        let mut t = self.tables();
        let now = Utc::now();
        let driver = DriverEntity {
            id: t.next_id(),
            name: driver.name,
            current_status: driver.current_status,
            active: driver.active,
            user_id: driver.user_id,
            created_at: now,
            updated_at: now,
        };
        t.drivers.push(driver.clone());
        Ok(driver)
    }

    async fn find_driver(&self, id: i32) -> StoreResult<Option<DriverEntity>> {
        Ok(self.tables().drivers.iter().find(|d| d.id == id).cloned())
    }

    async fn set_driver_status(&self, id: i32, status: DriverStatus) -> StoreResult<()> {
        let mut t = self.tables();
        let driver = t
            .drivers
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(StoreError::NotFound)?;
        driver.current_status = status.as_str().to_string();
        driver.updated_at = Utc::now();
        Ok(())
    }

    async fn create_cash_transaction(
        &self,
        txn: CreateCashTransactionEntity,
    ) -> StoreResult<CashTransactionEntity> {
        Self::take_failure(&self.transient_cash_failures, "connection closed during cash insert")?;
        let mut t = self.tables();
        t.check_cash_unique(txn.order_id)?;
        Ok(t.insert_cash(txn))
    }

    async fn find_cash_transaction(
        &self,
        order_id: i32,
    ) -> StoreResult<Option<CashTransactionEntity>> {
        Ok(self
            .tables()
            .cash_transactions
            .iter()
            .find(|c| c.order_id == order_id)
            .cloned())
    }

    async fn confirm_cash_transaction(
        &self,
        order_id: i32,
        payment_timestamp: DateTime<Utc>,
    ) -> StoreResult<Option<CashTransactionEntity>> {
        let mut t = self.tables();
        let Some(txn) = t.cash_transactions.iter_mut().find(|c| c.order_id == order_id) else {
            return Ok(None);
        };
        txn.confirmed = true;
        txn.payment_timestamp = Some(payment_timestamp);
        txn.updated_at = Utc::now();
        Ok(Some(txn.clone()))
    }

    async fn verify_cash_transaction(
        &self,
        order_id: i32,
        verification: CashVerification,
    ) -> StoreResult<Option<CashTransactionEntity>> {
        let mut t = self.tables();
        let Some(txn) = t
            .cash_transactions
            .iter_mut()
            .find(|c| c.order_id == order_id && c.confirmed)
        else {
            return Ok(None);
        };
        txn.admin_verified = verification.admin_verified;
        if verification.discrepancy_amount.is_some() {
            txn.discrepancy_amount = verification.discrepancy_amount;
        }
        if verification.discrepancy_notes.is_some() {
            txn.discrepancy_notes = verification.discrepancy_notes;
        }
        txn.updated_at = Utc::now();
        Ok(Some(txn.clone()))
    }

    async fn list_cash_transactions_for_orders(
        &self,
        order_ids: &[i32],
    ) -> StoreResult<Vec<CashTransactionEntity>> {
        Ok(self
            .tables()
            .cash_transactions
            .iter()
            .filter(|c| order_ids.contains(&c.order_id))
            .cloned()
            .collect())
    }

    async fn replace_cash_summary(
        &self,
        summary: CreateCashSummaryEntity,
    ) -> StoreResult<CashSummaryEntity> {
        let mut t = self.tables();
        t.cash_summaries.retain(|s| {
            !(s.summary_date == summary.summary_date && s.driver_id == summary.driver_id)
        });
        let summary = CashSummaryEntity {
            id: t.next_id(),
            summary_date: summary.summary_date,
            driver_id: summary.driver_id,
            cash_total: summary.cash_total,
            card_total: summary.card_total,
            order_count: summary.order_count,
            created_at: Utc::now(),
        };
        t.cash_summaries.push(summary.clone());
        Ok(summary)
    }

    async fn reserved_seats(&self, date: NaiveDate, time: NaiveTime) -> StoreResult<i64> {
        Ok(self
            .tables()
            .reservations
            .iter()
            .filter(|r| r.reservation_date == date && r.reservation_time == time)
            .filter(|r| r.status != ReservationStatus::Cancelled.as_str())
            .map(|r| i64::from(r.party_size))
            .sum())
    }

    async fn create_reservation(
        &self,
        reservation: CreateReservationEntity,
    ) -> StoreResult<ReservationEntity> {
        let mut t = self.tables();
        let now = Utc::now();
        let reservation = ReservationEntity {
            id: t.next_id(),
            customer_name: reservation.customer_name,
            reservation_date: reservation.reservation_date,
            reservation_time: reservation.reservation_time,
            party_size: reservation.party_size,
            status: reservation.status,
            created_at: now,
            updated_at: now,
        };
        t.reservations.push(reservation.clone());
        Ok(reservation)
    }

    async fn insert_lock(&self, lock: CreateCronLockEntity) -> StoreResult<CronLockEntity> {
        Self::take_failure(
            &self.transient_lock_failures,
            "could not serialize access due to concurrent update",
        )?;

        let mut t = self.tables();
        if t.cron_locks.contains_key(&lock.task_name) {
            return Err(StoreError::UniqueViolation(format!(
                "cron lock {} already exists",
                lock.task_name
            )));
        }
        let row = CronLockEntity {
            id: t.next_id(),
            task_name: lock.task_name,
            instance_id: lock.instance_id,
            locked_at: lock.locked_at,
        };
        t.cron_locks.insert(row.task_name.clone(), row.clone());
        Ok(row)
    }

    async fn find_lock(&self, task_name: &str) -> StoreResult<Option<CronLockEntity>> {
        Ok(self.tables().cron_locks.get(task_name).cloned())
    }

    async fn replace_stale_lock(
        &self,
        task_name: &str,
        instance_id: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut t = self.tables();
        match t.cron_locks.get_mut(task_name) {
            Some(row) if row.locked_at < stale_before => {
                row.instance_id = instance_id.to_string();
                row.locked_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_lock(&self, task_name: &str) -> StoreResult<bool> {
        Ok(self.tables().cron_locks.remove(task_name).is_some())
    }

    async fn list_active_webhooks(&self) -> StoreResult<Vec<WebhookEntity>> {
        Ok(self
            .tables()
            .webhooks
            .iter()
            .filter(|w| w.status == WebhookStatus::Active.as_str() && w.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn find_webhook(&self, id: Uuid) -> StoreResult<Option<WebhookEntity>> {
        Ok(self.tables().webhooks.iter().find(|w| w.id == id).cloned())
    }

    async fn record_webhook_failure(&self, id: Uuid, details: Value) -> StoreResult<()> {
        let mut t = self.tables();
        let webhook = t
            .webhooks
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or(StoreError::NotFound)?;
        webhook.status = WebhookStatus::Failed.as_str().to_string();
        webhook.details = Some(details);
        webhook.updated_at = Utc::now();
        Ok(())
    }

    async fn restore_webhook(&self, id: Uuid) -> StoreResult<()> {
        let mut t = self.tables();
        if let Some(webhook) = t
            .webhooks
            .iter_mut()
            .find(|w| w.id == id && w.status == WebhookStatus::Failed.as_str())
        {
            webhook.status = WebhookStatus::Active.as_str().to_string();
            webhook.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_notification_log(
        &self,
        log: CreateNotificationLogEntity,
    ) -> StoreResult<NotificationLogEntity> {
        let now = Utc::now();
        let log = NotificationLogEntity {
            id: Uuid::new_v4(),
            kind: log.kind,
            target: log.target,
            provider: log.provider,
            webhook_id: log.webhook_id,
            event: log.event,
            payload: log.payload,
            status: log.status,
            attempts: log.attempts,
            last_error: log.last_error,
            created_at: now,
            updated_at: now,
        };
        self.tables().notification_logs.push(log.clone());
        Ok(log)
    }

    async fn list_failed_webhook_notifications(
        &self,
        created_after: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> StoreResult<Vec<NotificationLogEntity>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .tables()
            .notification_logs
            .iter()
            .filter(|n| {
                n.kind == NotificationKind::Webhook.as_str()
                    && n.status == NotificationStatus::Failed.as_str()
                    && n.webhook_id.is_some()
                    && n.created_at > created_after
                    && n.attempts < max_attempts
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_notification_log(
        &self,
        id: Uuid,
        status: NotificationStatus,
        attempts: i32,
        last_error: Option<String>,
    ) -> StoreResult<()> {
        let mut t = self.tables();
        let log = t
            .notification_logs
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(StoreError::NotFound)?;
        log.status = status.as_str().to_string();
        log.attempts = attempts;
        log.last_error = last_error;
        log.updated_at = Utc::now();
        Ok(())
    }

    async fn purge(&self, purge: Purge) -> StoreResult<PurgeCounts> {
        let mut t = self.tables();
        let counts = match purge {
            Purge::ExpiredTrackingCodes { now } => {
                let mut cleared = 0;
                for order in t.orders.iter_mut() {
                    if order.tracking_code_expires_at.is_some_and(|exp| exp <= now) {
                        order.tracking_code = None;
                        order.tracking_code_expires_at = None;
                        cleared += 1;
                    }
                }
                vec![("orders", cleared)]
            }
            Purge::OrphanedOrders { created_before } => {
                let pending = OrderStatus::Pending.as_str();
                let doomed: Vec<i32> = t
                    .orders
                    .iter()
                    .filter(|o| o.status == pending && o.created_at < created_before)
                    .map(|o| o.id)
                    .collect();
                let items = retain_counting(&mut t.order_items, |i| !doomed.contains(&i.order_id));
                t.audit_logs.retain(|a| !doomed.contains(&a.order_id));
                let orders = retain_counting(&mut t.orders, |o| !doomed.contains(&o.id));
                vec![("orders", orders), ("order_items", items)]
            }
            Purge::StaleLocks { locked_before } => {
                let before = t.cron_locks.len();
                t.cron_locks.retain(|_, l| l.locked_at >= locked_before);
                vec![("cron_locks", before - t.cron_locks.len())]
            }
            Purge::CashData {
                transactions_before,
                summaries_before,
            } => {
                let txns = retain_counting(&mut t.cash_transactions, |c| {
                    !(c.confirmed && c.admin_verified && c.created_at < transactions_before)
                });
                let summaries = retain_counting(&mut t.cash_summaries, |s| {
                    s.summary_date >= summaries_before
                });
                vec![("cash_transactions", txns), ("cash_summaries", summaries)]
            }
            Purge::Reservations { before } => {
                let removed = retain_counting(&mut t.reservations, |r| {
                    let terminal = r
                        .status
                        .parse::<ReservationStatus>()
                        .is_ok_and(|s| s.is_terminal());
                    !(terminal && r.reservation_date < before)
                });
                vec![("reservations", removed)]
            }
            Purge::Sessions { expired_before } => {
                let removed = retain_counting(&mut t.sessions, |(_, _, exp)| *exp >= expired_before);
                vec![("sessions", removed)]
            }
            Purge::NotificationLogs {
                notifications_before,
                audit_before,
                webhooks_deleted_before,
            } => {
                let logs = retain_counting(&mut t.notification_logs, |n| {
                    n.created_at >= notifications_before
                });
                let audits = retain_counting(&mut t.audit_logs, |a| a.created_at >= audit_before);
                let hooks = retain_counting(&mut t.webhooks, |w| {
                    !w.deleted_at.is_some_and(|d| d < webhooks_deleted_before)
                });
                vec![
                    ("notification_logs", logs),
                    ("audit_logs", audits),
                    ("webhooks", hooks),
                ]
            }
            Purge::InactiveDrivers => {
                let owning: Vec<i32> = t
                    .orders
                    .iter()
                    .filter_map(|o| o.driver_id)
                    .chain(t.cash_transactions.iter().filter_map(|c| c.driver_id))
                    .collect();
                let removed = retain_counting(&mut t.drivers, |d| {
                    d.active || d.user_id.is_some() || owning.contains(&d.id)
                });
                vec![("drivers", removed)]
            }
        };
        Ok(counts)
    }
}
