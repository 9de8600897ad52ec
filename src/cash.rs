//! Cash reconciliation: one cash transaction per order, cashier confirmation,
//! admin verification and daily summaries.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    error::AppError,
    models::{
        Actor, CashTransactionEntity, CreateCashSummaryEntity, CreateCashTransactionEntity,
        OrderEntity, OrderStatus, Role,
    },
    store::{CashVerification, Store, StoreError},
};

/// Rounds to whole cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CashTransactionOptions {
    pub customer_notes: Option<String>,
}

/// Cash counted by an admin during verification.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CountedCash {
    pub counted_amount: f64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CashSummary {
    pub date: NaiveDate,
    pub driver_id: Option<i32>,
    pub cash_total: f64,
    pub card_total: f64,
    pub today_total: f64,
    pub order_count: usize,
    pub avg_transaction: f64,
    /// Cash reported by drivers but not yet confirmed by a cashier.
    pub pending_cash_total: f64,
    pub discrepancy_total: f64,
}

fn new_transaction(
    order: &OrderEntity,
    driver_id: Option<i32>,
    amount: f64,
    opts: CashTransactionOptions,
) -> Result<CreateCashTransactionEntity, AppError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(AppError::Validation(
            "Cash amount must be a non-negative number".into(),
        ));
    }
    if let (Some(collector), Some(owner)) = (driver_id, order.driver_id) {
        if collector != owner {
            return Err(AppError::Validation(format!(
                "Order {} is assigned to driver {owner}",
                order.order_number
            )));
        }
    }

    let amount = round_cents(amount);
    let delta = round_cents(amount - order.total);
    Ok(CreateCashTransactionEntity {
        order_id: order.id,
        driver_id,
        amount,
        discrepancy_amount: (delta != 0.0).then_some(delta),
        customer_notes: opts.customer_notes,
    })
}

/// Maps the one-per-order unique violation to a conflict.
pub(crate) fn already_recorded(order_number: &str, err: StoreError) -> AppError {
    match err {
        StoreError::UniqueViolation(_) => {
            AppError::Conflict(format!("Order {order_number} already has a cash transaction"))
        }
        other => other.into(),
    }
}

#[derive(Clone)]
pub struct CashService {
    store: Arc<dyn Store>,
}

impl CashService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn order(&self, order_number: &str) -> Result<OrderEntity, AppError> {
        self.store
            .find_order_by_number(order_number)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {order_number}")))
    }

    async fn transaction_for(&self, order: &OrderEntity) -> Result<CashTransactionEntity, AppError> {
        self.store
            .find_cash_transaction(order.id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Cash transaction for order {}", order.order_number))
            })
    }

    /// Records the cash collected for an order. An order carries at most one.
    pub async fn create_cash_transaction_for_order(
        &self,
        order_number: &str,
        driver_id: Option<i32>,
        amount: f64,
        opts: CashTransactionOptions,
    ) -> Result<CashTransactionEntity, AppError> {
        let order = self.order(order_number).await?;
        self.create_for(&order, driver_id, amount, opts).await
    }

    /// Cash reported by `actor`. Drivers may only report for orders assigned
    /// to them and are always recorded as the collector.
    pub async fn report_collected_cash(
        &self,
        order_number: &str,
        actor: Actor,
        driver_id: Option<i32>,
        amount: f64,
        opts: CashTransactionOptions,
    ) -> Result<CashTransactionEntity, AppError> {
        let order = self.order(order_number).await?;
        let driver_id = match actor.role {
            Role::Driver => {
                if actor.id.is_none() || order.driver_id != actor.id {
                    return Err(AppError::forbidden(
                        format!("Order {order_number} is not assigned to this driver"),
                        &[Role::Cashier, Role::Admin, Role::Owner],
                    ));
                }
                actor.id
            }
            _ => driver_id,
        };
        self.create_for(&order, driver_id, amount, opts).await
    }

    async fn create_for(
        &self,
        order: &OrderEntity,
        driver_id: Option<i32>,
        amount: f64,
        opts: CashTransactionOptions,
    ) -> Result<CashTransactionEntity, AppError> {
        let order_number = order.order_number.as_str();
        let new_txn = new_transaction(order, driver_id, amount, opts)?;
        if self.store.find_cash_transaction(order.id).await?.is_some() {
            return Err(AppError::Conflict(format!(
                "Order {order_number} already has a cash transaction"
            )));
        }
        if let Some(driver_id) = driver_id {
            self.store
                .find_driver(driver_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Driver {driver_id}")))?;
        }

        let txn = self
            .store
            .create_cash_transaction(new_txn)
            .await
            .map_err(|e| already_recorded(order_number, e))?;

        info!(
            order = order_number,
            driver = ?txn.driver_id,
            amount = txn.amount,
            discrepancy = ?txn.discrepancy_amount,
            "Cash transaction created"
        );
        Ok(txn)
    }

    /// Builds the cash row a DELIVERED transition writes with its status
    /// change. `None` when the same amount is already on record; a different
    /// amount is a conflict.
    pub async fn prepare_for_delivery(
        &self,
        order: &OrderEntity,
        amount: f64,
        opts: CashTransactionOptions,
    ) -> Result<Option<CreateCashTransactionEntity>, AppError> {
        let new_txn = new_transaction(order, order.driver_id, amount, opts)?;
        match self.store.find_cash_transaction(order.id).await? {
            Some(existing) if existing.amount == new_txn.amount => Ok(None),
            Some(existing) => Err(AppError::Conflict(format!(
                "Order {} already has {:.2} in cash on record, not {:.2}",
                order.order_number, existing.amount, new_txn.amount
            ))),
            None => Ok(Some(new_txn)),
        }
    }

    /// Marks the cash as received by the cashier.
    pub async fn confirm_cash_transaction(
        &self,
        order_number: &str,
        payment_timestamp: Option<DateTime<Utc>>,
    ) -> Result<CashTransactionEntity, AppError> {
        let order = self.order(order_number).await?;
        let txn = self
            .store
            .confirm_cash_transaction(order.id, payment_timestamp.unwrap_or_else(Utc::now))
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Cash transaction for order {order_number}"))
            })?;

        info!(order = order_number, "Cash transaction confirmed");
        Ok(txn)
    }

    /// Admin sign-off. The cashier must have confirmed the cash first.
    pub async fn verify_cash_transaction(
        &self,
        order_number: &str,
        admin_verified: bool,
        counted: Option<CountedCash>,
    ) -> Result<CashTransactionEntity, AppError> {
        let order = self.order(order_number).await?;
        let txn = self.transaction_for(&order).await?;
        if !txn.confirmed {
            return Err(AppError::Validation(format!(
                "Cash for order {order_number} must be confirmed before verification"
            )));
        }

        let mut verification = CashVerification {
            admin_verified,
            ..Default::default()
        };
        if let Some(counted) = counted {
            let delta = round_cents(counted.counted_amount - txn.amount);
            if delta != 0.0 {
                verification.discrepancy_amount = Some(delta);
            }
            verification.discrepancy_notes = counted.notes;
        }

        let txn = self
            .store
            .verify_cash_transaction(order.id, verification)
            .await?
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "Cash for order {order_number} must be confirmed before verification"
                ))
            })?;

        if let Some(discrepancy) = txn.discrepancy_amount {
            warn!(order = order_number, discrepancy, "Cash verified with discrepancy");
        } else {
            info!(order = order_number, admin_verified, "Cash transaction verified");
        }
        Ok(txn)
    }

    pub async fn find_for_order(
        &self,
        order: &OrderEntity,
    ) -> Result<Option<CashTransactionEntity>, AppError> {
        Ok(self.store.find_cash_transaction(order.id).await?)
    }

    pub async fn get_cash_summary_by_driver_and_date(
        &self,
        driver_id: i32,
        date: NaiveDate,
    ) -> Result<CashSummary, AppError> {
        self.summarize(Some(driver_id), date).await
    }

    pub async fn get_cash_summary_by_date(&self, date: NaiveDate) -> Result<CashSummary, AppError> {
        self.summarize(None, date).await
    }

    async fn summarize(&self, driver_id: Option<i32>, date: NaiveDate) -> Result<CashSummary, AppError> {
        let from = date
            .and_hms_opt(0, 0, 0)
            .context("Invalid summary date")?
            .and_utc();
        let to = from + chrono::Duration::days(1);

        let orders: Vec<OrderEntity> = self
            .store
            .list_orders_between(driver_id, from, to)
            .await?
            .into_iter()
            .filter(|o| {
                matches!(
                    o.status(),
                    Ok(OrderStatus::Delivered) | Ok(OrderStatus::Completed)
                )
            })
            .collect();
        let order_ids: Vec<i32> = orders.iter().map(|o| o.id).collect();
        let txns = self
            .store
            .list_cash_transactions_for_orders(&order_ids)
            .await?;

        let mut cash_total = 0.0;
        let mut pending_cash_total = 0.0;
        let mut discrepancy_total = 0.0;
        for txn in &txns {
            if txn.confirmed {
                cash_total += txn.amount;
            } else {
                pending_cash_total += txn.amount;
            }
            discrepancy_total += txn.discrepancy_amount.unwrap_or(0.0);
        }
        let card_total: f64 = orders
            .iter()
            .filter(|o| !txns.iter().any(|t| t.order_id == o.id))
            .map(|o| o.total)
            .sum();

        let today_total = round_cents(cash_total + card_total);
        let order_count = orders.len();
        let avg_transaction = if order_count == 0 {
            0.0
        } else {
            round_cents(today_total / order_count as f64)
        };

        let summary = CashSummary {
            date,
            driver_id,
            cash_total: round_cents(cash_total),
            card_total: round_cents(card_total),
            today_total,
            order_count,
            avg_transaction,
            pending_cash_total: round_cents(pending_cash_total),
            discrepancy_total: round_cents(discrepancy_total),
        };

        let cached = CreateCashSummaryEntity {
            summary_date: date,
            driver_id,
            cash_total: summary.cash_total,
            card_total: summary.card_total,
            order_count: i32::try_from(order_count).unwrap_or(i32::MAX),
        };
        if let Err(e) = self.store.replace_cash_summary(cached).await {
            warn!(date = %date, driver = ?driver_id, error = %e, "Failed to cache cash summary");
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        models::{CreateDriverEntity, CreateOrderEntity, OrderAssignment},
        store::MemoryStore,
    };

    async fn seed_order(store: &MemoryStore, number: &str, total: f64, status: OrderStatus) -> OrderEntity {
        let (order, _) = store
            .create_order_with_items(
                CreateOrderEntity {
                    order_number: number.into(),
                    order_type: "DELIVERY".into(),
                    status: status.as_str().into(),
                    total,
                    customer_name: "Ada".into(),
                    customer_phone: None,
                    customer_email: None,
                    delivery_address: Some("1 Main St".into()),
                    tracking_code: None,
                    tracking_code_expires_at: None,
                    table_number: None,
                    guest_count: None,
                },
                Vec::new(),
            )
            .await
            .unwrap();
        order
    }

    async fn seed_driver(store: &MemoryStore) -> i32 {
        store
            .create_driver(CreateDriverEntity {
                name: "Dee".into(),
                current_status: "Available".into(),
                active: true,
                user_id: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn second_cash_transaction_for_an_order_conflicts() {
        let store = Arc::new(MemoryStore::new());
        seed_order(&store, "ORD-1", 20.0, OrderStatus::Delivered).await;
        let cash = CashService::new(store.clone());

        cash.create_cash_transaction_for_order("ORD-1", None, 20.0, Default::default())
            .await
            .unwrap();
        let err = cash
            .create_cash_transaction_for_order("ORD-1", None, 20.0, Default::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    async fn assign(store: &MemoryStore, number: &str, driver: i32) {
        store
            .update_order_status_by_number(
                number,
                OrderStatus::Ready,
                OrderStatus::OutForDelivery,
                OrderAssignment {
                    driver_id: Some(driver),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drivers_report_cash_only_for_their_own_orders() {
        let store = Arc::new(MemoryStore::new());
        seed_order(&store, "ORD-1", 20.0, OrderStatus::Ready).await;
        let owner = seed_driver(&store).await;
        let stranger = seed_driver(&store).await;
        assign(&store, "ORD-1", owner).await;
        let cash = CashService::new(store.clone());

        let err = cash
            .report_collected_cash(
                "ORD-1",
                Actor::new(Role::Driver, Some(stranger)),
                None,
                0.0,
                Default::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let txn = cash
            .report_collected_cash(
                "ORD-1",
                Actor::new(Role::Driver, Some(owner)),
                Some(stranger),
                20.0,
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(txn.driver_id, Some(owner));
    }

    #[tokio::test]
    async fn drivers_cannot_report_for_unassigned_orders() {
        let store = Arc::new(MemoryStore::new());
        seed_order(&store, "ORD-1", 20.0, OrderStatus::Ready).await;
        let driver = seed_driver(&store).await;
        let cash = CashService::new(store.clone());

        let err = cash
            .report_collected_cash(
                "ORD-1",
                Actor::new(Role::Driver, Some(driver)),
                None,
                20.0,
                Default::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn staff_cannot_credit_cash_to_another_driver() {
        let store = Arc::new(MemoryStore::new());
        seed_order(&store, "ORD-1", 20.0, OrderStatus::Ready).await;
        let owner = seed_driver(&store).await;
        let other = seed_driver(&store).await;
        assign(&store, "ORD-1", owner).await;
        let cash = CashService::new(store.clone());

        let err = cash
            .report_collected_cash(
                "ORD-1",
                Actor::new(Role::Cashier, Some(2)),
                Some(other),
                20.0,
                Default::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn delivery_cash_must_match_an_existing_record() {
        let store = Arc::new(MemoryStore::new());
        let order = seed_order(&store, "ORD-1", 20.0, OrderStatus::Delivered).await;
        let cash = CashService::new(store.clone());
        cash.create_cash_transaction_for_order("ORD-1", None, 20.0, Default::default())
            .await
            .unwrap();

        let same = cash
            .prepare_for_delivery(&order, 20.0, Default::default())
            .await
            .unwrap();
        assert!(same.is_none());

        let err = cash
            .prepare_for_delivery(&order, 0.0, Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn verification_requires_confirmation() {
        let store = Arc::new(MemoryStore::new());
        seed_order(&store, "ORD-1", 20.0, OrderStatus::Delivered).await;
        let cash = CashService::new(store.clone());
        cash.create_cash_transaction_for_order("ORD-1", None, 20.0, Default::default())
            .await
            .unwrap();

        let err = cash
            .verify_cash_transaction("ORD-1", true, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        cash.confirm_cash_transaction("ORD-1", None).await.unwrap();
        let txn = cash
            .verify_cash_transaction("ORD-1", true, None)
            .await
            .unwrap();
        assert!(txn.confirmed && txn.admin_verified);
    }

    #[tokio::test]
    async fn collected_cash_above_total_records_discrepancy() {
        let store = Arc::new(MemoryStore::new());
        seed_order(&store, "ORD-1", 42.5, OrderStatus::Delivered).await;
        let cash = CashService::new(store.clone());

        let txn = cash
            .create_cash_transaction_for_order("ORD-1", None, 45.0, Default::default())
            .await
            .unwrap();

        assert_eq!(txn.amount, 45.0);
        assert_eq!(txn.discrepancy_amount, Some(2.5));
    }

    #[tokio::test]
    async fn admin_count_overrides_discrepancy() {
        let store = Arc::new(MemoryStore::new());
        seed_order(&store, "ORD-1", 30.0, OrderStatus::Delivered).await;
        let cash = CashService::new(store.clone());
        cash.create_cash_transaction_for_order("ORD-1", None, 30.0, Default::default())
            .await
            .unwrap();
        cash.confirm_cash_transaction("ORD-1", None).await.unwrap();

        let txn = cash
            .verify_cash_transaction(
                "ORD-1",
                true,
                Some(CountedCash {
                    counted_amount: 29.0,
                    notes: Some("one coin short".into()),
                }),
            )
            .await
            .unwrap();

        assert_eq!(txn.discrepancy_amount, Some(-1.0));
        assert_eq!(txn.discrepancy_notes.as_deref(), Some("one coin short"));
    }

    #[tokio::test]
    async fn confirming_unknown_order_is_not_found() {
        let cash = CashService::new(Arc::new(MemoryStore::new()));
        let err = cash.confirm_cash_transaction("ORD-404", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn summary_splits_cash_and_card() {
        let store = Arc::new(MemoryStore::new());
        let driver = seed_driver(&store).await;
        for (number, total) in [("ORD-1", 10.0), ("ORD-2", 15.0)] {
            seed_order(&store, number, total, OrderStatus::OutForDelivery).await;
            store
                .update_order_status_by_number(
                    number,
                    OrderStatus::OutForDelivery,
                    OrderStatus::Delivered,
                    OrderAssignment {
                        driver_id: Some(driver),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let cash = CashService::new(store.clone());
        cash.create_cash_transaction_for_order("ORD-1", Some(driver), 10.0, Default::default())
            .await
            .unwrap();
        cash.confirm_cash_transaction("ORD-1", None).await.unwrap();

        let summary = cash
            .get_cash_summary_by_driver_and_date(driver, Utc::now().date_naive())
            .await
            .unwrap();

        assert_eq!(summary.cash_total, 10.0);
        assert_eq!(summary.card_total, 15.0);
        assert_eq!(summary.today_total, 25.0);
        assert_eq!(summary.order_count, 2);
        assert_eq!(summary.avg_transaction, 12.5);
        assert_eq!(store.cash_summaries().len(), 1);
    }

    #[tokio::test]
    async fn empty_day_averages_to_zero() {
        let cash = CashService::new(Arc::new(MemoryStore::new()));

        let summary = cash
            .get_cash_summary_by_date(Utc::now().date_naive())
            .await
            .unwrap();

        assert_eq!(summary.order_count, 0);
        assert_eq!(summary.avg_transaction, 0.0);
    }
}
