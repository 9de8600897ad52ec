//! Guest tracking codes and the masked view they unlock.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use tokio::time::Instant;
use utoipa::ToSchema;

use crate::models::{OrderEntity, OrderItemEntity};

pub const TRACKING_CODE_LEN: usize = 8;

const MAX_FAILED_LOOKUPS: u32 = 5;
const FAILED_LOOKUP_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Random upper-case alphanumeric string.
pub fn random_code(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect()
}

/// Keeps the first and last character and stars out the rest.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    match chars.len() {
        0 => String::new(),
        1 => "*".into(),
        2 => format!("{}*", chars[0]),
        n => {
            let mut masked = String::with_capacity(n);
            masked.push(chars[0]);
            masked.extend(std::iter::repeat_n('*', n - 2));
            masked.push(chars[n - 1]);
            masked
        }
    }
}

#[derive(Serialize, Debug, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackedOrder {
    pub order_number: String,
    pub order_type: String,
    pub status: String,
    pub total: f64,
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub delivery_address: Option<String>,
    pub items: Vec<OrderItemEntity>,
    pub tracking_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedOrder {
    pub fn masked(order: OrderEntity, items: Vec<OrderItemEntity>) -> Self {
        Self {
            order_number: order.order_number,
            order_type: order.order_type,
            status: order.status,
            total: order.total,
            customer_name: mask(&order.customer_name),
            customer_phone: order.customer_phone.as_deref().map(mask),
            customer_email: order.customer_email.as_deref().map(mask),
            delivery_address: order.delivery_address.as_deref().map(mask),
            items,
            tracking_expires_at: order.tracking_code_expires_at,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// Counts failed lookups per order number to stop code guessing.
#[derive(Default)]
pub struct TrackingGuard {
    failures: Mutex<HashMap<String, (u32, Instant)>>,
}

impl TrackingGuard {
    pub fn is_blocked(&self, order_number: &str) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.get(order_number) {
            Some((_, since)) if since.elapsed() > FAILED_LOOKUP_WINDOW => {
                failures.remove(order_number);
                false
            }
            Some((count, _)) => *count >= MAX_FAILED_LOOKUPS,
            None => false,
        }
    }

    /// Counts a failed lookup and drops entries whose window has passed.
    pub fn record_failure(&self, order_number: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.retain(|_, (_, since)| since.elapsed() <= FAILED_LOOKUP_WINDOW);
        let entry = failures
            .entry(order_number.to_string())
            .or_insert((0, Instant::now()));
        entry.0 += 1;
    }

    /// Order numbers currently being counted.
    pub fn tracked(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn reset(&self, order_number: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(order_number);
    }
}
