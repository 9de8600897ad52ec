use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use diesel::{
    Selectable,
    prelude::{Identifiable, Insertable, Queryable},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

/// Declares a closed enum persisted as its text form in a varchar column.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("{} is not a valid {}", other, stringify!($name))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(OrderStatus {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
    Preparing => "PREPARING",
    Ready => "READY",
    OutForDelivery => "OUT_FOR_DELIVERY",
    AwaitingPayment => "AWAITING_PAYMENT",
    PaymentDisputed => "PAYMENT_DISPUTED",
    Delivered => "DELIVERED",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

text_enum!(OrderType {
    Takeout => "TAKEOUT",
    Delivery => "DELIVERY",
    DineIn => "DINE_IN",
});

text_enum!(
    /// Authenticated caller role.
    Role {
        Customer => "CUSTOMER",
        Driver => "DRIVER",
        Cook => "COOK",
        Waiter => "WAITER",
        Cashier => "CASHIER",
        Admin => "ADMIN",
        Owner => "OWNER",
    }
);

text_enum!(DriverStatus {
    Available => "Available",
    OnDelivery => "On Delivery",
    Offline => "Offline",
});

text_enum!(ReservationStatus {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
    Seated => "SEATED",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

text_enum!(WebhookStatus {
    Active => "ACTIVE",
    Disabled => "DISABLED",
    Failed => "FAILED",
});

text_enum!(NotificationKind {
    Email => "EMAIL",
    Sms => "SMS",
    Push => "PUSH",
    Webhook => "WEBHOOK",
});

text_enum!(NotificationStatus {
    Sent => "SENT",
    Failed => "FAILED",
});

impl NotificationKind {
    /// Unknown kinds fall back to webhook delivery.
    pub fn parse_or_webhook(s: &str) -> Self {
        s.to_ascii_uppercase().parse().unwrap_or(NotificationKind::Webhook)
    }
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationStatus::Completed | ReservationStatus::Cancelled)
    }
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Actor {
    pub role: Role,
    /// Staff member id; for drivers this is the driver id.
    pub id: Option<i32>,
}

impl Actor {
    pub fn new(role: Role, id: Option<i32>) -> Self {
        Self { role, id }
    }
}

// Orders

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderEntity {
    pub id: i32,
    pub order_number: String,
    pub order_type: String,
    pub status: String,
    pub total: f64,
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub delivery_address: Option<String>,
    pub driver_id: Option<i32>,
    pub cook_id: Option<i32>,
    pub cashier_id: Option<i32>,
    pub waiter_id: Option<i32>,
    #[serde(skip_serializing)]
    pub tracking_code: Option<String>,
    pub tracking_code_expires_at: Option<DateTime<Utc>>,
    pub table_number: Option<i32>,
    pub guest_count: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderEntity {
    pub fn status(&self) -> Result<OrderStatus, String> {
        self.status.parse()
    }

    pub fn order_type(&self) -> Result<OrderType, String> {
        self.order_type.parse()
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateOrderEntity {
    pub order_number: String,
    pub order_type: String,
    pub status: String,
    pub total: f64,
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub delivery_address: Option<String>,
    pub tracking_code: Option<String>,
    pub tracking_code_expires_at: Option<DateTime<Utc>>,
    pub table_number: Option<i32>,
    pub guest_count: Option<i32>,
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone, ToSchema)]
#[diesel(belongs_to(OrderEntity, foreign_key = order_id))]
#[diesel(table_name = crate::schema::order_items)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderItemEntity {
    pub id: i32,
    pub order_id: i32,
    pub menu_item_id: i32,
    pub name: String,
    pub quantity: i32,
    pub unit_price: f64,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::order_items)]
pub struct CreateOrderItemEntity {
    pub order_id: i32,
    pub menu_item_id: i32,
    pub name: String,
    pub quantity: i32,
    pub unit_price: f64,
}

/// Role-assignment columns written together with a status change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderAssignment {
    pub driver_id: Option<i32>,
    pub cook_id: Option<i32>,
    pub cashier_id: Option<i32>,
    pub waiter_id: Option<i32>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::audit_logs)]
pub struct CreateAuditLogEntity {
    pub order_id: i32,
    pub actor_role: String,
    pub actor_id: Option<i32>,
    pub from_status: String,
    pub to_status: String,
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone)]
#[diesel(table_name = crate::schema::audit_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AuditLogEntity {
    pub id: i32,
    pub order_id: i32,
    pub actor_role: String,
    pub actor_id: Option<i32>,
    pub from_status: String,
    pub to_status: String,
    pub created_at: DateTime<Utc>,
}

// Cash

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::cash_transactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CashTransactionEntity {
    pub id: i32,
    pub order_id: i32,
    pub driver_id: Option<i32>,
    pub amount: f64,
    pub confirmed: bool,
    pub admin_verified: bool,
    pub discrepancy_amount: Option<f64>,
    pub customer_notes: Option<String>,
    pub discrepancy_notes: Option<String>,
    pub payment_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::cash_transactions)]
pub struct CreateCashTransactionEntity {
    pub order_id: i32,
    pub driver_id: Option<i32>,
    pub amount: f64,
    pub discrepancy_amount: Option<f64>,
    pub customer_notes: Option<String>,
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::cash_summaries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CashSummaryEntity {
    pub id: i32,
    pub summary_date: NaiveDate,
    pub driver_id: Option<i32>,
    pub cash_total: f64,
    pub card_total: f64,
    pub order_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::cash_summaries)]
pub struct CreateCashSummaryEntity {
    pub summary_date: NaiveDate,
    pub driver_id: Option<i32>,
    pub cash_total: f64,
    pub card_total: f64,
    pub order_count: i32,
}

// Drivers

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::drivers)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DriverEntity {
    pub id: i32,
    pub name: String,
    pub current_status: String,
    pub active: bool,
    pub user_id: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::drivers)]
pub struct CreateDriverEntity {
    pub name: String,
    pub current_status: String,
    pub active: bool,
    pub user_id: Option<i32>,
}

// Reservations

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::reservations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ReservationEntity {
    pub id: i32,
    pub customer_name: String,
    pub reservation_date: NaiveDate,
    pub reservation_time: NaiveTime,
    pub party_size: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::reservations)]
pub struct CreateReservationEntity {
    pub customer_name: String,
    pub reservation_date: NaiveDate,
    pub reservation_time: NaiveTime,
    pub party_size: i32,
    pub status: String,
}

// Maintenance

#[derive(Queryable, Selectable, Serialize, Debug, Clone)]
#[diesel(table_name = crate::schema::cron_locks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CronLockEntity {
    pub id: i32,
    pub task_name: String,
    pub instance_id: String,
    pub locked_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::cron_locks)]
pub struct CreateCronLockEntity {
    pub task_name: String,
    pub instance_id: String,
    pub locked_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone)]
#[diesel(table_name = crate::schema::webhooks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct WebhookEntity {
    pub id: Uuid,
    pub url: String,
    pub status: String,
    pub integration_id: Option<String>,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone)]
#[diesel(table_name = crate::schema::notification_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NotificationLogEntity {
    pub id: Uuid,
    pub kind: String,
    pub target: String,
    pub provider: Option<String>,
    pub webhook_id: Option<Uuid>,
    pub event: Option<String>,
    pub payload: Value,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::notification_logs)]
pub struct CreateNotificationLogEntity {
    pub kind: String,
    pub target: String,
    pub provider: Option<String>,
    pub webhook_id: Option<Uuid>,
    pub event: Option<String>,
    pub payload: Value,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
}
