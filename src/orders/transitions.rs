//! Order status graph and the roles allowed to walk each edge.

use crate::models::{OrderStatus, Role};

pub struct Edge {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub roles: &'static [Role],
}

const KITCHEN: &[Role] = &[Role::Cook, Role::Cashier, Role::Admin, Role::Owner];
const FRONT_OF_HOUSE: &[Role] = &[Role::Waiter, Role::Cashier, Role::Admin, Role::Owner];
const DELIVERY: &[Role] = &[Role::Driver, Role::Cashier, Role::Admin, Role::Owner];
const TILL: &[Role] = &[Role::Cashier, Role::Admin, Role::Owner];
const MANAGEMENT: &[Role] = &[Role::Admin, Role::Owner];

pub const EDGES: &[Edge] = &[
    Edge { from: OrderStatus::Pending, to: OrderStatus::Confirmed, roles: FRONT_OF_HOUSE },
    Edge { from: OrderStatus::Confirmed, to: OrderStatus::Preparing, roles: KITCHEN },
    Edge { from: OrderStatus::Preparing, to: OrderStatus::Ready, roles: KITCHEN },
    Edge { from: OrderStatus::Ready, to: OrderStatus::OutForDelivery, roles: DELIVERY },
    Edge { from: OrderStatus::Ready, to: OrderStatus::AwaitingPayment, roles: FRONT_OF_HOUSE },
    Edge { from: OrderStatus::OutForDelivery, to: OrderStatus::Delivered, roles: DELIVERY },
    // Settles a delivery once its cash has been reconciled.
    Edge { from: OrderStatus::Delivered, to: OrderStatus::Completed, roles: TILL },
    Edge { from: OrderStatus::AwaitingPayment, to: OrderStatus::Completed, roles: TILL },
    Edge { from: OrderStatus::AwaitingPayment, to: OrderStatus::PaymentDisputed, roles: TILL },
    Edge { from: OrderStatus::PaymentDisputed, to: OrderStatus::Completed, roles: MANAGEMENT },
    Edge { from: OrderStatus::PaymentDisputed, to: OrderStatus::Cancelled, roles: MANAGEMENT },
    Edge { from: OrderStatus::Pending, to: OrderStatus::Cancelled, roles: TILL },
    Edge { from: OrderStatus::Confirmed, to: OrderStatus::Cancelled, roles: TILL },
];

pub fn edge(from: OrderStatus, to: OrderStatus) -> Option<&'static Edge> {
    EDGES.iter().find(|e| e.from == from && e.to == to)
}

pub fn next_statuses(from: OrderStatus) -> Vec<OrderStatus> {
    EDGES.iter().filter(|e| e.from == from).map(|e| e.to).collect()
}

pub fn is_terminal(status: OrderStatus) -> bool {
    !EDGES.iter().any(|e| e.from == status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_and_cancelled_are_terminal() {
        assert!(is_terminal(OrderStatus::Completed));
        assert!(is_terminal(OrderStatus::Cancelled));
        assert!(!is_terminal(OrderStatus::Delivered));
        assert!(!is_terminal(OrderStatus::Pending));
    }

    #[test]
    fn ready_branches_to_delivery_or_payment() {
        let next = next_statuses(OrderStatus::Ready);
        assert_eq!(next, vec![OrderStatus::OutForDelivery, OrderStatus::AwaitingPayment]);
    }

    #[test]
    fn drivers_only_walk_delivery_edges() {
        let driver_edges: Vec<(OrderStatus, OrderStatus)> = EDGES
            .iter()
            .filter(|e| e.roles.contains(&Role::Driver))
            .map(|e| (e.from, e.to))
            .collect();
        assert_eq!(
            driver_edges,
            vec![
                (OrderStatus::Ready, OrderStatus::OutForDelivery),
                (OrderStatus::OutForDelivery, OrderStatus::Delivered),
            ]
        );
    }

    #[test]
    fn no_self_edges() {
        for status in OrderStatus::ALL {
            assert!(edge(*status, *status).is_none());
        }
    }

    #[test]
    fn customers_cannot_move_orders() {
        assert!(EDGES.iter().all(|e| !e.roles.contains(&Role::Customer)));
    }
}
