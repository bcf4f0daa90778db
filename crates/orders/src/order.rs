use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use brewline_core::{Attributes, DomainError, DomainResult, Entity, Timestamped};
use brewline_menu::MenuItemId;

use crate::placement::NewOrder;
use crate::status::{OrderStatus, PaymentMethod};

brewline_core::record_id!(OrderId, "OrderId");

/// Order line with the name and unit price captured when the order was placed.
///
/// `menu_item_id` is a snapshot reference; later menu edits or deletes do not
/// touch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub menu_item_id: MenuItemId,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
}

impl OrderItem {
    pub fn line_total(&self) -> DomainResult<Decimal> {
        self.unit_price
            .checked_mul(Decimal::from(self.quantity))
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "line total for menu item {} exceeds the representable range",
                    self.menu_item_id
                ))
            })
    }
}

/// Sum of the line totals, failing instead of overflowing.
pub(crate) fn sum_line_totals(items: &[OrderItem]) -> DomainResult<Decimal> {
    items.iter().try_fold(Decimal::ZERO, |total, item| {
        total.checked_add(item.line_total()?).ok_or_else(|| {
            DomainError::validation("order total exceeds the representable range")
        })
    })
}

/// A placed order.
///
/// The total is always the sum of the line totals; it is computed on
/// construction and never set directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    customer_name: String,
    total: Decimal,
    status: OrderStatus,
    payment_method: PaymentMethod,
    special_instructions: Attributes,
    items: Vec<OrderItem>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Order {
    /// A freshly inserted order: status `pending`, both timestamps `at`.
    pub fn placed(id: OrderId, new: NewOrder, at: DateTime<Utc>) -> DomainResult<Self> {
        Self::restore(
            id,
            new.customer_name,
            OrderStatus::Pending,
            new.payment_method,
            new.special_instructions,
            new.items,
            at,
            at,
        )
    }

    /// Rebuild an order from persisted state.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: OrderId,
        customer_name: String,
        status: OrderStatus,
        payment_method: PaymentMethod,
        special_instructions: Attributes,
        items: Vec<OrderItem>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let total = sum_line_totals(&items)?;
        Ok(Self {
            id,
            customer_name,
            total,
            status,
            payment_method,
            special_instructions,
            items,
            created_at,
            updated_at,
        })
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn customer_name(&self) -> &str {
        &self.customer_name
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    pub fn special_instructions(&self) -> &Attributes {
        &self.special_instructions
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    /// Move to `next`, returning the previous status.
    pub fn transition_to(&mut self, next: OrderStatus) -> DomainResult<OrderStatus> {
        let previous = self.status;
        self.status = previous.transition(next)?;
        Ok(previous)
    }

    /// Check the stored total against the lines.
    pub fn ensure_consistent_total(&self, stored_total: Decimal) -> DomainResult<()> {
        if stored_total != self.total {
            return Err(DomainError::invariant(format!(
                "order {} total {} does not match its lines ({})",
                self.id, stored_total, self.total
            )));
        }
        Ok(())
    }
}

impl Entity for Order {
    const KIND: &'static str = "order";
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Timestamped for Order {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

/// One recorded status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub order_id: OrderId,
    pub previous: OrderStatus,
    pub next: OrderStatus,
    pub changed_at: DateTime<Utc>,
}

/// Line shape returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineView {
    pub menu_item_id: i64,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub line_total: Decimal,
}

/// Order shape returned to callers: enum values rendered as strings and line
/// totals spelled out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    pub id: i64,
    pub customer_name: String,
    pub status: String,
    pub payment_method: String,
    pub special_instructions: Attributes,
    pub items: Vec<OrderLineView>,
    pub total: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<&Order> for OrderView {
    type Error = DomainError;

    fn try_from(order: &Order) -> DomainResult<Self> {
        let items = order
            .items
            .iter()
            .map(|item| {
                Ok(OrderLineView {
                    menu_item_id: item.menu_item_id.get(),
                    name: item.name.clone(),
                    unit_price: item.unit_price,
                    quantity: item.quantity,
                    line_total: item.line_total()?,
                })
            })
            .collect::<DomainResult<Vec<_>>>()?;

        Ok(Self {
            id: order.id.get(),
            customer_name: order.customer_name.clone(),
            status: order.status.as_str().to_string(),
            payment_method: order.payment_method.as_str().to_string(),
            special_instructions: order.special_instructions.clone(),
            items,
            total: order.total,
            created_at: order.created_at,
            updated_at: order.updated_at,
        })
    }
}
