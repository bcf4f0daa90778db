//! Stock movements: the append-only trail of quantity changes.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use brewline_core::DomainError;

use crate::item::InventoryItemId;

/// Why a quantity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementKind {
    Restock,
    Usage,
    Waste,
}

impl MovementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementKind::Restock => "restock",
            MovementKind::Usage => "usage",
            MovementKind::Waste => "waste",
        }
    }

    /// Classify a manual quantity change.
    pub fn for_adjustment(delta: Decimal) -> Self {
        if delta >= Decimal::ZERO {
            MovementKind::Restock
        } else {
            MovementKind::Waste
        }
    }
}

impl FromStr for MovementKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restock" => Ok(MovementKind::Restock),
            "usage" => Ok(MovementKind::Usage),
            "waste" => Ok(MovementKind::Waste),
            other => Err(DomainError::validation(format!(
                "unknown movement kind '{other}'"
            ))),
        }
    }
}

/// One recorded quantity change. `delta` is signed: negative for stock leaving.
///
/// `order_id` is the raw id of the order that consumed the stock, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub item_id: InventoryItemId,
    pub kind: MovementKind,
    pub delta: Decimal,
    pub order_id: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn usage(
        item_id: InventoryItemId,
        amount: Decimal,
        order_id: i64,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id,
            kind: MovementKind::Usage,
            delta: -amount,
            order_id: Some(order_id),
            recorded_at,
        }
    }

    pub fn adjustment(item_id: InventoryItemId, delta: Decimal, recorded_at: DateTime<Utc>) -> Self {
        Self {
            item_id,
            kind: MovementKind::for_adjustment(delta),
            delta,
            order_id: None,
            recorded_at,
        }
    }
}
