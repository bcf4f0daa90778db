//! Orders domain module.
//!
//! Order lifecycle, placement validation, price snapshotting and the
//! aggregated ingredient consumption an order implies. Pure domain logic; the
//! fulfillment engine in `brewline-infra` drives it inside a transaction.

pub mod order;
pub mod placement;
pub mod status;

pub use order::{Order, OrderId, OrderItem, OrderLineView, OrderView, StatusChange};
pub use placement::{Consumption, NewOrder, OrderLineRequest, PlaceOrder, ValidatedLine, ValidatedOrder};
pub use status::{OrderStatus, PaymentMethod};
