//! Free-form key/value maps attached to records (menu metadata, special
//! instructions).

use std::collections::BTreeMap;

/// Ordered string → JSON value map.
pub type Attributes = BTreeMap<String, serde_json::Value>;
