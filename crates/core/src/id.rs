//! Strongly-typed identifiers used across the domain.
//!
//! Records are keyed by database-assigned 64-bit integers. Each bounded context
//! declares its own newtype with [`record_id!`] so ids of different tables
//! cannot be mixed up.

/// Declare an integer record identifier newtype.
///
/// ```ignore
/// brewline_core::record_id!(InventoryItemId, "InventoryItemId");
/// ```
#[macro_export]
macro_rules! record_id {
    ($t:ident, $name:literal) => {
        #[derive(
            Debug,
            Copy,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $t(i64);

        impl $t {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl core::str::FromStr for $t {
            type Err = $crate::DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = s.trim().parse::<i64>().map_err(|e| {
                    $crate::DomainError::validation(format!("{}: {}", $name, e))
                })?;
                if value <= 0 {
                    return Err($crate::DomainError::validation(format!(
                        "{}: must be positive",
                        $name
                    )));
                }
                Ok(Self(value))
            }
        }
    };
}
