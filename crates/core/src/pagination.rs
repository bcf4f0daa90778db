//! Page requests and page envelopes for list accessors.
//!
//! Sorting is restricted to a fixed set of keys; each accessor declares the
//! subset it accepts and storage backends map keys to columns themselves, so a
//! caller-supplied string never reaches a query.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Sort keys understood by list accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Id,
    Name,
    Price,
    Quantity,
    Total,
    CreatedAt,
    UpdatedAt,
}

impl SortKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Id => "id",
            SortKey::Name => "name",
            SortKey::Price => "price",
            SortKey::Quantity => "quantity",
            SortKey::Total => "total",
            SortKey::CreatedAt => "created_at",
            SortKey::UpdatedAt => "updated_at",
        }
    }
}

impl core::fmt::Display for SortKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "id" => Ok(SortKey::Id),
            "name" => Ok(SortKey::Name),
            "price" => Ok(SortKey::Price),
            "quantity" => Ok(SortKey::Quantity),
            "total" => Ok(SortKey::Total),
            "created_at" => Ok(SortKey::CreatedAt),
            "updated_at" => Ok(SortKey::UpdatedAt),
            other => Err(DomainError::validation(format!("unknown sort key '{other}'"))),
        }
    }
}

/// A 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    pub sort_by: Option<SortKey>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort_by: None,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32, sort_by: Option<SortKey>) -> Self {
        Self {
            page,
            page_size,
            sort_by,
        }
    }

    /// Check bounds and that the sort key is one the accessor supports.
    pub fn validate(&self, allowed: &[SortKey]) -> DomainResult<()> {
        if self.page == 0 {
            return Err(DomainError::validation("page must be at least 1"));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(DomainError::validation(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if let Some(key) = self.sort_by {
            if !allowed.contains(&key) {
                return Err(DomainError::validation(format!(
                    "cannot sort by '{key}'"
                )));
            }
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }

    /// The sort key, defaulting to `id`.
    pub fn sort_key(&self) -> SortKey {
        self.sort_by.unwrap_or(SortKey::Id)
    }
}

/// A page of results plus the numbers needed for pagination controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub current_page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u64,
    pub has_next_page: bool,
    pub data: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(request: &PageRequest, total_items: u64, data: Vec<T>) -> Self {
        let total_pages = total_pages(total_items, request.page_size);
        Self {
            current_page: request.page,
            page_size: request.page_size,
            total_items,
            total_pages,
            has_next_page: u64::from(request.page) < total_pages,
            data,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            current_page: self.current_page,
            page_size: self.page_size,
            total_items: self.total_items,
            total_pages: self.total_pages,
            has_next_page: self.has_next_page,
            data: self.data.into_iter().map(f).collect(),
        }
    }
}

/// `ceil(total_items / page_size)`; zero when the page size is zero.
pub fn total_pages(total_items: u64, page_size: u32) -> u64 {
    if page_size == 0 {
        return 0;
    }
    total_items.div_ceil(u64::from(page_size))
}
