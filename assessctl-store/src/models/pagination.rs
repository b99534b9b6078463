//! Limit/offset pagination for list queries

use serde::{Deserialize, Serialize};

/// Maximum rows returned by one list call
pub const MAX_LIMIT: u32 = 500;

/// Default rows per list call
const DEFAULT_LIMIT: u32 = 50;

/// Pagination window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Rows to return (1..=500)
    pub limit: u32,
    /// Rows to skip
    pub offset: u64,
}

impl Pagination {
    /// Create a window, clamping `limit` to 1..=500.
    pub fn new(limit: u32, offset: u64) -> Self {
        Self {
            limit: limit.clamp(1, MAX_LIMIT),
            offset,
        }
    }

    /// Window for a 1-indexed page number.
    pub fn page(page: u32, per_page: u32) -> Self {
        let limit = per_page.clamp(1, MAX_LIMIT);
        Self {
            limit,
            offset: u64::from(page.max(1) - 1) * u64::from(limit),
        }
    }

    /// Re-apply the clamp to a window built as a struct literal.
    pub fn normalized(self) -> Self {
        Self::new(self.limit, self.offset)
    }

    /// Window following this one.
    pub fn next(&self) -> Self {
        Self {
            limit: self.limit,
            offset: self.offset + u64::from(self.limit),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// One window of results plus the total number of matching rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    /// Total count across all windows
    pub total: i64,
    pub limit: u32,
    pub offset: u64,
}

impl<T> Paginated<T> {
    /// Whether rows exist beyond this window.
    pub fn has_more(&self) -> bool {
        (self.offset + self.items.len() as u64) < self.total.max(0) as u64
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginated<U> {
        Paginated {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            limit: self.limit,
            offset: self.offset,
        }
    }
}
