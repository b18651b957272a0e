// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// A consistent snapshot of the cache counters.
///
/// Both values are taken from the same critical section, so `used <= cached` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ElementCounts {
    /// Number of live entries, whether in use, still being created, or idle.
    pub cached: usize,
    /// Number of entries with at least one open checkout.
    pub used: usize,
}

impl ElementCounts {
    /// Number of entries that are retained without any open checkout.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.cached.saturating_sub(self.used)
    }
}
