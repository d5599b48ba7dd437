// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Longest-prefix routing with a separator requirement: an address matches a
//! driver's prefix only if it equals the prefix exactly or the prefix is
//! immediately followed by `/`, so `/avantistest` never matches the `/avantis`
//! driver.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::driver::Driver;

pub struct PrefixTable {
    entries: RwLock<Vec<(String, Arc<dyn Driver>)>>,
}

impl PrefixTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Rebuilds the table from the current driver set, sorted by descending
    /// prefix length so the longest match wins.
    pub fn rebuild(&self, drivers: &[Arc<dyn Driver>]) {
        let mut entries: Vec<(String, Arc<dyn Driver>)> = drivers
            .iter()
            .map(|d| (d.prefix().to_lowercase(), d.clone()))
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        *self.entries.write() = entries;
    }

    /// Resolves an OSC address to its owning driver and the address
    /// remainder relative to that driver's prefix.
    pub fn resolve(&self, address: &str) -> Option<(Arc<dyn Driver>, String)> {
        let lower = address.to_lowercase();
        for (prefix, driver) in self.entries.read().iter() {
            if lower.len() < prefix.len() || !lower.starts_with(prefix.as_str()) {
                continue;
            }
            let rest = &address[prefix.len()..];
            if rest.is_empty() || rest.starts_with('/') {
                return Some((driver.clone(), rest.to_string()));
            }
        }
        None
    }
}

impl Default for PrefixTable {
    fn default() -> Self {
        Self::new()
    }
}
