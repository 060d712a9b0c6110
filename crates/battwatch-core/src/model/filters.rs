// ── Filter model ──
//
// Four fixed categories. The selected values per category are ordered
// string sets so that serialized state and outgoing queries are stable.
// Area selections hold area *ids*; names are display-only.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The four filterable categories.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FilterCategory {
    Manufacturer,
    DeviceClass,
    Status,
    Area,
}

impl FilterCategory {
    pub const ALL: [Self; 4] = [
        Self::Manufacturer,
        Self::DeviceClass,
        Self::Status,
        Self::Area,
    ];
}

/// One generation of filter selections.
///
/// Two generations exist at runtime: the *active* set (applied and
/// persisted) and an optional *staged* working copy edited in the
/// deferred-apply flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(default)]
    pub manufacturers: BTreeSet<String>,
    #[serde(default)]
    pub device_classes: BTreeSet<String>,
    #[serde(default)]
    pub statuses: BTreeSet<String>,
    #[serde(default)]
    pub areas: BTreeSet<String>,
}

impl FilterSet {
    pub fn values(&self, category: FilterCategory) -> &BTreeSet<String> {
        match category {
            FilterCategory::Manufacturer => &self.manufacturers,
            FilterCategory::DeviceClass => &self.device_classes,
            FilterCategory::Status => &self.statuses,
            FilterCategory::Area => &self.areas,
        }
    }

    fn values_mut(&mut self, category: FilterCategory) -> &mut BTreeSet<String> {
        match category {
            FilterCategory::Manufacturer => &mut self.manufacturers,
            FilterCategory::DeviceClass => &mut self.device_classes,
            FilterCategory::Status => &mut self.statuses,
            FilterCategory::Area => &mut self.areas,
        }
    }

    /// Flip one value. Returns `true` if the value is now selected.
    pub fn toggle(&mut self, category: FilterCategory, value: &str) -> bool {
        let set = self.values_mut(category);
        if set.remove(value) {
            false
        } else {
            set.insert(value.to_owned());
            true
        }
    }

    /// Remove one value (chip deletion). Returns `true` if it was present.
    pub fn remove(&mut self, category: FilterCategory, value: &str) -> bool {
        self.values_mut(category).remove(value)
    }

    /// Drop every selection. Returns `true` if anything was selected.
    pub fn clear(&mut self) -> bool {
        let had_any = !self.is_empty();
        for category in FilterCategory::ALL {
            self.values_mut(category).clear();
        }
        had_any
    }

    pub fn is_empty(&self) -> bool {
        FilterCategory::ALL
            .iter()
            .all(|c| self.values(*c).is_empty())
    }

    pub fn selection_count(&self) -> usize {
        FilterCategory::ALL.iter().map(|c| self.values(*c).len()).sum()
    }

    /// Drop selections that no longer appear in the fetched vocabulary.
    ///
    /// Returns `true` if anything was pruned, so the caller knows to
    /// persist the corrected state back.
    pub fn prune(&mut self, options: &FilterOptions) -> bool {
        let mut changed = false;
        for category in FilterCategory::ALL {
            let set = self.values_mut(category);
            let before = set.len();
            set.retain(|value| options.contains(category, value));
            changed |= set.len() != before;
        }
        changed
    }
}

// ── Vocabulary ───────────────────────────────────────────────────────

/// One selectable area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaOption {
    pub id: String,
    pub name: String,
}

/// The selectable values per category, fetched once per session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOptions {
    pub manufacturers: Vec<String>,
    pub device_classes: Vec<String>,
    pub areas: Vec<AreaOption>,
    pub statuses: Vec<String>,
}

impl FilterOptions {
    /// Whether `value` is part of the vocabulary for `category`.
    pub fn contains(&self, category: FilterCategory, value: &str) -> bool {
        match category {
            FilterCategory::Manufacturer => self.manufacturers.iter().any(|v| v == value),
            FilterCategory::DeviceClass => self.device_classes.iter().any(|v| v == value),
            FilterCategory::Status => self.statuses.iter().any(|v| v == value),
            FilterCategory::Area => self.areas.iter().any(|a| a.id == value),
        }
    }
}
