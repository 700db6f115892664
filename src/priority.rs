//! Priority levels shared by every worker domain.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Scheduling levels ordered from most to least urgent.
///
/// The ordering is stable so the dispatcher can rely on integer indexes instead of branching on
/// specific labels. Adding a new level only requires appending it to [`PriorityLevel::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    High,
    Medium,
    Low,
}

impl PriorityLevel {
    /// Ordered list of all levels (high → low) for iteration utilities.
    pub const ALL: [PriorityLevel; 3] = [
        PriorityLevel::High,
        PriorityLevel::Medium,
        PriorityLevel::Low,
    ];

    /// Stable index for level based arrays.
    pub const fn index(self) -> usize {
        match self {
            PriorityLevel::High => 0,
            PriorityLevel::Medium => 1,
            PriorityLevel::Low => 2,
        }
    }

    /// Multiplier applied to a worker's time-until-due before it is compared.
    ///
    /// A High worker that is 10 ms late outranks a Low worker that is up to 1 s late. Under
    /// sustained saturation Low workers can starve; see `WorkerStats::starvation_risk`.
    ///
    /// # Mapping
    /// - `High` → 100
    /// - `Medium` → 10
    /// - `Low` → 1
    pub const fn weight(self) -> u32 {
        match self {
            PriorityLevel::High => 100,
            PriorityLevel::Medium => 10,
            PriorityLevel::Low => 1,
        }
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PriorityLevel::High => "high",
            PriorityLevel::Medium => "medium",
            PriorityLevel::Low => "low",
        };
        write!(f, "{label}")
    }
}

/// Helper structure wrapping a value per [`PriorityLevel`].
///
/// The dispatcher keeps one due heap per level in a table like this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityTable<T> {
    values: Vec<T>,
}

impl<T> PriorityTable<T> {
    /// Build a table by executing a closure for each level, in [`PriorityLevel::ALL`] order.
    ///
    /// # Example
    /// ```
    /// use subsystem_scheduler::{PriorityLevel, PriorityTable};
    ///
    /// let weights = PriorityTable::from_fn(|level| level.weight());
    /// assert_eq!(weights[PriorityLevel::Medium], 10);
    /// ```
    pub fn from_fn(mut f: impl FnMut(PriorityLevel) -> T) -> Self {
        let mut values = Vec::with_capacity(PriorityLevel::ALL.len());
        for level in PriorityLevel::ALL {
            values.push(f(level));
        }
        PriorityTable { values }
    }

    /// Borrow the value for a given level.
    pub fn get(&self, level: PriorityLevel) -> &T {
        &self.values[level.index()]
    }

    /// Mutably borrow the value for a given level.
    pub fn get_mut(&mut self, level: PriorityLevel) -> &mut T {
        &mut self.values[level.index()]
    }

    /// Iterate `(level, value)` pairs from High to Low.
    pub fn iter(&self) -> impl Iterator<Item = (PriorityLevel, &T)> {
        PriorityLevel::ALL.into_iter().zip(self.values.iter())
    }
}

impl<T: Default> Default for PriorityTable<T> {
    fn default() -> Self {
        PriorityTable::from_fn(|_| T::default())
    }
}

impl<T> Index<PriorityLevel> for PriorityTable<T> {
    type Output = T;

    fn index(&self, index: PriorityLevel) -> &Self::Output {
        self.get(index)
    }
}

impl<T> IndexMut<PriorityLevel> for PriorityTable<T> {
    fn index_mut(&mut self, index: PriorityLevel) -> &mut Self::Output {
        self.get_mut(index)
    }
}
