// Copyright 2021 The Ostraka Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Common widely used typedefs.

use serde_derive::{Deserialize, Serialize};

use std::fmt;

/// Number of milliseconds.
pub type Milliseconds = u64;

/// Blockchain height (number of committed blocks). Height 0 is the empty
/// chain; the genesis block is committed at height 1.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Height(pub u64);

impl Height {
    /// Returns zero value of the height.
    pub fn zero() -> Self {
        Height(0)
    }

    /// Returns next value of the height.
    pub fn next(self) -> Self {
        Height(self.0 + 1)
    }

    /// Returns previous value of the height.
    ///
    /// # Panics
    ///
    /// Panics if `self.0` is equal to zero.
    pub fn previous(self) -> Self {
        assert_ne!(0, self.0);
        Height(self.0 - 1)
    }

    /// Increments the height value.
    pub fn increment(&mut self) {
        self.0 += 1;
    }

    /// Returns the number of blocks between `self` and an earlier height.
    ///
    /// # Panics
    ///
    /// Panics if `earlier` is greater than `self`.
    pub fn distance(self, earlier: Self) -> u64 {
        assert!(earlier <= self);
        self.0 - earlier.0
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consensus round index within one height. Every height starts at round 0.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Round(pub u32);

impl Round {
    /// Returns zero value of the round.
    pub fn zero() -> Self {
        Round(0)
    }

    /// Returns next value of the round.
    pub fn next(self) -> Self {
        Round(self.0 + 1)
    }

    /// Increments the round value.
    pub fn increment(&mut self) {
        self.0 += 1;
    }

    /// Returns the iterator over rounds `[self, to)`.
    pub fn iter_to(self, to: Self) -> impl Iterator<Item = Round> {
        (self.0..to.0).map(Round)
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of the node, set at compile time from the crate manifest.
pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the user agent string of the node, e.g. `ostraka-node/0.1.0`.
pub fn user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), NODE_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_arithmetic() {
        let mut height = Height::zero();
        height.increment();
        assert_eq!(height, Height(1));
        assert_eq!(height.next(), Height(2));
        assert_eq!(height.next().previous(), height);
        assert_eq!(Height(10).distance(Height(7)), 3);
    }

    #[test]
    fn round_iteration() {
        let rounds: Vec<_> = Round(1).iter_to(Round(4)).collect();
        assert_eq!(rounds, vec![Round(1), Round(2), Round(3)]);
    }

    #[test]
    fn user_agent_contains_version() {
        assert!(user_agent().contains(NODE_VERSION));
    }
}
