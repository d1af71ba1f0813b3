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

//! The node's position in the protocol: height, round and step.

use serde_derive::{Deserialize, Serialize};

use std::fmt;

use crate::{
    encoding::{CodecError, TagReader, TagWriter},
    helpers::{Height, Round},
};

const TAG_HEIGHT: u8 = 1;
const TAG_ROUND: u8 = 2;
const TAG_STEP: u8 = 3;

/// Stage of the consensus state machine within one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Step {
    /// Waiting for the application to publish the committee and last commit.
    NewHeight = 1,
    /// Entering a round; the proposer builds and broadcasts a proposal.
    NewRound = 2,
    /// Waiting for the round's proposal.
    Propose = 3,
    /// Broadcasting a prevote.
    Prevote = 4,
    /// Waiting for a prevote quorum.
    PrevoteWait = 5,
    /// Broadcasting a precommit.
    Precommit = 6,
    /// Waiting for a precommit quorum.
    PrecommitWait = 7,
    /// Applying and persisting the decided block.
    Commit = 8,
}

impl Step {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::NewHeight),
            2 => Some(Self::NewRound),
            3 => Some(Self::Propose),
            4 => Some(Self::Prevote),
            5 => Some(Self::PrevoteWait),
            6 => Some(Self::Precommit),
            7 => Some(Self::PrecommitWait),
            8 => Some(Self::Commit),
            _ => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NewHeight => "new-height",
            Self::NewRound => "new-round",
            Self::Propose => "propose",
            Self::Prevote => "prevote",
            Self::PrevoteWait => "prevote-wait",
            Self::Precommit => "precommit",
            Self::PrecommitWait => "precommit-wait",
            Self::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Height, round and step triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hrs {
    /// Height the node is working on.
    pub height: Height,
    /// Current round within the height.
    pub round: Round,
    /// Current step within the round.
    pub step: Step,
}

impl Hrs {
    /// Creates the triple.
    pub fn new(height: Height, round: Round, step: Step) -> Self {
        Self {
            height,
            round,
            step,
        }
    }

    pub(crate) fn encode_into(&self, writer: &mut TagWriter) {
        writer.write_u64(TAG_HEIGHT, self.height.0);
        writer.write_u32(TAG_ROUND, self.round.0);
        writer.write_u8(TAG_STEP, self.step as u8);
    }

    pub(crate) fn decode_from(reader: &mut TagReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            height: Height(reader.read_u64(TAG_HEIGHT)?),
            round: Round(reader.read_u32(TAG_ROUND)?),
            step: Step::from_u8(reader.read_u8(TAG_STEP)?)
                .ok_or_else(|| CodecError::Malformed("unknown step".into()))?,
        })
    }
}

impl fmt::Display for Hrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.height, self.round, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_protocol_progress() {
        let early = Hrs::new(Height(5), Round(0), Step::Prevote);
        let later_step = Hrs::new(Height(5), Round(0), Step::Precommit);
        let later_round = Hrs::new(Height(5), Round(1), Step::Propose);
        let later_height = Hrs::new(Height(6), Round(0), Step::NewHeight);

        assert!(early < later_step);
        assert!(later_step < later_round);
        assert!(later_round < later_height);
    }

    #[test]
    fn display_is_compact() {
        let hrs = Hrs::new(Height(3), Round(1), Step::PrecommitWait);
        assert_eq!(hrs.to_string(), "3/1/precommit-wait");
    }
}
