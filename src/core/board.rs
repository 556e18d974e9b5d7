// src/core/board.rs

//! The routable hardware identity of a board, and the inter-board link
//! topology used to translate a logical link into an FPGA register write.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The `(cabinet, frame, board)` triple that addresses a single board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoardAddress {
    pub cabinet: u8,
    pub frame: u8,
    pub board: u8,
}

impl BoardAddress {
    pub fn new(cabinet: u8, frame: u8, board: u8) -> Self {
        Self {
            cabinet,
            frame,
            board,
        }
    }
}

impl fmt::Display for BoardAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.cabinet, self.frame, self.board)
    }
}

/// One of the six compass directions a board can be linked to its neighbour on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum_macros::EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    East,
    NorthEast,
    North,
    West,
    SouthWest,
    South,
}

/// An FPGA identifier: each board has three FPGAs, each serving two links.
pub type FpgaId = u8;

/// A word-addressable control register on the link hardware.
pub type RegisterAddress = u32;

const REG_LOW: RegisterAddress = 0x0000_005C;
const REG_HIGH: RegisterAddress = 0x0001_005C;

impl Link {
    /// Maps this link to the `(fpga, register_address)` pair the hardware
    /// client must write to in order to enable or disable it. Fixed mapping
    /// per the hardware's FPGA layout; never reorder.
    pub fn fpga_register(self) -> (FpgaId, RegisterAddress) {
        match self {
            Link::East => (0, REG_LOW),
            Link::South => (0, REG_HIGH),
            Link::SouthWest => (1, REG_LOW),
            Link::West => (1, REG_HIGH),
            Link::North => (2, REG_LOW),
            Link::NorthEast => (2, REG_HIGH),
        }
    }

    /// The register value to write for a given desired enabled state: `0`
    /// enables the link, `1` disables it.
    pub fn register_value(enable: bool) -> u32 {
        if enable { 0 } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_encoding_matches_fixed_table() {
        assert_eq!(Link::East.fpga_register(), (0, 0x0000_005C));
        assert_eq!(Link::South.fpga_register(), (0, 0x0001_005C));
        assert_eq!(Link::SouthWest.fpga_register(), (1, 0x0000_005C));
        assert_eq!(Link::West.fpga_register(), (1, 0x0001_005C));
        assert_eq!(Link::North.fpga_register(), (2, 0x0000_005C));
        assert_eq!(Link::NorthEast.fpga_register(), (2, 0x0001_005C));
    }

    #[test]
    fn register_value_is_inverted_boolean() {
        assert_eq!(Link::register_value(true), 0);
        assert_eq!(Link::register_value(false), 1);
    }
}
