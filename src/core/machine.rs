// src/core/machine.rs

//! A named physical machine: a 3-D grid of boards, owning exactly one ABMC,
//! plus the coordinate tables needed to resolve between logical board,
//! physical board, chip, and job-local chip coordinates.

use crate::core::abmc::AsyncBmpController;
use crate::core::board::{BoardAddress, Link};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

/// Logical triad coordinates `(x, y, z)` within a machine's board grid.
pub type Triad = (u32, u32, u32);

/// The static, config-derived description of one machine. Cloned into
/// `MachineInfo` at runtime alongside its live `AsyncBmpController`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    pub tags: BTreeSet<String>,
    pub width: u32,
    pub height: u32,
    pub dead_boards: BTreeSet<BoardAddress>,
    pub dead_links: BTreeSet<(BoardAddress, Link)>,
    /// Logical triad -> physical board address.
    pub triad_to_board: HashMap<Triad, BoardAddress>,
    /// `(cabinet, frame)` -> BMP host (used to construct the hardware client).
    pub bmp_hosts: HashMap<(u8, u8), String>,
    /// Logical triad -> the IP address of that board's Ethernet chip.
    pub triad_to_ip: HashMap<Triad, String>,
    pub bmp_port: u16,
}

impl MachineSpec {
    pub fn board_to_triad(&self) -> HashMap<BoardAddress, Triad> {
        self.triad_to_board
            .iter()
            .map(|(&triad, &board)| (board, triad))
            .collect()
    }
}

/// A machine with its live ABMC attached.
pub struct MachineInfo {
    pub spec: MachineSpec,
    pub abmc: Arc<AsyncBmpController>,
}

impl MachineInfo {
    pub fn num_boards(&self) -> usize {
        self.spec.triad_to_board.len() - self.spec.dead_boards.len()
    }

    /// `where_is` by logical triad: returns the board address and the
    /// machine-relative chip coordinates of the requested chip, or `None`
    /// if the triad is outside the machine.
    pub fn resolve_triad(&self, triad: Triad) -> Option<BoardAddress> {
        self.spec.triad_to_board.get(&triad).copied()
    }

    pub fn resolve_board(&self, board: BoardAddress) -> Option<Triad> {
        self.board_to_triad_cached().get(&board).copied()
    }

    fn board_to_triad_cached(&self) -> HashMap<BoardAddress, Triad> {
        self.spec.board_to_triad()
    }

    pub fn connections(&self) -> Vec<((u32, u32), SocketAddr)> {
        self.spec
            .triad_to_ip
            .iter()
            .filter_map(|(triad, ip)| {
                let addr: SocketAddr = format!("{ip}:{}", self.spec.bmp_port).parse().ok()?;
                Some(((triad.0, triad.1), addr))
            })
            .collect()
    }

    pub fn is_board_dead(&self, board: BoardAddress) -> bool {
        self.spec.dead_boards.contains(&board)
    }

    pub fn live_boards(&self) -> HashSet<BoardAddress> {
        self.spec
            .triad_to_board
            .values()
            .copied()
            .filter(|b| !self.spec.dead_boards.contains(b))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hardware::LoggingBmpClient;

    fn spec() -> MachineSpec {
        let mut triad_to_board = HashMap::new();
        for x in 0..1 {
            for y in 0..2 {
                for z in 0..3 {
                    triad_to_board.insert(
                        (x, y, z),
                        BoardAddress::new(0, 0, (x * 6 + y * 3 + z) as u8),
                    );
                }
            }
        }
        MachineSpec {
            name: "m".into(),
            tags: BTreeSet::from(["default".to_string()]),
            width: 1,
            height: 2,
            dead_boards: BTreeSet::new(),
            dead_links: BTreeSet::new(),
            triad_to_board,
            bmp_hosts: HashMap::new(),
            triad_to_ip: HashMap::new(),
            bmp_port: 0,
        }
    }

    #[test]
    fn resolves_triad_to_board_and_back() {
        let info = MachineInfo {
            spec: spec(),
            abmc: Arc::new(AsyncBmpController::new(
                Arc::new(LoggingBmpClient::new("m")),
                None,
            )),
        };
        let board = info.resolve_triad((0, 1, 2)).unwrap();
        assert_eq!(info.resolve_board(board), Some((0, 1, 2)));
        assert_eq!(info.resolve_triad((5, 5, 5)), None);
        info.abmc.stop();
        info.abmc.join();
    }
}
