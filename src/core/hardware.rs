// src/core/hardware.rs

//! The blocking hardware boundary. `BmpClient` is the contract the ABMC
//! worker speaks against; the real implementation lives outside this crate's
//! scope (it requires a physical BMP connection). `LoggingBmpClient` is a
//! stand-in that always succeeds and logs what it would have sent, so the
//! daemon is runnable and testable without hardware attached.

use crate::core::board::{BoardAddress, FpgaId, RegisterAddress};
use std::collections::BTreeSet;
use tracing::info;

/// A blocking client speaking to a machine's Board Management Processor.
/// Both operations may fail with an I/O-class error; neither may be called
/// from async context directly (the ABMC worker thread is the only caller).
pub trait BmpClient: Send + Sync + 'static {
    fn set_power(&self, state: bool, boards: &BTreeSet<BoardAddress>) -> std::io::Result<()>;

    fn write_fpga_reg(
        &self,
        fpga: FpgaId,
        addr: RegisterAddress,
        value: u32,
        board: BoardAddress,
    ) -> std::io::Result<()>;
}

/// A `BmpClient` that performs no hardware I/O; used for machines configured
/// without a BMP host, and in tests that exercise the ABMC in isolation.
pub struct LoggingBmpClient {
    machine_name: String,
}

impl LoggingBmpClient {
    pub fn new(machine_name: impl Into<String>) -> Self {
        Self {
            machine_name: machine_name.into(),
        }
    }
}

impl BmpClient for LoggingBmpClient {
    fn set_power(&self, state: bool, boards: &BTreeSet<BoardAddress>) -> std::io::Result<()> {
        info!(
            machine = %self.machine_name,
            state,
            boards = ?boards,
            "set_power (no BMP host configured, logging only)"
        );
        Ok(())
    }

    fn write_fpga_reg(
        &self,
        fpga: FpgaId,
        addr: RegisterAddress,
        value: u32,
        board: BoardAddress,
    ) -> std::io::Result<()> {
        info!(
            machine = %self.machine_name,
            fpga,
            addr,
            value,
            %board,
            "write_fpga_reg (no BMP host configured, logging only)"
        );
        Ok(())
    }
}
