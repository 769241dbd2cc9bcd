//! Mock construction helpers

use mockall::mock;
use sensorboard::error::Result;
use sensorboard::transport::{MockBoard, MockController, TransportStats};
use sensorboard::{Board, BoardConfig, BoardHandle, FirmwareVersion, Transport};
use std::thread::JoinHandle;

use super::FIRMWARE;

mock! {
    /// Transport whose every call is scripted by the test
    pub Link {}

    impl Transport for Link {
        fn send(&mut self, command: &[u8]) -> Result<()>;
        fn is_connected(&self) -> bool;
        fn firmware_version(&self) -> FirmwareVersion;
        fn module_revision(&self, module: u8) -> u8;
        fn stats(&self) -> &TransportStats;
        fn stats_mut(&mut self) -> &mut TransportStats;
        fn reset_stats(&mut self);
    }
}

/// A connected link reporting [`FIRMWARE`]; `send` is left to the test
pub fn connected_link() -> MockLink {
    let mut link = MockLink::new();
    link.expect_is_connected().return_const(true);
    link.expect_firmware_version().return_const(FIRMWARE);
    link.expect_module_revision().return_const(0u8);
    link.expect_stats().return_const(TransportStats::default());
    link
}

/// A board worker running over a simulated board
pub struct MockRig {
    pub handle: BoardHandle,
    pub control: MockController,
    worker: Option<JoinHandle<()>>,
}

impl MockRig {
    pub fn spawn(config: BoardConfig) -> Self {
        let (board, notifications) = MockBoard::new(FIRMWARE);
        let control = board.controller();
        let (handle, worker) = Board::spawn(config, Box::new(board), notifications);
        Self {
            handle,
            control,
            worker: Some(worker),
        }
    }

    /// Stop the worker and wait for it
    pub fn stop(&mut self) {
        self.handle.shutdown();
        if let Some(worker) = self.worker.take() {
            worker.join().expect("board worker exits cleanly");
        }
    }
}

impl Drop for MockRig {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
