//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use sensorboard::{Attributes, FirmwareVersion, ProducerId};
use std::time::Duration;

/// Firmware the simulated boards report
pub const FIRMWARE: FirmwareVersion = FirmwareVersion::new(1, 5, 0);

/// Accelerometer register: three signed 16-bit axes
pub const ACCEL: (u8, u8) = (0x03, 0x04);

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Assert two time spans agree to the microsecond rounding of tick conversion
pub fn assert_span_eq(actual: chrono::Duration, expected: chrono::Duration) {
    let drift = (actual - expected).num_microseconds().unwrap_or(i64::MAX).abs();
    assert!(
        drift <= 1,
        "Expected span {} to match {} (drift {}us)",
        actual,
        expected,
        drift
    );
}

/// Attributes of the accelerometer source
pub fn accel_attributes() -> Attributes {
    Attributes::uniform(3, 2, true)
}

/// Register the accelerometer through a board handle
pub fn register_accel(handle: &sensorboard::BoardHandle) -> ProducerId {
    handle
        .register_source(ACCEL.0, ACCEL.1, None, accel_attributes(), 6)
        .expect("accelerometer registers")
}
