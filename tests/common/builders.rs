//! Route and config builders shared by the integration tests

use sensorboard::alloc::{DataRoute, NodeInput, Reaction, RouteNode, RouteSpec};
use sensorboard::codec::{ProcessorConfig, ThresholdMode};
use sensorboard::{BoardConfig, ProducerId};

/// Moving average of `samples` 16-bit values
pub fn average(samples: u8) -> ProcessorConfig {
    ProcessorConfig::Average {
        output_size: 2,
        input_size: 2,
        input_count: 1,
        signed: true,
        high_pass: false,
        samples,
    }
}

/// Absolute threshold on a 16-bit value
pub fn threshold(boundary: i32, hysteresis: u16) -> ProcessorConfig {
    ProcessorConfig::Threshold {
        size: 2,
        signed: true,
        mode: ThresholdMode::Absolute,
        boundary,
        hysteresis,
    }
}

/// Z axis, averaged over 16 samples and thresholded at 500 with 50 hysteresis;
/// the threshold output is logged
pub fn z_threshold_route(accel: ProducerId) -> RouteSpec {
    RouteSpec::Data(
        DataRoute::new(accel)
            .node(RouteNode::new(NodeInput::SourceChannel(2), average(16)))
            .node(
                RouteNode::new(NodeInput::Node(0), threshold(500, 50))
                    .named("z-threshold")
                    .logged(),
            ),
    )
}

/// A single logged threshold on one accelerometer axis
pub fn axis_route(accel: ProducerId, axis: usize, name: &str) -> RouteSpec {
    RouteSpec::Data(
        DataRoute::new(accel).node(
            RouteNode::new(NodeInput::SourceChannel(axis), threshold(100, 0))
                .named(name)
                .logged(),
        ),
    )
}

/// One axis averaged into a logged threshold whose events reset the average
///
/// The average is bound to `name`. Builds two processors, one log trigger
/// and one event entry.
pub fn resetting_axis_route(accel: ProducerId, axis: usize, name: &str) -> RouteSpec {
    RouteSpec::Data(
        DataRoute::new(accel)
            .node(RouteNode::new(NodeInput::SourceChannel(axis), average(16)).named(name))
            .node(
                RouteNode::new(NodeInput::Node(0), threshold(500, 50))
                    .logged()
                    .react(Reaction::reset(name, vec![0, 0])),
            ),
    )
}

/// Config with short timeouts so failure paths finish quickly
pub fn fast_config() -> BoardConfig {
    let mut config = BoardConfig::default();
    config.timeouts.creation_ms = 80;
    config.timeouts.read_ms = 150;
    config.poll_interval_ms = 5;
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_config_is_valid() {
        assert!(fast_config().validate().is_ok());
    }
}
