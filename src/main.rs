//! Sensor board demo
//!
//! Runs against the simulated board: builds an accelerometer pipeline that
//! averages the Z axis and thresholds it, logs the result, then downloads
//! the log and prints the timestamped samples.

use anyhow::Context;
use sensorboard::{
    alloc::{DataRoute, NodeInput, RouteNode, RouteSpec},
    codec::{ProcessorConfig, ThresholdMode},
    transport::MockBoard,
    Attributes, Board, BoardConfig, DownloadOptions, FirmwareVersion,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const ACCELEROMETER: (u8, u8) = (0x03, 0x04);

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sensorboard=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting sensor board demo");

    let config = BoardConfig::load_or_default();
    let (board, notifications) = MockBoard::new(FirmwareVersion::new(1, 5, 0));
    let control = board.controller();
    let download = DownloadOptions::from(&config.download);
    let (handle, worker) = Board::spawn(config, Box::new(board), notifications);

    let accel = handle
        .register_source(
            ACCELEROMETER.0,
            ACCELEROMETER.1,
            None,
            Attributes::uniform(3, 2, true),
            6,
        )
        .context("registering the accelerometer")?;

    let route = handle
        .create_route(RouteSpec::Data(
            DataRoute::new(accel)
                .node(RouteNode::new(
                    NodeInput::SourceChannel(2),
                    ProcessorConfig::Average {
                        output_size: 2,
                        input_size: 2,
                        input_count: 1,
                        signed: true,
                        high_pass: false,
                        samples: 16,
                    },
                ))
                .node(
                    RouteNode::new(
                        NodeInput::Node(0),
                        ProcessorConfig::Threshold {
                            size: 2,
                            signed: true,
                            mode: ThresholdMode::Absolute,
                            boundary: 500,
                            hysteresis: 50,
                        },
                    )
                    .named("z-threshold")
                    .logged(),
                ),
        ))
        .context("creating the threshold route")?;
    tracing::info!(
        "Route {} committed: processors {:?}, log slots {:?}",
        route.id,
        route.processors,
        route.log_slots()
    );

    let output = route.output(1).context("route has no threshold output")?;
    let logger = route
        .logger_for(output)
        .context("threshold output is not logged")?;
    let samples = handle.subscribe_logger(logger)?;

    // Pretend the board logged a while before we download
    let slot = route
        .log_slots()
        .first()
        .copied()
        .context("route owns no log slot")?;
    for (i, value) in [480i16, 560, 610, 440].iter().enumerate() {
        let [lo, hi] = value.to_le_bytes();
        control.push_log_entry(slot, 1_000 + i as u32 * 683, [lo, hi, 0, 0]);
    }
    control.set_tick(4_000);

    handle.download_log(download.clear_entries().on_progress(|remaining, total| {
        tracing::info!("Download progress: {}/{}", total - remaining, total);
    }))?;

    for sample in samples.try_iter() {
        let [lo, hi, ..] = sample.data[..] else {
            tracing::warn!("Short sample from {}", sample.logger);
            continue;
        };
        let value = i16::from_le_bytes([lo, hi]);
        println!(
            "{}  tick {:>8}  z = {}",
            sample.timestamp.format("%H:%M:%S%.3f"),
            sample.tick,
            value
        );
    }

    handle.remove_route(route.id)?;
    let status = handle.status()?;
    tracing::info!(
        "{} routes, {} producers, {} commands sent",
        status.routes,
        status.producers,
        status.transport.commands_sent
    );

    handle.shutdown();
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("board worker panicked"))?;
    Ok(())
}
