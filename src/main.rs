use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use cap_convert::format::{PixelFormat, Size};
use capture_fanout::capture::{CaptureSummary, SyntheticSource, run_capture};
use capture_fanout::controller::ClientEvent;
use capture_fanout::core::format::CaptureFormat;
use capture_fanout::{
    BufferId, CaptureParams, ChannelEventHandler, ControllerId, HandlerId, HubConfig, HubHandle, HubSession, SessionId,
    telemetry,
};
use clap::Parser;
use futures_util::future::join_all;
use memmap2::Mmap;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Runs a synthetic capture source through the hub and fans it out to
/// several in-process consumers.
#[derive(Parser, Debug)]
#[command(name = "cap-fanout")]
#[command(about = "Distribute captured frames from a bounded buffer pool to many consumers")]
struct Args {
    /// Number of consumers to register
    #[arg(short, long, default_value_t = 3)]
    clients: u32,

    /// Frames to capture before stopping
    #[arg(short = 'n', long, default_value_t = 90)]
    frames: u64,

    /// Stop after this many seconds even if frames remain
    #[arg(long)]
    seconds: Option<u64>,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    #[arg(short = 'f', long, default_value_t = 30.0)]
    fps: f64,

    /// Clockwise sensor rotation: 0, 90, 180 or 270
    #[arg(short, long, default_value_t = 0)]
    rotation: i32,

    /// Pool capacity
    #[arg(long, default_value_t = 3)]
    max_buffers: usize,

    /// JSON hub configuration; replaces --max-buffers and the frame geometry
    #[arg(long)]
    config: Option<String>,

    /// Register this client index paused
    #[arg(long)]
    pause_client: Option<u32>,

    /// Resource utilization every consumer reports when returning a buffer
    #[arg(long, default_value_t = 0.5)]
    feedback: f64,
}

#[derive(Debug)]
struct ConsumerStats {
    handler_id: HandlerId,
    frames: u64,
    mean_luma: Option<u8>,
    failed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init("info");

    if !matches!(args.rotation, 0 | 90 | 180 | 270) {
        bail!("rotation must be 0, 90, 180 or 270, got {}", args.rotation);
    }

    let config = match &args.config {
        Some(path) => HubConfig::from_json_file(path).with_context(|| format!("loading {path}"))?,
        None => HubConfig {
            max_buffers: args.max_buffers,
            requested_format: CaptureFormat::new(Size::new(args.width, args.height), args.fps, PixelFormat::I420),
            ..HubConfig::default()
        },
    };
    let requested = config.requested_format;
    let session = HubSession::spawn(config)?;
    let HubSession { handle, mut adapter, task } = session;

    let params = CaptureParams::new(requested);
    let mut consumers = Vec::new();
    for index in 0..args.clients {
        let handler_id = HandlerId(u64::from(index) + 1);
        let controller_id = ControllerId(index + 1);
        let (handler, events) = ChannelEventHandler::new(handler_id);
        handle.add_client(controller_id, handler, SessionId(index as i32 + 1), params)?;
        if args.pause_client == Some(index) {
            handle.pause_client(controller_id, handler_id)?;
        }
        consumers.push(tokio::spawn(consume(handle.clone(), handler_id, events, args.feedback)));
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    if let Some(seconds) = args.seconds {
        let stop_tx = stop_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            let _ = stop_tx.send(true);
        });
    }

    let mut source = SyntheticSource::new(requested, args.rotation).with_frame_limit(args.frames);
    let capture = tokio::spawn(async move {
        let summary = run_capture(&mut source, &mut adapter, stop_rx).await;
        (summary, adapter)
    });
    let (summary, adapter): (CaptureSummary, _) = capture.await.context("capture task panicked")?;
    drop(stop_tx);

    // Queued frames still hold producer reservations; let them drain.
    wait_for_idle(&handle, Duration::from_secs(2)).await;
    let stats = adapter.stats();
    drop(adapter);

    for index in 0..args.clients {
        handle.stop_session(SessionId(index as i32 + 1))?;
    }
    handle.shutdown()?;
    let controller = task.await.context("distribution task panicked")?;
    let first_frame = controller.first_frame_stats();
    drop(controller);

    let results = join_all(consumers).await;

    println!("captured {} frames, throttled {}", summary.frames_captured, summary.frames_throttled);
    println!(
        "adapter delivered {} frames, dropped {}",
        stats.frames_delivered, stats.frames_dropped
    );
    if let Some(first) = first_frame {
        println!(
            "first frame {}x{} aspect {:.2}",
            first.width,
            first.height,
            f64::from(first.aspect_ratio_x100) / 100.0
        );
    }
    for result in results {
        let consumer = result.context("consumer task panicked")?;
        println!(
            "client {}: {} frames, mean luma {}{}",
            consumer.handler_id,
            consumer.frames,
            consumer.mean_luma.map_or_else(|| "-".to_string(), |l| l.to_string()),
            if consumer.failed { " (error)" } else { "" }
        );
    }
    if summary.failed {
        bail!("capture source failed");
    }
    Ok(())
}

async fn wait_for_idle(handle: &HubHandle, limit: Duration) {
    let poll = async {
        while handle.pool_utilization() > 0.0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(limit, poll).await.is_err() {
        warn!(utilization = handle.pool_utilization(), "buffers still held at shutdown");
    }
}

async fn consume(
    hub: HubHandle,
    handler_id: HandlerId,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    feedback: f64,
) -> ConsumerStats {
    let mut stats = ConsumerStats {
        handler_id,
        frames: 0,
        mean_luma: None,
        failed: false,
    };
    let mut mappings: HashMap<BufferId, Mmap> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::BufferCreated { buffer_id, handle, .. } => match handle.map() {
                Ok(map) => {
                    mappings.insert(buffer_id, map);
                }
                Err(e) => warn!(%handler_id, %buffer_id, "failed to map buffer: {e}"),
            },
            ClientEvent::BufferDestroyed { buffer_id, .. } => {
                mappings.remove(&buffer_id);
            }
            ClientEvent::BufferReady {
                controller_id,
                buffer_id,
                frame,
                ..
            } => {
                stats.frames += 1;
                if let (Some(map), Some(layout)) = (mappings.get(&buffer_id), frame.i420_layout()) {
                    if let Some(y) = map.get(..layout.y_len).filter(|y| !y.is_empty()) {
                        let sum: u64 = y.iter().map(|&v| u64::from(v)).sum();
                        stats.mean_luma = Some((sum / y.len() as u64) as u8);
                    }
                }
                if hub.return_buffer(controller_id, handler_id, buffer_id, Some(feedback)).is_err() {
                    break;
                }
            }
            ClientEvent::Error { reason, .. } => {
                warn!(%handler_id, "capture failed: {reason}");
                stats.failed = true;
                break;
            }
            ClientEvent::Ended { .. } => {
                info!(%handler_id, frames = stats.frames, "session ended");
                break;
            }
        }
    }
    stats
}
