mod blend;
mod capture;
mod frame_loop;
mod output;
mod palette;
mod segmentation;
#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use capture::WebcamCapture;
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use frame_loop::{FrameLoop, LoopConfig, LoopState, StartError, StopHandle};
use output::V4L2Output;
use segmentation::{Backend, InferenceSession};
use std::io::BufRead;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Requested capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Requested capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Output resolution width
    #[arg(long, default_value_t = 1280)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 720)]
    output_height: u32,

    /// Display refresh rate the loop ticks at
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..))]
    fps: u32,

    /// Path to the DeepLab segmentation model (ONNX file)
    #[arg(long)]
    model: PathBuf,

    /// Execution backend for inference
    #[arg(long, value_enum, default_value_t = Backend::Cuda)]
    backend: Backend,

    /// Square input edge the model was exported with
    #[arg(long, default_value_t = 513)]
    model_input: u32,

    /// How long one iteration waits for camera metadata before skipping
    #[arg(long, default_value_t = 2000)]
    metadata_timeout_ms: u64,

    /// Log statistics every N frames (0 disables)
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,

    /// Start the overlay immediately instead of waiting for a toggle
    #[arg(long)]
    autostart: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

enum Command {
    Toggle,
    Quit,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("livemask starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Output: {}x{}", args.output_width, args.output_height);
    tracing::info!("Refresh rate: {} fps", args.fps);

    // The model loads in the background; frames are skipped until it is ready
    let pending = segmentation::spawn_loader(args.model.clone(), args.backend, args.model_input)
        .context("Failed to start segmentation model loader")?;

    let capture = WebcamCapture::new(args.input_device, args.capture_width, args.capture_height);

    let output = V4L2Output::new(&args.output_device, args.output_width, args.output_height)
        .context("Failed to initialize v4l2loopback output")?;

    let config = LoopConfig {
        fps: args.fps,
        metadata_timeout: Duration::from_millis(args.metadata_timeout_ms),
        stats_interval: args.stats_interval,
    };
    let mut frame_loop = FrameLoop::new(
        config,
        Box::new(capture),
        InferenceSession::new(pending),
        Box::new(output),
    );

    let commands = spawn_control_reader(frame_loop.stop_handle())?;

    if args.autostart {
        toggle(&mut frame_loop);
    }
    tracing::info!("Press Enter to toggle the webcam overlay, q + Enter to quit");

    for command in commands {
        match command {
            Command::Toggle => toggle(&mut frame_loop),
            Command::Quit => break,
        }
    }

    if frame_loop.is_running() {
        tracing::info!("Waiting for the in-flight frame before exiting");
    }
    // Also collects a loop that quit already stopped through the handle
    frame_loop.stop();
    if frame_loop.stats().iterations > 0 {
        log_session(&frame_loop);
    }
    tracing::info!("livemask exiting");

    Ok(())
}

fn toggle(frame_loop: &mut FrameLoop) {
    // A worker that died while running still reports Running; stop collects it
    if frame_loop.state() == LoopState::Running {
        frame_loop.stop();
        log_session(frame_loop);
        return;
    }

    match frame_loop.start() {
        Ok(()) => {}
        Err(StartError::Cancelled) => tracing::info!("Webcam overlay start cancelled"),
        Err(err) => {
            tracing::error!("Failed to start webcam overlay: {:#}", anyhow::Error::new(err))
        }
    }
}

fn log_session(frame_loop: &FrameLoop) {
    let stats = frame_loop.stats();
    tracing::info!(
        "Session: {} frames presented, {} skipped, {:.1} fps",
        stats.presented,
        stats.skipped(),
        stats.effective_fps()
    );
}

/// Read toggle/quit commands from stdin; end of input counts as quit
///
/// The main thread is blocked while a start opens the camera, so this thread
/// cancels a pending start itself, and requests the stop for quit directly so
/// it does not wait behind a blocked start.
fn spawn_control_reader(stop: StopHandle) -> Result<Receiver<Command>> {
    let (tx, rx) = unbounded();

    thread::Builder::new()
        .name("control".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let command = match line {
                    Ok(line) if line.trim().eq_ignore_ascii_case("q") => Command::Quit,
                    Ok(_) => Command::Toggle,
                    Err(err) => {
                        tracing::warn!("Failed to read control input: {}", err);
                        Command::Quit
                    }
                };
                let quit = matches!(command, Command::Quit);
                if quit {
                    stop.request_stop();
                } else if stop.state() == LoopState::Starting {
                    stop.request_stop();
                    continue;
                }
                if tx.send(command).is_err() || quit {
                    return;
                }
            }
            stop.request_stop();
            let _ = tx.send(Command::Quit);
        })
        .context("Failed to spawn control reader")?;

    Ok(rx)
}
