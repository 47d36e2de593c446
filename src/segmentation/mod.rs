mod deeplab;
mod preprocess;
mod session;
pub mod types;

pub use deeplab::DeepLab;
pub use session::InferenceSession;
pub use types::{Backend, Mask, RunningMode, SegmentError, SegmentationEngine};

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::path::PathBuf;
use std::thread;

type EngineResult = Result<Box<dyn SegmentationEngine>>;

/// Engine whose load is still running on a background thread
pub struct PendingEngine {
    receiver: Receiver<EngineResult>,
}

impl PendingEngine {
    /// Pending engine fed by the returned sender
    pub fn channel() -> (Sender<EngineResult>, Self) {
        // A load reports exactly once
        let (tx, receiver) = bounded(1);
        (tx, Self { receiver })
    }
}

/// Start loading the default segmentation model (DeepLab) in the background
pub fn spawn_loader(model_path: PathBuf, backend: Backend, input_edge: u32) -> Result<PendingEngine> {
    let (tx, pending) = PendingEngine::channel();

    thread::Builder::new()
        .name("engine-loader".to_string())
        .spawn(move || {
            let engine = DeepLab::new(&model_path, backend, input_edge)
                .map(|model| Box::new(model) as Box<dyn SegmentationEngine>);
            // The session may already be gone; nothing to report to then
            let _ = tx.send(engine);
        })?;

    Ok(pending)
}
