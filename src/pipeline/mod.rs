pub mod worker;

pub use worker::{FrameSink, FrameSource, PipelineWorker, WorkerExit};
