pub mod loopback;

pub use loopback::{LoopbackSink, SinkError};
