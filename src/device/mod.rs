pub mod controls;
pub mod graph;
pub mod session;

pub use graph::GraphSpec;
pub use session::{discover, ConnectError, DeviceRef, DeviceSession, DiscoverError};
pub use session::{PullError, PushError};
