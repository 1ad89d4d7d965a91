//! User-issued sensor commands and the queue carrying them into the pipeline

use tracing::trace;

/// A discrete sensor parameter change issued by the control surface.
///
/// Consumed exactly once by the pipeline worker and applied to the open
/// device session. Nothing here is persisted; slider positions live in the
/// panel, the last manual exposure pair lives in the session's translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Absolute lens position, 0-255
    SetManualFocus(u8),
    /// Switch to autofocus and fire a one-shot trigger
    TriggerAutofocus,
    /// Exposure time (1-33000 us) and ISO (100-1600), always sent together
    SetManualExposure { time_us: u32, iso: u32 },
    /// Enable the device's auto-exposure algorithm, or revert to the last
    /// manual exposure/ISO pair
    SetAutoExposure(bool),
    /// Fixed correlated color temperature, 1000-12000 K
    SetWhiteBalance(u32),
}

/// Create the command queue for one session lifetime.
///
/// MPSC FIFO: the supervisor pushes on behalf of the panel, the pipeline
/// worker drains once per paced tick. A fresh channel is created on every
/// connect so no command survives a disconnect boundary.
pub fn channel() -> (ControlSender, ControlDrain) {
    let (tx, rx) = flume::unbounded();
    (ControlSender(tx), ControlDrain(rx))
}

#[derive(Clone)]
pub struct ControlSender(flume::Sender<ControlCommand>);

impl ControlSender {
    /// Enqueue a command; returns false when the worker side is gone.
    pub fn push(&self, cmd: ControlCommand) -> bool {
        trace!(?cmd, "control enqueued");
        self.0.send(cmd).is_ok()
    }
}

pub struct ControlDrain(flume::Receiver<ControlCommand>);

impl ControlDrain {
    /// All commands queued since the last drain, in submission order,
    /// without blocking.
    pub fn try_drain(&self) -> Vec<ControlCommand> {
        self.0.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_fifo_order() {
        let (tx, rx) = channel();
        tx.push(ControlCommand::SetManualFocus(10));
        tx.push(ControlCommand::SetManualFocus(20));
        tx.push(ControlCommand::SetWhiteBalance(6500));
        tx.push(ControlCommand::SetManualFocus(30));

        let drained = rx.try_drain();
        assert_eq!(
            drained,
            vec![
                ControlCommand::SetManualFocus(10),
                ControlCommand::SetManualFocus(20),
                ControlCommand::SetWhiteBalance(6500),
                ControlCommand::SetManualFocus(30),
            ]
        );
    }

    #[test]
    fn drain_empties_the_queue() {
        let (tx, rx) = channel();
        tx.push(ControlCommand::TriggerAutofocus);
        assert_eq!(rx.try_drain().len(), 1);
        assert!(rx.try_drain().is_empty());
    }

    #[test]
    fn push_fails_once_drain_side_dropped() {
        let (tx, rx) = channel();
        drop(rx);
        assert!(!tx.push(ControlCommand::SetAutoExposure(true)));
    }
}
