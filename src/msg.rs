//! Inter-task messages and queue types.
//!
//! Tasks never share state; everything crosses task boundaries by value
//! through bounded SPSC queues. [`Core`] owns one queue per task pair and
//! routes all button/BLE/motor traffic through them: its entry points run
//! in their owning task's context, enqueue on the way out, and drain their
//! own mailbox on the way in.
//!
//! The aliases here fix the depths. A `heapless::spsc::Queue<T, N>` holds
//! `N − 1` elements and `N` must be a power of two, so each alias uses the
//! next power of two above its required depth.
//!
//! [`Core`]: crate::device::Core

use crate::role::SessionParams;
use heapless::spsc::Queue;

/// Messages consumed by the motor/pattern task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MotorMsg {
    /// Cycle to the next stimulation mode (button short press).
    ModeChange,
    EmergencyShutdown,
    /// Pairing finished; the session runs with these parameters.
    PairingComplete(SessionParams),
    PairingFailed,
}

/// Messages consumed by the BLE task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BleMsg {
    ReEnable,
    EmergencyShutdown,
}

/// Messages consumed by the button task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ButtonMsg {
    /// The session window elapsed; surface it to the user.
    SessionTimeout,
}

/// Button → motor, depth 7.
pub type ButtonToMotorQueue = Queue<MotorMsg, 8>;

/// Button → BLE, depth 3.
pub type ButtonToBleQueue = Queue<BleMsg, 4>;

/// BLE → motor, depth 3.
pub type BleToMotorQueue = Queue<MotorMsg, 4>;

/// Motor → button, depth 1.
pub type MotorToButtonQueue = Queue<ButtonMsg, 2>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_are_fifo_and_bounded() {
        let mut q = ButtonToBleQueue::new();
        let (mut tx, mut rx) = q.split();
        for _ in 0..3 {
            tx.enqueue(BleMsg::ReEnable).unwrap();
        }
        // Depth 3: the fourth message is refused.
        assert!(tx.enqueue(BleMsg::EmergencyShutdown).is_err());
        assert_eq!(rx.dequeue(), Some(BleMsg::ReEnable));

        // Space freed; ordering preserved.
        tx.enqueue(BleMsg::EmergencyShutdown).unwrap();
        for _ in 0..2 {
            assert_eq!(rx.dequeue(), Some(BleMsg::ReEnable));
        }
        assert_eq!(rx.dequeue(), Some(BleMsg::EmergencyShutdown));
        assert_eq!(rx.dequeue(), None);
    }

    #[test]
    fn motor_to_button_holds_one() {
        let mut q = MotorToButtonQueue::new();
        let (mut tx, mut rx) = q.split();
        tx.enqueue(ButtonMsg::SessionTimeout).unwrap();
        assert!(tx.enqueue(ButtonMsg::SessionTimeout).is_err());
        assert_eq!(rx.dequeue(), Some(ButtonMsg::SessionTimeout));
    }

    #[test]
    fn pairing_params_travel_by_value() {
        let mut q = BleToMotorQueue::new();
        let (mut tx, mut rx) = q.split();
        let params = SessionParams::default();
        tx.enqueue(MotorMsg::PairingComplete(params)).unwrap();
        assert_eq!(rx.dequeue(), Some(MotorMsg::PairingComplete(params)));
    }
}
