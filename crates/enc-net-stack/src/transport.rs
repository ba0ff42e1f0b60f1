use std::collections::VecDeque;

/// Byte-level access to the Ethernet controller.
///
/// Implementations own the hardware (or a simulation of it); the stack only ever borrows a
/// transport for the duration of one `poll`.
pub trait LinkTransport {
    fn is_link_up(&mut self) -> bool;

    fn is_frame_available(&mut self) -> bool;

    /// Copies the next received frame into `buf` and returns its length, truncating frames longer
    /// than `buf`. Returns `0` when nothing is pending.
    fn receive_frame(&mut self, buf: &mut [u8]) -> usize;

    /// Sends one complete frame. Returns `false` if the controller aborted the transmission.
    fn transmit_frame(&mut self, frame: &[u8]) -> bool;

    /// Reports and clears a receive-buffer overrun.
    fn is_rx_overflow(&mut self) -> bool {
        false
    }
}

impl<T: LinkTransport + ?Sized> LinkTransport for &mut T {
    fn is_link_up(&mut self) -> bool {
        <T as LinkTransport>::is_link_up(&mut **self)
    }

    fn is_frame_available(&mut self) -> bool {
        <T as LinkTransport>::is_frame_available(&mut **self)
    }

    fn receive_frame(&mut self, buf: &mut [u8]) -> usize {
        <T as LinkTransport>::receive_frame(&mut **self, buf)
    }

    fn transmit_frame(&mut self, frame: &[u8]) -> bool {
        <T as LinkTransport>::transmit_frame(&mut **self, frame)
    }

    fn is_rx_overflow(&mut self) -> bool {
        <T as LinkTransport>::is_rx_overflow(&mut **self)
    }
}

impl<T: LinkTransport + ?Sized> LinkTransport for Box<T> {
    fn is_link_up(&mut self) -> bool {
        <T as LinkTransport>::is_link_up(&mut **self)
    }

    fn is_frame_available(&mut self) -> bool {
        <T as LinkTransport>::is_frame_available(&mut **self)
    }

    fn receive_frame(&mut self, buf: &mut [u8]) -> usize {
        <T as LinkTransport>::receive_frame(&mut **self, buf)
    }

    fn transmit_frame(&mut self, frame: &[u8]) -> bool {
        <T as LinkTransport>::transmit_frame(&mut **self, frame)
    }

    fn is_rx_overflow(&mut self) -> bool {
        <T as LinkTransport>::is_rx_overflow(&mut **self)
    }
}

/// In-memory transport: frames pushed with [`QueueTransport::push_rx`] are received in order and
/// transmitted frames are collected in `tx`.
#[derive(Debug, Clone)]
pub struct QueueTransport {
    pub rx: VecDeque<Vec<u8>>,
    pub tx: Vec<Vec<u8>>,
    pub link_up: bool,
    /// Makes every `transmit_frame` fail (the frame is still recorded in `tx`).
    pub fail_tx: bool,
    rx_overflow: bool,
}

impl Default for QueueTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueTransport {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: Vec::new(),
            link_up: true,
            fail_tx: false,
            rx_overflow: false,
        }
    }

    pub fn push_rx(&mut self, frame: Vec<u8>) {
        self.rx.push_back(frame);
    }

    pub fn take_tx(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.tx)
    }

    /// Latches an overrun, reported once by the next `is_rx_overflow`.
    pub fn signal_rx_overflow(&mut self) {
        self.rx_overflow = true;
    }
}

impl LinkTransport for QueueTransport {
    fn is_link_up(&mut self) -> bool {
        self.link_up
    }

    fn is_frame_available(&mut self) -> bool {
        !self.rx.is_empty()
    }

    fn receive_frame(&mut self, buf: &mut [u8]) -> usize {
        let Some(frame) = self.rx.pop_front() else {
            return 0;
        };
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        len
    }

    fn transmit_frame(&mut self, frame: &[u8]) -> bool {
        self.tx.push(frame.to_vec());
        !self.fail_tx
    }

    fn is_rx_overflow(&mut self) -> bool {
        std::mem::take(&mut self.rx_overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_transport_delivers_in_order() {
        let mut t = QueueTransport::new();
        t.push_rx(vec![1, 2, 3]);
        t.push_rx(vec![4]);
        let mut buf = [0u8; 2];
        assert!(t.is_frame_available());
        assert_eq!(t.receive_frame(&mut buf), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(t.receive_frame(&mut buf), 1);
        assert_eq!(t.receive_frame(&mut buf), 0);
        assert!(!t.is_frame_available());
    }

    #[test]
    fn overflow_flag_clears_on_read() {
        let mut t = QueueTransport::new();
        t.signal_rx_overflow();
        fn drain<T: LinkTransport>(mut t: T) -> (bool, bool) {
            (t.is_rx_overflow(), t.is_rx_overflow())
        }
        assert_eq!(drain(&mut t), (true, false));
    }

    #[test]
    fn failed_transmit_is_reported() {
        let mut t = QueueTransport::new();
        t.fail_tx = true;
        assert!(!t.transmit_frame(&[0xaa]));
        assert_eq!(t.take_tx(), vec![vec![0xaa]]);
    }
}
