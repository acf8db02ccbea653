//! 内存中的模拟串口
//!
//! `MockTransport::pair()` 返回传输本身和一个 `MockPeer`。`MockPeer`
//! 扮演设备一侧：注入入站字节、观察每次写入、注入连续写失败。

use crate::{RxTransport, SerialError, SplittableTransport, TxTransport};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// 默认读超时，与 `SerialConfig` 默认值一致
pub const DEFAULT_MOCK_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// 模拟接收半部
pub struct MockRx {
    inbound: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    read_timeout: Duration,
}

/// 模拟发送半部
pub struct MockTx {
    written: Sender<Vec<u8>>,
    fail_writes: Arc<AtomicUsize>,
    write_attempts: Arc<AtomicUsize>,
}

/// 模拟传输
pub struct MockTransport {
    rx: MockRx,
    tx: MockTx,
}

/// 设备一侧的句柄
#[derive(Clone)]
pub struct MockPeer {
    inbound: Sender<Vec<u8>>,
    written: Receiver<Vec<u8>>,
    fail_writes: Arc<AtomicUsize>,
    write_attempts: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn pair() -> (MockTransport, MockPeer) {
        Self::pair_with_timeout(DEFAULT_MOCK_READ_TIMEOUT)
    }

    pub fn pair_with_timeout(read_timeout: Duration) -> (MockTransport, MockPeer) {
        let (inbound_tx, inbound_rx) = unbounded();
        let (written_tx, written_rx) = unbounded();
        let fail_writes = Arc::new(AtomicUsize::new(0));
        let write_attempts = Arc::new(AtomicUsize::new(0));

        let transport = MockTransport {
            rx: MockRx {
                inbound: inbound_rx,
                pending: VecDeque::new(),
                read_timeout,
            },
            tx: MockTx {
                written: written_tx,
                fail_writes: fail_writes.clone(),
                write_attempts: write_attempts.clone(),
            },
        };
        let peer = MockPeer {
            inbound: inbound_tx,
            written: written_rx,
            fail_writes,
            write_attempts,
        };
        (transport, peer)
    }
}

impl RxTransport for MockRx {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.pending.is_empty() {
            match self.inbound.recv_timeout(self.read_timeout) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => return Err(SerialError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(SerialError::Disconnected),
            }
        }

        let n = self.pending.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        if n == 0 {
            // 注入了空块
            return Err(SerialError::Timeout);
        }
        Ok(n)
    }
}

impl TxTransport for MockTx {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        self.write_attempts.fetch_add(1, Ordering::Relaxed);

        let failed = self
            .fail_writes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SerialError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected write failure",
            )));
        }

        self.written
            .send(bytes.to_vec())
            .map_err(|_| SerialError::Disconnected)
    }
}

impl RxTransport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        self.rx.read(buf)
    }
}

impl TxTransport for MockTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        self.tx.write_all(bytes)
    }
}

impl SplittableTransport for MockTransport {
    type Rx = MockRx;
    type Tx = MockTx;

    fn split(self) -> Result<(MockRx, MockTx), SerialError> {
        Ok((self.rx, self.tx))
    }
}

impl MockPeer {
    /// 注入入站字节（设备 → 主机）
    pub fn inject(&self, bytes: &[u8]) {
        // 传输已被丢弃时静默忽略
        let _ = self.inbound.send(bytes.to_vec());
    }

    /// 等待下一次写入
    pub fn recv_written(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.written.recv_timeout(timeout).ok()
    }

    /// 取出目前为止的全部写入
    pub fn drain_written(&self) -> Vec<Vec<u8>> {
        self.written.try_iter().collect()
    }

    /// 让接下来的 `n` 次写入失败
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::Release);
    }

    /// 写入尝试总数（含失败）
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::Relaxed)
    }
}
