use std::sync::{Condvar, Mutex};
use std::time::Duration;

// Input (push) can be any size, output (front/pop) is always BLOCK_SIZE.

const DEFAULT_BLOCK_SIZE: usize = 16 * 16384;
const DEFAULT_N_BLOCKS: usize = 2;
const WAIT_TIMEOUT_MS: u64 = 1500;

struct State {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    // -1 is the halted ("fail forever") state
    blocks_filled: i32,
    last_input: bool,
    block_size: usize,
    n_blocks: usize,
}

/// Bounded byte FIFO between a sample source and its worker thread. This is
/// the only place sample blocks cross threads in the core.
pub struct Fifo {
    state: Mutex<State>,
    cv_ready: Condvar,
    cv_has_space: Condvar,
}

impl Default for Fifo {
    fn default() -> Self {
        Fifo::new(DEFAULT_BLOCK_SIZE, DEFAULT_N_BLOCKS)
    }
}

impl Fifo {
    pub fn new(block_size: usize, n_blocks: usize) -> Fifo {
        Fifo {
            state: Mutex::new(State {
                data: vec![0u8; block_size * n_blocks],
                head: 0,
                tail: 0,
                blocks_filled: 0,
                last_input: false,
                block_size,
                n_blocks,
            }),
            cv_ready: Condvar::new(),
            cv_has_space: Condvar::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.state.lock().unwrap().block_size
    }

    /// Fail-forever: pending and future waits return immediately, pushes are
    /// rejected.
    pub fn halt(&self) {
        let mut s = self.state.lock().unwrap();
        s.blocks_filled = -1;
        self.cv_ready.notify_all();
        self.cv_has_space.notify_all();
    }

    /// Orderly end of input. A partially filled tail block is zero padded
    /// and released so the consumer sees the final samples.
    pub fn push_finished(&self) {
        let mut s = self.state.lock().unwrap();
        s.last_input = true;

        let partial = s.tail % s.block_size;
        if partial != 0 && s.blocks_filled >= 0 && s.blocks_filled < s.n_blocks as i32 {
            let pad = s.block_size - partial;
            let sz = s.data.len();
            let tail = s.tail;
            for i in 0..pad {
                let idx = (tail + i) % sz;
                s.data[idx] = 0;
            }
            s.tail = (tail + pad) % sz;
            s.blocks_filled += 1;
        }
        self.cv_ready.notify_all();
    }

    pub fn finished(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.last_input && s.blocks_filled <= 0
    }

    pub fn halted(&self) -> bool {
        self.state.lock().unwrap().blocks_filled == -1
    }

    /// Block up to 1500 ms for at least one full block. `false` on timeout,
    /// halt or end-of-input, so callers can run stall detection.
    pub fn wait(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.blocks_filled == 0 && !s.last_input {
            let (guard, _) = self
                .cv_ready
                .wait_timeout_while(s, Duration::from_millis(WAIT_TIMEOUT_MS), |s| {
                    s.blocks_filled == 0 && !s.last_input
                })
                .unwrap();
            s = guard;
        }
        s.blocks_filled > 0
    }

    /// Copy of the head block; `None` when nothing is available.
    pub fn front(&self) -> Option<Vec<u8>> {
        let s = self.state.lock().unwrap();
        if s.blocks_filled <= 0 {
            return None;
        }
        Some(s.data[s.head..s.head + s.block_size].to_vec())
    }

    /// Release `count` blocks back to the producer.
    pub fn pop(&self, count: i32) {
        let mut s = self.state.lock().unwrap();
        let count = count.min(s.blocks_filled);
        if count > 0 {
            let sz = s.data.len();
            s.head = (s.head + count as usize * s.block_size) % sz;
            s.blocks_filled -= count;
            self.cv_has_space.notify_one();
        }
    }

    pub fn full(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.blocks_filled == s.n_blocks as i32
    }

    /// Copy `buf` into the ring. With `wait == false` the call fails when
    /// there is not enough room (buffer overrun: the caller logs and drops);
    /// with `wait == true` it blocks until space is available or `halt`.
    pub fn push(&self, buf: &[u8], wait: bool) -> bool {
        if buf.is_empty() {
            return true;
        }
        let mut s = self.state.lock().unwrap();

        let blocks_ready = ((s.tail % s.block_size + buf.len()) / s.block_size) as i32;
        let blocks_needed = ((s.tail % s.block_size + buf.len() - 1) / s.block_size + 1) as i32;

        if s.blocks_filled == -1 {
            return false;
        }

        if s.blocks_filled + blocks_needed > s.n_blocks as i32 {
            if wait {
                while s.blocks_filled != -1 && s.blocks_filled + blocks_needed > s.n_blocks as i32 {
                    s = self.cv_has_space.wait(s).unwrap();
                }
                if s.blocks_filled == -1 {
                    return false;
                }
            } else {
                return false;
            }
        }

        let sz = s.data.len();
        let tail = s.tail;
        if tail + buf.len() <= sz {
            s.data[tail..tail + buf.len()].copy_from_slice(buf);
        } else {
            let first = sz - tail;
            s.data[tail..].copy_from_slice(&buf[..first]);
            s.data[..buf.len() - first].copy_from_slice(&buf[first..]);
        }
        s.tail = (tail + buf.len()) % sz;

        if blocks_ready > 0 {
            s.blocks_filled += blocks_ready;
            self.cv_ready.notify_one();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_pop_roundtrip() {
        let fifo = Fifo::new(4, 4);
        assert!(fifo.push(&[1, 2], false));
        assert!(fifo.push(&[3, 4, 5, 6], false));
        assert!(fifo.wait());
        assert_eq!(fifo.front().unwrap(), vec![1, 2, 3, 4]);
        fifo.pop(1);
        // two bytes remain in a partial tail block, not yet a full block
        assert!(fifo.front().is_none());
        assert!(fifo.push(&[7, 8], false));
        assert!(fifo.wait());
        assert_eq!(fifo.front().unwrap(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_overrun_without_wait() {
        let fifo = Fifo::new(4, 2);
        assert!(fifo.push(&[0u8; 8], false));
        // ring is full, a non-waiting push is a buffer overrun
        assert!(!fifo.push(&[1u8; 4], false));
        fifo.pop(1);
        assert!(fifo.push(&[1u8; 4], false));
    }

    #[test]
    fn test_halt_unblocks_producer() {
        let fifo = Arc::new(Fifo::new(4, 1));
        assert!(fifo.push(&[0u8; 4], false));

        let f = fifo.clone();
        let t = std::thread::spawn(move || f.push(&[1u8; 4], true));

        std::thread::sleep(Duration::from_millis(50));
        fifo.halt();
        assert!(!t.join().unwrap());
        assert!(!fifo.wait());
    }

    #[test]
    fn test_wait_times_out() {
        let fifo = Fifo::new(4, 2);
        let start = std::time::Instant::now();
        assert!(!fifo.wait());
        assert!(start.elapsed() >= Duration::from_millis(WAIT_TIMEOUT_MS - 100));
    }

    #[test]
    fn test_push_finished() {
        let fifo = Fifo::new(4, 2);
        fifo.push_finished();
        assert!(!fifo.wait());
        assert!(fifo.finished());
    }
}
