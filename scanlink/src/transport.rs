use crate::encoding::{Instruction, Readable};
use crate::error::{Error, Result};
use crate::link::LinkExt;
use crate::opcode;
use crate::session::SessionState;
use crate::status::{TargetStatus, CREDIT_MASK, SYS_STALL, TARGET_STATUS_SIZE};
use log::{trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// State shared between caller threads and the poller
pub(crate) struct Shared {
    state: Mutex<SessionState>,
    polling: AtomicBool,
    destroy: AtomicBool,
}

impl Shared {
    pub fn new(state: SessionState) -> Self {
        Shared {
            state: Mutex::new(state),
            polling: AtomicBool::new(false),
            destroy: AtomicBool::new(false),
        }
    }

    /// Takes the session lock
    ///
    /// A panic while holding the lock leaves the state consistent enough to keep going, so a
    /// poisoned lock is entered anyway.
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn suspend(&self) {
        self.polling.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.polling.store(true, Ordering::SeqCst);
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }
}

/// Reads the status byte and transmits as many queued chunks as the board has credit for
pub(crate) fn poll_once(state: &mut SessionState) -> Result<()> {
    let link = state.link.as_mut().ok_or(Error::NotConnected)?;
    let reply = link.request(
        &Instruction::new(opcode::INT_STATUS, 0, (0u16, 1u16)),
        1,
    )?;
    let mut status = reply[0];
    let mut credit = status & CREDIT_MASK;
    while credit > 0 {
        let Some(chunk) = state.sink.queue_mut().pop_front() else {
            break;
        };
        link.exchange(chunk.data(), 0)?;
        trace!("sent chunk of {} instructions", chunk.len());
        status &= !SYS_STALL;
        credit -= 1;
    }
    state.status_byte = status;
    Ok(())
}

/// Fetches the telemetry block of the query target
pub(crate) fn refresh_target_status(state: &mut SessionState) -> Result<()> {
    let query = state.address.query;
    let link = state.link.as_mut().ok_or(Error::NotConnected)?;
    let reply = link.request(
        &Instruction::new(
            opcode::INT_TGTSTATUS,
            1 << query,
            (0u16, TARGET_STATUS_SIZE as u16),
        ),
        TARGET_STATUS_SIZE,
    )?;
    let mut data = &reply[..];
    let mut status =
        TargetStatus::read(&mut data).map_err(|_| Error::data("short target status reply"))?;
    status.me = query;
    state.target_status = status;
    Ok(())
}

/// Background thread driving [`poll_once`] while polling is enabled
///
/// Suspending only flips a flag, the thread keeps running until the poller is dropped.
pub(crate) struct Poller {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn spawn(shared: Arc<Shared>, interval: Duration) -> Result<Self> {
        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name("scanlink-poller".into())
            .spawn(move || run(&worker, interval))?;
        Ok(Poller {
            shared,
            thread: Some(thread),
        })
    }

    #[cfg(test)]
    pub fn thread_id(&self) -> Option<thread::ThreadId> {
        self.thread.as_ref().map(|t| t.thread().id())
    }
}

fn run(shared: &Shared, interval: Duration) {
    while !shared.destroy.load(Ordering::SeqCst) {
        if shared.is_polling() {
            let mut state = shared.lock();
            // suspend may have raced the lock
            if shared.is_polling() && state.link.is_some() {
                let result = poll_once(&mut state).and_then(|_| refresh_target_status(&mut state));
                if let Err(e) = result {
                    warn!("status poll failed, polling suspended: {e}");
                    shared.suspend();
                }
            }
        }
        thread::park_timeout(interval);
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shared.destroy.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::fifo_buffer::CHUNK_INSTRUCTIONS;
    use crate::sim::SimulatedBoard;
    use crate::status::IO_ABORT;
    use std::time::Instant;

    fn connected_state() -> (SessionState, SimulatedBoard) {
        let config = SessionConfig::default();
        let board = SimulatedBoard::new(&config.flash);
        let mut state = SessionState::new(config);
        state.link = Some(Box::new(board.clone()));
        (state, board)
    }

    fn queue_chunks(state: &mut SessionState, chunks: usize) {
        for n in 0..chunks * CHUNK_INSTRUCTIONS {
            state
                .sink
                .queue_mut()
                .push(&Instruction::new(opcode::SLEEP, 1, n as i32));
        }
    }

    #[test]
    fn credit_limits_chunks_per_poll() {
        let (mut state, board) = connected_state();
        board.set_status(2, true, false);
        queue_chunks(&mut state, 5);

        poll_once(&mut state).unwrap();
        assert_eq!(state.sink.queue().queued(), 3);
        assert_eq!(board.streamed().len(), 2 * CHUNK_INSTRUCTIONS);
        assert_eq!(state.status_byte & SYS_STALL, 0);

        poll_once(&mut state).unwrap();
        poll_once(&mut state).unwrap();
        assert_eq!(state.sink.queue().queued(), 0);
        let sent: Vec<i32> = board.streamed().iter().map(|i| i.operands()).collect();
        let expected: Vec<i32> = (0..5 * CHUNK_INSTRUCTIONS as i32).collect();
        assert_eq!(sent, expected);
    }

    #[test]
    fn no_credit_sends_nothing() {
        let (mut state, board) = connected_state();
        board.set_status(0, false, true);
        queue_chunks(&mut state, 1);
        poll_once(&mut state).unwrap();
        assert_eq!(state.sink.queue().queued(), 1);
        assert!(board.streamed().is_empty());
        assert_eq!(state.status_byte & IO_ABORT, IO_ABORT);
    }

    #[test]
    fn telemetry_is_tagged_with_query_target() {
        let (mut state, board) = connected_state();
        board.set_target_status(
            3,
            TargetStatus {
                inputs: 0x55,
                ..Default::default()
            },
        );
        state.address.query = 3;
        refresh_target_status(&mut state).unwrap();
        assert_eq!(state.target_status.inputs, 0x55);
        assert_eq!(state.target_status.me, 3);
        let req = board.requests_with(opcode::INT_TGTSTATUS);
        assert_eq!(req[0].target, 0x08);
    }

    #[test]
    fn poll_without_link_fails() {
        let mut state = SessionState::new(SessionConfig::default());
        assert!(matches!(poll_once(&mut state), Err(Error::NotConnected)));
    }

    fn wait_streamed(board: &SimulatedBoard, count: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(2);
        while board.streamed().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        board.streamed().len()
    }

    #[test]
    fn resumed_poller_drains_queue_on_same_thread() {
        let (mut state, board) = connected_state();
        board.set_status(4, true, false);
        queue_chunks(&mut state, 1);
        let shared = Arc::new(Shared::new(state));
        let poller = Poller::spawn(shared.clone(), Duration::from_millis(2)).unwrap();
        let id = poller.thread_id();
        assert!(id.is_some());

        thread::sleep(Duration::from_millis(30));
        assert!(board.streamed().is_empty());
        assert_eq!(shared.lock().sink.queue().queued(), 1);

        shared.resume();
        assert_eq!(wait_streamed(&board, CHUNK_INSTRUCTIONS), CHUNK_INSTRUCTIONS);

        shared.suspend();
        queue_chunks(&mut shared.lock(), 1);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(board.streamed().len(), CHUNK_INSTRUCTIONS);

        shared.resume();
        assert_eq!(
            wait_streamed(&board, 2 * CHUNK_INSTRUCTIONS),
            2 * CHUNK_INSTRUCTIONS
        );
        assert_eq!(poller.thread_id(), id);
        assert_eq!(shared.lock().sink.queue().queued(), 0);
    }

    #[test]
    fn dropping_the_poller_stops_the_thread() {
        let shared = Arc::new(Shared::new(SessionState::new(SessionConfig::default())));
        let poller = Poller::spawn(shared.clone(), Duration::from_secs(60)).unwrap();
        shared.resume();
        drop(poller);
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
