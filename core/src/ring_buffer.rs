use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;

/// Creates a bounded single-producer/single-consumer byte queue.
///
/// The writer half sits between a command's output and the handler that
/// forwards it to the client. Writes park when the buffer is full, so
/// back-pressure propagates from a slow consumer to the producing
/// process. Reads park when the buffer is empty; once the writer is shut
/// down (or dropped) the remaining bytes drain and reads return EOF.
pub fn ring_buffer(capacity: usize) -> (RingBufferWriter, RingBufferReader) {
    let shared = Arc::new(Mutex::new(State {
        buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
        capacity,
        write_closed: false,
        read_closed: false,
        read_waker: None,
        write_waker: None,
    }));
    (
        RingBufferWriter {
            shared: Arc::clone(&shared),
        },
        RingBufferReader { shared },
    )
}

struct State {
    buf: VecDeque<u8>,
    capacity: usize,
    write_closed: bool,
    read_closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl State {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

pub struct RingBufferWriter {
    shared: Arc<Mutex<State>>,
}

pub struct RingBufferReader {
    shared: Arc<Mutex<State>>,
}

fn lock(shared: &Mutex<State>) -> std::sync::MutexGuard<'_, State> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl AsyncWrite for RingBufferWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = lock(&self.shared);

        if state.read_closed || state.write_closed {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let available = state.capacity - state.buf.len();
        if available == 0 {
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = available.min(data.len());
        state.buf.extend(&data[..n]);
        state.wake_reader();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = lock(&self.shared);
        state.write_closed = true;
        state.wake_reader();
        Poll::Ready(Ok(()))
    }
}

impl Drop for RingBufferWriter {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        state.write_closed = true;
        state.wake_reader();
    }
}

impl AsyncRead for RingBufferReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = lock(&self.shared);

        if state.buf.is_empty() {
            if state.write_closed {
                return Poll::Ready(Ok(()));
            }
            state.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = state.buf.len().min(buf.remaining());
        let (front, back) = state.buf.as_slices();
        if n <= front.len() {
            buf.put_slice(&front[..n]);
        } else {
            buf.put_slice(front);
            buf.put_slice(&back[..n - front.len()]);
        }
        state.buf.drain(..n);
        state.wake_writer();
        Poll::Ready(Ok(()))
    }
}

impl Drop for RingBufferReader {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        state.read_closed = true;
        state.wake_writer();
    }
}
