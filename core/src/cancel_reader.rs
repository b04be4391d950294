use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use tokio::io::AsyncRead;
use tokio::io::ReadBuf;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFutureOwned;

/// Wraps a reader whose type does not expose cancellation so that a
/// blocked read can be released from the outside.
///
/// Calling [`CancelHandle::cancel`] makes the wrapper synthesize EOF:
/// an in-flight read wakes up and completes with zero bytes, and every
/// later read returns zero immediately. The underlying reader is left
/// untouched; it is typically the network stream and goes away with the
/// call that owns it.
pub struct CancelReader<R> {
    inner: R,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
}

/// Cancels the paired [`CancelReader`]. Cloneable; `cancel` is
/// idempotent and may race an in-flight read.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl<R> CancelReader<R> {
    pub fn new(inner: R) -> (Self, CancelHandle) {
        let token = CancellationToken::new();
        let reader = Self {
            inner,
            cancelled: Box::pin(token.clone().cancelled_owned()),
            done: false,
        };
        (reader, CancelHandle { token })
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CancelReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.done {
            return Poll::Ready(Ok(()));
        }

        // Polling the cancellation future first keeps the read armed to
        // wake on cancel even while the inner reader is pending.
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.done = true;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_pass_through_until_cancelled() {
        let (rx, mut tx) = tokio::io::simplex(64);
        let (mut reader, handle) = CancelReader::new(rx);

        tx.write_all(b"data").await.unwrap();

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");

        handle.cancel();
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn cancel_releases_a_blocked_read() {
        let (rx, _tx) = tokio::io::simplex(64);
        let (mut reader, handle) = CancelReader::new(rx);

        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        handle.cancel(); // idempotent

        let n = pending.await.unwrap().unwrap();
        assert_eq!(n, 0);
    }
}
