//! Connection IO with read/write/idle deadlines.

use pin_project_lite::pin_project;
use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::Sleep,
};

pin_project! {
    /// Wraps a connection so that reads and writes are bounded by the
    /// configured timeouts.
    ///
    /// While a request is in flight (tracked by the shared counter the
    /// request handler maintains) reads are bounded by the read timeout;
    /// between requests, by the idle timeout. A deadline is armed when an
    /// operation first returns pending and cleared when it completes, so
    /// it bounds the time to the next byte of progress. Expiry surfaces
    /// as `TimedOut`, which closes the connection.
    pub struct TimeoutIo<S> {
        #[pin]
        inner: S,
        read_timeout: Duration,
        write_timeout: Duration,
        idle_timeout: Duration,
        in_flight: Arc<AtomicUsize>,
        read_deadline: Option<Pin<Box<Sleep>>>,
        write_deadline: Option<Pin<Box<Sleep>>>,
    }
}

impl<S> TimeoutIo<S> {
    pub fn new(
        inner: S,
        read_timeout: Duration,
        write_timeout: Duration,
        idle_timeout: Duration,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
            idle_timeout,
            in_flight,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

/// Counts a request as in flight for the connection it arrived on.
pub struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    pub fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: AsyncRead> AsyncRead for TimeoutIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();

        match this.inner.as_mut().poll_read(cx, buf) {
            Poll::Ready(res) => {
                *this.read_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                if this.read_deadline.is_none() {
                    let timeout = if this.in_flight.load(Ordering::SeqCst) > 0 {
                        *this.read_timeout
                    } else {
                        *this.idle_timeout
                    };
                    *this.read_deadline = Some(Box::pin(tokio::time::sleep(timeout)));
                }
                let deadline = this
                    .read_deadline
                    .as_mut()
                    .expect("deadline was just armed");
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for TimeoutIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        match this.inner.as_mut().poll_write(cx, buf) {
            Poll::Ready(res) => {
                *this.write_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                if this.write_deadline.is_none() {
                    *this.write_deadline = Some(Box::pin(tokio::time::sleep(*this.write_timeout)));
                }
                let deadline = this
                    .write_deadline
                    .as_mut()
                    .expect("deadline was just armed");
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "write timed out",
                    ))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
