//! Write-through splitter used to copy a response into a cache writer.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::AsyncWrite;

/// Which half of a [`TeeWriter`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeeSide {
    /// The client-facing output
    Primary,
    /// The cache copy
    Secondary,
}

/// Writes every byte to a primary sink and, while it stays healthy, to a
/// secondary one.
///
/// A primary failure is returned to the caller. A secondary failure is
/// recorded and the secondary is dropped, so the primary keeps receiving
/// data. Either way [`TeeWriter::failed_side`] reports what happened and the
/// secondary's content must be treated as incomplete.
pub struct TeeWriter<P, S> {
    primary: P,
    secondary: Option<S>,
    /// Bytes accepted by the primary but not yet by the secondary
    pending: Vec<u8>,
    pending_pos: usize,
    failed: Option<TeeSide>,
    secondary_error: Option<io::Error>,
}

impl<P, S> TeeWriter<P, S>
where
    P: AsyncWrite + Unpin,
    S: AsyncWrite + Unpin,
{
    pub fn new(primary: P, secondary: Option<S>) -> Self {
        Self {
            primary,
            secondary,
            pending: Vec::new(),
            pending_pos: 0,
            failed: None,
            secondary_error: None,
        }
    }

    pub fn failed_side(&self) -> Option<TeeSide> {
        self.failed
    }

    /// Error that caused the secondary to be dropped, if any.
    pub fn take_secondary_error(&mut self) -> Option<io::Error> {
        self.secondary_error.take()
    }

    /// Give back the secondary, `None` if it was detached by a failure.
    pub fn into_secondary(self) -> Option<S> {
        self.secondary
    }

    fn fail_secondary(&mut self, err: io::Error) {
        self.failed.get_or_insert(TeeSide::Secondary);
        self.secondary = None;
        self.secondary_error = Some(err);
        self.pending.clear();
        self.pending_pos = 0;
    }

    /// Push pending bytes into the secondary. Never fails: a secondary error
    /// detaches the secondary.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        while self.pending_pos < self.pending.len() {
            let Some(secondary) = self.secondary.as_mut() else {
                break;
            };
            match Pin::new(secondary).poll_write(cx, &self.pending[self.pending_pos..]) {
                Poll::Ready(Ok(0)) => {
                    self.fail_secondary(io::ErrorKind::WriteZero.into());
                }
                Poll::Ready(Ok(n)) => self.pending_pos += n,
                Poll::Ready(Err(e)) => self.fail_secondary(e),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(())
    }

    fn record_primary<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if result.is_err() {
            self.failed = Some(TeeSide::Primary);
        }
        result
    }
}

impl<P, S> AsyncWrite for TeeWriter<P, S>
where
    P: AsyncWrite + Unpin,
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.failed == Some(TeeSide::Primary) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "primary output already failed",
            )));
        }
        ready!(this.poll_drain(cx));

        let result = ready!(Pin::new(&mut this.primary).poll_write(cx, buf));
        let n = this.record_primary(result)?;
        if this.secondary.is_some() {
            this.pending.extend_from_slice(&buf[..n]);
            // A pending drain is resumed by the next write or flush.
            let _ = this.poll_drain(cx);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx));
        let result = ready!(Pin::new(&mut this.primary).poll_flush(cx));
        this.record_primary(result)?;
        if let Some(secondary) = this.secondary.as_mut() {
            if let Err(e) = ready!(Pin::new(secondary).poll_flush(cx)) {
                this.fail_secondary(e);
            }
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx));
        if let Some(secondary) = this.secondary.as_mut() {
            if let Err(e) = ready!(Pin::new(secondary).poll_flush(cx)) {
                this.fail_secondary(e);
            }
        }
        let result = ready!(Pin::new(&mut this.primary).poll_shutdown(cx));
        this.record_primary(result)?;
        Poll::Ready(Ok(()))
    }
}
