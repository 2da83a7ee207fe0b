use crate::trace::sink::{ClientTrace, WroteRequestInfo};
use chrono::{DateTime, Utc};
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const HEADER_TERMINATOR: &[u8; 4] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEventKind {
    WroteHeaders,
    WroteRequest(WroteRequestInfo),
    FirstResponseByte,
}

/// A phase observed on the wire, stamped when it happened.
#[derive(Debug, Clone, Copy)]
pub struct WireEvent {
    pub at: DateTime<Utc>,
    pub kind: WireEventKind,
}

impl WireEvent {
    pub fn apply<T: ClientTrace + ?Sized>(self, trace: &mut T) {
        match self.kind {
            WireEventKind::WroteHeaders => trace.wrote_headers(self.at),
            WireEventKind::WroteRequest(info) => trace.wrote_request(self.at, info),
            WireEventKind::FirstResponseByte => trace.got_first_response_byte(self.at),
        }
    }
}

pub type WireEvents = UnboundedReceiver<WireEvent>;

/// Wraps a connection and reports when the request headers, the whole
/// request and the first response byte cross it.
///
/// Only the first request on the connection is observed.
#[derive(Debug)]
pub struct TracedIo<T> {
    inner: T,
    events: UnboundedSender<WireEvent>,
    body_len: u64,
    written: u64,
    terminator_matched: usize,
    header_end: Option<u64>,
    request_done: bool,
    first_byte_seen: bool,
}

impl<T> TracedIo<T> {
    /// `body_len` is the exact size of the request body that follows the headers.
    pub fn new(inner: T, body_len: u64) -> (Self, WireEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let io = Self {
            inner,
            events,
            body_len,
            written: 0,
            terminator_matched: 0,
            header_end: None,
            request_done: false,
            first_byte_seen: false,
        };
        (io, rx)
    }

    fn emit(&self, kind: WireEventKind) {
        // The receiver is gone once the runner stopped listening.
        let _ = self.events.send(WireEvent {
            at: Utc::now(),
            kind,
        });
    }

    fn observe_written(&mut self, bytes: &[u8]) {
        if self.header_end.is_none() {
            for (i, byte) in bytes.iter().enumerate() {
                if *byte == HEADER_TERMINATOR[self.terminator_matched] {
                    self.terminator_matched += 1;
                } else if *byte == HEADER_TERMINATOR[0] {
                    self.terminator_matched = 1;
                } else {
                    self.terminator_matched = 0;
                }
                if self.terminator_matched == HEADER_TERMINATOR.len() {
                    self.header_end = Some(self.written + i as u64 + 1);
                    break;
                }
            }
        }
        self.written += bytes.len() as u64;
    }

    fn request_complete(&self) -> bool {
        self.header_end
            .is_some_and(|end| self.written >= end + self.body_len)
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for TracedIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if !this.first_byte_seen && buf.filled().len() > before {
            this.first_byte_seen = true;
            this.emit(WireEventKind::FirstResponseByte);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TracedIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.observe_written(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write_vectored(cx, bufs))?;
        let mut remaining = n;
        for slice in bufs {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(slice.len());
            this.observe_written(&slice[..take]);
            remaining -= take;
        }
        Poll::Ready(Ok(n))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        if this.header_end.is_some() && !this.request_done {
            if this.terminator_matched == HEADER_TERMINATOR.len() {
                // Reset so the headers event is sent exactly once.
                this.terminator_matched = 0;
                this.emit(WireEventKind::WroteHeaders);
            }
            if this.request_complete() {
                this.request_done = true;
                this.emit(WireEventKind::WroteRequest(WroteRequestInfo {
                    bytes: this.written,
                }));
            }
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
