use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// 只计数的 sink：多个 writer 并发写入也安全（`&WriteCounter` 实现了 `Write`）
#[derive(Debug, Default)]
pub struct WriteCounter {
    written: AtomicU64,
}

impl WriteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }
}

impl Write for &WriteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.fetch_add(buf.len() as u64, Ordering::AcqRel);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for WriteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 同时写入两个 writer（先 primary 再 secondary），两者都收到完全相同的字节
pub struct TeeWriter<A, B> {
    primary: A,
    secondary: B,
}

impl<A: Write, B: Write> TeeWriter<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }

    pub fn into_inner(self) -> (A, B) {
        (self.primary, self.secondary)
    }
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        self.secondary.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}

type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// 包装一个 reader，在 close（或 drop）时恰好调用一次回调，不论是否读完
pub struct OnCloseReader<R> {
    inner: R,
    on_close: Option<CloseCallback>,
}

impl<R> OnCloseReader<R> {
    pub fn new(inner: R, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            on_close: Some(Box::new(on_close)),
        }
    }

    pub fn close(&mut self) {
        if let Some(cb) = self.on_close.take() {
            cb();
        }
    }
}

impl<R> Drop for OnCloseReader<R> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<R: Read> Read for OnCloseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for OnCloseReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// 跳过 `start` 字节后，最多拷贝 `length` 字节到 `w`，返回实际写出的字节数
pub fn copy_section<R: Read, W: Write>(
    r: &mut R,
    w: &mut W,
    start: u64,
    length: u64,
) -> io::Result<u64> {
    let skipped = io::copy(&mut r.by_ref().take(start), &mut io::sink())?;
    if skipped < start {
        return Ok(0);
    }
    io::copy(&mut r.by_ref().take(length), w)
}

const CHANNEL_CHUNK: usize = 64 * 1024;

/// 同步 `Write` -> tokio channel 的桥：阻塞线程里的 pipeline 通过它把输出流给 HTTP body。
///
/// 接收端被 drop（客户端断开）后写入返回 `BrokenPipe`，pipeline 随之中止。
pub struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHANNEL_CHUNK),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(CHANNEL_CHUNK),
        ));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response receiver closed"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        if self.buf.len() >= CHANNEL_CHUNK {
            self.send_buffered()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}
