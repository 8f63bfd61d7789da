use std::io::{self, Read, Write};

/// One answer from a [`BlockSource`] pull.
#[derive(Debug, PartialEq, Clone)]
pub enum Chunk {
    /// Up to `max` bytes of payload. A chunk shorter than the requested
    /// maximum (including an empty one) terminates the transfer.
    Data(Vec<u8>),
    /// Nothing available yet; the server retries after a short tick.
    Pending,
    /// The stream is exhausted.
    End,
}

/// Trait used to feed read transfers without the server ever owning the
/// payload. Implementations may read a file, proxy an HTTP body, or
/// generate bytes programmatically; they get no shutdown call and must be
/// robust to being dropped mid-transfer.
pub trait BlockSource {
    /// Produces the next chunk of at most `max` bytes.
    fn pull(&mut self, max: usize) -> io::Result<Chunk>;
}

/// Receiving side of a write transfer. `last` is true exactly once, on the
/// final (short) frame.
pub trait BlockSink {
    fn push(&mut self, payload: &[u8], last: bool) -> io::Result<()>;
}

/// Per-request factory the embedding host supplies to the server.
/// A trivial directory-backed implementation ships with the `streamtftpd`
/// binary; the library itself has no notion of a filesystem.
pub trait StreamProvider {
    type Source: BlockSource;
    type Sink: BlockSink;

    /// Opens a source for a read request, along with the total size if it
    /// is known up front (used to answer a `tsize` probe).
    fn open_source(&mut self, filename: &str) -> io::Result<(Self::Source, Option<u64>)>;

    /// Opens a sink for a write request. `announced_size` is the total the
    /// client declared via `tsize`, when it did.
    fn open_sink(&mut self, filename: &str, announced_size: Option<u64>)
        -> io::Result<Self::Sink>;
}

/// Adapts any `Read` into a `BlockSource`.
pub struct ReadSource<R: Read> {
    inner: R,
}

impl<R: Read> ReadSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> BlockSource for ReadSource<R> {
    fn pull(&mut self, max: usize) -> io::Result<Chunk> {
        let mut v = Vec::with_capacity(max);
        self.inner.by_ref().take(max as u64).read_to_end(&mut v)?;
        Ok(Chunk::Data(v))
    }
}

/// Adapts any `Write` into a `BlockSink`.
pub struct WriteSink<W: Write> {
    inner: W,
}

impl<W: Write> WriteSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> BlockSink for WriteSink<W> {
    fn push(&mut self, payload: &[u8], last: bool) -> io::Result<()> {
        self.inner.write_all(payload)?;
        if last {
            self.inner.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_source_chunks_then_runs_dry() {
        let mut src = ReadSource::new(&b"abcdefgh"[..]);
        assert_eq!(src.pull(4).unwrap(), Chunk::Data(b"abcd".to_vec()));
        assert_eq!(src.pull(4).unwrap(), Chunk::Data(b"efgh".to_vec()));
        // exhausted input yields an empty (terminal) chunk
        assert_eq!(src.pull(4).unwrap(), Chunk::Data(vec![]));
    }

    #[test]
    fn write_sink_accumulates() {
        let mut out = vec![];
        {
            let mut sink = WriteSink::new(&mut out);
            sink.push(b"hello ", false).unwrap();
            sink.push(b"world", true).unwrap();
        }
        assert_eq!(out, b"hello world");
    }
}
