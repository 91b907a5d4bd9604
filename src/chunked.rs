use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

// Chunk-size lines longer than this are rejected.
const MAX_LINE_LENGTH: usize = 4096;

const SOURCE_BUFFER_SIZE: usize = 4096;
const MIN_SOURCE_BUFFER_SIZE: usize = 16;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum ChunkedError {
    #[error("header line too long")]
    LineTooLong,
    #[error("http chunk length too large")]
    ChunkLengthTooLarge,
    #[error("invalid byte in chunk length")]
    InvalidByteInLength,
    #[error("malformed chunked encoding")]
    MalformedChunkedEncoding,
}

impl From<ChunkedError> for io::Error {
    fn from(error: ChunkedError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, error)
    }
}

// A byte source with a peekable internal buffer. The decoder uses the
// buffered view to decide whether the next chunk header is already available
// without blocking, and reads chunk bodies directly into the caller's slice.
pub(crate) trait ChunkSource {
    fn buffered(&self) -> &[u8];
    fn consume(&mut self, amt: usize);
    // One read from the underlying source into the internal buffer.
    // Ok(0) means EOF.
    async fn fill(&mut self) -> io::Result<usize>;
    // Read into `out`, draining the internal buffer first. Ok(0) means EOF.
    async fn read_direct(&mut self, out: &mut [u8]) -> io::Result<usize>;
}

// Streaming decoder for `Transfer-Encoding: chunked` framing. The decoder is
// pass-through: chunk-size lines, CRLF separators, and the terminating
// `0\r\n\r\n` are all copied to the output verbatim, so a downstream splice
// transmits exactly the bytes that arrived. `read` returns EOF (Ok(0)) after
// the terminating chunk has been fully emitted.
//
// Partial writes are resumable: a line or footer that did not fit into the
// caller's slice carries a cursor into the next call.
#[derive(Default)]
pub(crate) struct ChunkedDecoder {
    // Unread body bytes in the current chunk.
    remaining_in_chunk: u64,
    // Whether the \r\n chunk footer still needs to be verified.
    check_end: bool,
    done: bool,
    line: Vec<u8>,
    line_pending: usize,
    footer: [u8; 2],
    footer_pending: usize,
}

impl ChunkedDecoder {
    pub(crate) async fn read<S: ChunkSource>(
        &mut self,
        src: &mut S,
        out: &mut [u8],
    ) -> io::Result<usize> {
        let mut written = 0;
        let mut body_written = 0;
        loop {
            if self.done {
                break;
            }
            if self.check_end {
                if body_written > 0 && src.buffered().len() < 2 && self.footer_pending == 0 {
                    // Some data is already going out. Return early (per the
                    // read contract) instead of potentially blocking on the
                    // chunk footer.
                    break;
                }
                if self.footer_pending == 0 {
                    self.read_footer(src).await?;
                    if &self.footer != b"\r\n" {
                        return Err(ChunkedError::MalformedChunkedEncoding.into());
                    }
                    self.footer_pending = 2;
                }
                if written == out.len() {
                    break;
                }
                let start = self.footer.len() - self.footer_pending;
                let n = copy_into(&mut out[written..], &self.footer[start..]);
                written += n;
                self.footer_pending -= n;
                if self.footer_pending != 0 {
                    break;
                }
                self.check_end = false;
                if self.remaining_in_chunk == 0 && self.line == b"0\r\n" {
                    self.done = true;
                    continue;
                }
            }
            if self.line_pending > 0 {
                if written == out.len() {
                    break;
                }
                let start = self.line.len() - self.line_pending;
                let n = copy_into(&mut out[written..], &self.line[start..]);
                written += n;
                self.line_pending -= n;
                if self.line_pending != 0 {
                    break;
                }
                if self.remaining_in_chunk == 0 {
                    if self.line == b"0\r\n" {
                        // Terminating chunk; the final \r\n follows.
                        self.check_end = true;
                        continue;
                    }
                    self.done = true;
                    continue;
                }
            }
            if self.remaining_in_chunk == 0 {
                if body_written > 0 && !src.buffered().contains(&b'\n') {
                    // Enough was returned. Don't potentially block reading a
                    // new chunk header.
                    break;
                }
                self.begin_chunk(src).await?;
                continue;
            }
            if written == out.len() {
                break;
            }
            let cap = (out.len() - written).min(usize::try_from(self.remaining_in_chunk).unwrap_or(usize::MAX));
            let n = src.read_direct(&mut out[written..written + cap]).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            written += n;
            body_written += n;
            self.remaining_in_chunk -= n as u64;
            if self.remaining_in_chunk == 0 {
                self.check_end = true;
            }
        }
        Ok(written)
    }

    // Read and parse a chunk-size line, retaining the raw bytes for output.
    async fn begin_chunk<S: ChunkSource>(&mut self, src: &mut S) -> io::Result<()> {
        self.read_chunk_line(src).await?;
        let value = trim_trailing_whitespace(&self.line);
        // Chunk extensions after ';' are ignored but passed through.
        let value = match value.iter().position(|&byte| byte == b';') {
            Some(index) => &value[..index],
            None => value,
        };
        self.remaining_in_chunk = parse_hex_uint(value)?;
        Ok(())
    }

    async fn read_chunk_line<S: ChunkSource>(&mut self, src: &mut S) -> io::Result<()> {
        self.line.clear();
        loop {
            let buffered = src.buffered();
            if let Some(pos) = buffered.iter().position(|&byte| byte == b'\n') {
                if self.line.len() + pos + 1 >= MAX_LINE_LENGTH {
                    return Err(ChunkedError::LineTooLong.into());
                }
                self.line.extend_from_slice(&buffered[..=pos]);
                src.consume(pos + 1);
                break;
            }
            if self.line.len() + buffered.len() >= MAX_LINE_LENGTH {
                return Err(ChunkedError::LineTooLong.into());
            }
            let taken = buffered.len();
            self.line.extend_from_slice(buffered);
            src.consume(taken);
            if src.fill().await? == 0 {
                // We always know when EOF is coming; a started line must end.
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        self.line_pending = self.line.len();
        Ok(())
    }

    async fn read_footer<S: ChunkSource>(&mut self, src: &mut S) -> io::Result<()> {
        let mut got = 0;
        while got < self.footer.len() {
            let buffered = src.buffered();
            if buffered.is_empty() {
                if src.fill().await? == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                continue;
            }
            let n = buffered.len().min(self.footer.len() - got);
            self.footer[got..got + n].copy_from_slice(&buffered[..n]);
            src.consume(n);
            got += n;
        }
        Ok(())
    }
}

fn copy_into(out: &mut [u8], src: &[u8]) -> usize {
    let n = out.len().min(src.len());
    out[..n].copy_from_slice(&src[..n]);
    n
}

fn trim_trailing_whitespace(mut value: &[u8]) -> &[u8] {
    while let [rest @ .., last] = value {
        if matches!(*last, b' ' | b'\t' | b'\n' | b'\r') {
            value = rest;
        } else {
            break;
        }
    }
    value
}

fn parse_hex_uint(value: &[u8]) -> Result<u64, ChunkedError> {
    let mut n: u64 = 0;
    for (index, byte) in value.iter().enumerate() {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => return Err(ChunkedError::InvalidByteInLength),
        };
        if index == 16 {
            return Err(ChunkedError::ChunkLengthTooLarge);
        }
        n = (n << 4) | u64::from(digit);
    }
    Ok(n)
}

// Internal buffer implementing `ChunkSource` over any async reader.
pub(crate) struct BufferedChunkSource<R> {
    reader: R,
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
}

impl<R: AsyncRead + Unpin> BufferedChunkSource<R> {
    fn with_capacity(reader: R, size: usize) -> Self {
        BufferedChunkSource {
            reader,
            buf: vec![0u8; size.max(MIN_SOURCE_BUFFER_SIZE)].into_boxed_slice(),
            pos: 0,
            cap: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> ChunkSource for BufferedChunkSource<R> {
    fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..self.cap]
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.cap);
    }

    async fn fill(&mut self) -> io::Result<usize> {
        if self.pos == self.cap {
            self.pos = 0;
            self.cap = 0;
        }
        let n = self.reader.read(&mut self.buf[self.cap..]).await?;
        self.cap += n;
        Ok(n)
    }

    async fn read_direct(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.cap {
            let n = copy_into(out, &self.buf[self.pos..self.cap]);
            self.pos += n;
            return Ok(n);
        }
        self.reader.read(out).await
    }
}

// Standalone pass-through chunked reader over an async byte source.
pub(crate) struct ChunkedReader<R> {
    source: BufferedChunkSource<R>,
    decoder: ChunkedDecoder,
}

impl<R: AsyncRead + Unpin> ChunkedReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self::with_buffer_size(reader, SOURCE_BUFFER_SIZE)
    }

    pub(crate) fn with_buffer_size(reader: R, size: usize) -> Self {
        ChunkedReader {
            source: BufferedChunkSource::with_capacity(reader, size),
            decoder: ChunkedDecoder::default(),
        }
    }

    pub(crate) async fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.decoder.read(&mut self.source, out).await
    }

    pub(crate) async fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let mut chunk = [0u8; 512];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAMED: &[u8] = b"7\r\nhello, \r\n17\r\nworld! 0123456789abcdef\r\n0\r\n\r\n";

    fn inner_error(error: &io::Error) -> Option<&ChunkedError> {
        error.get_ref()?.downcast_ref::<ChunkedError>()
    }

    #[tokio::test]
    async fn passes_framing_through_untouched() {
        let mut reader = ChunkedReader::new(FRAMED);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, FRAMED);
    }

    #[tokio::test]
    async fn passes_framing_through_with_tiny_internal_buffers() {
        for size in 0..FRAMED.len() {
            let mut reader = ChunkedReader::with_buffer_size(FRAMED, size);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, FRAMED, "internal buffer size {size}");
        }
    }

    #[tokio::test]
    async fn reads_multiple_chunks_in_one_call() {
        let framed: &[u8] = b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n";
        let mut reader = ChunkedReader::new(framed);
        let mut out = [0u8; 21];
        let n = reader.read(&mut out).await.unwrap();
        assert_eq!(n, framed.len());
        assert_eq!(&out[..n], framed);
        assert_eq!(reader.read(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn does_not_block_for_an_unbuffered_chunk_header() {
        // The first chunk fills the 16-byte internal buffer exactly, so a
        // single read must stop there rather than block on the next header.
        let framed: &[u8] = b"b\r\n0123456789a\r\n3\r\nfoo\r\n0\r\n\r\n";
        let mut reader = ChunkedReader::with_buffer_size(framed, 16);
        let mut out = vec![0u8; framed.len()];
        let n = reader.read(&mut out).await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(&out[..n], b"b\r\n0123456789a\r\n");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"3\r\nfoo\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn resumes_partial_writes_with_a_one_byte_output() {
        let mut reader = ChunkedReader::new(FRAMED);
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = reader.read(&mut byte).await.unwrap();
            if n == 0 {
                break;
            }
            out.push(byte[0]);
        }
        assert_eq!(out, FRAMED);
    }

    #[tokio::test]
    async fn ignores_chunk_extensions() {
        let framed: &[u8] = b"3;token=val\r\nfoo\r\n0\r\n\r\n";
        let mut reader = ChunkedReader::new(framed);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, framed);
    }

    #[tokio::test]
    async fn rejects_a_missing_chunk_footer() {
        let framed: &[u8] = b"3\r\nfooXY3\r\nbar\r\n0\r\n\r\n";
        let mut reader = ChunkedReader::new(framed);
        let mut out = Vec::new();
        let error = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(
            inner_error(&error),
            Some(&ChunkedError::MalformedChunkedEncoding)
        );
    }

    #[tokio::test]
    async fn rejects_an_invalid_length_byte() {
        let framed: &[u8] = b"3g\r\nfoo\r\n0\r\n\r\n";
        let mut reader = ChunkedReader::new(framed);
        let mut out = Vec::new();
        let error = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(
            inner_error(&error),
            Some(&ChunkedError::InvalidByteInLength)
        );
    }

    #[tokio::test]
    async fn rejects_an_oversized_chunk_length() {
        let framed: &[u8] = b"00000000000000007\r\nfoo\r\n0\r\n\r\n";
        let mut reader = ChunkedReader::new(framed);
        let mut out = Vec::new();
        let error = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(
            inner_error(&error),
            Some(&ChunkedError::ChunkLengthTooLarge)
        );
    }

    #[tokio::test]
    async fn rejects_an_overlong_size_line() {
        let mut framed = vec![b'0'; MAX_LINE_LENGTH + 1];
        framed.extend_from_slice(b"\r\n\r\n");
        let mut reader = ChunkedReader::new(framed.as_slice());
        let mut out = Vec::new();
        let error = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(inner_error(&error), Some(&ChunkedError::LineTooLong));
    }

    #[tokio::test]
    async fn surfaces_eof_in_the_middle_of_a_chunk() {
        let framed: &[u8] = b"ff\r\ntruncated";
        let mut reader = ChunkedReader::new(framed);
        let mut out = Vec::new();
        let error = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn surfaces_eof_in_the_middle_of_a_size_line() {
        let framed: &[u8] = b"7";
        let mut reader = ChunkedReader::new(framed);
        let mut out = Vec::new();
        let error = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }
}
