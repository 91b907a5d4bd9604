use std::io;

use http::Uri;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::{
    buffer_pool::PooledBuffer,
    chunked::{ChunkSource, ChunkedDecoder},
    error::ServerError,
};

const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";

// Streaming HTTP parser and rewriter. Wraps a byte reader and a fixed-size
// parse buffer; reads just enough to expose the start line and headers, can
// rewrite the Host/Origin headers and the request-URI in place while the
// buffer has not been handed downstream, and then yields a body reader that
// frames the remaining bytes (passthrough, length-bounded, or chunked)
// without ever copying bodies through intermediate storage.
//
// The same type handles requests and responses: for responses, the caller
// seeds the method of the request being answered so HEAD/CONNECT semantics
// apply.
pub(crate) struct HttpProcessor<R> {
    reader: R,
    buf: PooledBuffer,
    read_pos: usize,
    write_pos: usize,
    // Set once every buffered byte went out; later rewrites are dropped.
    buffer_drained: bool,
    parsed: bool,
    is_request: bool,
    request_method: Option<String>,
    raw_uri: Option<String>,
    url: Option<Uri>,
    response_status: u16,
    // Canonicalized name/value pairs in wire order.
    headers: Vec<(String, String)>,
    body_starts: usize,
    // Bytes sitting in the parse buffer when headers were parsed, adjusted
    // by in-place rewrites.
    buffered_bytes: u64,
    saw_eof: bool,
}

impl<R: AsyncRead + Unpin> HttpProcessor<R> {
    pub(crate) fn new(reader: R, buf: PooledBuffer) -> Self {
        HttpProcessor {
            reader,
            buf,
            read_pos: 0,
            write_pos: 0,
            buffer_drained: false,
            parsed: false,
            is_request: false,
            request_method: None,
            raw_uri: None,
            url: None,
            response_status: 0,
            headers: Vec::new(),
            body_starts: 0,
            buffered_bytes: 0,
            saw_eof: false,
        }
    }

    // Seed the method of the request this response answers.
    pub(crate) fn with_request_method(mut self, method: Option<String>) -> Self {
        self.request_method = method;
        self
    }

    pub(crate) fn is_request(&self) -> bool {
        self.is_request
    }

    pub(crate) fn request_method(&self) -> Option<&str> {
        self.request_method.as_deref()
    }

    pub(crate) fn raw_uri(&self) -> Option<&str> {
        self.raw_uri.as_deref()
    }

    pub(crate) fn saw_eof(&self) -> bool {
        self.saw_eof
    }

    // Block until the CRLF CRLF delimiter has been observed, then parse the
    // start line and headers. Fails if the delimiter does not fit in the
    // parse buffer. Idempotent.
    pub(crate) async fn read_headers_if_needed(&mut self) -> io::Result<()> {
        if self.parsed {
            return Ok(());
        }
        let delimiter_index = loop {
            if let Some(index) = find(&self.buf[..self.write_pos], HEADER_DELIMITER) {
                break index;
            }
            if self.write_pos == self.buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    ServerError::HeadersTooLarge,
                ));
            }
            let write_pos = self.write_pos;
            let n = self.reader.read(&mut self.buf[write_pos..]).await?;
            if n == 0 {
                self.saw_eof = true;
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.write_pos += n;
        };
        if delimiter_index == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ServerError::HeadersTooLarge,
            ));
        }
        self.buffered_bytes = self.write_pos as u64;
        self.body_starts = delimiter_index + HEADER_DELIMITER.len();

        let first_line_end = find(&self.buf[..delimiter_index + 2], b"\r\n").unwrap_or(0);
        let start_line = String::from_utf8_lossy(&self.buf[..first_line_end]).into_owned();
        self.parse_header_lines(first_line_end + 2, delimiter_index + 2)?;
        self.parse_start_line(&start_line);
        self.parsed = true;
        Ok(())
    }

    fn parse_header_lines(&mut self, from: usize, to: usize) -> io::Result<()> {
        let region = String::from_utf8_lossy(&self.buf[from..to]).into_owned();
        for line in region.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed header line {line:?}"),
                ));
            };
            self.headers
                .push((canonical_header_name(name), value.trim().to_string()));
        }
        Ok(())
    }

    // Split the start line on spaces. A valid method token means a request;
    // otherwise attempt `PROTO SP STATUS SP REASON`. Anything else is kept
    // as a status-less response, like the original parser.
    fn parse_start_line(&mut self, line: &str) {
        self.is_request = false;
        if let Some((method, rest)) = line.split_once(' ')
            && let Some((uri, _proto)) = rest.split_once(' ')
            && is_valid_method(method)
        {
            self.is_request = true;
            self.request_method = Some(method.to_string());
            self.raw_uri = Some(uri.to_string());
            self.url = uri.parse::<Uri>().ok();
            return;
        }
        if let Some((_proto, status)) = line.split_once(' ') {
            let status_text = status.split(' ').next().unwrap_or_default();
            if status_text.len() == 3
                && let Ok(code) = status_text.parse::<u16>()
            {
                self.response_status = code;
            }
        }
    }

    fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(header, _)| header == name)
            .map(|(_, value)| value.as_str())
            .collect()
    }

    // The single value of a header, if it appears exactly once.
    fn single_header_value(&self, name: &str) -> Option<&str> {
        match self.header_values(name).as_slice() {
            [value] => Some(value),
            _ => None,
        }
    }

    pub(crate) fn is_chunked(&self) -> bool {
        self.header_values("Transfer-Encoding")
            .first()
            .is_some_and(|value| *value == "chunked")
    }

    fn is_upgrade(&self) -> bool {
        self.header_values("Connection")
            .first()
            .is_some_and(|value| value.eq_ignore_ascii_case("upgrade"))
    }

    // Host for routing: a `host` query parameter takes precedence over the
    // Host header.
    pub(crate) async fn get_host(&mut self) -> io::Result<String> {
        self.read_headers_if_needed().await?;
        if let Some(url) = &self.url
            && let Some(query) = url.query()
        {
            for param in query.split('&') {
                if let Some(("host", value)) = param.split_once('=')
                    && !value.is_empty()
                {
                    return Ok(value.to_string());
                }
            }
        }
        match self.single_header_value("Host") {
            Some(host) => Ok(host.to_string()),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ServerError::MissingHostHeader,
            )),
        }
    }

    pub(crate) async fn get_url_path(&mut self) -> io::Result<String> {
        self.read_headers_if_needed().await?;
        match &self.url {
            Some(url) => Ok(url.path().to_string()),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ServerError::MissingUrlPath,
            )),
        }
    }

    // The adjusted content length as `(length, valid)`. Chunked bodies and
    // bodies that HTTP semantics declare empty (204/304/1xx, 2xx to CONNECT,
    // any response to HEAD) report zero. Missing lengths fall back to what is
    // already buffered for requests, and to a read-until-close sentinel for
    // responses whose body has started arriving.
    pub(crate) fn get_content_length(&self) -> (u64, bool) {
        if self.is_chunked() {
            return (0, true);
        }
        if let Some(value) = self.header_values("Content-Length").first() {
            let Ok(length) = value.trim().parse::<u64>() else {
                return (0, false);
            };
            // See https://www.rfc-editor.org/rfc/rfc9110.html: no content for
            // 204, 304 and 1xx, nor for successful CONNECT or any HEAD reply.
            let status = self.response_status;
            if status == 204 || status == 304 || (100..200).contains(&status) {
                return (0, true);
            }
            if !self.is_request
                && self.request_method.as_deref() == Some("CONNECT")
                && (200..300).contains(&status)
            {
                return (0, true);
            }
            if !self.is_request && self.request_method.as_deref() == Some("HEAD") {
                return (0, true);
            }
            return (length, true);
        }
        debug!("missing Content-Length header");
        let buffered_body = self
            .buffered_bytes
            .saturating_sub(self.body_starts as u64);
        if self.is_request {
            return (buffered_body, true);
        }
        if buffered_body > 0 {
            // Stream until the peer closes; e.g. HTTP/1.0-style responses.
            ((u64::MAX >> 1) - self.buffered_bytes, true)
        } else {
            // No Content-Length and nothing buffered, e.g. a bare 304.
            (0, true)
        }
    }

    // Overwrite the Host header, and rewrite the domain portion of Origin
    // when it points at the proxy's public domain.
    pub(crate) async fn set_host_header(&mut self, value: &str, proxy_domain: &str) {
        if self.read_headers_if_needed().await.is_err() {
            return;
        }
        self.replace_header("Host", value);
        if let Some(origin) = self.single_header_value("Origin").map(str::to_string) {
            let domain = proxy_domain
                .split_once('/')
                .map_or(proxy_domain, |(host, _)| host);
            if origin.to_lowercase().contains(&domain.to_lowercase())
                && let Some(index) = origin.find(domain)
            {
                let replaced = format!(
                    "{}{}{}",
                    &origin[..index],
                    value,
                    &origin[index + domain.len()..]
                );
                self.replace_header("Origin", &replaced);
            }
        }
    }

    // Replace a header's value in the parsed set, and in the raw buffer as
    // long as the buffer has not been drained downstream (bytes already sent
    // cannot be rewritten).
    fn replace_header(&mut self, name: &str, value: &str) {
        let Some(old) = self.single_header_value(name).map(str::to_string) else {
            return;
        };
        if let Some(entry) = self.headers.iter_mut().find(|(header, _)| header == name) {
            entry.1 = value.to_string();
        }
        if self.buffer_drained {
            return;
        }
        // Locate the header name on the wire: preceded by '\n' and followed
        // by ':', so a match inside the URI or another value is skipped.
        let mut cursor = 0;
        let mut line_start = None;
        while cursor < self.write_pos {
            let Some(relative) = find(&self.buf[cursor..self.write_pos], name.as_bytes()) else {
                break;
            };
            let position = cursor + relative;
            if self.buf.get(position + name.len()) == Some(&b':')
                && position > 0
                && self.buf[position - 1] == b'\n'
            {
                line_start = Some(position);
                break;
            }
            cursor = position + name.len();
        }
        let Some(start) = line_start else {
            return;
        };
        let Some(line_length) = find(&self.buf[start..self.write_pos], b"\n") else {
            return;
        };
        let Some(offset) = find(&self.buf[start..start + line_length], old.as_bytes()) else {
            return;
        };
        let at = start + offset;
        self.splice(at, old.len(), value.as_bytes());
    }

    // Replace the request-URI token in the start line, updating the parsed
    // URL and all cursors so downstream byte counts stay consistent.
    pub(crate) async fn replace_request_url(&mut self, new_url: &str) {
        if self.read_headers_if_needed().await.is_err() {
            return;
        }
        if self.url.is_none() || !self.is_request {
            return;
        }
        let Ok(parsed) = new_url.parse::<Uri>() else {
            return;
        };
        self.url = Some(parsed);
        if self.buffer_drained {
            return;
        }
        let Some(raw_uri) = self.raw_uri.clone() else {
            return;
        };
        let Some(start) = find(&self.buf[..self.write_pos], raw_uri.as_bytes()) else {
            return;
        };
        if find(&self.buf[start..self.write_pos], b"\n").is_none() {
            return;
        }
        self.splice(start, raw_uri.len(), new_url.as_bytes());
        self.raw_uri = Some(new_url.to_string());
    }

    fn splice(&mut self, at: usize, old_len: usize, new_value: &[u8]) {
        self.buf
            .splice(at..at + old_len, new_value.iter().copied());
        let difference = new_value.len() as i64 - old_len as i64;
        self.write_pos = (self.write_pos as i64 + difference) as usize;
        self.body_starts = (self.body_starts as i64 + difference) as usize;
        self.buffered_bytes = (self.buffered_bytes as i64 + difference) as u64;
    }

    // Copy buffered bytes out first; once the buffer is drained, every call
    // is a single read on the underlying source.
    async fn read_raw(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if !self.buffer_drained {
            self.read_headers_if_needed().await?;
            if out.is_empty() {
                return Ok(0);
            }
            let n = copy_into(out, &self.buf[self.read_pos..self.write_pos]);
            self.read_pos += n;
            if self.read_pos == self.write_pos {
                self.buffer_drained = true;
            }
            return Ok(n);
        }
        let n = self.reader.read(out).await?;
        if n == 0 {
            self.saw_eof = true;
        }
        Ok(n)
    }

    // The framed reader over `[headers || body]`. Framing is decided here,
    // after any rewrites: upgraded connections pass bytes through until EOF,
    // chunked bodies emit the buffered prefix and then chunk framing, and
    // everything else is bounded by the adjusted content length.
    pub(crate) async fn body_reader(&mut self) -> io::Result<HttpBodyReader<'_, R>> {
        self.read_headers_if_needed().await?;
        let framing = if self.is_upgrade() {
            debug!("connection is an upgrade");
            Framing::Passthrough
        } else if self.is_chunked() {
            Framing::Chunked {
                header_remaining: self.body_starts as u64,
                decoder: ChunkedDecoder::default(),
            }
        } else {
            let (length, _) = self.get_content_length();
            Framing::Limited {
                remaining: (self.body_starts as u64).saturating_add(length),
            }
        };
        Ok(HttpBodyReader {
            processor: self,
            framing,
        })
    }
}

// The parse buffer doubles as the chunked decoder's ongoing buffer once the
// headers are out: buffered bytes are served first, then single reads refill
// the recycled buffer.
impl<R: AsyncRead + Unpin> ChunkSource for HttpProcessor<R> {
    fn buffered(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    fn consume(&mut self, amt: usize) {
        self.read_pos = (self.read_pos + amt).min(self.write_pos);
        if self.parsed && self.write_pos > 0 && self.read_pos == self.write_pos {
            self.buffer_drained = true;
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
        let write_pos = self.write_pos;
        let n = self.reader.read(&mut self.buf[write_pos..]).await?;
        if n == 0 {
            self.saw_eof = true;
        }
        self.write_pos += n;
        Ok(n)
    }

    async fn read_direct(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.read_pos < self.write_pos {
            let n = copy_into(out, &self.buf[self.read_pos..self.write_pos]);
            self.consume(n);
            return Ok(n);
        }
        let n = self.reader.read(out).await?;
        if n == 0 {
            self.saw_eof = true;
        }
        Ok(n)
    }
}

enum Framing {
    Passthrough,
    Limited {
        remaining: u64,
    },
    Chunked {
        header_remaining: u64,
        decoder: ChunkedDecoder,
    },
}

// Framed body reader handed to the splicing tasks. Yields exactly the bytes
// of one message (or everything until EOF for upgraded connections).
pub(crate) struct HttpBodyReader<'a, R> {
    processor: &'a mut HttpProcessor<R>,
    framing: Framing,
}

impl<R: AsyncRead + Unpin> HttpBodyReader<'_, R> {
    pub(crate) async fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match &mut self.framing {
            Framing::Passthrough => self.processor.read_raw(out).await,
            Framing::Limited { remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let cap = out
                    .len()
                    .min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let n = self.processor.read_raw(&mut out[..cap]).await?;
                *remaining -= n as u64;
                Ok(n)
            }
            Framing::Chunked {
                header_remaining,
                decoder,
            } => {
                if *header_remaining > 0 {
                    let cap = out
                        .len()
                        .min(usize::try_from(*header_remaining).unwrap_or(usize::MAX));
                    let n = self.processor.read_raw(&mut out[..cap]).await?;
                    *header_remaining -= n as u64;
                    return Ok(n);
                }
                decoder.read(&mut *self.processor, out).await
            }
        }
    }

    pub(crate) fn saw_eof(&self) -> bool {
        self.processor.saw_eof
    }
}

fn copy_into(out: &mut [u8], src: &[u8]) -> usize {
    let n = out.len().min(src.len());
    out[..n].copy_from_slice(&src[..n]);
    n
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// Canonical MIME form: first letter and every letter after a dash uppercase,
// the rest lowercase.
fn canonical_header_name(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len());
    let mut uppercase_next = true;
    for character in name.trim().chars() {
        if uppercase_next {
            canonical.extend(character.to_uppercase());
        } else {
            canonical.extend(character.to_lowercase());
        }
        uppercase_next = character == '-';
    }
    canonical
}

// RFC 7230 token: one or more characters excluding CTLs and separators.
fn is_valid_method(method: &str) -> bool {
    !method.is_empty()
        && method.bytes().all(|byte| {
            matches!(byte, 0x21..=0x7e)
                && !matches!(
                    byte,
                    b'(' | b')'
                        | b'<'
                        | b'>'
                        | b'@'
                        | b','
                        | b';'
                        | b':'
                        | b'\\'
                        | b'"'
                        | b'/'
                        | b'['
                        | b']'
                        | b'?'
                        | b'='
                        | b'{'
                        | b'}'
                )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::PooledBuffer;

    fn processor(input: &[u8], buffer_size: usize) -> HttpProcessor<&[u8]> {
        HttpProcessor::new(input, PooledBuffer::unpooled(buffer_size))
    }

    async fn read_all<R: AsyncRead + Unpin>(processor: &mut HttpProcessor<R>) -> Vec<u8> {
        let mut reader = processor.body_reader().await.unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = reader.read(&mut chunk).await.unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn reads_until_close_when_response_has_no_content_length() {
        let body = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\nBody is here";
        let mut sut = processor(body, body.len() * 3);
        let out = read_all(&mut sut).await;
        assert_eq!(out, body);
        let (length, valid) = sut.get_content_length();
        assert!(valid);
        assert!(length > u64::MAX / 4);
    }

    #[tokio::test]
    async fn reports_no_content_for_status_204_304_and_1xx() {
        for status in ["204 No Content", "304 Not Modified", "180 Processing"] {
            let body = format!("HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\r\n");
            let mut sut = processor(body.as_bytes(), body.len() * 3);
            let out = read_all(&mut sut).await;
            assert_eq!(out, body.as_bytes());
            assert_eq!(sut.get_content_length(), (0, true));
        }
    }

    #[tokio::test]
    async fn head_response_with_content_length_yields_headers_only() {
        let body =
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 15632\r\n\r\n";
        let mut sut = processor(body, body.len() * 3).with_request_method(Some("HEAD".into()));
        let out = read_all(&mut sut).await;
        assert_eq!(out, body);
        assert_eq!(sut.get_content_length(), (0, true));
    }

    #[tokio::test]
    async fn connect_response_suppresses_content_only_on_2xx() {
        let ok = b"HTTP/1.1 200 OK\r\nContent-Length: 15632\r\n\r\n";
        let sut_ok = {
            let mut sut = processor(ok, ok.len() * 3).with_request_method(Some("CONNECT".into()));
            sut.read_headers_if_needed().await.unwrap();
            sut
        };
        assert_eq!(sut_ok.get_content_length(), (0, true));

        let bad = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 15632\r\n\r\n";
        let mut sut_bad =
            processor(bad, bad.len() * 3).with_request_method(Some("CONNECT".into()));
        sut_bad.read_headers_if_needed().await.unwrap();
        assert_eq!(sut_bad.get_content_length(), (15632, true));
    }

    #[tokio::test]
    async fn invalid_content_length_is_flagged() {
        let body = b"POST / HTTP/1.1\r\nContent-Length: banana\r\nHost: domain.io\r\n\r\n";
        let mut sut = processor(body, body.len() * 3);
        sut.read_headers_if_needed().await.unwrap();
        assert_eq!(sut.get_content_length(), (0, false));
    }

    #[tokio::test]
    async fn rewrites_host_and_origin_with_a_large_buffer() {
        for expected in ["a.b.com", "tunnel.test.domain.io"] {
            let body = b"POST / HTTP/1.1\r\nContent-Length: 12\r\nContent-Type: application/json\r\nHost: domain.io\r\nOrigin: https://domain.io:123\r\n\r\nBody is here";
            let mut sut = processor(body, body.len() * 3);
            sut.set_host_header(expected, "domain.io").await;
            assert_eq!(sut.get_host().await.unwrap(), expected);
            assert_eq!(
                sut.single_header_value("Origin").unwrap(),
                format!("https://{expected}:123")
            );
            let out = read_all(&mut sut).await;
            let rewritten = String::from_utf8_lossy(body).replace("domain.io", expected);
            assert_eq!(String::from_utf8_lossy(&out), rewritten);
        }
    }

    #[tokio::test]
    async fn rewrites_only_buffered_bytes_when_content_length_is_missing() {
        let body = b"POST / HTTP/1.1\r\nContent-Type: application/json\r\nHost: domain.io\r\nOrigin: https://domain.io:123\r\n\r\nBody is here";
        let mut sut = processor(body, body.len() * 3);
        sut.set_host_header("a.b.com", "domain.io").await;
        let out = read_all(&mut sut).await;
        let rewritten = String::from_utf8_lossy(body).replace("domain.io", "a.b.com");
        assert_eq!(String::from_utf8_lossy(&out), rewritten);
    }

    #[tokio::test]
    async fn rewrites_chunked_payloads_across_buffer_sizes() {
        let body = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Type: application/json\r\nHost: domain.io\r\n\r\n7\r\nMozilla\r\n9\r\nDeveloper\r\n7\r\nNetwork\r\n0\r\n\r\n";
        for buffer_size in [body.len() * 3, body.len(), body.len() - 40] {
            for expected in ["a.b.com", "tunnel.test.domain.io"] {
                let mut sut = processor(body, buffer_size);
                assert_eq!(sut.get_host().await.unwrap(), "domain.io");
                sut.set_host_header(expected, "domain.io").await;
                assert_eq!(sut.get_host().await.unwrap(), expected);
                let out = read_all(&mut sut).await;
                let rewritten = String::from_utf8_lossy(body).replace("domain.io", expected);
                assert_eq!(
                    String::from_utf8_lossy(&out),
                    rewritten,
                    "buffer size {buffer_size}"
                );
            }
        }
    }

    #[tokio::test]
    async fn rewrites_with_a_buffer_smaller_than_the_body() {
        for expected in ["a.b.com", "tunnel.test.domain.io"] {
            let body = b"POST / HTTP/1.1\r\nContent-Length: 12\r\nContent-Type: application/json\r\nHost: domain.io\r\n\r\nBody is here";
            let mut sut = processor(body, body.len() - 10);
            assert_eq!(sut.get_host().await.unwrap(), "domain.io");
            sut.set_host_header(expected, "domain.io").await;
            assert_eq!(sut.get_host().await.unwrap(), expected);
            let out = read_all(&mut sut).await;
            let rewritten = String::from_utf8_lossy(body).replace("domain.io", expected);
            assert_eq!(String::from_utf8_lossy(&out), rewritten);
        }
    }

    #[tokio::test]
    async fn reads_without_modification_when_nothing_is_rewritten() {
        let body = b"POST / HTTP/1.1\r\nContent-Length: 12\r\nContent-Type: application/json\r\nHost: domain.io\r\n\r\nBody is here";
        let mut sut = processor(body, body.len() - 10);
        let out = read_all(&mut sut).await;
        assert_eq!(out, body);
        assert_eq!(sut.get_host().await.unwrap(), "domain.io");
    }

    #[tokio::test]
    async fn body_reads_work_without_a_host_header() {
        let body = b"POST / HTTP/1.1\r\nContent-Length: 12\r\nContent-Type: application/json\r\nAuthorization: domain.io\r\n\r\nBody is here";
        let mut sut = processor(body, body.len() - 10);
        assert!(sut.get_host().await.is_err());
        let mut reader = sut.body_reader().await.unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 32];
        loop {
            let n = reader.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, body);
        // Reads past the framed end keep returning zero.
        assert_eq!(reader.read(&mut chunk).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn host_query_parameter_overrides_the_header() {
        let body = b"GET /?host=tun.domain.io HTTP/1.1\r\nHost: other.example\r\n\r\n";
        let mut sut = processor(body, body.len() * 3);
        assert_eq!(sut.get_host().await.unwrap(), "tun.domain.io");
    }

    #[tokio::test]
    async fn classifies_start_lines() {
        let request = b"GET /path HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut sut = processor(request, 1024);
        sut.read_headers_if_needed().await.unwrap();
        assert!(sut.is_request());
        assert_eq!(sut.request_method(), Some("GET"));
        assert_eq!(sut.raw_uri(), Some("/path"));

        let response = b"HTTP/1.1 503 Service Unavailable\r\n\r\nx";
        let mut sut = processor(response, 1024);
        sut.read_headers_if_needed().await.unwrap();
        assert!(!sut.is_request());
        assert_eq!(sut.response_status, 503);
    }

    #[tokio::test]
    async fn replaces_the_request_url_in_place() {
        let body = b"GET /base/tun/real/path HTTP/1.1\r\nHost: domain.io\r\n\r\n";
        let mut sut = processor(body, body.len() * 3);
        sut.replace_request_url("/real/path").await;
        let out = read_all(&mut sut).await;
        assert_eq!(
            out,
            b"GET /real/path HTTP/1.1\r\nHost: domain.io\r\n\r\n"
        );
        assert_eq!(sut.get_url_path().await.unwrap(), "/real/path");
    }

    #[tokio::test]
    async fn identity_url_replacement_is_byte_identical() {
        let body = b"GET /same HTTP/1.1\r\nHost: domain.io\r\n\r\n";
        let mut sut = processor(body, body.len() * 3);
        sut.replace_request_url("/same").await;
        let out = read_all(&mut sut).await;
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn upgraded_connections_pass_through_until_eof() {
        let body =
            b"GET /ws HTTP/1.1\r\nHost: domain.io\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\nopaque frames beyond headers";
        let mut sut = processor(body, 128);
        let out = read_all(&mut sut).await;
        assert_eq!(out, body);
        assert!(sut.saw_eof());
    }

    #[tokio::test]
    async fn fails_when_headers_exceed_the_buffer() {
        let body = b"GET / HTTP/1.1\r\nHost: domain.io\r\nX-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n";
        let mut sut = processor(body, 32);
        let error = sut.read_headers_if_needed().await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn canonicalizes_header_names() {
        assert_eq!(canonical_header_name("content-length"), "Content-Length");
        assert_eq!(canonical_header_name("HOST"), "Host");
        assert_eq!(canonical_header_name("x-real-ip"), "X-Real-Ip");
    }

    #[test]
    fn validates_method_tokens() {
        for method in ["GET", "POST", "M-SEARCH", "PATCH"] {
            assert!(is_valid_method(method));
        }
        for method in ["", "HTTP/1.1", "GE T", "bad{method}"] {
            assert!(!is_valid_method(method));
        }
    }
}
