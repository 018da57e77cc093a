//! Pull-style HTTP/1.1 parsing: request line, status line, header fields,
//! and body framing (Content-Length and chunked). Nothing here buffers a
//! whole message; each method consumes exactly one line or one length-known
//! span from the underlying [`LineReader`].

use tokio::io::AsyncRead;

use crate::error::{SessionError, SessionResult};
use crate::line_reader::LineReader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: String,
    pub status: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderEvent {
    Field { name: String, value: String },
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(usize),
    Chunked,
}

fn strip_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn as_str(line: &[u8]) -> SessionResult<&str> {
    std::str::from_utf8(line).map_err(|_| SessionError::protocol("non-UTF-8 line"))
}

pub fn parse_request_line(line: &[u8]) -> SessionResult<RequestLine> {
    let text = as_str(strip_crlf(line))?;
    let mut parts = text.splitn(3, ' ');
    let method = parts.next().filter(|s| !s.is_empty());
    let target = parts.next().filter(|s| !s.is_empty());
    let version = parts.next().filter(|s| !s.is_empty());
    match (method, target, version) {
        (Some(method), Some(target), Some(version)) => Ok(RequestLine {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        }),
        _ => Err(SessionError::protocol("malformed request line")),
    }
}

pub fn parse_status_line(line: &[u8]) -> SessionResult<StatusLine> {
    let text = as_str(strip_crlf(line))?;
    let mut parts = text.splitn(3, ' ');
    let version = parts.next().filter(|s| !s.is_empty());
    let status = parts.next().filter(|s| !s.is_empty());
    let reason = parts.next().unwrap_or("").to_string();
    match (version, status) {
        (Some(version), Some(status)) => {
            let status = status
                .parse::<u16>()
                .map_err(|_| SessionError::protocol("malformed status code"))?;
            Ok(StatusLine {
                version: version.to_string(),
                status,
                reason,
            })
        }
        _ => Err(SessionError::protocol("malformed status line")),
    }
}

pub fn parse_header_line(line: &[u8]) -> SessionResult<HeaderEvent> {
    let trimmed = strip_crlf(line);
    if trimmed.is_empty() {
        return Ok(HeaderEvent::End);
    }
    let text = as_str(trimmed)?;
    let (name, value) = text
        .split_once(':')
        .ok_or_else(|| SessionError::protocol("header line missing colon"))?;
    Ok(HeaderEvent::Field {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
    })
}

/// Tracks `Content-Length` across possibly-repeated header lines: matching
/// duplicates are accepted, conflicting values are a protocol error.
#[derive(Default)]
struct ContentLengthState {
    value: Option<usize>,
}

impl ContentLengthState {
    fn observe(&mut self, raw: &str) -> SessionResult<()> {
        let len: usize = raw
            .trim()
            .parse()
            .map_err(|_| SessionError::protocol("invalid Content-Length"))?;
        match self.value {
            Some(prev) if prev != len => {
                Err(SessionError::protocol("conflicting Content-Length"))
            }
            _ => {
                self.value = Some(len);
                Ok(())
            }
        }
    }
}

fn split_tokens(value: &str) -> impl Iterator<Item = String> + '_ {
    value.split(',').filter_map(|tok| {
        let tok = tok.trim();
        if tok.is_empty() {
            None
        } else {
            Some(tok.to_ascii_lowercase())
        }
    })
}

/// Accumulates framing-relevant headers as they stream past, yielding the
/// resulting [`BodyFraming`] once the header block ends.
#[derive(Default)]
pub struct FramingAccumulator {
    content_length: ContentLengthState,
    chunked: bool,
}

impl FramingAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, name: &str, value: &str) -> SessionResult<()> {
        match name.to_ascii_lowercase().as_str() {
            "content-length" => self.content_length.observe(value)?,
            "transfer-encoding" => {
                if split_tokens(value).any(|t| t == "chunked") {
                    self.chunked = true;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn finish(self) -> BodyFraming {
        if self.chunked {
            BodyFraming::Chunked
        } else if let Some(n) = self.content_length.value {
            BodyFraming::Length(n)
        } else {
            BodyFraming::None
        }
    }
}

/// One step of body relaying: either "the caller must forward exactly this
/// many bytes before calling again", or "the body is finished".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEvent {
    Data(usize),
    End,
}

enum ChunkedState {
    AwaitingSize,
    AwaitingTrailer,
    Done,
}

enum CursorState {
    None,
    Length { remaining_known: bool },
    Chunked(ChunkedState),
}

/// Drives body relaying one event at a time. For `Length` framing it yields
/// a single `Data(n)` then `End`. For `Chunked` framing it alternates
/// chunk-size lines (consumed internally) with `Data(n)` events the caller
/// must satisfy by relaying exactly `n` bytes before the next call, which
/// then consumes the trailing CRLF and the next chunk-size line in turn.
pub struct BodyCursor {
    state: CursorState,
}

impl BodyCursor {
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::None => CursorState::None,
            BodyFraming::Length(0) => CursorState::Length {
                remaining_known: false,
            },
            BodyFraming::Length(_) => CursorState::Length {
                remaining_known: true,
            },
            BodyFraming::Chunked => CursorState::Chunked(ChunkedState::AwaitingSize),
        };
        BodyCursor { state }
    }

    /// Advances the cursor by one step. Framing bytes that are not part of
    /// the body payload itself (chunk-size lines, the trailing CRLF after
    /// each chunk) are read from `reader` and forwarded to `sink` here, so
    /// they relay byte-for-byte without the caller needing to know about
    /// them. A returned `Data(n)` means the caller must relay exactly `n`
    /// payload bytes (e.g. via `reader.read_n(n, sink)`) before calling
    /// `next_event` again.
    pub async fn next_event<R, W>(
        &mut self,
        reader: &mut LineReader<R>,
        sink: &mut W,
        length_hint: Option<usize>,
    ) -> SessionResult<BodyEvent>
    where
        R: AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        match &mut self.state {
            CursorState::None => Ok(BodyEvent::End),
            CursorState::Length { remaining_known } => {
                if *remaining_known {
                    *remaining_known = false;
                    let n = length_hint.unwrap_or(0);
                    if n == 0 {
                        Ok(BodyEvent::End)
                    } else {
                        Ok(BodyEvent::Data(n))
                    }
                } else {
                    Ok(BodyEvent::End)
                }
            }
            CursorState::Chunked(chunk_state) => match chunk_state {
                ChunkedState::AwaitingSize => {
                    let line = reader.readline().await?;
                    let size = parse_chunk_size(&line)?;
                    use tokio::io::AsyncWriteExt;
                    sink.write_all(&line).await?;
                    if size == 0 {
                        loop {
                            let trailer = reader.readline().await?;
                            sink.write_all(&trailer).await?;
                            if strip_crlf(&trailer).is_empty() {
                                *chunk_state = ChunkedState::Done;
                                return Ok(BodyEvent::End);
                            }
                        }
                    }
                    *chunk_state = ChunkedState::AwaitingTrailer;
                    Ok(BodyEvent::Data(size))
                }
                ChunkedState::AwaitingTrailer => {
                    let trailer = reader.readline().await?;
                    if strip_crlf(&trailer) != b"" {
                        return Err(SessionError::protocol("malformed chunk trailer"));
                    }
                    use tokio::io::AsyncWriteExt;
                    sink.write_all(&trailer).await?;
                    *chunk_state = ChunkedState::AwaitingSize;
                    Box::pin(self.next_event(reader, sink, length_hint)).await
                }
                ChunkedState::Done => Ok(BodyEvent::End),
            },
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> SessionResult<usize> {
    let text = as_str(strip_crlf(line))?;
    let size_str = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size_str, 16).map_err(|_| SessionError::protocol("invalid chunk size"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor as IoCursor;

    #[test]
    fn parses_request_line() {
        let rl = parse_request_line(b"GET http://example.com/ HTTP/1.1\r\n").unwrap();
        assert_eq!(rl.method, "GET");
        assert_eq!(rl.target, "http://example.com/");
        assert_eq!(rl.version, "HTTP/1.1");
    }

    #[test]
    fn rejects_malformed_request_line() {
        assert!(parse_request_line(b"GET\r\n").is_err());
    }

    #[test]
    fn parses_status_line_with_reason() {
        let sl = parse_status_line(b"HTTP/1.1 404 Not Found\r\n").unwrap();
        assert_eq!(sl.status, 404);
        assert_eq!(sl.reason, "Not Found");
    }

    #[test]
    fn parses_header_field() {
        match parse_header_line(b"Host: example.com\r\n").unwrap() {
            HeaderEvent::Field { name, value } => {
                assert_eq!(name, "Host");
                assert_eq!(value, "example.com");
            }
            HeaderEvent::End => panic!("expected field"),
        }
    }

    #[test]
    fn blank_line_ends_headers() {
        assert_eq!(parse_header_line(b"\r\n").unwrap(), HeaderEvent::End);
    }

    #[test]
    fn duplicate_matching_content_length_is_accepted() {
        let mut acc = FramingAccumulator::new();
        acc.observe("Content-Length", "5").unwrap();
        acc.observe("content-length", "5").unwrap();
        assert_eq!(acc.finish(), BodyFraming::Length(5));
    }

    #[test]
    fn conflicting_content_length_is_rejected() {
        let mut acc = FramingAccumulator::new();
        acc.observe("Content-Length", "5").unwrap();
        let err = acc.observe("Content-Length", "6").unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn chunked_transfer_encoding_wins_over_length() {
        let mut acc = FramingAccumulator::new();
        acc.observe("Transfer-Encoding", "chunked").unwrap();
        assert_eq!(acc.finish(), BodyFraming::Chunked);
    }

    #[tokio::test]
    async fn chunked_body_cursor_walks_chunks_then_ends() {
        let mut reader = LineReader::new(IoCursor::new(b"5\r\nworld\r\n0\r\n\r\n".to_vec()));
        let mut cursor = BodyCursor::new(BodyFraming::Chunked);
        let mut sink = Vec::new();

        match cursor.next_event(&mut reader, &mut sink, None).await.unwrap() {
            BodyEvent::Data(n) => assert_eq!(n, 5),
            BodyEvent::End => panic!("expected data event"),
        }
        assert_eq!(sink, b"5\r\n");
        reader.read_n(5, &mut sink).await.unwrap();

        match cursor.next_event(&mut reader, &mut sink, None).await.unwrap() {
            BodyEvent::End => {}
            BodyEvent::Data(_) => panic!("expected end event"),
        }
        assert_eq!(sink, b"5\r\nworld\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn length_framed_body_yields_single_event() {
        let mut reader = LineReader::new(IoCursor::new(b"hi".to_vec()));
        let mut cursor = BodyCursor::new(BodyFraming::Length(2));
        let mut sink = Vec::new();
        assert_eq!(
            cursor
                .next_event(&mut reader, &mut sink, Some(2))
                .await
                .unwrap(),
            BodyEvent::Data(2)
        );
        assert_eq!(
            cursor
                .next_event(&mut reader, &mut sink, Some(2))
                .await
                .unwrap(),
            BodyEvent::End
        );
    }

    #[tokio::test]
    async fn no_framing_yields_end_immediately() {
        let mut reader = LineReader::new(IoCursor::new(Vec::new()));
        let mut cursor = BodyCursor::new(BodyFraming::None);
        let mut sink = Vec::new();
        assert_eq!(
            cursor.next_event(&mut reader, &mut sink, None).await.unwrap(),
            BodyEvent::End
        );
    }
}
