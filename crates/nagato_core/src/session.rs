//! The per-connection proxy state machine: dispatches `CONNECT` to a raw
//! tunnel (with TLS ClientHello pre-segmentation) or runs the HTTP relay
//! path, learning and applying the evasion strategy for each upstream.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::{SessionError, SessionResult};
use crate::evasion::{presegment_client_hello, Evasion};
use crate::http::{
    parse_header_line, parse_request_line, parse_status_line, BodyCursor, BodyEvent,
    BodyFraming, FramingAccumulator, HeaderEvent, RequestLine,
};
use crate::line_reader::LineReader;
use crate::responses;
use crate::strategy::{StrategyTable, UpstreamStrategy};

/// A client request's headers, already split out from framing-relevant and
/// routing-relevant fields.
struct RequestHead {
    headers: Vec<(String, String)>,
    framing: BodyFraming,
    host_header: Option<String>,
}

async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
) -> SessionResult<RequestHead> {
    let mut headers = Vec::new();
    let mut host_header = None;
    let mut framing_acc = FramingAccumulator::new();

    loop {
        let line = reader.readline().await?;
        match parse_header_line(&line)? {
            HeaderEvent::End => break,
            HeaderEvent::Field { name, value } => {
                framing_acc.observe(&name, &value)?;
                if name.eq_ignore_ascii_case("host") {
                    host_header = Some(value.clone());
                }
                headers.push((name, value));
            }
        }
    }

    Ok(RequestHead {
        headers,
        framing: framing_acc.finish(),
        host_header,
    })
}

/// Discards a request's header block without retaining it, for the
/// `CONNECT` path where the proxy never forwards the envelope itself.
async fn drain_request_head<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
) -> SessionResult<()> {
    loop {
        let line = reader.readline().await?;
        if matches!(parse_header_line(&line)?, HeaderEvent::End) {
            return Ok(());
        }
    }
}

fn parse_connect_target(target: &str) -> SessionResult<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| SessionError::protocol("CONNECT target missing port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| SessionError::protocol("CONNECT target has an invalid port"))?;
    if host.is_empty() {
        return Err(SessionError::protocol("CONNECT target missing host"));
    }
    Ok((host.to_string(), port))
}

/// Splits an absolute-form target into `(host, port, path_and_query)`.
/// Returns `None` if `target` has no scheme/authority (origin-form already).
fn parse_absolute_target(target: &str) -> Option<(String, u16, String)> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().ok()?),
        None => (authority.to_string(), 80u16),
    };
    Some((host, port, path))
}

fn upstream_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Drives one accepted client connection end to end.
pub struct ProxySession<S> {
    client: S,
    peer_addr: SocketAddr,
    strategies: Arc<StrategyTable>,
}

impl<S> ProxySession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(client: S, peer_addr: SocketAddr, strategies: Arc<StrategyTable>) -> Self {
        Self {
            client,
            peer_addr,
            strategies,
        }
    }

    #[instrument(skip(self), fields(client_addr = %self.peer_addr), name = "proxy_session")]
    pub async fn run(self) -> SessionResult<()> {
        let (client_r, mut client_w) = tokio::io::split(self.client);
        let mut client_reader = LineReader::new(client_r);

        let head_line = match client_reader.readline().await {
            Ok(line) => line,
            Err(SessionError::EndOfStream) => return Ok(()),
            Err(e) => return Err(e),
        };
        let request_line = parse_request_line(&head_line)?;

        if request_line.method.eq_ignore_ascii_case("CONNECT") {
            return run_tunnel(client_reader, client_w, request_line, self.peer_addr).await;
        }

        let head = read_request_head(&mut client_reader).await?;
        let (host, port) = resolve_host_port(&request_line, &head)?;
        let key = upstream_key(&host, port);

        let upstream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(target: "nagato::session", %host, port, error = %e, "upstream connect failed");
                responses::send_gateway_timeout(&mut client_w, &request_line.version).await?;
                return Ok(());
            }
        };
        let _ = upstream.set_nodelay(true);
        let (upstream_r, upstream_w) = upstream.into_split();

        let (url_tx, url_rx) = mpsc::unbounded_channel::<String>();
        let strategies = self.strategies.clone();

        let request_fut = request_loop(
            client_reader,
            upstream_w,
            key.clone(),
            strategies.clone(),
            request_line,
            head,
            url_tx,
        );
        let response_fut = response_loop(
            LineReader::new(upstream_r),
            client_w,
            key,
            strategies,
            url_rx,
        );

        tokio::select! {
            r = request_fut => r,
            r = response_fut => r,
        }
    }
}

fn resolve_host_port(request_line: &RequestLine, head: &RequestHead) -> SessionResult<(String, u16)> {
    if let Some((host, port, _)) = parse_absolute_target(&request_line.target) {
        return Ok((host, port));
    }
    if let Some(host_header) = &head.host_header {
        let (host, port) = match host_header.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(80)),
            None => (host_header.clone(), 80),
        };
        return Ok((host, port));
    }
    Err(SessionError::protocol(
        "request has neither an absolute target nor a Host header",
    ))
}

async fn run_tunnel<R, W>(
    mut client_reader: LineReader<R>,
    mut client_writer: W,
    request_line: RequestLine,
    peer_addr: SocketAddr,
) -> SessionResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (host, port) = parse_connect_target(&request_line.target)?;
    drain_request_head(&mut client_reader).await?;

    let upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(target: "nagato::session", %host, port, %peer_addr, error = %e, "tunnel connect failed");
            responses::send_gateway_timeout(&mut client_writer, &request_line.version).await?;
            return Ok(());
        }
    };
    let _ = upstream.set_nodelay(true);
    responses::send_connection_established(&mut client_writer, &request_line.version).await?;

    let (mut upstream_r, mut upstream_w) = upstream.into_split();
    presegment_client_hello(&mut client_reader, &mut upstream_w).await?;

    let leftover = client_reader.drain_buffered();
    if !leftover.is_empty() {
        upstream_w.write_all(&leftover).await?;
        upstream_w.flush().await?;
    }
    let mut client_r = client_reader.into_inner();

    info!(target: "nagato::session", %host, port, %peer_addr, "tunnel established");

    tokio::select! {
        r = tokio::io::copy(&mut client_r, &mut upstream_w) => { let _ = r; }
        r = tokio::io::copy(&mut upstream_r, &mut client_writer) => { let _ = r; }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn request_loop<R, W>(
    mut client_reader: LineReader<R>,
    mut upstream_writer: W,
    key: String,
    strategies: Arc<StrategyTable>,
    first_request_line: RequestLine,
    first_head: RequestHead,
    url_tx: mpsc::UnboundedSender<String>,
) -> SessionResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut evasion = Evasion::new();

    write_request(
        &mut client_reader,
        &mut upstream_writer,
        &first_request_line,
        &first_head,
        &key,
        &strategies,
        &mut evasion,
        &url_tx,
    )
    .await?;

    loop {
        let line = client_reader.readline().await?;
        let request_line = parse_request_line(&line)?;
        let head = read_request_head(&mut client_reader).await?;
        write_request(
            &mut client_reader,
            &mut upstream_writer,
            &request_line,
            &head,
            &key,
            &strategies,
            &mut evasion,
            &url_tx,
        )
        .await?;
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_request<R, W>(
    client_reader: &mut LineReader<R>,
    upstream_writer: &mut W,
    request_line: &RequestLine,
    head: &RequestHead,
    key: &str,
    strategies: &StrategyTable,
    evasion: &mut Evasion,
    url_tx: &mpsc::UnboundedSender<String>,
) -> SessionResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let committed = strategies.get(key);
    let use_absolute = !matches!(committed, UpstreamStrategy::OriginFormFragmented);

    let target_host = head.host_header.clone().unwrap_or_else(|| key.to_string());

    let (path_and_query, is_absolute_target) = match parse_absolute_target(&request_line.target) {
        Some((_, _, path)) => (path, true),
        None => (request_line.target.clone(), false),
    };

    if use_absolute && !is_absolute_target {
        return Err(SessionError::protocol(
            "absolute-URI rewrite requires an absolute request target",
        ));
    }

    let _ = url_tx.send(request_line.target.to_string());

    let line = if use_absolute {
        format!(
            "{} https://{}{} {}\r\n",
            request_line.method, target_host, path_and_query, request_line.version
        )
    } else {
        format!(
            "{} {} {}\r\n",
            request_line.method, path_and_query, request_line.version
        )
    };
    upstream_writer.write_all(line.as_bytes()).await?;

    if !use_absolute {
        evasion.write_dummy_headers(upstream_writer).await?;
    }

    for (name, value) in &head.headers {
        if !use_absolute && name.eq_ignore_ascii_case("host") {
            continue;
        }
        if name.eq_ignore_ascii_case("proxy-connection") {
            let line = format!("Connection: {value}\r\n");
            upstream_writer.write_all(line.as_bytes()).await?;
            continue;
        }
        let line = format!("{name}: {value}\r\n");
        upstream_writer.write_all(line.as_bytes()).await?;
    }

    if !use_absolute {
        evasion
            .write_host_fragmented(upstream_writer, &target_host)
            .await?;
    }

    upstream_writer.write_all(b"\r\n").await?;
    upstream_writer.flush().await?;

    relay_body(client_reader, upstream_writer, head.framing).await
}

async fn relay_body<R, W>(
    reader: &mut LineReader<R>,
    sink: &mut W,
    framing: BodyFraming,
) -> SessionResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut cursor = BodyCursor::new(framing);
    let mut length_hint = match framing {
        BodyFraming::Length(n) => Some(n),
        _ => None,
    };
    loop {
        match cursor.next_event(reader, sink, length_hint).await? {
            BodyEvent::Data(n) => {
                reader.read_n(n, sink).await?;
                length_hint = None;
            }
            BodyEvent::End => return Ok(()),
        }
    }
}

/// Whether this upstream status, on its own, lets the proxy conclude which
/// evasion strategy works. `503` is deliberately excluded from the 5xx
/// block-detection branch (see the session's design notes).
enum Conclusion {
    Success,
    Blocked,
    Inconclusive,
}

fn conclude(status: u16) -> Conclusion {
    match status {
        200..=299 | 304 => Conclusion::Success,
        503 => Conclusion::Inconclusive,
        400..=599 => Conclusion::Blocked,
        _ => Conclusion::Inconclusive,
    }
}

async fn response_loop<R, W>(
    mut upstream_reader: LineReader<R>,
    mut client_writer: W,
    key: String,
    strategies: Arc<StrategyTable>,
    mut url_rx: mpsc::UnboundedReceiver<String>,
) -> SessionResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let status_line_bytes = upstream_reader.readline().await?;
        let status_line = parse_status_line(&status_line_bytes)?;

        let head = read_response_head(&mut upstream_reader).await?;
        let no_body = is_no_body(status_line.status);

        match conclude(status_line.status) {
            Conclusion::Success => {
                strategies.commit(&key, UpstreamStrategy::AbsoluteUriHttps);
                let _ = url_rx.recv().await;
                forward_status_and_headers(&mut client_writer, &status_line, &head.headers)
                    .await?;
                if !no_body {
                    relay_body(&mut upstream_reader, &mut client_writer, head.framing).await?;
                }
                // Subsequent responses on this upstream are pumped raw.
                return pump_rest(upstream_reader, client_writer).await;
            }
            Conclusion::Blocked => {
                strategies.commit(&key, UpstreamStrategy::OriginFormFragmented);
                let location = url_rx.recv().await.unwrap_or_default();
                warn!(
                    target: "nagato::session",
                    %key, status = status_line.status,
                    "upstream response looked like a censor block, redirecting client"
                );
                responses::send_temporary_redirect(
                    &mut client_writer,
                    &status_line.version,
                    &location,
                )
                .await?;
                return Ok(());
            }
            Conclusion::Inconclusive => {
                let _ = url_rx.recv().await;
                forward_status_and_headers(&mut client_writer, &status_line, &head.headers)
                    .await?;
                if !no_body {
                    relay_body(&mut upstream_reader, &mut client_writer, head.framing).await?;
                }
            }
        }
    }
}

struct ResponseHead {
    headers: Vec<(String, String)>,
    framing: BodyFraming,
}

async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
) -> SessionResult<ResponseHead> {
    let mut headers = Vec::new();
    let mut framing_acc = FramingAccumulator::new();
    loop {
        let line = reader.readline().await?;
        match parse_header_line(&line)? {
            HeaderEvent::End => break,
            HeaderEvent::Field { name, value } => {
                framing_acc.observe(&name, &value)?;
                headers.push((name, value));
            }
        }
    }
    Ok(ResponseHead {
        headers,
        framing: framing_acc.finish(),
    })
}

fn is_no_body(status: u16) -> bool {
    matches!(status, 100..=199 | 204 | 304)
}

async fn forward_status_and_headers<W: AsyncWrite + Unpin>(
    w: &mut W,
    status_line: &crate::http::StatusLine,
    headers: &[(String, String)],
) -> SessionResult<()> {
    let mut out = format!(
        "{} {} {}\r\n",
        status_line.version, status_line.status, status_line.reason
    );
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    w.write_all(out.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

async fn pump_rest<R, W>(reader: LineReader<R>, mut writer: W) -> SessionResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = reader;
    let leftover = reader.drain_buffered();
    if !leftover.is_empty() {
        writer.write_all(&leftover).await?;
        writer.flush().await?;
    }
    let mut raw = reader.into_inner();
    tokio::io::copy(&mut raw, &mut writer).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_target() {
        let (host, port) = parse_connect_target("example.com:443").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn rejects_connect_target_without_port() {
        assert!(parse_connect_target("example.com").is_err());
    }

    #[test]
    fn parses_absolute_target_with_path() {
        let (host, port, path) = parse_absolute_target("http://example.com/a/b?q=1").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/a/b?q=1");
    }

    #[test]
    fn parses_absolute_target_with_explicit_port() {
        let (host, port, path) = parse_absolute_target("http://example.com:8080/").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8080);
        assert_eq!(path, "/");
    }

    #[test]
    fn origin_form_target_is_not_absolute() {
        assert!(parse_absolute_target("/just/a/path").is_none());
    }

    #[test]
    fn conclude_treats_503_as_inconclusive() {
        assert!(matches!(conclude(503), Conclusion::Inconclusive));
        assert!(matches!(conclude(403), Conclusion::Blocked));
        assert!(matches!(conclude(200), Conclusion::Success));
        assert!(matches!(conclude(304), Conclusion::Success));
    }
}
