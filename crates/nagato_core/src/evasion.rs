//! Byte-level writers implementing the censor-evasion tricks: dummy header
//! padding, host-header fragmentation, and TLS ClientHello pre-segmentation.
//!
//! Randomness here is for evasion, not security. Each session owns its own
//! generator seeded from the process entropy source so sessions never share
//! (and an observer can never correlate) evasion jitter.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Duration};

use crate::error::SessionResult;
use crate::line_reader::LineReader;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

pub struct Evasion {
    rng: StdRng,
}

impl Evasion {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    fn random_str(&mut self, len: usize) -> String {
        (0..len)
            .map(|_| ALPHABET[self.rng.random_range(0..ALPHABET.len())] as char)
            .collect()
    }

    /// Eight `X-<rand16>: <rand128>` headers, padding the request head so
    /// the real headers miss the first TCP segment.
    pub async fn write_dummy_headers<W: AsyncWrite + Unpin>(
        &mut self,
        w: &mut W,
    ) -> SessionResult<()> {
        for _ in 0..8 {
            let name = self.random_str(16);
            let value = self.random_str(128);
            let line = format!("X-{name}: {value}\r\n");
            w.write_all(line.as_bytes()).await?;
        }
        w.flush().await?;
        Ok(())
    }

    /// Emits `hoSt:<host>\r\n` (mixed case, no space after the colon) split
    /// into random 1-5 byte sub-writes, flushing and sleeping 0-10ms between
    /// each piece so the line never lands whole in one TCP segment.
    pub async fn write_host_fragmented<W: AsyncWrite + Unpin>(
        &mut self,
        w: &mut W,
        host: &str,
    ) -> SessionResult<()> {
        let line = format!("hoSt:{host}\r\n");
        let bytes = line.as_bytes();
        let head_len = bytes.len().min(2);
        let (head, mut rest) = bytes.split_at(head_len);

        self.write_piece(w, head).await?;
        while !rest.is_empty() {
            let take = self.rng.random_range(1..=5).min(rest.len());
            let (piece, remainder) = rest.split_at(take);
            self.write_piece(w, piece).await?;
            rest = remainder;
        }
        Ok(())
    }

    async fn write_piece<W: AsyncWrite + Unpin>(
        &mut self,
        w: &mut W,
        piece: &[u8],
    ) -> SessionResult<()> {
        w.write_all(piece).await?;
        w.flush().await?;
        let delay_ms = self.rng.random_range(0..10u64);
        sleep(Duration::from_millis(delay_ms)).await;
        Ok(())
    }
}

impl Default for Evasion {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the first 5 bytes of a freshly-tunneled stream and forwards them.
/// If they look like a TLS record header (`16 03 01`) whose declared length
/// exceeds 85, reads and forwards the next 85 bytes too, so the ClientHello
/// record header and its SNI extension land in separate upstream writes.
pub async fn presegment_client_hello<R, W>(
    client: &mut LineReader<R>,
    upstream: &mut W,
) -> SessionResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let first = client.read_exact(5).await?;
    upstream.write_all(&first).await?;
    upstream.flush().await?;

    if first.len() == 5 && first[0] == 0x16 && first[1] == 0x03 && first[2] == 0x01 {
        let record_len = u16::from_be_bytes([first[3], first[4]]) as usize;
        if record_len > 85 {
            let second = client.read_exact(85).await?;
            upstream.write_all(&second).await?;
            upstream.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor as IoCursor;

    #[tokio::test]
    async fn host_fragmentation_reassembles_to_the_expected_line() {
        let mut evasion = Evasion::new();
        let mut out = Vec::new();
        evasion
            .write_host_fragmented(&mut out, "example.com")
            .await
            .unwrap();
        assert_eq!(out, b"hoSt:example.com\r\n");
    }

    #[tokio::test]
    async fn presegmentation_is_noop_for_small_client_hello() {
        // record header claims a 50-byte record, under the 85-byte threshold
        let mut client = LineReader::new(IoCursor::new(vec![0x16, 0x03, 0x01, 0x00, 0x32]));
        let mut upstream = Vec::new();
        presegment_client_hello(&mut client, &mut upstream).await.unwrap();
        assert_eq!(upstream.len(), 5);
    }

    #[tokio::test]
    async fn presegmentation_splits_large_client_hello() {
        let mut payload = vec![0x16, 0x03, 0x01, 0x00, 150];
        payload.extend(std::iter::repeat(0xAA).take(85));
        let mut client = LineReader::new(IoCursor::new(payload));
        let mut upstream = Vec::new();
        presegment_client_hello(&mut client, &mut upstream).await.unwrap();
        assert_eq!(upstream.len(), 90);
    }

    #[tokio::test]
    async fn presegmentation_passes_through_non_tls_bytes() {
        let mut client = LineReader::new(IoCursor::new(b"GET / ".to_vec()));
        let mut upstream = Vec::new();
        presegment_client_hello(&mut client, &mut upstream).await.unwrap();
        assert_eq!(upstream, b"GET / ");
    }
}
