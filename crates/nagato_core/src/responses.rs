//! Canned byte-exact responses the session sends to the client itself,
//! rather than relaying from upstream.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::SessionResult;

pub fn proxy_agent() -> String {
    format!("Nagato/{}", env!("CARGO_PKG_VERSION"))
}

pub async fn send_connection_established<W: AsyncWrite + Unpin>(
    w: &mut W,
    version: &str,
) -> SessionResult<()> {
    let response = format!(
        "{version} 200 Connection Established\r\nProxy-Agent: {}\r\n\r\n",
        proxy_agent()
    );
    w.write_all(response.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn send_gateway_timeout<W: AsyncWrite + Unpin>(
    w: &mut W,
    version: &str,
) -> SessionResult<()> {
    let response = format!(
        "{version} 504 Gateway Timeout\r\nProxy-Agent: {}\r\nConnection: close\r\n\r\n",
        proxy_agent()
    );
    w.write_all(response.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn send_temporary_redirect<W: AsyncWrite + Unpin>(
    w: &mut W,
    version: &str,
    location: &str,
) -> SessionResult<()> {
    let response = format!(
        "{version} 307 Temporary Redirect\r\nLocation: {location}\r\nProxy-Agent: {}\r\nConnection: close\r\n\r\n",
        proxy_agent()
    );
    w.write_all(response.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_established_has_no_body() {
        let mut out = Vec::new();
        send_connection_established(&mut out, "HTTP/1.1").await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 Connection Established\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(text.contains("Proxy-Agent: Nagato/"));
    }

    #[tokio::test]
    async fn gateway_timeout_closes_the_connection() {
        let mut out = Vec::new();
        send_gateway_timeout(&mut out, "HTTP/1.1").await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("504 Gateway Timeout"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn redirect_carries_the_requested_location() {
        let mut out = Vec::new();
        send_temporary_redirect(&mut out, "HTTP/1.1", "http://example.com/").await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("307 Temporary Redirect"));
        assert!(text.contains("Location: http://example.com/\r\n"));
    }
}
