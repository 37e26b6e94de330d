//! HTTP CONNECT forward-proxy client.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::proxy::Address;

/// Largest response head accepted from the proxy.
const MAX_RESPONSE_HEAD: usize = 8192;

const MAX_HEADERS: usize = 32;

/// Open a tunnel to `dest` through an HTTP proxy on an already connected stream.
///
/// Any status outside 2xx is a handshake failure. Bytes the proxy sends past
/// the response head are rejected, since the relay server never speaks first.
pub async fn http_connect<S>(stream: &mut S, dest: &Address) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = match dest {
        Address::Socket(addr) => addr.to_string(),
        Address::Domain(name, port) => format!("{}:{}", name, port),
    };
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::proxy("proxy closed during CONNECT"));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let code = resp.code.unwrap_or(0);
                if !(200..300).contains(&code) {
                    return Err(Error::proxy(format!(
                        "CONNECT {} answered {} {}",
                        authority,
                        code,
                        resp.reason.unwrap_or("")
                    )));
                }
                if buf.len() > head_len {
                    return Err(Error::proxy("unexpected data after CONNECT response"));
                }
                tracing::debug!("HTTP proxy connected to {}", authority);
                return Ok(());
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() >= MAX_RESPONSE_HEAD {
                    return Err(Error::proxy("CONNECT response head too large"));
                }
            }
            Err(e) => return Err(Error::proxy(format!("malformed CONNECT response: {}", e))),
        }
    }
}
