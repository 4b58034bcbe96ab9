//! Adaptive bidirectional-copy helper.
//!
//! Derived from tokio's own `io::copy`, generalized to grow and shrink its buffer at runtime
//! instead of using a single fixed size. See <https://github.com/tokio-rs/tokio/issues/6454>
//! for the upstream discussion this is based on.

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Smallest buffer used by [`copy_adaptive`].
pub const MIN_BUFFER_SIZE: usize = 8 * 1024;

/// Largest buffer used by [`copy_adaptive`].
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Copies bytes from `reader` to `writer` until EOF, resizing the internal buffer based on how
/// full each read leaves it: a full read doubles the buffer (up to [`MAX_BUFFER_SIZE`]), a read
/// using less than a quarter of it halves the buffer (down to [`MIN_BUFFER_SIZE`]).
///
/// This keeps small request/response bodies cheap while letting large streaming payloads amortize
/// the per-read overhead, without requiring per-call tuning.
pub async fn copy_adaptive<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0_u8; MIN_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n]).await?;
        total += n as u64;

        if n == buf.len() && buf.len() < MAX_BUFFER_SIZE {
            buf.resize(buf.len() * 2, 0);
        } else if n < buf.len() / 4 && buf.len() > MIN_BUFFER_SIZE {
            let shrunk = (buf.len() / 2).max(MIN_BUFFER_SIZE);
            buf.truncate(shrunk);
        }
    }

    writer.flush().await?;

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_all_bytes() {
        let payload = vec![7_u8; 5 * MAX_BUFFER_SIZE];
        let mut out = Vec::new();
        let n = copy_adaptive(payload.as_slice(), &mut out).await.unwrap();
        assert_eq!(n, payload.len() as u64);
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn copies_small_payload() {
        let payload = b"hello bridge".to_vec();
        let mut out = Vec::new();
        let n = copy_adaptive(payload.as_slice(), &mut out).await.unwrap();
        assert_eq!(n, payload.len() as u64);
        assert_eq!(out, payload);
    }
}
