//! Length-prefixed JSON framing.
//!
//! A frame is 8 ASCII hex digits giving the payload length in bytes, followed
//! by the UTF-8 JSON payload itself.

use crate::{SumsError, SumsResult};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_PREFIX_LEN: usize = 8;

/// Upper bound on the buffer reserved before a payload starts arriving.
const FRAME_INITIAL_CAPACITY: usize = 64 * 1024;

pub fn encode_frame(payload: &[u8]) -> SumsResult<Vec<u8>> {
    if payload.len() > u32::MAX as usize {
        return Err(SumsError::CantSend(format!(
            "payload too large for frame: {} bytes",
            payload.len()
        )));
    }

    let mut buf = Vec::with_capacity(FRAME_PREFIX_LEN + payload.len());
    buf.extend_from_slice(format!("{:08x}", payload.len()).as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn parse_prefix(prefix: &[u8]) -> SumsResult<usize> {
    let text = std::str::from_utf8(prefix)
        .map_err(|_| SumsError::CantReceive("frame prefix is not ascii".to_string()))?;
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(SumsError::CantReceive(format!(
            "invalid frame prefix: {:?}",
            text
        )));
    }
    let len = u32::from_str_radix(text, 16)
        .map_err(|e| SumsError::CantReceive(format!("invalid frame prefix {:?}: {}", text, e)))?;
    Ok(len as usize)
}

/// Decodes one frame from the start of `buf`, returning the payload and the
/// number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> SumsResult<(Vec<u8>, usize)> {
    if buf.len() < FRAME_PREFIX_LEN {
        return Err(SumsError::BrokenConnection(format!(
            "short frame prefix: {} bytes",
            buf.len()
        )));
    }
    let len = parse_prefix(&buf[..FRAME_PREFIX_LEN])?;
    let end = FRAME_PREFIX_LEN + len;
    if buf.len() < end {
        return Err(SumsError::BrokenConnection(format!(
            "short frame payload: expected {} bytes, got {}",
            len,
            buf.len() - FRAME_PREFIX_LEN
        )));
    }
    Ok((buf[FRAME_PREFIX_LEN..end].to_vec(), end))
}

fn map_read_err(err: std::io::Error, what: &str) -> SumsError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        SumsError::BrokenConnection(format!("eof while reading {}", what))
    } else {
        SumsError::CantReceive(format!("read {} failed: {}", what, err))
    }
}

pub async fn read_frame<R>(reader: &mut R) -> SumsResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|e| map_read_err(e, "frame prefix"))?;
    let len = parse_prefix(&prefix)?;

    // grows with the bytes that actually arrive, not with the declared length
    let mut payload = Vec::with_capacity(len.min(FRAME_INITIAL_CAPACITY));
    let read = (&mut *reader)
        .take(len as u64)
        .read_to_end(&mut payload)
        .await
        .map_err(|e| map_read_err(e, "frame payload"))?;
    if read != len {
        return Err(SumsError::BrokenConnection(format!(
            "eof while reading frame payload: expected {} bytes, got {}",
            len, read
        )));
    }
    Ok(payload)
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> SumsResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::BrokenPipe
            || e.kind() == std::io::ErrorKind::ConnectionReset
        {
            SumsError::BrokenConnection(format!("peer gone while writing frame: {}", e))
        } else {
            SumsError::CantSend(format!("write frame failed: {}", e))
        }
    })?;
    writer
        .flush()
        .await
        .map_err(|e| SumsError::CantSend(format!("flush frame failed: {}", e)))?;
    Ok(())
}

/// Reads one frame and parses it as JSON. Transport errors keep their fatal
/// variants; a payload that is not JSON is `BadJson`.
pub async fn read_json<R>(reader: &mut R) -> SumsResult<Value>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader).await?;
    serde_json::from_slice(&payload).map_err(|e| SumsError::BadJson(e.to_string()))
}

pub async fn write_json<W>(writer: &mut W, value: &Value) -> SumsResult<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(value)
        .map_err(|e| SumsError::CantSend(format!("serialize response failed: {}", e)))?;
    write_frame(writer, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_prefix() {
        let frame = encode_frame(b"{}").unwrap();
        assert_eq!(&frame[..8], b"00000002");
        assert_eq!(&frame[8..], b"{}");

        let big = vec![b'x'; 0x1af];
        let frame = encode_frame(&big).unwrap();
        assert_eq!(&frame[..8], b"000001af");
    }

    #[test]
    fn test_decode_accepts_upper_case() {
        let mut buf = b"0000000A".to_vec();
        buf.extend_from_slice(b"0123456789trailing");
        let (payload, consumed) = decode_frame(&buf).unwrap();
        assert_eq!(payload, b"0123456789");
        assert_eq!(consumed, 18);
    }

    #[test]
    fn test_decode_errors() {
        let err = decode_frame(b"0000").unwrap_err();
        assert!(err.is_connection_fatal());
        assert!(matches!(err, SumsError::BrokenConnection(_)));

        let err = decode_frame(b"zz000002{}").unwrap_err();
        assert!(matches!(err, SumsError::CantReceive(_)));

        let err = decode_frame(b"00000010{}").unwrap_err();
        assert!(matches!(err, SumsError::BrokenConnection(_)));
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(16);
        let value = json!({"reqtype": "ping", "sessionid": "1f"});
        let sent = value.clone();
        let writer = tokio::spawn(async move {
            write_json(&mut a, &sent).await.unwrap();
            a
        });
        let got = read_json(&mut b).await.unwrap();
        assert_eq!(got, value);
        let _ = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_eof_is_broken_connection() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, SumsError::BrokenConnection(_)));
    }

    #[tokio::test]
    async fn test_oversized_prefix_with_short_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"ffffffff{\"reqtype\"").await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, SumsError::BrokenConnection(_)));
        assert!(err.to_string().contains("got 10"));
    }

    #[tokio::test]
    async fn test_read_bad_json() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"not json").await.unwrap();
        let err = read_json(&mut b).await.unwrap_err();
        assert!(matches!(err, SumsError::BadJson(_)));
        assert!(!err.is_connection_fatal());
    }
}
