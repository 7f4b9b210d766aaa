//! ICE-over-TCP framing and the SSLTCP pseudo-handshake constants.
//!
//! WebRTC TCP candidates frame every packet as a 2-byte big-endian length
//! followed by the payload (RFC 4571), so one frame can never exceed 64 KiB
//! minus one. The SSLTCP variant prefixes the stream with a fixed fake SSL
//! handshake; after the server's canned reply the stream is framed the same
//! way.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Largest payload a frame can carry.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// The fixed 72-byte fake SSL ClientHello a browser opens an SSLTCP
/// candidate with.
pub const SSL_CLIENT_HELLO: [u8; 72] = [
    0x80, 0x46, // msg len, MSB set marks a 2-byte header
    0x01, // CLIENT_HELLO
    0x03, 0x01, // SSL 3.1
    0x00, 0x2d, // ciphersuite len
    0x00, 0x00, // session id len
    0x00, 0x10, // challenge len
    0x01, 0x00, 0x80, 0x03, 0x00, 0x80, 0x07, 0x00, 0xc0, // ciphersuites
    0x06, 0x00, 0x40, 0x02, 0x00, 0x80, 0x04, 0x00, 0x80, //
    0x00, 0x00, 0x04, 0x00, 0xfe, 0xff, 0x00, 0x00, 0x0a, //
    0x00, 0xfe, 0xfe, 0x00, 0x00, 0x09, 0x00, 0x00, 0x64, //
    0x00, 0x00, 0x62, 0x00, 0x00, 0x03, 0x00, 0x00, 0x06, //
    0x1f, 0x17, 0x0c, 0xa6, 0x2f, 0x00, 0x78, 0xfc, // challenge
    0x46, 0x55, 0x2e, 0xb1, 0x83, 0x39, 0xf1, 0xea, //
];

/// The fixed 79-byte ServerHello answering [`SSL_CLIENT_HELLO`].
pub const SSL_SERVER_HELLO: [u8; 79] = [
    0x16, // handshake message
    0x03, 0x01, // SSL 3.1
    0x00, 0x4a, // message len
    0x02, // SERVER_HELLO
    0x00, 0x00, 0x46, // handshake len
    0x03, 0x01, // SSL 3.1
    0x42, 0x85, 0x45, 0xa7, 0x27, 0xa9, 0x5d, 0xa0, // server random
    0xb3, 0xc5, 0xe7, 0x53, 0xda, 0x48, 0x2b, 0x3f, //
    0xc6, 0x5a, 0xca, 0x89, 0xc1, 0x58, 0x52, 0xa1, //
    0x78, 0x3c, 0x5b, 0x17, 0x46, 0x00, 0x85, 0x3f, //
    0x20, // session id len
    0x0e, 0xd3, 0x06, 0x72, 0x5b, 0x5b, 0x1b, 0x5f, // session id
    0x15, 0xac, 0x13, 0xf9, 0x88, 0x53, 0x9d, 0x9b, //
    0xe8, 0x3d, 0x7b, 0x0c, 0x30, 0x32, 0x6e, 0x38, //
    0x4d, 0xa2, 0x75, 0x57, 0x41, 0x6c, 0x34, 0x5c, //
    0x00, 0x04, // RSA/RC4-128/MD5
    0x00, // null compression
];

/// Read one frame into `buf`, returning the payload length. A declared
/// length of zero yields `Ok(0)`. Transient socket errors re-enter the read
/// loop; closing the stream mid-frame is an error.
pub async fn read_frame<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    debug_assert!(buf.len() >= MAX_FRAME_LEN);

    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    let len = u16::from_be_bytes(head) as usize;
    if len == 0 {
        return Ok(0);
    }

    let mut filled = 0;
    while filled < len {
        match reader.read(&mut buf[filled..len]).await {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed inside an ice-tcp frame",
                )))
            }
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(len)
}

/// Write one frame: length prefix, then payload. Payloads over
/// [`MAX_FRAME_LEN`] are rejected.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::TooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let payload = b"dtls handshake bytes".to_vec();
        let mut wire = Vec::new();
        write_frame(&mut wire, &payload).await.unwrap();
        assert_eq!(&wire[..2], &(payload.len() as u16).to_be_bytes());

        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let mut reader = wire.as_slice();
        let n = read_frame(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], payload.as_slice());
    }

    #[tokio::test]
    async fn zero_length_yields_empty_frame() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &[]).await.unwrap();
        assert_eq!(wire, vec![0, 0]);

        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let mut reader = wire.as_slice();
        assert_eq!(read_frame(&mut reader, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected() {
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        let mut wire = Vec::new();
        assert!(matches!(
            write_frame(&mut wire, &payload).await,
            Err(Error::TooLarge(_))
        ));
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn maximum_payload_round_trips() {
        let payload = vec![0xAB; MAX_FRAME_LEN];
        let mut wire = Vec::new();
        write_frame(&mut wire, &payload).await.unwrap();

        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let mut reader = wire.as_slice();
        let n = read_frame(&mut reader, &mut buf).await.unwrap();
        assert_eq!(n, MAX_FRAME_LEN);
        assert_eq!(&buf[..n], payload.as_slice());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"complete payload").await.unwrap();
        wire.truncate(wire.len() - 4);

        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let mut reader = wire.as_slice();
        assert!(read_frame(&mut reader, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn consecutive_frames_keep_boundaries() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first").await.unwrap();
        write_frame(&mut wire, b"second frame").await.unwrap();

        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let mut reader = wire.as_slice();
        let n = read_frame(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = read_frame(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second frame");
    }

    #[test]
    fn ssltcp_magics_have_expected_shape() {
        assert_eq!(SSL_CLIENT_HELLO.len(), 58);
        assert_eq!(SSL_SERVER_HELLO.len(), 79);
        assert_eq!(SSL_SERVER_HELLO[0], 0x16);
        assert_eq!(&SSL_SERVER_HELLO[1..3], &[0x03, 0x01]);
    }
}
