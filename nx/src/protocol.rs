//! pkt-line parsing for the ref advertisement returned by `git-upload-pack`
//!
//! Each frame starts with a 4-digit hex length that counts the header itself.
//! The first frame is discarded; the hash is the first token of the second
//! frame's payload, before the NUL that introduces the capability list:
//!
//! ```text
//! 0032<banner>
//! 003f<hash> refs/heads/main\0<capabilities>
//! ```

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::repo::CommitHash;

/// Size of the hex length prefix on every frame
pub const HEADER_LEN: usize = 4;

/// Index of the frame that carries the head ref line
const HEAD_FRAME_INDEX: usize = 1;

/// Errors produced while parsing the advertisement stream
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("stream ended before the head ref line was read")]
    UnexpectedEof,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("read failed: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof
        } else {
            ProtocolError::Io(err)
        }
    }
}

fn parse_length(header: &[u8; HEADER_LEN]) -> Result<usize, ProtocolError> {
    let text = std::str::from_utf8(header)
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or_else(|| ProtocolError::MalformedFrame(format!("non-hex length header {:?}", header)))?;

    let len = usize::from_str_radix(text, 16)
        .map_err(|e| ProtocolError::MalformedFrame(format!("bad length header {text:?}: {e}")))?;

    if len < HEADER_LEN {
        return Err(ProtocolError::MalformedFrame(format!(
            "declared length {len} is shorter than the {HEADER_LEN}-byte header"
        )));
    }
    Ok(len)
}

async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = parse_length(&header)?;

    let mut payload = vec![0u8; len - HEADER_LEN];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

fn hash_from_ref_line(payload: &[u8]) -> Result<CommitHash, ProtocolError> {
    let line = payload.split(|b| *b == 0).next().unwrap_or_default();
    let token = line
        .split(|b| b.is_ascii_whitespace())
        .find(|t| !t.is_empty())
        .ok_or_else(|| ProtocolError::MalformedFrame("ref line carries no hash token".to_string()))?;
    let token = std::str::from_utf8(token)
        .map_err(|e| ProtocolError::MalformedFrame(format!("hash token is not valid UTF-8: {e}")))?;

    CommitHash::new(token).ok_or_else(|| ProtocolError::MalformedFrame(format!("invalid hash token '{token}'")))
}

/// Read frames until the head ref line and return its commit hash
///
/// Only the first two frames are consumed; the rest of the stream is left
/// unread for the caller to discard.
pub async fn read_advertised_head<R>(mut reader: R) -> Result<CommitHash, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    for index in 0..=HEAD_FRAME_INDEX {
        let payload = read_frame(&mut reader).await?;
        debug!(index, len = payload.len(), "read_advertised_head: frame read");
        if index == HEAD_FRAME_INDEX {
            return hash_from_ref_line(&payload);
        }
    }
    Err(ProtocolError::UnexpectedEof)
}

/// Encode one payload as a pkt-line frame
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = format!("{:04x}", payload.len() + HEADER_LEN).into_bytes();
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SHA: &str = "4d5fcfa2e1b3c0d9a8f7e6d5c4b3a2f1e0d9c8b7";

    fn advertisement(head_line: &[u8]) -> Vec<u8> {
        let mut stream = encode_frame(b"# service=git-upload-pack\n");
        stream.extend(encode_frame(head_line));
        stream.extend(b"0000");
        stream
    }

    #[tokio::test]
    async fn test_reads_hash_from_second_frame() {
        let line = format!("{SHA} refs/heads/main\0multi_ack thin-pack side-band agent=git/2.45\n");
        let stream = advertisement(line.as_bytes());

        let hash = read_advertised_head(stream.as_slice()).await.unwrap();
        assert_eq!(hash.as_str(), SHA);
    }

    #[tokio::test]
    async fn test_hash_without_capabilities() {
        let line = format!("{SHA} HEAD\n");
        let stream = advertisement(line.as_bytes());

        let hash = read_advertised_head(stream.as_slice()).await.unwrap();
        assert_eq!(hash.as_str(), SHA);
    }

    #[tokio::test]
    async fn test_hash_is_case_sensitive_opaque_token() {
        let stream = advertisement(b"AbC-123 refs/heads/main\0caps");

        let hash = read_advertised_head(stream.as_slice()).await.unwrap();
        assert_eq!(hash.as_str(), "AbC-123");
    }

    #[tokio::test]
    async fn test_ignores_trailing_frames() {
        let mut stream = advertisement(format!("{SHA} HEAD\0caps").as_bytes());
        stream.extend(encode_frame(b"ffffffff refs/heads/other\n"));

        let hash = read_advertised_head(stream.as_slice()).await.unwrap();
        assert_eq!(hash.as_str(), SHA);
    }

    #[tokio::test]
    async fn test_non_utf8_hash_token_is_malformed() {
        let stream = advertisement(b"4d5f\xffcfa2 refs/heads/main\0caps");

        let err = read_advertised_head(stream.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_non_utf8_after_token_is_ignored() {
        let line = [SHA.as_bytes(), &b" refs/heads/\xfe\0caps"[..]].concat();
        let stream = advertisement(&line);

        let hash = read_advertised_head(stream.as_slice()).await.unwrap();
        assert_eq!(hash.as_str(), SHA);
    }

    #[tokio::test]
    async fn test_empty_stream_is_unexpected_eof() {
        let err = read_advertised_head(&b""[..]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_single_frame_is_unexpected_eof() {
        let stream = encode_frame(b"banner\n");
        let err = read_advertised_head(stream.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_unexpected_eof() {
        let mut stream = encode_frame(b"banner\n");
        stream.extend(b"0040abc");
        let err = read_advertised_head(stream.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_truncated_header_is_unexpected_eof() {
        let err = read_advertised_head(&b"00"[..]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_length_below_header_is_malformed() {
        for header in ["0000", "0001", "0003"] {
            let err = read_advertised_head(header.as_bytes()).await.unwrap_err();
            assert!(
                matches!(err, ProtocolError::MalformedFrame(_)),
                "{header} should be malformed, got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_flush_as_second_frame_is_malformed() {
        let mut stream = encode_frame(b"banner\n");
        stream.extend(b"0000");
        let err = read_advertised_head(stream.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn test_non_hex_header_is_malformed() {
        let err = read_advertised_head(&b"zz12rest"[..]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn test_missing_token_is_malformed() {
        let lines: [&[u8]; 3] = [b"\0caps", b"   \0caps", b""];
        for line in lines {
            let stream = advertisement(line);
            let err = read_advertised_head(stream.as_slice()).await.unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedFrame(_)), "{line:?}: {err:?}");
        }
    }

    #[test]
    fn test_encode_frame_counts_header() {
        assert_eq!(encode_frame(b"a\n"), b"0006a\n".to_vec());
        assert_eq!(encode_frame(b""), b"0004".to_vec());
    }

    proptest! {
        #[test]
        fn prop_extracts_encoded_hash(
            hash in "[0-9A-Za-z]{1,64}",
            refname in "refs/heads/[a-z0-9/_-]{1,24}",
            banner in proptest::collection::vec(any::<u8>(), 0..200),
            caps in "[ -~]{0,80}",
        ) {
            let head_line = format!("{hash} {refname}\0{caps}\n");
            let mut stream = encode_frame(&banner);
            stream.extend(encode_frame(head_line.as_bytes()));

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let parsed = runtime.block_on(read_advertised_head(stream.as_slice())).unwrap();
            prop_assert_eq!(parsed.as_str(), hash.as_str());
        }
    }
}
