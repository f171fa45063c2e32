// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Length-prefixed record framing for datagrams crossing a byte stream.
//!
//! Each record is a 2-byte big-endian unsigned length followed by that many
//! payload bytes, so datagram boundaries survive transport over an ordered
//! byte channel.

/// The position within a record at which a read was interrupted or violated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length {received} exceeds the provided buffer of {capacity} bytes")]
  MaxLengthExceeded { capacity: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: ::std::io::Error,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] ::std::io::Error),
}

/// Reads one length-prefixed record into the front of `buffer`, returning the
/// payload length.
///
/// Returns `Ok(None)` when the stream ends cleanly at a record boundary. A
/// stream ending anywhere inside a record is a framing violation, as is a
/// declared length exceeding `buffer.len()` — the length check happens before
/// any payload byte is consumed, so an oversized record is never read past
/// its prefix.
pub async fn read_frame<T: tokio::io::AsyncRead + Unpin>(
  mut s: T,
  buffer: &mut [u8],
) -> Result<Option<usize>, ReadError> {
  use tokio::io::AsyncReadExt;
  let mut prefix = [0u8; 2];
  // The first prefix byte is read alone so that end-of-stream between
  // records can be told apart from a record torn mid-prefix.
  let n = s
    .read(&mut prefix[..1])
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })?;
  if n == 0 {
    return Ok(None);
  }
  s.read_exact(&mut prefix[1..])
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })?;
  let length = u16::from_be_bytes(prefix) as usize;
  if length > buffer.len() {
    return Err(ReadError::MaxLengthExceeded {
      capacity: buffer.len(),
      received: length,
    });
  }
  s.read_exact(&mut buffer[..length])
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(Some(length))
}

/// Writes `payload` as one length-prefixed record.
///
/// `payload` must fit the 2-byte length prefix; the forwarding paths feed
/// this from buffers no larger than [`u16::MAX`] bytes.
pub async fn write_frame<T: tokio::io::AsyncWrite + Unpin>(
  mut s: T,
  payload: &[u8],
) -> Result<(), WriteError> {
  use tokio::io::AsyncWriteExt;
  debug_assert!(payload.len() <= u16::MAX as usize);
  s.write_u16(payload.len() as u16).await?;
  Ok(s.write_all(payload).await?)
}

#[cfg(test)]
mod tests {
  use super::{read_frame, write_frame, NextExpected, ReadError};

  #[tokio::test]
  async fn frame_roundtrip_preserves_boundaries() {
    let mut wire: Vec<u8> = Vec::new();
    {
      let mut cursor = std::io::Cursor::new(&mut wire);
      write_frame(&mut cursor, b"ab").await.unwrap();
      write_frame(&mut cursor, b"cde").await.unwrap();
      write_frame(&mut cursor, b"").await.unwrap();
    }
    // Prefix plus payload for each record, in order
    assert_eq!(&wire[..4], &[0x00, 0x02, b'a', b'b']);
    assert_eq!(&wire[4..9], &[0x00, 0x03, b'c', b'd', b'e']);
    assert_eq!(&wire[9..], &[0x00, 0x00]);

    let mut cursor = std::io::Cursor::new(&wire);
    let mut buffer = [0u8; 16];
    assert_eq!(read_frame(&mut cursor, &mut buffer).await.unwrap(), Some(2));
    assert_eq!(&buffer[..2], b"ab");
    assert_eq!(read_frame(&mut cursor, &mut buffer).await.unwrap(), Some(3));
    assert_eq!(&buffer[..3], b"cde");
    assert_eq!(read_frame(&mut cursor, &mut buffer).await.unwrap(), Some(0));
    assert_eq!(
      read_frame(&mut cursor, &mut buffer).await.unwrap(),
      None,
      "End-of-stream on a record boundary must read as clean termination"
    );
  }

  #[tokio::test]
  async fn oversized_length_is_rejected_before_payload() {
    let wire = [0x00u8, 0x05, b'x', b'y'];
    let mut cursor = std::io::Cursor::new(&wire[..]);
    let mut buffer = [0u8; 4];
    match read_frame(&mut cursor, &mut buffer).await {
      Err(ReadError::MaxLengthExceeded { capacity, received }) => {
        assert_eq!(capacity, 4);
        assert_eq!(received, 5);
      }
      other => panic!("Expected MaxLengthExceeded, got {:?}", other),
    }
    // The payload bytes must remain unconsumed
    assert_eq!(cursor.position(), 2);
  }

  #[tokio::test]
  async fn torn_prefix_is_a_framing_violation() {
    let wire = [0x00u8];
    let mut cursor = std::io::Cursor::new(&wire[..]);
    let mut buffer = [0u8; 4];
    match read_frame(&mut cursor, &mut buffer).await {
      Err(ReadError::UnexpectedEnd {
        expected: NextExpected::LengthSpecifier,
        ..
      }) => {}
      other => panic!("Expected UnexpectedEnd at the length prefix, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn torn_content_is_a_framing_violation() {
    let wire = [0x00u8, 0x04, b'a', b'b'];
    let mut cursor = std::io::Cursor::new(&wire[..]);
    let mut buffer = [0u8; 8];
    match read_frame(&mut cursor, &mut buffer).await {
      Err(ReadError::UnexpectedEnd {
        expected: NextExpected::Content { length: 4 },
        ..
      }) => {}
      other => panic!("Expected UnexpectedEnd inside content, got {:?}", other),
    }
  }
}
