//! Framed messages exchanged between metadata clients and servers.
//!
//! Wire layout: `[kind:u8][tag:u16]` followed by a kind-specific body with
//! big-endian integers and `u16`-length-prefixed strings. The `tag`
//! correlates a response with its request on one connection; tag 0 is
//! reserved for server-initiated broadcasts.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::codec::bits;
use crate::store::StoreError;

const KIND_GET: u8 = 0;
const KIND_PUT: u8 = 1;
const KIND_ERROR: u8 = 2;
const KIND_AUTH: u8 = 3;

/// A single protocol message.
///
/// `Get` asks for the latest version of a key; the server answers with a
/// `Put` (or `Error` when the key is unknown). `Put` updates a key and is
/// echoed back verbatim on success, then fanned out with tag 0 to every
/// other authorized connection. `Error` only travels server-to-client.
/// `Auth` carries a password client-to-server and an empty value on the
/// success reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Get {
        tag: u16,
        key: Bytes,
    },
    Put {
        tag: u16,
        key: Bytes,
        value: Bytes,
        version: u64,
    },
    Error {
        tag: u16,
        text: String,
    },
    Auth {
        tag: u16,
        password: String,
    },
}

impl Message {
    pub fn get(tag: u16, key: impl Into<Bytes>) -> Self {
        Message::Get {
            tag,
            key: key.into(),
        }
    }

    pub fn put(tag: u16, key: impl Into<Bytes>, value: impl Into<Bytes>, version: u64) -> Self {
        Message::Put {
            tag,
            key: key.into(),
            value: value.into(),
            version,
        }
    }

    pub fn error(tag: u16, text: impl Into<String>) -> Self {
        Message::Error {
            tag,
            text: text.into(),
        }
    }

    pub fn auth(tag: u16, password: impl Into<String>) -> Self {
        Message::Auth {
            tag,
            password: password.into(),
        }
    }

    pub fn tag(&self) -> u16 {
        match *self {
            Message::Get { tag, .. }
            | Message::Put { tag, .. }
            | Message::Error { tag, .. }
            | Message::Auth { tag, .. } => tag,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Get { .. } => "GET",
            Message::Put { .. } => "PUT",
            Message::Error { .. } => "ERROR",
            Message::Auth { .. } => "AUTH",
        }
    }

    /// Copy of a `Put` with tag 0, suitable for fan-out to connections that
    /// did not send the original request. Only puts are broadcast.
    pub fn for_broadcast(&self) -> Option<Message> {
        match self {
            Message::Put {
                key,
                value,
                version,
                ..
            } => Some(Message::Put {
                tag: 0,
                key: key.clone(),
                value: value.clone(),
                version: *version,
            }),
            _ => None,
        }
    }
}

/// Keys and values are clipped and hex-escaped when not printable, so
/// arbitrary metadata bytes never garble log output. Passwords only ever
/// log their presence.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Get { tag, key } => {
                write!(f, "kind=GET tag={} key={}", tag, repr(key))
            }
            Message::Put {
                tag,
                key,
                value,
                version,
            } => write!(
                f,
                "kind=PUT tag={} key={} value={} version={}",
                tag,
                repr(key),
                repr(value),
                version
            ),
            Message::Error { tag, text } => {
                write!(f, "kind=ERROR tag={} value={}", tag, repr(text.as_bytes()))
            }
            Message::Auth { tag, password } => {
                write!(f, "kind=AUTH tag={} value={}", tag, !password.is_empty())
            }
        }
    }
}

fn repr(raw: &[u8]) -> String {
    const MAX: usize = 11;
    let printable = raw.iter().all(|b| b.is_ascii() && !b.is_ascii_control());
    let text = if printable {
        String::from_utf8_lossy(raw).into_owned()
    } else {
        hex::encode(raw)
    };
    if text.len() > MAX {
        format!("{}...", &text[..MAX - 3])
    } else {
        text
    }
}

/// Serializes messages to a writer, reusing one internal buffer. Concurrent
/// `encode` calls are serialized on that buffer; callers still have to
/// serialize access to any single underlying stream.
#[derive(Default)]
pub struct Encoder {
    buf: Mutex<BytesMut>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn encode<W>(&self, w: &mut W, m: &Message) -> Result<(), StoreError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = self.buf.lock().await;
        buf.clear();
        match m {
            Message::Get { tag, key } => {
                bits::put_u8(&mut *buf, KIND_GET);
                bits::put_u16(&mut *buf, *tag);
                bits::put_bytes(&mut *buf, key);
            }
            Message::Put {
                tag,
                key,
                value,
                version,
            } => {
                bits::put_u8(&mut *buf, KIND_PUT);
                bits::put_u16(&mut *buf, *tag);
                bits::put_bytes(&mut *buf, key);
                bits::put_bytes(&mut *buf, value);
                bits::put_u64(&mut *buf, *version);
            }
            Message::Error { tag, text } => {
                bits::put_u8(&mut *buf, KIND_ERROR);
                bits::put_u16(&mut *buf, *tag);
                bits::put_bytes(&mut *buf, text.as_bytes());
            }
            Message::Auth { tag, password } => {
                bits::put_u8(&mut *buf, KIND_AUTH);
                bits::put_u16(&mut *buf, *tag);
                bits::put_bytes(&mut *buf, password.as_bytes());
            }
        }
        w.write_all(&buf).await.map_err(underflow_on_eof)?;
        Ok(())
    }
}

/// Deserializes messages from a reader, reading exactly the bytes each field
/// needs (the decoder never peeks past the current message).
#[derive(Default)]
pub struct Decoder {
    buf: Mutex<Vec<u8>>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn decode<R>(&self, r: &mut R) -> Result<Message, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = self.buf.lock().await;
        let mut head = [0u8; 3];
        r.read_exact(&mut head).await.map_err(underflow_on_eof)?;
        let kind = head[0];
        let tag = u16::from_be_bytes([head[1], head[2]]);
        match kind {
            KIND_GET => {
                let key = read_prefixed(r, &mut buf).await?;
                Ok(Message::Get {
                    tag,
                    key: Bytes::from(key),
                })
            }
            KIND_PUT => {
                let key = read_prefixed(r, &mut buf).await?;
                let value = read_prefixed(r, &mut buf).await?;
                let mut v = [0u8; 8];
                r.read_exact(&mut v).await.map_err(underflow_on_eof)?;
                Ok(Message::Put {
                    tag,
                    key: Bytes::from(key),
                    value: Bytes::from(value),
                    version: u64::from_be_bytes(v),
                })
            }
            KIND_ERROR => {
                let text = read_prefixed(r, &mut buf).await?;
                Ok(Message::Error {
                    tag,
                    text: String::from_utf8_lossy(&text).into_owned(),
                })
            }
            KIND_AUTH => {
                let password = read_prefixed(r, &mut buf).await?;
                Ok(Message::Auth {
                    tag,
                    password: String::from_utf8_lossy(&password).into_owned(),
                })
            }
            other => Err(StoreError::BadMessage(format!(
                "unknown message kind {other}"
            ))),
        }
    }
}

async fn read_prefixed<R>(r: &mut R, scratch: &mut Vec<u8>) -> Result<Vec<u8>, StoreError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    r.read_exact(&mut len).await.map_err(underflow_on_eof)?;
    let n = u16::from_be_bytes(len) as usize;
    scratch.resize(n, 0);
    r.read_exact(&mut scratch[..n])
        .await
        .map_err(underflow_on_eof)?;
    Ok(scratch[..n].to_vec())
}

fn underflow_on_eof(e: std::io::Error) -> StoreError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof || e.kind() == std::io::ErrorKind::WriteZero {
        StoreError::Underflow
    } else {
        StoreError::Io(e)
    }
}

/// Allocates request tags for one connection. Wraps around and skips 0,
/// which is reserved for broadcasts; with fewer than 65 535 requests in
/// flight a wrapped tag never collides with an outstanding one.
#[derive(Default)]
pub struct TagAllocator {
    next: AtomicU16,
}

impl TagAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u16 {
        loop {
            let tag = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if tag != 0 {
                return tag;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    fn random_bytes(rng: &mut impl RngCore) -> Vec<u8> {
        let n = rng.random_range(0..64);
        let mut b = vec![0u8; n];
        rng.fill_bytes(&mut b);
        b
    }

    fn random_message(rng: &mut impl RngCore) -> Message {
        let tag = rng.random::<u16>();
        match rng.random_range(0..4) {
            0 => Message::get(tag, random_bytes(rng)),
            1 => Message::put(tag, random_bytes(rng), random_bytes(rng), rng.random()),
            2 => Message::error(tag, String::from_utf8_lossy(&random_bytes(rng)).into_owned()),
            _ => Message::auth(tag, String::from_utf8_lossy(&random_bytes(rng)).into_owned()),
        }
    }

    #[tokio::test]
    async fn what_you_encode_is_what_you_decode() {
        let mut rng = rand::rng();
        let encoder = Encoder::new();
        let decoder = Decoder::new();
        for _ in 0..1000 {
            let m = random_message(&mut rng);
            let mut wire = Vec::new();
            encoder.encode(&mut wire, &m).await.unwrap();
            let got = decoder.decode(&mut wire.as_slice()).await.unwrap();
            assert_eq!(got, m);
        }
    }

    #[tokio::test]
    async fn fresh_codec_per_message_also_round_trips() {
        let mut rng = rand::rng();
        for _ in 0..200 {
            let m = random_message(&mut rng);
            let mut wire = Vec::new();
            Encoder::new().encode(&mut wire, &m).await.unwrap();
            let got = Decoder::new().decode(&mut wire.as_slice()).await.unwrap();
            assert_eq!(got, m);
        }
    }

    #[tokio::test]
    async fn truncated_input_underflows() {
        let m = Message::put(7, &b"key"[..], &b"value"[..], 3);
        let mut wire = Vec::new();
        Encoder::new().encode(&mut wire, &m).await.unwrap();
        for cut in 0..wire.len() {
            let decoder = Decoder::new();
            let err = decoder.decode(&mut &wire[..cut]).await.unwrap_err();
            assert!(matches!(err, StoreError::Underflow), "cut at {cut}: {err}");
        }
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let wire = [9u8, 0, 1];
        let err = Decoder::new().decode(&mut &wire[..]).await.unwrap_err();
        assert!(matches!(err, StoreError::BadMessage(_)));
    }

    #[test]
    fn display_clips_and_escapes() {
        assert_eq!(
            Message::get(42, &b"name"[..]).to_string(),
            "kind=GET tag=42 key=name"
        );
        assert_eq!(
            Message::put(43, &b"name"[..], &b"mark"[..], 666).to_string(),
            "kind=PUT tag=43 key=name value=mark version=666"
        );
        assert_eq!(
            Message::error(44, "neutrinos hit the memory bank").to_string(),
            "kind=ERROR tag=44 value=neutrino..."
        );
        assert_eq!(
            Message::auth(45, "s3cr3t").to_string(),
            "kind=AUTH tag=45 value=true"
        );
        assert_eq!(
            Message::auth(46, "").to_string(),
            "kind=AUTH tag=46 value=false"
        );
    }

    #[test]
    fn tags_skip_zero_and_wrap() {
        let tags = TagAllocator::new();
        let first = tags.next();
        assert_ne!(first, 0);
        for _ in 0..0x2_0000 {
            assert_ne!(tags.next(), 0);
        }
    }
}
