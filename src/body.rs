//! Request body sources.
//!
//! A [`Body`] yields its content as a lazy sequence of byte chunks with a
//! known or unknown length. The connection layer uses `length_hint` to pick
//! between `Content-Length` and chunked transfer framing, and `rewind` to
//! replay the body when a redirect preserves the request method.

use std::path::PathBuf;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::error::{Error, ErrorKind, Result};

#[cfg(feature = "json")]
use serde::Serialize;

const FILE_CHUNK: usize = 64 * 1024;

/// A request body.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Empty,
    Full {
        data: Bytes,
        content_type: Option<String>,
        sent: bool,
    },
    File {
        path: PathBuf,
        len: u64,
        file: Option<tokio::fs::File>,
    },
}

impl Body {
    /// An empty body.
    pub fn empty() -> Self {
        Self { inner: Inner::Empty }
    }

    /// A body from raw bytes, sent without a Content-Type.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self {
            inner: Inner::Full {
                data: data.into(),
                content_type: None,
                sent: false,
            },
        }
    }

    /// A `text/plain` body.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            inner: Inner::Full {
                data: Bytes::from(text.into()),
                content_type: Some("text/plain; charset=utf-8".to_owned()),
                sent: false,
            },
        }
    }

    /// Serializes `value` as an `application/json` body.
    #[cfg(feature = "json")]
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let data = serde_json::to_vec(value)?;
        Ok(Self {
            inner: Inner::Full {
                data: Bytes::from(data),
                content_type: Some("application/json".to_owned()),
                sent: false,
            },
        })
    }

    /// URL-encodes `pairs` as an `application/x-www-form-urlencoded` body.
    pub fn form<K, V>(pairs: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut out = String::new();
        for (key, value) in pairs {
            if !out.is_empty() {
                out.push('&');
            }
            form_encode_into(&mut out, key.as_ref());
            out.push('=');
            form_encode_into(&mut out, value.as_ref());
        }
        Self {
            inner: Inner::Full {
                data: Bytes::from(out),
                content_type: Some("application/x-www-form-urlencoded".to_owned()),
                sent: false,
            },
        }
    }

    /// Streams the file at `path` as an `application/octet-stream` body.
    ///
    /// The file is opened when the request is sent; its current size is
    /// recorded here and used for `Content-Length`.
    pub async fn file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await.map_err(Error::io)?;
        Ok(Self {
            inner: Inner::File {
                path,
                len: meta.len(),
                file: None,
            },
        })
    }

    /// The Content-Type this body implies, unless the caller set one.
    pub fn content_type(&self) -> Option<&str> {
        match &self.inner {
            Inner::Empty => None,
            Inner::Full { content_type, .. } => content_type.as_deref(),
            Inner::File { .. } => Some("application/octet-stream"),
        }
    }

    /// Total length in bytes, when known up front.
    pub fn length_hint(&self) -> Option<u64> {
        match &self.inner {
            Inner::Empty => Some(0),
            Inner::Full { data, .. } => Some(data.len() as u64),
            Inner::File { len, .. } => Some(*len),
        }
    }

    /// Pulls the next chunk, or `None` once the body is exhausted.
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.inner {
            Inner::Empty => Ok(None),
            Inner::Full { data, sent, .. } => {
                if *sent || data.is_empty() {
                    Ok(None)
                } else {
                    *sent = true;
                    Ok(Some(data.clone()))
                }
            }
            Inner::File { path, file, .. } => {
                if file.is_none() {
                    *file = Some(tokio::fs::File::open(&*path).await.map_err(Error::io)?);
                }
                let reader = file.as_mut().ok_or(ErrorKind::Io)?;
                let mut buf = vec![0u8; FILE_CHUNK];
                let n = reader.read(&mut buf).await.map_err(Error::io)?;
                if n == 0 {
                    Ok(None)
                } else {
                    buf.truncate(n);
                    Ok(Some(Bytes::from(buf)))
                }
            }
        }
    }

    /// Resets the body so it can be sent again (redirect replay).
    pub(crate) fn rewind(&mut self) {
        match &mut self.inner {
            Inner::Empty => {}
            Inner::Full { sent, .. } => *sent = false,
            Inner::File { file, .. } => *file = None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Self::bytes(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Self::bytes(data)
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::text(text)
    }
}

/// `application/x-www-form-urlencoded` escaping: unreserved characters pass
/// through, space becomes `+`, everything else is percent-encoded.
fn form_encode_into(out: &mut String, input: &str) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'*' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(HEX[(byte >> 4) as usize] as char);
                out.push(HEX[(byte & 0xf) as usize] as char);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_body_yields_once_and_rewinds() {
        let mut body = Body::bytes(&b"hello"[..]);
        assert_eq!(body.length_hint(), Some(5));
        assert_eq!(body.next_chunk().await.unwrap().unwrap(), &b"hello"[..]);
        assert!(body.next_chunk().await.unwrap().is_none());

        body.rewind();
        assert_eq!(body.next_chunk().await.unwrap().unwrap(), &b"hello"[..]);
    }

    #[test]
    fn form_encoding_escapes_reserved_bytes() {
        let body = Body::form(&[("foo", "42"), ("foo bar", "a&b=c")]);
        assert_eq!(
            body.content_type(),
            Some("application/x-www-form-urlencoded")
        );
        let Inner::Full { data, .. } = &body.inner else {
            panic!("expected full body");
        };
        assert_eq!(&data[..], b"foo=42&foo+bar=a%26b%3Dc");
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_body_sets_content_type() {
        let body = Body::json(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(body.content_type(), Some("application/json"));
        assert_eq!(body.length_hint(), Some(b"{\"a\":1}".len() as u64));
    }

    #[tokio::test]
    async fn empty_body_has_zero_hint() {
        let mut body = Body::empty();
        assert_eq!(body.length_hint(), Some(0));
        assert!(body.next_chunk().await.unwrap().is_none());
    }
}
