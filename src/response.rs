//! Buffered response.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::error::{Error, ErrorKind, Result};
use crate::redirect::Hop;

/// A fully buffered HTTP response, including the redirect trail that led to
/// it.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    history: Vec<Hop>,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        history: Vec<Hop>,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            history,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Redirect hops followed before this response, oldest first.
    pub fn history(&self) -> &[Hop] {
        &self.history
    }

    /// The response body.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Consumes the response, returning the body.
    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    /// The body as UTF-8 text.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).map_err(|e| Error::with_source(ErrorKind::Decode, e))
    }

    /// Decodes the body as JSON.
    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &'static [u8]) -> Response {
        Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(body),
            Vec::new(),
        )
    }

    #[test]
    fn text_requires_utf8() {
        assert_eq!(response(b"ok").text().unwrap(), "ok");
        assert_eq!(
            response(b"\xff\xfe").text().unwrap_err().kind(),
            ErrorKind::Decode
        );
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_decodes_typed() {
        #[derive(serde::Deserialize, Debug)]
        struct Payload {
            n: u32,
        }
        let payload: Payload = response(b"{\"n\": 7}").json().unwrap();
        assert_eq!(payload.n, 7);
        assert_eq!(
            response(b"not json").json::<Payload>().unwrap_err().kind(),
            ErrorKind::Decode
        );
    }
}
