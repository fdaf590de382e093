//! Serialized request envelope.
//!
//! The payload of a `uwsgi` command is a key/value packet in the format the
//! dealer backends consume: a 4-byte header (modifier byte, u16-LE body
//! size, modifier byte) followed by pairs of u16-LE length-prefixed strings.
//! The u16 body size caps a whole envelope at 64 KiB, which is why the
//! per-request header list is bounded upstream.

use bytes::{BufMut, Bytes, BytesMut};

use crate::Error;

/// Builder for a request envelope.
///
/// # Example
///
/// ```
/// use gateway_server_codec::envelope::RequestEnvelope;
///
/// let mut envelope = RequestEnvelope::default();
/// envelope.push("REQUEST_METHOD", b"GET").unwrap();
/// envelope.push("REQUEST_URI", b"/").unwrap();
///
/// let bytes = envelope.finish().unwrap();
/// assert_eq!(&bytes[4..20], b"\x0e\x00REQUEST_METHOD".as_slice());
/// ```
#[derive(Default)]
pub struct RequestEnvelope {
    body: BytesMut,
}

impl RequestEnvelope {
    pub fn push(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        if key.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }

        self.body.put_u16_le(key.len() as u16);
        self.body.put_slice(key.as_bytes());
        self.body.put_u16_le(value.len() as u16);
        self.body.put_slice(value);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn finish(self) -> Result<Bytes, Error> {
        if self.body.len() > u16::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }

        let mut buf = BytesMut::with_capacity(4 + self.body.len());
        buf.put_u8(0);
        buf.put_u16_le(self.body.len() as u16);
        buf.put_u8(0);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }
}

/// Iterate the key/value pairs of a serialized envelope.
///
/// Dealer backends are the normal consumer of envelopes; this decoder exists
/// so tests and diagnostic tooling can read back what was sent.
pub fn pairs(envelope: &[u8]) -> Result<Vec<(String, Bytes)>, Error> {
    if envelope.len() < 4 {
        return Err(Error::InvalidInput);
    }

    let size = u16::from_le_bytes([envelope[1], envelope[2]]) as usize;
    if envelope.len() != size + 4 {
        return Err(Error::InvalidInput);
    }

    let body = &envelope[4..];
    let mut out = Vec::new();
    let mut offset = 0;

    while offset < body.len() {
        let mut take = |offset: &mut usize| -> Result<Bytes, Error> {
            if body.len() < *offset + 2 {
                return Err(Error::InvalidInput);
            }

            let len = u16::from_le_bytes([body[*offset], body[*offset + 1]]) as usize;
            if body.len() < *offset + 2 + len {
                return Err(Error::InvalidInput);
            }

            let value = Bytes::copy_from_slice(&body[*offset + 2..*offset + 2 + len]);
            *offset += 2 + len;
            Ok(value)
        };

        let key = take(&mut offset)?;
        let value = take(&mut offset)?;
        out.push((std::str::from_utf8(&key)?.to_string(), value));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_reads_back_in_order() {
        let mut envelope = RequestEnvelope::default();
        envelope.push("REQUEST_METHOD", b"POST").unwrap();
        envelope.push("CONTENT_LENGTH", b"11").unwrap();
        envelope.push("HTTP_HOST", b"a.example").unwrap();

        let bytes = envelope.finish().unwrap();
        let pairs = pairs(&bytes).unwrap();

        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].0, "REQUEST_METHOD");
        assert_eq!(pairs[0].1.as_ref(), b"POST");
        assert_eq!(pairs[2].0, "HTTP_HOST");
        assert_eq!(pairs[2].1.as_ref(), b"a.example");
    }

    #[test]
    fn oversized_values_are_refused() {
        let mut envelope = RequestEnvelope::default();
        let huge = vec![b'x'; u16::MAX as usize + 1];

        assert!(matches!(
            envelope.push("HTTP_COOKIE", &huge),
            Err(Error::PayloadTooLarge)
        ));
    }
}
