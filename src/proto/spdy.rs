//! SPDY/2 response framing.
//!
//! Only the dealer-to-client direction is framed here: a `SYN_REPLY`
//! carrying the compressed name/value block, data frames for the body, and
//! an empty `FLAG_FIN` data frame for the end of a stream. The name/value
//! block is zlib-compressed against the protocol dictionary, with one
//! compression context per connection shared by all of its streams.

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{Compress, Compression, FlushCompress};

const FLAG_FIN: u8 = 0x01;

/// The protocol's shared zlib dictionary for header blocks.
#[rustfmt::skip]
static DICTIONARY: &[u8] = b"optionsgetheadpostputdeletetraceacceptaccept-charsetaccept-encodingaccept-languageauthorizationexpectfromhostif-modified-sinceif-matchif-none-matchif-rangeif-unmodifiedsincemax-forwardsproxy-authorizationrangerefererteuser-agent100101200201202203204205206300301302303304305306307400401402403404405406407408409410411412413414415416417500501502503504505accept-rangesageetaglocationproxy-authenticatepublicretry-afterservervarywarningwww-authenticateallowcontent-basecontent-encodingcache-controlconnectiondatetrailertransfer-encodingupgradeviawarningcontent-languagecontent-lengthcontent-locationcontent-md5content-rangecontent-typeetagexpireslast-modifiedset-cookieMondayTuesdayWednesdayThursdayFridaySaturdaySundayJanFebMarAprMayJunJulAugSepOctNovDecchunkedtext/htmlimage/pngimage/jpgimage/gifapplication/xmlapplication/xhtmltext/plainpublicmax-agecharset=iso-8859-1utf-8gzipdeflateHTTP/1.1statusversionurl\0";

/// Per-connection compression state for outbound header blocks.
pub struct Context {
    compress: Compress,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        let mut compress = Compress::new(Compression::default(), true);
        compress
            .set_dictionary(DICTIONARY)
            .expect("dictionary within zlib limits");
        Self { compress }
    }

    fn deflate(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() + 64);
        let mut consumed = 0;

        loop {
            if out.capacity() == out.len() {
                out.reserve(256);
            }

            let before = self.compress.total_in() as usize;
            let _ = self
                .compress
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync);
            consumed += self.compress.total_in() as usize - before;

            // a sync flush is complete once all input is taken and the
            // encoder stopped filling the buffer
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }

        out
    }
}

/// Control frame: `SYN_REPLY` with the compressed name/value block.
pub fn syn_reply(context: &mut Context, stream: u32, pairs: &[(String, String)]) -> Bytes {
    let mut block = BytesMut::new();
    block.put_u16(pairs.len() as u16);

    for (name, value) in pairs {
        block.put_u16(name.len() as u16);
        block.put_slice(name.as_bytes());
        block.put_u16(value.len() as u16);
        block.put_slice(value.as_bytes());
    }

    let compressed = context.deflate(&block);

    let mut frame = BytesMut::with_capacity(14 + compressed.len());
    frame.put_u16(0x8002);
    frame.put_u16(0x0002);
    frame.put_u8(0);
    frame.put_uint(6 + compressed.len() as u64, 3);
    frame.put_u32(stream & 0x7fff_ffff);
    frame.put_u16(0);
    frame.put_slice(&compressed);
    frame.freeze()
}

/// Data frame; `fin` closes the stream.
pub fn data(stream: u32, payload: &[u8], fin: bool) -> Bytes {
    let mut frame = BytesMut::with_capacity(8 + payload.len());
    frame.put_u32(stream & 0x7fff_ffff);
    frame.put_u8(if fin { FLAG_FIN } else { 0 });
    frame.put_uint(payload.len() as u64, 3);
    frame.put_slice(payload);
    frame.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_layout() {
        let frame = data(3, b"abc", true);

        assert_eq!(&frame[..4], &[0, 0, 0, 3]);
        assert_eq!(frame[4], FLAG_FIN);
        assert_eq!(&frame[5..8], &[0, 0, 3]);
        assert_eq!(&frame[8..], b"abc");
    }

    #[test]
    fn syn_reply_is_a_control_frame() {
        let mut context = Context::new();
        let frame = syn_reply(
            &mut context,
            1,
            &[("status".to_string(), "200 OK".to_string())],
        );

        // control bit + version, then the SYN_REPLY type
        assert_eq!(&frame[..4], &[0x80, 0x02, 0x00, 0x02]);

        let length = u32::from_be_bytes([0, frame[5], frame[6], frame[7]]) as usize;
        assert_eq!(frame.len(), 8 + length);

        // stream id and a non-empty compressed block
        assert_eq!(&frame[8..12], &[0, 0, 0, 1]);
        assert!(frame.len() > 14);
    }

    #[test]
    fn streams_share_one_context() {
        // the second reply compresses against state left by the first; it
        // must still produce a well-formed frame
        let mut context = Context::new();
        let pairs = vec![("status".to_string(), "200 OK".to_string())];

        let first = syn_reply(&mut context, 1, &pairs);
        let second = syn_reply(&mut context, 3, &pairs);

        assert_eq!(&second[..4], &[0x80, 0x02, 0x00, 0x02]);
        assert!(!first.is_empty() && !second.is_empty());
    }
}
