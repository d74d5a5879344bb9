//! Content transfer encodings: identity and base64 on the writing side, plus quoted-printable
//! decoding on the reading side.

use std::fmt::{self, Display, Formatter};
use std::io::{self, Write};

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::write::EncoderWriter;
use base64::Engine;
use bytes::{Buf, BytesMut};

use crate::constants::header;
use crate::header::Header;

/// Accepts base64 with or without trailing padding, as found in the wild.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The `Content-Transfer-Encoding` the writer applies to a part body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentTransferEncoding {
    /// `7bit`: written verbatim.
    SevenBit,
    /// `8bit`: written verbatim.
    EightBit,
    /// `binary`: written verbatim.
    Binary,
    /// `base64`
    Base64,
}

impl ContentTransferEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentTransferEncoding::SevenBit => "7bit",
            ContentTransferEncoding::EightBit => "8bit",
            ContentTransferEncoding::Binary => "binary",
            ContentTransferEncoding::Base64 => "base64",
        }
    }

    /// Looks up an encoding by its header value, ignoring case and surrounding whitespace.
    pub fn from_header_value(value: &str) -> Option<ContentTransferEncoding> {
        let value = value.trim();
        [
            ContentTransferEncoding::SevenBit,
            ContentTransferEncoding::EightBit,
            ContentTransferEncoding::Binary,
            ContentTransferEncoding::Base64,
        ]
        .into_iter()
        .find(|encoding| encoding.as_str().eq_ignore_ascii_case(value))
    }
}

impl Display for ContentTransferEncoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wraps an output sink so that bytes written to it are transfer encoded.
pub(crate) enum EncodingWriter<W: Write> {
    Identity(W),
    Base64(EncoderWriter<'static, GeneralPurpose, W>),
}

impl<W: Write> EncodingWriter<W> {
    pub(crate) fn new(encoding: ContentTransferEncoding, inner: W) -> EncodingWriter<W> {
        match encoding {
            ContentTransferEncoding::Base64 => EncodingWriter::Base64(EncoderWriter::new(inner, &STANDARD)),
            _ => EncodingWriter::Identity(inner),
        }
    }

    /// Flushes any pending encoder state and hands back the wrapped sink.
    pub(crate) fn finish(self) -> io::Result<W> {
        match self {
            EncodingWriter::Identity(inner) => Ok(inner),
            EncodingWriter::Base64(mut encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for EncodingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EncodingWriter::Identity(inner) => inner.write(buf),
            EncodingWriter::Base64(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            EncodingWriter::Identity(inner) => inner.flush(),
            EncodingWriter::Base64(encoder) => encoder.flush(),
        }
    }
}

/// Incremental decoder for a part body, fed with raw chunks as the tokenizer finds them.
#[derive(Debug)]
pub(crate) enum BodyDecoder {
    Identity,
    Base64 { pending: BytesMut },
    QuotedPrintable { pending: BytesMut },
}

impl BodyDecoder {
    pub(crate) fn for_headers(headers: &[Header]) -> BodyDecoder {
        let encoding = crate::header::find(headers, header::CONTENT_TRANSFER_ENCODING).map(str::trim);
        match encoding {
            Some(value) if value.eq_ignore_ascii_case("base64") => BodyDecoder::Base64 {
                pending: BytesMut::new(),
            },
            Some(value) if value.eq_ignore_ascii_case("quoted-printable") => BodyDecoder::QuotedPrintable {
                pending: BytesMut::new(),
            },
            _ => BodyDecoder::Identity,
        }
    }

    /// Decodes `raw` into `out`. Input that can't be decoded yet is held back until more arrives
    /// or `last` is set.
    pub(crate) fn decode(&mut self, raw: &[u8], last: bool, out: &mut BytesMut) -> crate::Result<()> {
        match self {
            BodyDecoder::Identity => {
                out.extend_from_slice(raw);
            }
            BodyDecoder::Base64 { pending } => {
                pending.extend(raw.iter().copied().filter(|b| !b.is_ascii_whitespace()));
                let len = if last { pending.len() } else { pending.len() / 4 * 4 };
                if len > 0 {
                    let mut decoded = Vec::with_capacity(len / 4 * 3);
                    LENIENT_BASE64
                        .decode_vec(&pending[..len], &mut decoded)
                        .map_err(|err| crate::Error::DecodeBody(err.to_string()))?;
                    out.extend_from_slice(&decoded);
                    pending.advance(len);
                }
            }
            BodyDecoder::QuotedPrintable { pending } => {
                pending.extend_from_slice(raw);
                let consumed = decode_quoted_printable(pending, last, out);
                pending.advance(consumed);
            }
        }
        Ok(())
    }
}

/// Decodes as much of `input` as possible and returns the number of bytes consumed. Unless `last`
/// is set, an escape sequence cut off at the end of the input is left unconsumed.
fn decode_quoted_printable(input: &[u8], last: bool, out: &mut BytesMut) -> usize {
    let len = input.len();
    let mut i = 0;
    while i < len {
        let b = input[i];
        if b != b'=' {
            out.extend_from_slice(&[b]);
            i += 1;
            continue;
        }
        if i + 2 >= len && !last {
            break;
        }
        match (input.get(i + 1), input.get(i + 2)) {
            // Soft line breaks.
            (Some(b'\n'), _) => i += 2,
            (Some(b'\r'), Some(b'\n')) => i += 3,
            (Some(&hi), Some(&lo)) => match (hex_value(hi), hex_value(lo)) {
                (Some(hi), Some(lo)) => {
                    out.extend_from_slice(&[hi << 4 | lo]);
                    i += 3;
                }
                _ => {
                    out.extend_from_slice(b"=");
                    i += 1;
                }
            },
            (Some(b'\r'), None) => i += 2,
            _ => {
                out.extend_from_slice(b"=");
                i += 1;
            }
        }
    }
    i
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_in_chunks(mut decoder: BodyDecoder, raw: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut out = BytesMut::new();
        let chunks: Vec<&[u8]> = raw.chunks(chunk_size).collect();
        for (idx, chunk) in chunks.iter().enumerate() {
            decoder.decode(chunk, idx == chunks.len() - 1, &mut out).unwrap();
        }
        out.to_vec()
    }

    #[test]
    fn test_from_header_value() {
        assert_eq!(
            ContentTransferEncoding::from_header_value(" BASE64 "),
            Some(ContentTransferEncoding::Base64)
        );
        assert_eq!(
            ContentTransferEncoding::from_header_value("8bit"),
            Some(ContentTransferEncoding::EightBit)
        );
        assert_eq!(ContentTransferEncoding::from_header_value("x-unknown"), None);
    }

    #[test]
    fn test_base64_writer() {
        let mut out = Vec::new();
        let mut writer = EncodingWriter::new(ContentTransferEncoding::Base64, &mut out);
        writer.write_all(b"Hello, ").unwrap();
        writer.write_all(b"world").unwrap();
        writer.finish().unwrap();
        assert_eq!(out, b"SGVsbG8sIHdvcmxk");
    }

    #[test]
    fn test_base64_decoder_handles_split_input() {
        let raw = b"SGVs\r\nbG8s IHdv\r\ncmxkIQ==";
        for chunk_size in 1..raw.len() {
            let decoder = BodyDecoder::Base64 { pending: BytesMut::new() };
            assert_eq!(decode_in_chunks(decoder, raw, chunk_size), b"Hello, world!");
        }
    }

    #[test]
    fn test_base64_decoder_rejects_garbage() {
        let mut decoder = BodyDecoder::Base64 { pending: BytesMut::new() };
        let mut out = BytesMut::new();
        assert!(decoder.decode(b"SGV*bG8=", true, &mut out).is_err());
    }

    #[test]
    fn test_quoted_printable_decoder() {
        let raw = b"caf=C3=A9 soft=\r\nbreak and =3D sign=";
        for chunk_size in 1..raw.len() {
            let decoder = BodyDecoder::QuotedPrintable { pending: BytesMut::new() };
            assert_eq!(
                decode_in_chunks(decoder, raw, chunk_size),
                "café softbreak and = sign=".as_bytes()
            );
        }
    }

    #[test]
    fn test_decoder_selection() {
        let headers = vec![Header::new("content-transfer-encoding", "Base64")];
        assert!(matches!(BodyDecoder::for_headers(&headers), BodyDecoder::Base64 { .. }));
        assert!(matches!(BodyDecoder::for_headers(&[]), BodyDecoder::Identity));
    }
}
