use std::io::{self, Write};

use crate::blob::Blob;
use crate::constants::{self, header};
use crate::content_type::ContentType;
use crate::encoding::{ContentTransferEncoding, EncodingWriter};
use crate::header::Header;
use crate::helpers::{log_debug, log_error};

/// Writes a MIME multipart body part by part.
///
/// Header text and the boundary must be ASCII; anything else fails with
/// [`Error::NonAsciiCharacter`](crate::Error::NonAsciiCharacter).
///
/// # Examples
///
/// ```
/// use xop_multipart::{ContentTransferEncoding, MultipartBodyWriter};
/// use std::io::Write;
///
/// # fn run() -> xop_multipart::Result<()> {
/// let mut writer = MultipartBodyWriter::new(Vec::new(), "X-BOUNDARY")?;
/// let mut part = writer.write_part(None, ContentTransferEncoding::Binary, Some("a@example.org"), &[])?;
/// part.write_all(b"abcd").unwrap();
/// part.finish()?;
/// writer.complete()?;
///
/// assert_eq!(
///     writer.into_inner(),
///     b"--X-BOUNDARY\r\nContent-Transfer-Encoding: binary\r\nContent-ID: <a@example.org>\r\n\r\nabcd\r\n--X-BOUNDARY--\r\n"
/// );
/// # Ok(())
/// # }
/// # run().unwrap();
/// ```
pub struct MultipartBodyWriter<W: Write> {
    out: W,
    boundary: String,
    buffer: Vec<u8>,
}

impl<W: Write> MultipartBodyWriter<W> {
    pub fn new<B: Into<String>>(out: W, boundary: B) -> crate::Result<MultipartBodyWriter<W>> {
        let boundary = boundary.into();
        check_ascii(&boundary)?;
        Ok(MultipartBodyWriter {
            out,
            boundary,
            buffer: Vec::with_capacity(constants::ASCII_BUFFER_SIZE),
        })
    }

    /// Buffers text already known to be ASCII, flushing whenever the buffer fills up.
    fn write_ascii(&mut self, s: &str) -> crate::Result<()> {
        for &b in s.as_bytes() {
            if self.buffer.len() == constants::ASCII_BUFFER_SIZE {
                self.flush_buffer()?;
            }
            self.buffer.push(b);
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> crate::Result<()> {
        if !self.buffer.is_empty() {
            self.out.write_all(&self.buffer).map_err(crate::Error::WriteFailed)?;
            self.buffer.clear();
        }
        Ok(())
    }

    fn write_delimiter(&mut self) -> crate::Result<()> {
        let boundary = self.boundary.clone();
        self.write_ascii(constants::BOUNDARY_EXT)?;
        self.write_ascii(&boundary)
    }

    fn write_header(&mut self, name: &str, value: &str) -> crate::Result<()> {
        self.write_ascii(constants::CRLF)?;
        self.write_ascii(name)?;
        self.write_ascii(": ")?;
        self.write_ascii(value)
    }

    /// Starts a new part and returns a writer for its content.
    ///
    /// The content is encoded with `encoding` as it is written. The part has to be completed with
    /// [`PartWriter::finish`] before the next one is started; dropping the writer finishes it too,
    /// but errors are only logged then.
    pub fn write_part(
        &mut self,
        content_type: Option<&ContentType>,
        encoding: ContentTransferEncoding,
        content_id: Option<&str>,
        extra_headers: &[Header],
    ) -> crate::Result<PartWriter<'_, W>> {
        // Nothing is written unless every header is valid.
        let content_type = content_type.map(ContentType::to_string);
        let content_id = content_id.map(|content_id| format!("<{}>", content_id));
        for text in content_type.iter().chain(content_id.iter()) {
            check_ascii(text)?;
        }
        for extra in extra_headers {
            check_ascii(extra.name())?;
            check_ascii(extra.value())?;
        }

        self.write_delimiter()?;
        if let Some(content_type) = &content_type {
            self.write_header(header::CONTENT_TYPE, content_type)?;
        }
        self.write_header(header::CONTENT_TRANSFER_ENCODING, encoding.as_str())?;
        if let Some(content_id) = &content_id {
            self.write_header(header::CONTENT_ID, content_id)?;
        }
        for extra in extra_headers {
            self.write_header(extra.name(), extra.value())?;
        }
        self.write_ascii(constants::CRLF_CRLF)?;
        self.flush_buffer()?;

        log_debug!("started part {:?} with encoding {}", content_id, encoding);

        Ok(PartWriter {
            encoder: Some(EncodingWriter::new(encoding, &mut self.out)),
        })
    }

    /// Writes a complete part with the content of `blob`.
    pub fn write_blob_part(
        &mut self,
        blob: &dyn Blob,
        content_type: Option<&ContentType>,
        encoding: ContentTransferEncoding,
        content_id: Option<&str>,
        extra_headers: &[Header],
    ) -> crate::Result<()> {
        let mut part = self.write_part(content_type, encoding, content_id, extra_headers)?;
        blob.write_to(&mut part).map_err(crate::Error::WriteFailed)?;
        part.finish()
    }

    /// Writes the close delimiter. The underlying sink is flushed but not closed.
    pub fn complete(&mut self) -> crate::Result<()> {
        self.write_delimiter()?;
        self.write_ascii(constants::BOUNDARY_EXT)?;
        self.write_ascii(constants::CRLF)?;
        self.flush_buffer()?;
        self.out.flush().map_err(crate::Error::WriteFailed)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn check_ascii(s: &str) -> crate::Result<()> {
    match s.chars().find(|c| !c.is_ascii()) {
        Some(c) => Err(crate::Error::NonAsciiCharacter(c)),
        None => Ok(()),
    }
}

/// Writer for the content of one part, returned by [`MultipartBodyWriter::write_part`].
pub struct PartWriter<'a, W: Write> {
    encoder: Option<EncodingWriter<&'a mut W>>,
}

impl<W: Write> PartWriter<'_, W> {
    /// Flushes the encoder and terminates the part.
    pub fn finish(mut self) -> crate::Result<()> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> crate::Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let out = encoder.finish().map_err(crate::Error::WriteFailed)?;
            out.write_all(constants::CRLF.as_bytes()).map_err(crate::Error::WriteFailed)?;
        }
        Ok(())
    }
}

impl<W: Write> Write for PartWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.encoder.as_mut() {
            Some(encoder) => encoder.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "part already finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.encoder.as_mut() {
            Some(encoder) => encoder.flush(),
            None => Ok(()),
        }
    }
}

impl<W: Write> Drop for PartWriter<'_, W> {
    fn drop(&mut self) {
        if let Err(err) = self.finish_inner() {
            log_error!("failed to finish part: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlob;
    use crate::media_type::MediaType;

    #[test]
    fn test_write_part_headers() {
        let mut writer = MultipartBodyWriter::new(Vec::new(), "B").unwrap();
        let content_type = ContentType::new(MediaType::APPLICATION_XOP_XML, [("type", "text/xml")]);
        let mut part = writer
            .write_part(
                Some(&content_type),
                ContentTransferEncoding::EightBit,
                Some("root"),
                &[Header::new("X-Extra", "1")],
            )
            .unwrap();
        part.write_all(b"<doc/>").unwrap();
        part.finish().unwrap();
        writer.complete().unwrap();

        assert_eq!(
            String::from_utf8(writer.into_inner()).unwrap(),
            "--B\r\nContent-Type: application/xop+xml; type=\"text/xml\"\r\n\
             Content-Transfer-Encoding: 8bit\r\nContent-ID: <root>\r\nX-Extra: 1\r\n\r\n\
             <doc/>\r\n--B--\r\n"
        );
    }

    #[test]
    fn test_base64_part() {
        let mut writer = MultipartBodyWriter::new(Vec::new(), "B").unwrap();
        let blob = MemoryBlob::new(&b"Hello, world"[..]);
        writer
            .write_blob_part(&blob, None, ContentTransferEncoding::Base64, None, &[])
            .unwrap();

        assert_eq!(
            String::from_utf8(writer.into_inner()).unwrap(),
            "--B\r\nContent-Transfer-Encoding: base64\r\n\r\nSGVsbG8sIHdvcmxk\r\n"
        );
    }

    #[test]
    fn test_dropped_part_is_finished() {
        let mut writer = MultipartBodyWriter::new(Vec::new(), "B").unwrap();
        {
            let mut part = writer
                .write_part(None, ContentTransferEncoding::Base64, None, &[])
                .unwrap();
            part.write_all(b"ab").unwrap();
        }
        writer.complete().unwrap();
        assert!(String::from_utf8(writer.into_inner()).unwrap().ends_with("\r\n\r\nYWI=\r\n--B--\r\n"));
    }

    #[test]
    fn test_rejects_non_ascii() {
        assert_eq!(
            MultipartBodyWriter::new(Vec::new(), "bøundary").err(),
            Some(crate::Error::NonAsciiCharacter('ø'))
        );

        let mut writer = MultipartBodyWriter::new(Vec::new(), "B").unwrap();
        let res = writer.write_part(None, ContentTransferEncoding::Binary, Some("é@example.org"), &[]);
        assert_eq!(res.err(), Some(crate::Error::NonAsciiCharacter('é')));
    }

    #[test]
    fn test_rejected_part_writes_nothing() {
        let mut writer = MultipartBodyWriter::new(Vec::new(), "B").unwrap();
        let res = writer.write_part(
            None,
            ContentTransferEncoding::Binary,
            Some("a@example.org"),
            &[Header::new("X-Naïve", "1")],
        );
        assert_eq!(res.err(), Some(crate::Error::NonAsciiCharacter('ï')));

        let res = writer.write_part(None, ContentTransferEncoding::Binary, None, &[Header::new("X-Note", "café")]);
        assert_eq!(res.err(), Some(crate::Error::NonAsciiCharacter('é')));

        writer.complete().unwrap();
        assert_eq!(writer.into_inner(), b"--B--\r\n");
    }

    #[test]
    fn test_long_headers_go_through_the_buffer() {
        let mut writer = MultipartBodyWriter::new(Vec::new(), "B").unwrap();
        let value = "x".repeat(constants::ASCII_BUFFER_SIZE * 3 + 7);
        writer
            .write_part(None, ContentTransferEncoding::Binary, None, &[Header::new("X-Long", value.as_str())])
            .unwrap()
            .finish()
            .unwrap();
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert!(out.contains(&format!("X-Long: {}\r\n\r\n", value)));
    }
}
