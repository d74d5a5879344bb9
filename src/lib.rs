//! A streaming MIME multipart reader and writer for XOP/MTOM messages.
//!
//! [`MultipartBody`] reads a `multipart/related` (or any other `multipart/*`) message lazily from a
//! blocking [`Read`](std::io::Read). Parts can be looked up by content ID at any time, even though
//! the underlying stream can only be read forward: parts that are skipped over on the way are
//! buffered into [`Blob`]s, or streamed without buffering when they are consumed in order.
//!
//! [`MultipartBodyWriter`] writes such messages, applying the requested content transfer encoding
//! to each part.
//!
//! # Examples
//!
//! ```
//! use std::io::Write;
//! use xop_multipart::{ContentTransferEncoding, ContentType, MediaType, MultipartBody, MultipartBodyWriter};
//!
//! # fn run() -> xop_multipart::Result<()> {
//! let mut writer = MultipartBodyWriter::new(Vec::new(), "MIMEBoundary")?;
//! let root_type = ContentType::new(MediaType::APPLICATION_XOP_XML, [("charset", "utf-8"), ("type", "text/xml")]);
//! let mut root = writer.write_part(Some(&root_type), ContentTransferEncoding::EightBit, Some("root@example.org"), &[])?;
//! root.write_all(br#"<doc><xop:Include href="cid:image@example.org"/></doc>"#).unwrap();
//! root.finish()?;
//! let image_type = ContentType::from(MediaType::APPLICATION_OCTET_STREAM);
//! let mut image = writer.write_part(Some(&image_type), ContentTransferEncoding::Base64, Some("image@example.org"), &[])?;
//! image.write_all(&[0xff, 0xd8, 0xff, 0xe0]).unwrap();
//! image.finish()?;
//! writer.complete()?;
//! let data = writer.into_inner();
//!
//! let content_type = "multipart/related; boundary=MIMEBoundary; start=\"<root@example.org>\"".parse()?;
//! let message = MultipartBody::new(&data[..], content_type)?;
//!
//! let image = message.part("cid:image@example.org")?.unwrap();
//! assert_eq!(&image.bytes()?[..], &[0xff, 0xd8, 0xff, 0xe0]);
//!
//! let root = message.root_part()?;
//! assert!(root.content_type()?.media_type().is_xml());
//! # Ok(())
//! # }
//! # run().unwrap();
//! ```
//!
//! # Optional Features
//!
//! * `json`: Adds [`Part::json`] to deserialize part content as JSON.
//! * `log`: Emits debug records through the [`log`](https://docs.rs/log) crate.
//! * `all`: Enables every feature except `log`.

pub use blob::{
    Blob, FileBlob, MemoryBlob, MemoryBlobFactory, OverflowBlobFactory, StreamCopyError, WritableBlob,
    WritableBlobFactory, WritableMemoryBlob, WritableOverflowBlob,
};
pub use constants::DEFAULT_OVERFLOW_THRESHOLD;
pub use content_type::{ContentType, ContentTypeBuilder, ParseError};
pub use encoding::ContentTransferEncoding;
pub use error::Error;
pub use header::Header;
pub use media_type::MediaType;
pub use multipart::{Builder as MultipartBodyBuilder, MultipartBody, Parts};
pub use part::{Part, PartBlob, PartBlobFactory, PartReader, PartStatus};
pub use writer::{MultipartBodyWriter, PartWriter};

mod blob;
mod buffer;
mod constants;
mod content_type;
mod encoding;
mod error;
mod header;
mod helpers;
mod media_type;
mod multipart;
mod part;
mod tokenizer;
mod writer;

/// A Result type often returned from methods that can have `xop-multipart` errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Parses the `Content-Type` header of a multipart message to extract the boundary value.
///
/// # Examples
///
/// ```
/// # fn run() {
/// let content_type = "multipart/related; type=\"application/xop+xml\"; boundary=ABCDEFG";
/// assert_eq!(xop_multipart::parse_boundary(content_type), Ok("ABCDEFG".to_owned()));
/// # }
/// # run();
/// ```
pub fn parse_boundary<T: AsRef<str>>(content_type: T) -> Result<String> {
    let content_type = content_type.as_ref().parse::<ContentType>()?;
    boundary_of(&content_type).map(str::to_owned)
}

pub(crate) fn boundary_of(content_type: &ContentType) -> Result<&str> {
    if !content_type.media_type().has_primary_type("multipart") {
        return Err(Error::NoMultipart);
    }

    content_type
        .parameter(constants::param::BOUNDARY)
        .ok_or(Error::NoBoundary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_boundary() {
        let content_type = "multipart/related; boundary=ABCDEFG";
        assert_eq!(parse_boundary(content_type), Ok("ABCDEFG".to_owned()));

        let content_type = "multipart/mixed; boundary=\"------ABC DEFG\"";
        assert_eq!(parse_boundary(content_type), Ok("------ABC DEFG".to_owned()));

        let content_type = "boundary=------ABCDEFG";
        assert!(parse_boundary(content_type).is_err());

        let content_type = "text/plain";
        assert_eq!(parse_boundary(content_type), Err(Error::NoMultipart));

        let content_type = "text/plain; boundary=------ABCDEFG";
        assert_eq!(parse_boundary(content_type), Err(Error::NoMultipart));

        let content_type = "multipart/related; type=\"text/xml\"";
        assert_eq!(parse_boundary(content_type), Err(Error::NoBoundary));
    }
}
