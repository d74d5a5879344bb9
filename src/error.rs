use std::fmt::{self, Debug, Display, Formatter};
use std::io;

use derive_more::Display;

use crate::content_type::ParseError;

/// A set of errors that can occur while reading or writing a multipart body.
#[derive(Display)]
#[non_exhaustive]
pub enum Error {
    /// The `Content-Type` value couldn't be parsed.
    #[display(fmt = "failed to parse Content-Type: {}", _0)]
    DecodeContentType(ParseError),

    /// The envelope `Content-Type` is not `multipart/*`.
    #[display(fmt = "Content-Type is not multipart/*")]
    NoMultipart,

    /// No boundary found in the envelope `Content-Type`.
    #[display(fmt = "multipart boundary not found in Content-Type")]
    NoBoundary,

    /// Couldn't read the part headers completely.
    #[display(fmt = "failed to read part complete headers")]
    IncompleteHeaders,

    /// Failed to read headers.
    #[display(fmt = "failed to read headers: {}", _0)]
    ReadHeaderFailed(httparse::Error),

    /// A boundary delimiter line is followed by unexpected data.
    #[display(fmt = "malformed boundary delimiter line")]
    MalformedBoundary,

    /// Multipart stream is incomplete.
    #[display(fmt = "incomplete multipart stream")]
    IncompleteStream,

    /// The part body couldn't be decoded with its content transfer encoding.
    #[display(fmt = "failed to decode part content: {}", _0)]
    DecodeBody(String),

    /// The tokenizer reached a state the reader didn't expect. This signals a broken internal
    /// invariant, not a caller error.
    #[display(fmt = "internal error: expected tokenizer to be in state {}, but got {}", expected, actual)]
    UnexpectedState { expected: &'static str, actual: &'static str },

    /// Two parts of the same message share a content ID.
    #[display(fmt = "two MIME parts with the same Content-ID not allowed: {}", _0)]
    DuplicateContentId(String),

    /// The content of the part has been streamed or discarded and can no longer be read.
    #[display(fmt = "the content of the MIME part has already been consumed")]
    ContentConsumed,

    /// The message cursor is already in use further up the call stack.
    #[display(fmt = "the multipart cursor is already borrowed")]
    CursorBusy,

    /// An earlier error left the message in an unknown position; nothing more can be read from it.
    #[display(fmt = "the multipart message can't be read after an earlier error: {}", _0)]
    MessageFailed(String),

    /// The start parameter names a content ID that no part carries.
    #[display(fmt = "mandatory root MIME part is missing")]
    MissingRootPart,

    /// Reading from the underlying stream failed.
    #[display(fmt = "stream read failed: {}", _0)]
    StreamReadFailed(io::Error),

    /// Copying part content to temporary storage failed.
    #[display(fmt = "failed to write the MIME part content to temporary storage: {}", _0)]
    BlobWriteFailed(io::Error),

    /// Reading buffered part content back from its blob failed.
    #[display(fmt = "failed to retrieve part content from blob: {}", _0)]
    BlobReadFailed(io::Error),

    /// Writing to the output sink failed.
    #[display(fmt = "failed to write multipart body: {}", _0)]
    WriteFailed(io::Error),

    /// A header or boundary handed to the writer isn't 7-bit clean.
    #[display(fmt = "illegal character '{}'", _0)]
    NonAsciiCharacter(char),

    /// Failed to decode the part content as `JSON` in [`part.json()`](crate::Part::json).
    #[cfg(feature = "json")]
    #[display(fmt = "failed to decode part data as JSON: {}", _0)]
    DecodeJson(serde_json::Error),
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::DecodeContentType(err) => Some(err),
            Error::ReadHeaderFailed(err) => Some(err),
            Error::StreamReadFailed(err)
            | Error::BlobWriteFailed(err)
            | Error::BlobReadFailed(err)
            | Error::WriteFailed(err) => Some(err),
            #[cfg(feature = "json")]
            Error::DecodeJson(err) => Some(err),
            _ => None,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string().eq(&other.to_string())
    }
}

impl Eq for Error {}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::DecodeContentType(err)
    }
}

impl Error {
    /// Converts this error into an [`io::Error`] so it can cross a [`Read`](std::io::Read) boundary
    /// and be recovered with [`Error::from_io`].
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::StreamReadFailed(err) => err,
            err => io::Error::new(io::ErrorKind::Other, err),
        }
    }

    /// Recovers a crate error smuggled through an [`io::Error`], or classifies a plain I/O error
    /// as a read failure on the underlying stream.
    pub(crate) fn from_io(err: io::Error) -> Error {
        if err.get_ref().map_or(false, |inner| inner.is::<Error>()) {
            let kind = err.kind();
            return match err.into_inner().map(|inner| inner.downcast::<Error>()) {
                Some(Ok(err)) => *err,
                _ => Error::StreamReadFailed(kind.into()),
            };
        }
        Error::StreamReadFailed(err)
    }
}
