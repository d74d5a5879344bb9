use std::cell::{OnceCell, RefCell};
use std::fmt::{self, Debug, Formatter};
use std::io::{self, Read, Write};
use std::rc::{Rc, Weak};

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
#[cfg(feature = "json")]
use serde::de::DeserializeOwned;

use crate::blob::{Blob, StreamCopyError, WritableBlobFactory};
use crate::constants::{header, param};
use crate::content_type::ContentType;
use crate::header::Header;
use crate::helpers::{log_debug, log_error};
use crate::media_type::MediaType;
use crate::multipart::{MessageCursor, Shared};
use crate::tokenizer::{EntityState, MimeTokenizer};

/// What a part knows about itself once its headers have been read. Never changes afterwards.
pub(crate) struct PartHead {
    pub(crate) index: usize,
    pub(crate) headers: Vec<Header>,
    pub(crate) content_id: Option<String>,
    pub(crate) content_type: OnceCell<ContentType>,
    pub(crate) is_root: bool,
}

pub(crate) struct PartSlot {
    pub(crate) head: Rc<PartHead>,
    pub(crate) state: PartState,
    pub(crate) blob_factory: Rc<dyn WritableBlobFactory>,
    /// The view handed out by [`Part::part_blob`]. Weak, since the view holds the part.
    pub(crate) part_blob: Option<Weak<dyn Blob>>,
}

pub(crate) enum PartState {
    /// The tokenizer sits at the start of this part's body.
    Unread,
    /// The body has been copied into a blob.
    Buffered(Rc<dyn Blob>),
    /// A [`PartReader`] consumes the body directly from the tokenizer.
    Streaming(Rc<RefCell<StreamSource>>),
    /// The body has been consumed or released.
    Discarded,
    /// Reading the body failed; holds the error message.
    Failed(String),
}

/// Where a [`PartReader`] takes its bytes from.
pub(crate) enum StreamSource {
    /// Straight from the tokenizer.
    Live,
    /// From buffered content, either because the reader was opened on a blob or because the
    /// message had to move past the part while it was being streamed.
    Detached(Box<dyn Read>),
    Closed,
}

/// The observable state of a [`Part`]'s content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    /// The content hasn't been touched yet.
    Unread,
    /// The content has been buffered and can be read any number of times.
    Buffered,
    /// The content is being consumed through a [`PartReader`].
    Streaming,
    /// The content has been consumed or released and can no longer be read.
    Discarded,
    /// Reading the content failed. Nothing more can be read from the message.
    Failed,
}

impl PartState {
    fn status(&self) -> PartStatus {
        match self {
            PartState::Unread => PartStatus::Unread,
            PartState::Buffered(_) => PartStatus::Buffered,
            PartState::Streaming(_) => PartStatus::Streaming,
            PartState::Discarded => PartStatus::Discarded,
            PartState::Failed(_) => PartStatus::Failed,
        }
    }
}

/// Adapts the tokenizer's decoded body to [`Read`] so it can be copied into a blob.
struct BodyReader<'a, R> {
    tokenizer: &'a mut MimeTokenizer<R>,
}

impl<R: Read> Read for BodyReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.tokenizer.read_body(buf).map_err(crate::Error::into_io)
    }
}

impl<R: Read> MessageCursor<R> {
    pub(crate) fn status(&self, index: usize) -> PartStatus {
        self.parts[index].state.status()
    }

    /// Makes sure the content of the part no longer depends on the tokenizer, so the message can
    /// move on to the next part.
    pub(crate) fn fetch(&mut self, index: usize) -> crate::Result<()> {
        match &self.parts[index].state {
            PartState::Unread | PartState::Streaming(_) => self.guarded(Some(index), |cursor| cursor.fetch_body(index)),
            PartState::Buffered(_) | PartState::Discarded => Ok(()),
            PartState::Failed(reason) => Err(crate::Error::MessageFailed(reason.clone())),
        }
    }

    fn fetch_body(&mut self, index: usize) -> crate::Result<()> {
        match &self.parts[index].state {
            PartState::Streaming(source) => {
                let source = Rc::clone(source);
                // The reader may still be open; keep whatever it hasn't consumed yet.
                let blob = self.buffer_body(index)?;
                self.move_to_next_part()?;
                let input = blob.input_stream().map_err(crate::Error::BlobReadFailed)?;
                *source.borrow_mut() = StreamSource::Detached(input);
                self.parts[index].state = PartState::Discarded;
            }
            _ => {
                self.tokenizer.state().check(EntityState::Body)?;
                let blob = self.buffer_body(index)?;
                self.move_to_next_part()?;
                self.parts[index].state = PartState::Buffered(blob);
            }
        }
        Ok(())
    }

    pub(crate) fn discard(&mut self, index: usize) -> crate::Result<()> {
        match &self.parts[index].state {
            PartState::Unread | PartState::Streaming(_) => self.guarded(Some(index), |cursor| cursor.skip_body(index)),
            PartState::Buffered(_) => {
                self.parts[index].state = PartState::Discarded;
                Ok(())
            }
            PartState::Discarded | PartState::Failed(_) => Ok(()),
        }
    }

    fn skip_body(&mut self, index: usize) -> crate::Result<()> {
        match &self.parts[index].state {
            PartState::Streaming(source) => {
                let source = Rc::clone(source);
                self.tokenizer.skip_part()?;
                *source.borrow_mut() = StreamSource::Closed;
            }
            _ => {
                self.tokenizer.state().check(EntityState::Body)?;
                self.tokenizer.skip_part()?;
            }
        }
        self.parts[index].state = PartState::Discarded;
        Ok(())
    }

    /// Returns the buffered content, fetching it first if the part is still unread.
    pub(crate) fn content(&mut self, index: usize) -> crate::Result<Rc<dyn Blob>> {
        if let PartState::Unread = self.parts[index].state {
            self.fetch(index)?;
        }
        match &self.parts[index].state {
            PartState::Buffered(blob) => Ok(Rc::clone(blob)),
            PartState::Failed(reason) => Err(crate::Error::MessageFailed(reason.clone())),
            _ => Err(crate::Error::ContentConsumed),
        }
    }

    pub(crate) fn open_stream(&mut self, index: usize, preserve: bool) -> crate::Result<Rc<RefCell<StreamSource>>> {
        if !preserve {
            if let PartState::Unread = self.parts[index].state {
                return self.guarded(Some(index), |cursor| {
                    cursor.tokenizer.state().check(EntityState::Body)?;
                    let source = Rc::new(RefCell::new(StreamSource::Live));
                    cursor.parts[index].state = PartState::Streaming(Rc::clone(&source));
                    Ok(source)
                });
            }
        }

        let blob = self.content(index)?;
        let input = blob.input_stream().map_err(crate::Error::BlobReadFailed)?;
        if !preserve {
            self.parts[index].state = PartState::Discarded;
        }
        Ok(Rc::new(RefCell::new(StreamSource::Detached(input))))
    }

    /// Reads the next chunk of a part streamed straight from the tokenizer. Moves to the next part
    /// once the whole body has been read.
    fn read_stream(&mut self, index: usize, buf: &mut [u8]) -> crate::Result<usize> {
        self.guarded(Some(index), |cursor| {
            let n = cursor.tokenizer.read_body(buf)?;
            if n == 0 && !buf.is_empty() {
                cursor.move_to_next_part()?;
                cursor.parts[index].state = PartState::Discarded;
            }
            Ok(n)
        })
    }

    /// Called when a live reader is closed before the end of the body.
    fn close_stream(&mut self, index: usize) -> crate::Result<()> {
        match self.parts[index].state {
            PartState::Streaming(_) => self.guarded(Some(index), |cursor| {
                cursor.tokenizer.skip_part()?;
                cursor.parts[index].state = PartState::Discarded;
                Ok(())
            }),
            _ => Ok(()),
        }
    }

    fn buffer_body(&mut self, index: usize) -> crate::Result<Rc<dyn Blob>> {
        let mut blob = self.parts[index].blob_factory.create_blob();
        log_debug!("using blob of type {} for part {}", blob.kind(), index);

        let mut body = BodyReader {
            tokenizer: &mut self.tokenizer,
        };
        let size = blob.read_from(&mut body).map_err(|err| match err {
            StreamCopyError::Read(err) => crate::Error::from_io(err),
            StreamCopyError::Write(err) => crate::Error::BlobWriteFailed(err),
        })?;
        log_debug!("buffered {} bytes of part {}", size, index);

        blob.into_blob().map_err(crate::Error::BlobWriteFailed)
    }

    fn move_to_next_part(&mut self) -> crate::Result<()> {
        self.tokenizer.next()?.check(EntityState::EndBodyPart)?;
        match self.tokenizer.next()? {
            EntityState::Epilogue => while self.tokenizer.next()? != EntityState::EndMultipart {},
            EntityState::StartBodyPart | EntityState::EndMultipart => {}
            state => {
                return Err(crate::Error::UnexpectedState {
                    expected: EntityState::StartBodyPart.name(),
                    actual: state.name(),
                })
            }
        }
        Ok(())
    }
}

/// A single body part of a [`MultipartBody`](crate::MultipartBody).
///
/// Headers, the content ID and the content type are always available. The content is read lazily
/// and at most once from the underlying stream: it can either be buffered (see [`fetch`],
/// [`blob`], [`bytes`]) or streamed without buffering through [`input_stream(false)`].
///
/// A `Part` is a cheap handle; clones refer to the same part. Any access to a later part of the
/// same message forces this part's content to be buffered first, unless it has been discarded.
///
/// [`fetch`]: Part::fetch
/// [`blob`]: Part::blob
/// [`bytes`]: Part::bytes
/// [`input_stream(false)`]: Part::input_stream
pub struct Part<R> {
    shared: Rc<Shared<R>>,
    head: Rc<PartHead>,
}

impl<R> Clone for Part<R> {
    fn clone(&self) -> Self {
        Part {
            shared: Rc::clone(&self.shared),
            head: Rc::clone(&self.head),
        }
    }
}

impl<R> Debug for Part<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("index", &self.head.index)
            .field("content_id", &self.head.content_id)
            .field("headers", &self.head.headers)
            .finish()
    }
}

impl<R: Read> Part<R> {
    pub(crate) fn new(shared: Rc<Shared<R>>, head: Rc<PartHead>) -> Self {
        Part { shared, head }
    }

    /// The position of the part in the message, starting at zero.
    pub fn index(&self) -> usize {
        self.head.index
    }

    pub fn headers(&self) -> &[Header] {
        &self.head.headers
    }

    /// Returns the value of the first header with the given name, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        let value = crate::header::find(&self.head.headers, name);
        log_debug!("header name=({}) value=({:?})", name, value);
        value
    }

    /// The normalized content ID, without angle brackets.
    pub fn content_id(&self) -> Option<&str> {
        self.head.content_id.as_deref()
    }

    /// Whether this is the root part of the message.
    pub fn is_root(&self) -> bool {
        self.head.is_root
    }

    /// The parsed `Content-Type` header. A part without one gets the RFC 2046 default of
    /// `text/plain; charset="us-ascii"`.
    pub fn content_type(&self) -> crate::Result<&ContentType> {
        if let Some(content_type) = self.head.content_type.get() {
            return Ok(content_type);
        }
        let content_type = match self.header(header::CONTENT_TYPE) {
            Some(value) => value.parse::<ContentType>()?,
            None => ContentType::new(MediaType::TEXT_PLAIN, [(param::CHARSET, "us-ascii")]),
        };
        Ok(self.head.content_type.get_or_init(|| content_type))
    }

    pub fn status(&self) -> crate::Result<PartStatus> {
        Ok(self.shared.cursor()?.status(self.head.index))
    }

    /// Buffers the content, so the message can move past this part without losing it. Does nothing
    /// if the content is already buffered or discarded.
    ///
    /// If reading the content fails, the part and the rest of the message become unreadable: every
    /// later access fails with [`Error::MessageFailed`](crate::Error::MessageFailed).
    ///
    /// If the part is being streamed, the bytes the reader hasn't consumed yet are buffered and
    /// handed over to it; the part itself can no longer be read afterwards.
    pub fn fetch(&self) -> crate::Result<()> {
        self.shared.cursor()?.fetch(self.head.index)
    }

    /// Releases the content. An unread part is skipped without being buffered.
    pub fn discard(&self) -> crate::Result<()> {
        self.shared.cursor()?.discard(self.head.index)
    }

    /// Returns the buffered content, buffering it first if necessary.
    ///
    /// Fails with [`Error::ContentConsumed`](crate::Error::ContentConsumed) if the content has been
    /// streamed or discarded.
    pub fn blob(&self) -> crate::Result<Rc<dyn Blob>> {
        self.shared.cursor()?.content(self.head.index)
    }

    /// Opens a reader over the content.
    ///
    /// With `preserve` set, the content is buffered first and stays available afterwards. Without
    /// it, an unread part is streamed straight from the underlying stream, and a buffered part is
    /// released; either way the content can't be read again.
    pub fn input_stream(&self, preserve: bool) -> crate::Result<PartReader<R>> {
        let source = self.shared.cursor()?.open_stream(self.head.index, preserve)?;
        Ok(PartReader {
            shared: Rc::clone(&self.shared),
            index: self.head.index,
            source,
            bytes_read: 0,
        })
    }

    /// Returns a blob view of the part, created by the configured
    /// [`PartBlobFactory`](crate::PartBlobFactory) the first time it is asked for. The same view is
    /// returned as long as it is alive.
    ///
    /// The default view doesn't touch the content until it is read, and then buffers it like
    /// [`blob`](Part::blob).
    pub fn part_blob(&self) -> crate::Result<Rc<dyn Blob>>
    where
        R: 'static,
    {
        let (cached, factory) = {
            let cursor = self.shared.cursor()?;
            let cached = cursor.parts[self.head.index].part_blob.as_ref().and_then(Weak::upgrade);
            (cached, cursor.part_blob_factory.clone())
        };
        if let Some(blob) = cached {
            return Ok(blob);
        }

        let blob = match factory {
            Some(factory) => factory.create_blob(self.clone()),
            None => Rc::new(PartBlob::new(self.clone())),
        };
        self.shared.cursor()?.parts[self.head.index].part_blob = Some(Rc::downgrade(&blob));
        Ok(blob)
    }

    /// The part that follows this one in the message, reading it from the stream if needed.
    pub fn next_part(&self) -> crate::Result<Option<Part<R>>> {
        let next = self
            .shared
            .cursor()?
            .parts
            .get(self.head.index + 1)
            .map(|slot| Rc::clone(&slot.head));
        match next {
            Some(head) => Ok(Some(Part::new(Rc::clone(&self.shared), head))),
            None => Shared::advance(&self.shared),
        }
    }

    /// Returns the whole content, buffering it if necessary.
    pub fn bytes(&self) -> crate::Result<Bytes> {
        self.blob()?.to_bytes().map_err(crate::Error::BlobReadFailed)
    }

    /// Returns the content decoded as text using the `charset` of the part's content type, or
    /// `utf-8` if none is declared.
    pub fn text(&self) -> crate::Result<String> {
        self.text_with_charset("utf-8")
    }

    /// Like [`text`](Part::text) but with `default_encoding` used when the content type declares no
    /// charset. Unknown labels fall back to `utf-8`.
    pub fn text_with_charset(&self, default_encoding: &str) -> crate::Result<String> {
        let declared = match self.header(header::CONTENT_TYPE) {
            Some(_) => self.content_type()?.parameter(param::CHARSET).map(str::to_owned),
            None => None,
        };
        let encoding_name = declared.as_deref().unwrap_or(default_encoding);
        let encoding = Encoding::for_label(encoding_name.as_bytes()).unwrap_or(UTF_8);

        let bytes = self.bytes()?;
        let (text, _, _) = encoding.decode(&bytes);
        Ok(text.into_owned())
    }

    /// Deserializes the content as JSON.
    #[cfg(feature = "json")]
    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<T> {
        let bytes = self.bytes()?;
        serde_json::from_slice(&bytes).map_err(crate::Error::DecodeJson)
    }
}

/// Creates the blob views returned by [`Part::part_blob`]. Closures taking a [`Part`] are
/// factories.
pub trait PartBlobFactory<R> {
    fn create_blob(&self, part: Part<R>) -> Rc<dyn Blob>;
}

impl<R, F: Fn(Part<R>) -> Rc<dyn Blob>> PartBlobFactory<R> for F {
    fn create_blob(&self, part: Part<R>) -> Rc<dyn Blob> {
        self(part)
    }
}

/// A [`Blob`] backed by a [`Part`]. The content is buffered the first time it is read.
pub struct PartBlob<R> {
    part: Part<R>,
}

impl<R: Read> PartBlob<R> {
    pub fn new(part: Part<R>) -> PartBlob<R> {
        PartBlob { part }
    }

    pub fn part(&self) -> &Part<R> {
        &self.part
    }

    fn content(&self) -> io::Result<Rc<dyn Blob>> {
        self.part.blob().map_err(crate::Error::into_io)
    }
}

impl<R: Read> Blob for PartBlob<R> {
    fn size(&self) -> io::Result<u64> {
        self.content()?.size()
    }

    fn input_stream(&self) -> io::Result<Box<dyn Read>> {
        self.content()?.input_stream()
    }

    fn write_to(&self, out: &mut dyn Write) -> io::Result<u64> {
        self.content()?.write_to(out)
    }

    fn to_bytes(&self) -> io::Result<Bytes> {
        self.content()?.to_bytes()
    }

    fn kind(&self) -> &'static str {
        "part"
    }
}

/// Reader over the content of a [`Part`], returned by [`Part::input_stream`].
///
/// When the part is streamed, the reader is the only owner of the message cursor until it reaches
/// the end of the content or is closed. Dropping it has the same effect as [`close`].
///
/// [`close`]: PartReader::close
pub struct PartReader<R: Read> {
    shared: Rc<Shared<R>>,
    index: usize,
    source: Rc<RefCell<StreamSource>>,
    bytes_read: u64,
}

impl<R: Read> PartReader<R> {
    /// Closes the reader. If it was streaming the part, the rest of the content is skipped and the
    /// message cursor released.
    pub fn close(mut self) -> crate::Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> crate::Result<()> {
        let live = matches!(*self.source.borrow(), StreamSource::Live);
        if live {
            self.shared.cursor()?.close_stream(self.index)?;
            log_debug!("closed part {} stream after {} bytes", self.index, self.bytes_read);
        }
        *self.source.borrow_mut() = StreamSource::Closed;
        Ok(())
    }

    fn read_live(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        let n = self.shared.cursor()?.read_stream(self.index, buf)?;
        if n == 0 && !buf.is_empty() {
            *self.source.borrow_mut() = StreamSource::Closed;
            log_debug!("EOF reached on part {} after {} bytes", self.index, self.bytes_read);
        }
        Ok(n)
    }
}

impl<R: Read> Read for PartReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let live = matches!(*self.source.borrow(), StreamSource::Live);
        let n = if live {
            self.read_live(buf).map_err(crate::Error::into_io)?
        } else {
            match &mut *self.source.borrow_mut() {
                StreamSource::Detached(input) => input.read(buf)?,
                _ => 0,
            }
        };
        self.bytes_read += n as u64;
        Ok(n)
    }
}

impl<R: Read> Drop for PartReader<R> {
    fn drop(&mut self) {
        if let Err(err) = self.close_inner() {
            log_error!("failed to close part {} stream: {}", self.index, err);
        }
    }
}
