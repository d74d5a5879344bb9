use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;

use crate::blob::{MemoryBlobFactory, WritableBlobFactory};
use crate::constants::{header, param};
use crate::content_type::ContentType;
use crate::helpers::{self, log_debug, log_error};
use crate::part::{Part, PartBlobFactory, PartHead, PartSlot, PartState};
use crate::tokenizer::{EntityState, MimeTokenizer};

type PartListener<R> = Box<dyn FnMut(&Part<R>)>;

/// State shared between a [`MultipartBody`] and the parts and readers handed out for it.
pub(crate) struct Shared<R> {
    cursor: RefCell<MessageCursor<R>>,
    listener: RefCell<Option<PartListener<R>>>,
}

/// The single forward cursor over the message, plus everything discovered so far.
pub(crate) struct MessageCursor<R> {
    pub(crate) tokenizer: MimeTokenizer<R>,
    pub(crate) parts: Vec<PartSlot>,
    root_content_id: Option<String>,
    by_content_id: HashMap<String, usize>,
    current: Option<usize>,
    root: Option<usize>,
    attachment_blob_factory: Rc<dyn WritableBlobFactory>,
    pub(crate) part_blob_factory: Option<Rc<dyn PartBlobFactory<R>>>,
    /// Set by the first error that leaves the tokenizer at an unknown position.
    failure: Option<String>,
}

impl<R: Read> Shared<R> {
    pub(crate) fn cursor(&self) -> crate::Result<RefMut<'_, MessageCursor<R>>> {
        self.cursor.try_borrow_mut().map_err(|_| crate::Error::CursorBusy)
    }

    /// Reads the headers of the next part, fetching the content of the current one first.
    pub(crate) fn advance(shared: &Rc<Shared<R>>) -> crate::Result<Option<Part<R>>> {
        // Held across the advance so a listener can't move the cursor from under itself.
        let mut listener = shared.listener.try_borrow_mut().map_err(|_| crate::Error::CursorBusy)?;
        let head = shared.cursor()?.advance()?;
        let part = match head {
            Some(head) => Part::new(Rc::clone(shared), head),
            None => return Ok(None),
        };

        if let Some(listener) = listener.as_mut() {
            listener(&part);
        }
        Ok(Some(part))
    }

    fn part_at(shared: &Rc<Shared<R>>, index: usize) -> crate::Result<Option<Part<R>>> {
        let head = shared.cursor()?.parts.get(index).map(|slot| Rc::clone(&slot.head));
        Ok(head.map(|head| Part::new(Rc::clone(shared), head)))
    }
}

impl<R: Read> MessageCursor<R> {
    /// Runs an operation that moves the tokenizer. Once one fails, the message is no longer read:
    /// the part being read is marked failed and every later operation returns the first error.
    pub(crate) fn guarded<T, F>(&mut self, index: Option<usize>, op: F) -> crate::Result<T>
    where
        F: FnOnce(&mut Self) -> crate::Result<T>,
    {
        if let Some(reason) = &self.failure {
            return Err(crate::Error::MessageFailed(reason.clone()));
        }

        op(self).map_err(|err| {
            let reason = err.to_string();
            if self.failure.is_none() {
                log_error!("multipart message failed: {}", reason);
                self.failure = Some(reason.clone());
            }
            if let Some(index) = index {
                self.parts[index].state = PartState::Failed(reason);
            }
            err
        })
    }

    fn advance(&mut self) -> crate::Result<Option<Rc<PartHead>>> {
        self.guarded(None, Self::read_next_part)
    }

    fn read_next_part(&mut self) -> crate::Result<Option<Rc<PartHead>>> {
        if let Some(current) = self.current {
            self.fetch(current)?;
        }

        if self.tokenizer.state() == EntityState::EndMultipart {
            self.current = None;
            return Ok(None);
        }

        self.tokenizer.next()?.check(EntityState::StartHeader)?;

        let mut headers = Vec::new();
        let mut content_id = None;
        while self.tokenizer.next()? == EntityState::Field {
            if let Some(field) = self.tokenizer.field() {
                log_debug!("addHeader: ({}) value=({})", field.name(), field.value());
                if content_id.is_none() && field.is(header::CONTENT_ID) {
                    content_id = Some(helpers::normalize_content_id(field.value()));
                }
                headers.push(field.clone());
            }
        }
        self.tokenizer.next()?.check(EntityState::Body)?;

        if let Some(content_id) = &content_id {
            if self.by_content_id.contains_key(content_id) {
                return Err(crate::Error::DuplicateContentId(content_id.clone()));
            }
        }

        let index = self.parts.len();
        let is_root = match &self.root_content_id {
            Some(start) => content_id.as_deref() == Some(start.as_str()),
            None => index == 0,
        };
        let blob_factory: Rc<dyn WritableBlobFactory> = if is_root {
            Rc::new(MemoryBlobFactory)
        } else {
            Rc::clone(&self.attachment_blob_factory)
        };

        let head = Rc::new(PartHead {
            index,
            headers,
            content_id,
            content_type: Default::default(),
            is_root,
        });
        self.parts.push(PartSlot {
            head: Rc::clone(&head),
            state: PartState::Unread,
            blob_factory,
            part_blob: None,
        });
        if let Some(content_id) = &head.content_id {
            self.by_content_id.insert(content_id.clone(), index);
        }
        if is_root {
            self.root = Some(index);
        }
        self.current = Some(index);
        log_debug!("created part {} with content ID {:?}, root: {}", index, head.content_id, is_root);

        Ok(Some(head))
    }
}

/// Represents a MIME multipart message, typically an XOP/MTOM package.
///
/// The message is read lazily from the underlying reader. Parts are discovered one at a time, in
/// order, as they are requested: by content ID with [`part`], as the root part with
/// [`root_part`], or in sequence with [`parts`]. Looking up a part that hasn't been seen yet reads
/// past all the parts in between; their content is buffered so nothing is lost.
///
/// [`part`]: MultipartBody::part
/// [`root_part`]: MultipartBody::root_part
/// [`parts`]: MultipartBody::parts
///
/// # Examples
///
/// ```
/// use xop_multipart::MultipartBody;
///
/// # fn run() -> xop_multipart::Result<()> {
/// let data = "--X-BOUNDARY\r\nContent-ID: <root@example.org>\r\n\r\n<doc/>\r\n--X-BOUNDARY--\r\n";
/// let content_type = "multipart/related; boundary=X-BOUNDARY".parse()?;
/// let message = MultipartBody::new(data.as_bytes(), content_type)?;
///
/// let root = message.root_part()?;
/// assert_eq!(root.content_id(), Some("root@example.org"));
/// assert_eq!(root.text()?, "<doc/>");
/// # Ok(())
/// # }
/// # run().unwrap();
/// ```
pub struct MultipartBody<R> {
    shared: Rc<Shared<R>>,
    content_type: ContentType,
}

impl<R: Read> MultipartBody<R> {
    /// Creates a message with the default configuration.
    ///
    /// Fails if `content_type` is not a `multipart/*` type with a `boundary` parameter, or if the
    /// preamble can't be read.
    pub fn new(reader: R, content_type: ContentType) -> crate::Result<MultipartBody<R>> {
        MultipartBody::builder(reader, content_type).build()
    }

    pub fn builder(reader: R, content_type: ContentType) -> Builder<R> {
        Builder {
            reader,
            content_type,
            attachment_blob_factory: None,
            part_blob_factory: None,
            listener: None,
        }
    }

    /// The content type the message was created with.
    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    /// Returns the part with the given content ID, reading ahead until it is found.
    ///
    /// The content ID is normalized the same way as the `Content-ID` headers, so
    /// `<id@example.org>`, `cid:id@example.org` and `id@example.org` are equivalent.
    pub fn part(&self, content_id: &str) -> crate::Result<Option<Part<R>>> {
        let content_id = helpers::normalize_content_id(content_id);
        loop {
            let index = self.shared.cursor()?.by_content_id.get(&content_id).copied();
            if let Some(index) = index {
                return Shared::part_at(&self.shared, index);
            }
            if Shared::advance(&self.shared)?.is_none() {
                return Ok(None);
            }
        }
    }

    /// Returns the root part: the one whose content ID matches the `start` parameter, or the
    /// first part if there is no such parameter.
    pub fn root_part(&self) -> crate::Result<Part<R>> {
        loop {
            let root = self.shared.cursor()?.root;
            if let Some(index) = root {
                return Shared::part_at(&self.shared, index)?.ok_or(crate::Error::MissingRootPart);
            }
            if Shared::advance(&self.shared)?.is_none() {
                return Err(crate::Error::MissingRootPart);
            }
        }
    }

    /// The number of parts in the message. Reads the whole message.
    pub fn part_count(&self) -> crate::Result<usize> {
        self.detach()?;
        Ok(self.shared.cursor()?.parts.len())
    }

    /// Reads the rest of the message, buffering every part that hasn't been consumed, so that the
    /// underlying reader is no longer needed. Calling it again does nothing.
    pub fn detach(&self) -> crate::Result<()> {
        while Shared::advance(&self.shared)?.is_some() {}
        Ok(())
    }

    /// Iterates over all the parts of the message in order, starting from the first one. Parts
    /// already read are replayed; the others are read as the iterator advances.
    pub fn parts(&self) -> Parts<R> {
        Parts {
            shared: Rc::clone(&self.shared),
            next_index: 0,
            failed: false,
        }
    }
}

impl<'a, R: Read> IntoIterator for &'a MultipartBody<R> {
    type Item = crate::Result<Part<R>>;
    type IntoIter = Parts<R>;

    fn into_iter(self) -> Parts<R> {
        self.parts()
    }
}

/// Configures and creates a [`MultipartBody`].
pub struct Builder<R> {
    reader: R,
    content_type: ContentType,
    attachment_blob_factory: Option<Rc<dyn WritableBlobFactory>>,
    part_blob_factory: Option<Rc<dyn PartBlobFactory<R>>>,
    listener: Option<PartListener<R>>,
}

impl<R: Read> Builder<R> {
    /// Sets the factory for the blobs that buffer parts other than the root part. Defaults to
    /// [`MemoryBlobFactory`]. The root part is always buffered in memory.
    pub fn attachment_blob_factory<F: WritableBlobFactory + 'static>(mut self, factory: F) -> Builder<R> {
        self.attachment_blob_factory = Some(Rc::new(factory));
        self
    }

    /// Sets the factory for the blobs returned by [`Part::part_blob`]. Without one, parts get a
    /// [`PartBlob`](crate::PartBlob) that buffers the content on first use.
    pub fn part_blob_factory<F: PartBlobFactory<R> + 'static>(mut self, factory: F) -> Builder<R> {
        self.part_blob_factory = Some(Rc::new(factory));
        self
    }

    /// Registers a callback invoked with every part right after its headers have been read.
    pub fn part_creation_listener<L: FnMut(&Part<R>) + 'static>(mut self, listener: L) -> Builder<R> {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn build(self) -> crate::Result<MultipartBody<R>> {
        let boundary = crate::boundary_of(&self.content_type)?.to_owned();
        let root_content_id = self
            .content_type
            .parameter(param::START)
            .map(helpers::normalize_content_id);

        let attachment_blob_factory: Rc<dyn WritableBlobFactory> = match self.attachment_blob_factory {
            Some(factory) => factory,
            None => Rc::new(MemoryBlobFactory),
        };

        let mut tokenizer = MimeTokenizer::headless(self.reader, boundary);
        loop {
            match tokenizer.state() {
                EntityState::StartBodyPart | EntityState::EndMultipart => break,
                _ => {
                    tokenizer.next()?;
                }
            }
        }

        let cursor = MessageCursor {
            tokenizer,
            parts: Vec::new(),
            root_content_id,
            by_content_id: HashMap::new(),
            current: None,
            root: None,
            attachment_blob_factory,
            part_blob_factory: self.part_blob_factory,
            failure: None,
        };

        Ok(MultipartBody {
            shared: Rc::new(Shared {
                cursor: RefCell::new(cursor),
                listener: RefCell::new(self.listener),
            }),
            content_type: self.content_type,
        })
    }
}

/// Iterator over the parts of a [`MultipartBody`], returned by [`MultipartBody::parts`]. Ends
/// after yielding an error.
pub struct Parts<R> {
    shared: Rc<Shared<R>>,
    next_index: usize,
    failed: bool,
}

impl<R: Read> Iterator for Parts<R> {
    type Item = crate::Result<Part<R>>;

    fn next(&mut self) -> Option<crate::Result<Part<R>>> {
        if self.failed {
            return None;
        }

        let part = match Shared::part_at(&self.shared, self.next_index) {
            Ok(Some(part)) => Ok(Some(part)),
            Ok(None) => Shared::advance(&self.shared),
            Err(err) => Err(err),
        };
        match part {
            Ok(Some(part)) => {
                self.next_index += 1;
                Some(Ok(part))
            }
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PartStatus;

    fn message(data: &'static str, content_type: &str) -> MultipartBody<&'static [u8]> {
        MultipartBody::new(data.as_bytes(), content_type.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_rejects_bad_envelope() {
        let data = &b""[..];
        assert_eq!(
            MultipartBody::new(data, "text/xml; boundary=A".parse().unwrap()).err(),
            Some(crate::Error::NoMultipart)
        );
        assert_eq!(
            MultipartBody::new(data, "multipart/related".parse().unwrap()).err(),
            Some(crate::Error::NoBoundary)
        );
    }

    #[test]
    fn test_empty_multipart() {
        let message = message("--A--\r\n", "multipart/related; boundary=A");
        assert!(message.parts().next().is_none());
        assert_eq!(message.part_count(), Ok(0));
        assert_eq!(message.root_part().err(), Some(crate::Error::MissingRootPart));
    }

    #[test]
    fn test_advance_buffers_previous_part() {
        let data = "--A\r\nContent-ID: <a>\r\n\r\nfirst\r\n--A\r\nContent-ID: <b>\r\n\r\nsecond\r\n--A--\r\n";
        let message = message(data, "multipart/related; boundary=A");

        let first = message.parts().next().unwrap().unwrap();
        assert_eq!(first.status(), Ok(PartStatus::Unread));

        let second = first.next_part().unwrap().unwrap();
        assert_eq!(second.content_id(), Some("b"));
        assert_eq!(first.status(), Ok(PartStatus::Buffered));
        assert_eq!(first.text().unwrap(), "first");
        assert!(second.next_part().unwrap().is_none());
    }

    #[test]
    fn test_listener_sees_every_part() {
        let data = "--A\r\nContent-ID: <a>\r\n\r\n1\r\n--A\r\nContent-ID: <b>\r\n\r\n2\r\n--A--\r\n";
        let seen = Rc::new(RefCell::new(Vec::new()));
        let recorder = Rc::clone(&seen);
        let message = MultipartBody::builder(data.as_bytes(), "multipart/related; boundary=A".parse().unwrap())
            .part_creation_listener(move |part| recorder.borrow_mut().push(part.content_id().map(str::to_owned)))
            .build()
            .unwrap();

        message.detach().unwrap();
        assert_eq!(*seen.borrow(), vec![Some("a".to_owned()), Some("b".to_owned())]);
    }

    #[test]
    fn test_malformed_message_stays_failed() {
        let message = message(
            "--A\r\nContent-ID: <a>\r\n\r\n1\r\n--A junk\r\n\r\n2\r\n--A--\r\n",
            "multipart/related; boundary=A",
        );

        let results: Vec<_> = message.parts().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].as_ref().err(), Some(&crate::Error::MalformedBoundary));

        let failure = || crate::Error::MessageFailed("malformed boundary delimiter line".to_owned());
        let first = message.part("a").unwrap().unwrap();
        assert_eq!(first.status(), Ok(PartStatus::Failed));
        assert_eq!(first.bytes().err(), Some(failure()));
        assert_eq!(message.part("b").err(), Some(failure()));
        assert_eq!(message.root_part().unwrap().index(), 0);
    }

    #[test]
    fn test_reentrant_listener_is_rejected() {
        let data = "--A\r\n\r\n1\r\n--A\r\n\r\n2\r\n--A--\r\n";
        let results = Rc::new(RefCell::new(Vec::new()));
        let recorder = Rc::clone(&results);
        let message = MultipartBody::builder(data.as_bytes(), "multipart/related; boundary=A".parse().unwrap())
            .part_creation_listener(move |part| recorder.borrow_mut().push(part.next_part().err()))
            .build()
            .unwrap();

        message.detach().unwrap();
        assert_eq!(
            *results.borrow(),
            vec![Some(crate::Error::CursorBusy), Some(crate::Error::CursorBusy)]
        );
    }
}
