//! Pull tokenizer over a headless `multipart/*` body.
//!
//! The tokenizer yields a flat sequence of [`EntityState`]s. For every body part it goes through
//! `StartBodyPart`, `StartHeader`, one `Field` per header, `EndHeader`, `Body` and `EndBodyPart`.
//! After the close delimiter it reports `Epilogue` and finally `EndMultipart`.

use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::io::Read;

use bytes::{Buf, BytesMut};

use crate::buffer::StreamBuffer;
use crate::constants;
use crate::encoding::BodyDecoder;
use crate::header::Header;
use crate::helpers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntityState {
    Preamble,
    StartBodyPart,
    StartHeader,
    Field,
    EndHeader,
    Body,
    EndBodyPart,
    Epilogue,
    EndMultipart,
}

impl EntityState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            EntityState::Preamble => "Preamble",
            EntityState::StartBodyPart => "StartBodyPart",
            EntityState::StartHeader => "StartHeader",
            EntityState::Field => "Field",
            EntityState::EndHeader => "EndHeader",
            EntityState::Body => "Body",
            EntityState::EndBodyPart => "EndBodyPart",
            EntityState::Epilogue => "Epilogue",
            EntityState::EndMultipart => "EndMultipart",
        }
    }

    /// Fails with [`Error::UnexpectedState`](crate::Error::UnexpectedState) unless `self` is
    /// `expected`.
    pub(crate) fn check(self, expected: EntityState) -> crate::Result<()> {
        if self == expected {
            Ok(())
        } else {
            Err(crate::Error::UnexpectedState {
                expected: expected.name(),
                actual: self.name(),
            })
        }
    }
}

impl Display for EntityState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) struct MimeTokenizer<R> {
    buffer: StreamBuffer<R>,
    boundary: String,
    state: EntityState,
    fields: VecDeque<Header>,
    field: Option<Header>,
    decoder: BodyDecoder,
    decoded: BytesMut,
    body_done: bool,
}

impl<R: Read> MimeTokenizer<R> {
    /// Creates a tokenizer for a body whose outer headers have already been consumed.
    pub(crate) fn headless<B: Into<String>>(reader: R, boundary: B) -> MimeTokenizer<R> {
        MimeTokenizer {
            buffer: StreamBuffer::new(reader),
            boundary: boundary.into(),
            state: EntityState::Preamble,
            fields: VecDeque::new(),
            field: None,
            decoder: BodyDecoder::Identity,
            decoded: BytesMut::new(),
            body_done: false,
        }
    }

    pub(crate) fn state(&self) -> EntityState {
        self.state
    }

    /// The header the tokenizer is positioned on; only set in the `Field` state.
    pub(crate) fn field(&self) -> Option<&Header> {
        self.field.as_ref()
    }

    /// Moves to the next state and returns it.
    pub(crate) fn next(&mut self) -> crate::Result<EntityState> {
        self.state = match self.state {
            EntityState::Preamble => {
                self.skip_preamble()?;
                self.read_delimiter_line()?
            }
            EntityState::StartBodyPart => {
                self.read_headers()?;
                EntityState::StartHeader
            }
            EntityState::StartHeader | EntityState::Field => match self.fields.pop_front() {
                Some(field) => {
                    self.field = Some(field);
                    EntityState::Field
                }
                None => {
                    self.field = None;
                    EntityState::EndHeader
                }
            },
            EntityState::EndHeader => {
                self.decoded.clear();
                self.body_done = false;
                EntityState::Body
            }
            EntityState::Body => {
                self.skip_body()?;
                EntityState::EndBodyPart
            }
            EntityState::EndBodyPart => self.read_delimiter_line()?,
            EntityState::Epilogue => {
                while self.buffer.fill()? {
                    self.buffer.read_full_buf();
                }
                self.buffer.read_full_buf();
                EntityState::EndMultipart
            }
            EntityState::EndMultipart => EntityState::EndMultipart,
        };
        Ok(self.state)
    }

    /// Skips whatever remains of the current part and stops at the start of the next one, or at the
    /// end of the multipart if this was the last part.
    pub(crate) fn skip_part(&mut self) -> crate::Result<EntityState> {
        loop {
            match self.next()? {
                EntityState::StartBodyPart | EntityState::EndMultipart => return Ok(self.state),
                _ => continue,
            }
        }
    }

    /// Reads decoded body bytes into `out`. Returns `Ok(0)` at the end of the body.
    pub(crate) fn read_body(&mut self, out: &mut [u8]) -> crate::Result<usize> {
        self.state.check(EntityState::Body)?;
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            if !self.decoded.is_empty() {
                let n = out.len().min(self.decoded.len());
                out[..n].copy_from_slice(&self.decoded[..n]);
                self.decoded.advance(n);
                return Ok(n);
            }

            if self.body_done {
                return Ok(0);
            }

            match self.buffer.read_field_data(&self.boundary)? {
                Some((done, raw)) => {
                    self.body_done = done;
                    self.decoder.decode(&raw, done, &mut self.decoded)?;
                }
                None => {
                    self.buffer.fill()?;
                }
            }
        }
    }

    fn skip_body(&mut self) -> crate::Result<()> {
        self.decoded.clear();
        while !self.body_done {
            match self.buffer.read_field_data(&self.boundary)? {
                Some((done, _)) => self.body_done = done,
                None => {
                    self.buffer.fill()?;
                }
            }
        }
        Ok(())
    }

    fn dash_boundary(&self) -> String {
        format!("{}{}", constants::BOUNDARY_EXT, self.boundary)
    }

    /// Drops everything up to the first `--boundary` that starts a line.
    fn skip_preamble(&mut self) -> crate::Result<()> {
        let dash_boundary = self.dash_boundary();
        let delimiter = format!("{}{}", constants::CRLF, dash_boundary);

        self.buffer.fill_to(dash_boundary.len())?;
        if self.buffer.starts_with(dash_boundary.as_bytes()) {
            return Ok(());
        }

        loop {
            match memchr::memmem::find(&self.buffer.buf, delimiter.as_bytes()) {
                Some(idx) => {
                    self.buffer.discard(idx + constants::CRLF.len());
                    return Ok(());
                }
                None => {
                    // Keep enough of the tail to match a delimiter split across reads.
                    let keep = delimiter.len() - 1;
                    let len = self.buffer.buf.len();
                    if len > keep {
                        self.buffer.discard(len - keep);
                    }
                    if !self.buffer.fill()? {
                        return Err(crate::Error::IncompleteStream);
                    }
                }
            }
        }
    }

    /// Consumes a `--boundary` line and tells whether it opened another part or closed the
    /// multipart.
    fn read_delimiter_line(&mut self) -> crate::Result<EntityState> {
        let dash_boundary = self.dash_boundary();

        if !self.buffer.fill_to(dash_boundary.len() + 2)? && !self.buffer.starts_with(dash_boundary.as_bytes()) {
            return Err(crate::Error::IncompleteStream);
        }
        if !self.buffer.starts_with(dash_boundary.as_bytes()) {
            return Err(crate::Error::MalformedBoundary);
        }
        self.buffer.discard(dash_boundary.len());

        if self.buffer.starts_with(constants::BOUNDARY_EXT.as_bytes()) {
            self.buffer.discard(constants::BOUNDARY_EXT.len());
            helpers::log_debug!("close delimiter reached");
            return Ok(EntityState::Epilogue);
        }

        // Transport padding may follow the boundary before the line break.
        loop {
            if let Some(line) = self.buffer.read_until(constants::CRLF.as_bytes()) {
                let padding = &line[..line.len() - constants::CRLF.len()];
                return if padding.iter().all(|b| *b == b' ' || *b == b'\t') {
                    Ok(EntityState::StartBodyPart)
                } else {
                    Err(crate::Error::MalformedBoundary)
                };
            }
            if !self.buffer.fill()? {
                return Err(crate::Error::IncompleteStream);
            }
        }
    }

    fn read_headers(&mut self) -> crate::Result<()> {
        self.fields.clear();
        self.field = None;

        self.buffer.fill_to(constants::CRLF.len())?;
        let headers = if self.buffer.starts_with(constants::CRLF.as_bytes()) {
            self.buffer.discard(constants::CRLF.len());
            Vec::new()
        } else {
            let header_bytes = loop {
                if let Some(bytes) = self.buffer.read_until(constants::CRLF_CRLF.as_bytes()) {
                    break bytes;
                }
                if !self.buffer.fill()? {
                    return Err(crate::Error::IncompleteStream);
                }
            };

            let mut headers = [httparse::EMPTY_HEADER; constants::MAX_HEADERS];
            match httparse::parse_headers(&header_bytes, &mut headers) {
                Ok(httparse::Status::Complete((_, raw_headers))) => helpers::convert_raw_headers(raw_headers),
                Ok(httparse::Status::Partial) => return Err(crate::Error::IncompleteHeaders),
                Err(err) => return Err(crate::Error::ReadHeaderFailed(err)),
            }
        };

        self.decoder = BodyDecoder::for_headers(&headers);
        self.fields.extend(headers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(data: &[u8], boundary: &str) -> crate::Result<Vec<String>> {
        let mut tokenizer = MimeTokenizer::headless(data, boundary);
        let mut events = Vec::new();
        loop {
            let state = tokenizer.next()?;
            match state {
                EntityState::Field => {
                    let field = tokenizer.field().unwrap();
                    events.push(format!("{}={}", field.name(), field.value()));
                }
                EntityState::Body => {
                    let mut body = Vec::new();
                    let mut buf = [0u8; 3];
                    loop {
                        let n = tokenizer.read_body(&mut buf)?;
                        if n == 0 {
                            break;
                        }
                        body.extend_from_slice(&buf[..n]);
                    }
                    events.push(format!("Body({})", String::from_utf8_lossy(&body)));
                }
                EntityState::EndMultipart => {
                    events.push(state.to_string());
                    return Ok(events);
                }
                _ => events.push(state.to_string()),
            }
        }
    }

    #[test]
    fn test_event_sequence() {
        let data = b"preamble text\r\n--XX \t\r\nContent-ID: <a>\r\nX-Custom: 1\r\n\r\nfirst\r\n--XX\r\n\r\nsecond\r\n--XX--\r\nepilogue";
        assert_eq!(
            events(data, "XX").unwrap(),
            vec![
                "StartBodyPart",
                "StartHeader",
                "Content-ID=<a>",
                "X-Custom=1",
                "EndHeader",
                "Body(first)",
                "EndBodyPart",
                "StartBodyPart",
                "StartHeader",
                "EndHeader",
                "Body(second)",
                "EndBodyPart",
                "Epilogue",
                "EndMultipart",
            ]
        );
    }

    #[test]
    fn test_base64_body_is_decoded() {
        let data = b"--XX\r\nContent-Transfer-Encoding: base64\r\n\r\naGVsbG8g\r\nd29ybGQ=\r\n--XX--";
        let events = events(data, "XX").unwrap();
        assert!(events.contains(&"Body(hello world)".to_owned()));
    }

    #[test]
    fn test_empty_multipart() {
        assert_eq!(events(b"--XX--\r\n", "XX").unwrap(), vec!["Epilogue", "EndMultipart"]);
    }

    #[test]
    fn test_missing_close_delimiter() {
        assert_eq!(
            events(b"--XX\r\n\r\nbody without end", "XX"),
            Err(crate::Error::IncompleteStream)
        );
        assert_eq!(events(b"no boundary at all", "XX"), Err(crate::Error::IncompleteStream));
    }

    #[test]
    fn test_malformed_delimiter_line() {
        assert_eq!(events(b"--XXjunk\r\n\r\nbody\r\n--XX--", "XX"), Err(crate::Error::MalformedBoundary));
    }

    #[test]
    fn test_skip_part() {
        let data = b"--XX\r\nContent-ID: <a>\r\n\r\nfirst\r\n--XX\r\nContent-ID: <b>\r\n\r\nsecond\r\n--XX--\r\n";
        let mut tokenizer = MimeTokenizer::headless(&data[..], "XX");
        assert_eq!(tokenizer.next().unwrap(), EntityState::StartBodyPart);
        assert_eq!(tokenizer.skip_part().unwrap(), EntityState::StartBodyPart);
        assert_eq!(tokenizer.skip_part().unwrap(), EntityState::EndMultipart);
        assert_eq!(tokenizer.skip_part().unwrap(), EntityState::EndMultipart);
    }

    #[test]
    fn test_read_body_outside_body_fails() {
        let mut tokenizer = MimeTokenizer::headless(&b"--XX--"[..], "XX");
        let mut buf = [0u8; 4];
        assert!(matches!(
            tokenizer.read_body(&mut buf),
            Err(crate::Error::UnexpectedState { .. })
        ));
    }
}
