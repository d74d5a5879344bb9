//! The `Content-Type` header value (RFC 2045).

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::constants::param;
use crate::media_type::MediaType;

/// Error raised when a `Content-Type` value can't be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    message: String,
    index: usize,
}

impl ParseError {
    pub(crate) fn new<M: Into<String>>(message: M, index: usize) -> ParseError {
        ParseError {
            message: message.into(),
            index,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Byte offset in the input at which parsing failed.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} at index {}", self.message, self.index)
    }
}

impl std::error::Error for ParseError {}

/// A parsed `Content-Type`: a [`MediaType`] and its parameters.
///
/// Parameter names are case insensitive and stored lower-cased; values are kept verbatim. The
/// order in which parameters were added is preserved.
///
/// # Examples
///
/// ```
/// use xop_multipart::{ContentType, MediaType};
///
/// let ct: ContentType = "text/xml; Charset=utf-8".parse().unwrap();
/// assert_eq!(ct.media_type(), &MediaType::TEXT_XML);
/// assert_eq!(ct.parameter("CHARSET"), Some("utf-8"));
/// assert_eq!(ct.to_string(), "text/xml; charset=\"utf-8\"");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    media_type: MediaType,
    parameters: Vec<(String, String)>,
}

impl ContentType {
    /// Creates a content type from a media type and name/value parameter pairs.
    pub fn new<I, N, V>(media_type: MediaType, parameters: I) -> ContentType
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: Into<String>,
    {
        let mut builder = ContentType::builder(media_type);
        for (name, value) in parameters {
            builder = builder.parameter(name.as_ref(), value);
        }
        builder.build()
    }

    pub fn builder(media_type: MediaType) -> ContentTypeBuilder {
        ContentTypeBuilder {
            media_type,
            parameters: Vec::new(),
        }
    }

    /// Returns a builder initialized with the media type and parameters of this instance.
    pub fn to_builder(&self) -> ContentTypeBuilder {
        ContentTypeBuilder {
            media_type: self.media_type.clone(),
            parameters: self.parameters.clone(),
        }
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    /// Looks up a parameter value; the name is matched without regard to case.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over the `(name, value)` parameter pairs in insertion order.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Checks whether an entity with this content type is human readable. This is true for
    /// `text/*`, for XML media types, and for anything declaring a `charset`.
    pub fn is_textual(&self) -> bool {
        self.media_type.has_primary_type("text") || self.media_type.is_xml() || self.parameter(param::CHARSET).is_some()
    }
}

impl FromStr for ContentType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokenizer = Tokenizer::new(s);
        let primary_type = tokenizer.require_token()?;
        tokenizer.require('/')?;
        let sub_type = tokenizer.require_token()?;

        let mut builder = ContentType::builder(MediaType::new(primary_type, sub_type));
        while tokenizer.expect(';') {
            let name = match tokenizer.expect_token()? {
                Some(name) => name,
                // A trailing ';' isn't allowed by RFC 2045, but it's common enough to accept.
                None => break,
            };
            tokenizer.require('=')?;
            let value = tokenizer.require_token_or_quoted_string()?;
            builder = builder.parameter(name, value);
        }
        tokenizer.require_end()?;

        Ok(builder.build())
    }
}

/// Serializes every parameter value as a quoted string, even values that could be represented as
/// tokens (WS-I Basic Profile R1109).
impl Display for ContentType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.media_type)?;
        for (name, value) in &self.parameters {
            write!(f, "; {}=\"", name)?;
            for c in value.chars() {
                if c == '"' || c == '\\' {
                    f.write_str("\\")?;
                }
                write!(f, "{}", c)?;
            }
            f.write_str("\"")?;
        }
        Ok(())
    }
}

impl From<MediaType> for ContentType {
    fn from(media_type: MediaType) -> Self {
        ContentType::builder(media_type).build()
    }
}

impl TryFrom<&ContentType> for mime::Mime {
    type Error = mime::FromStrError;

    fn try_from(content_type: &ContentType) -> Result<Self, Self::Error> {
        content_type.to_string().parse()
    }
}

impl From<&mime::Mime> for ContentType {
    fn from(m: &mime::Mime) -> Self {
        let sub_type = match m.suffix() {
            Some(suffix) => format!("{}+{}", m.subtype(), suffix),
            None => m.subtype().as_str().to_owned(),
        };
        ContentType::new(
            MediaType::new(m.type_().as_str(), sub_type),
            m.params().map(|(name, value)| (name.as_str().to_owned(), value.as_str().to_owned())),
        )
    }
}

/// Mutable counterpart of [`ContentType`].
#[derive(Debug, Clone)]
pub struct ContentTypeBuilder {
    media_type: MediaType,
    parameters: Vec<(String, String)>,
}

impl ContentTypeBuilder {
    pub fn media_type(mut self, media_type: MediaType) -> ContentTypeBuilder {
        self.media_type = media_type;
        self
    }

    /// Sets a parameter. An existing parameter with the same name (ignoring case) is replaced in
    /// place.
    pub fn parameter<V: Into<String>>(mut self, name: &str, value: V) -> ContentTypeBuilder {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.parameters.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.parameters.push((name, value)),
        }
        self
    }

    pub fn remove_parameter(mut self, name: &str) -> ContentTypeBuilder {
        self.parameters.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self
    }

    pub fn clear_parameters(mut self) -> ContentTypeBuilder {
        self.parameters.clear();
        self
    }

    pub fn get_media_type(&self) -> &MediaType {
        &self.media_type
    }

    pub fn get_parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn build(self) -> ContentType {
        ContentType {
            media_type: self.media_type,
            parameters: self.parameters,
        }
    }
}

/// Tokenizer for RFC 2045 header values: tokens, quoted strings and single-character specials,
/// with whitespace between them skipped.
struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Tokenizer<'a> {
        Tokenizer { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c == ' ' || c == '\t' || c == '\r' || c == '\n' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, c: char) -> bool {
        self.skip_whitespace();
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn require(&mut self, c: char) -> Result<(), ParseError> {
        if self.expect(c) {
            Ok(())
        } else {
            Err(ParseError::new(format!("expected '{}'", c), self.pos))
        }
    }

    fn require_end(&mut self) -> Result<(), ParseError> {
        self.skip_whitespace();
        if self.pos == self.input.len() {
            Ok(())
        } else {
            Err(ParseError::new("unexpected character", self.pos))
        }
    }

    /// Reads a token; yields `None` only at the end of the input.
    fn expect_token(&mut self) -> Result<Option<&'a str>, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_token_char(c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos > start {
            Ok(Some(&self.input[start..self.pos]))
        } else if self.pos == self.input.len() {
            Ok(None)
        } else {
            Err(ParseError::new("expected token", self.pos))
        }
    }

    fn require_token(&mut self) -> Result<&'a str, ParseError> {
        match self.expect_token()? {
            Some(token) => Ok(token),
            None => Err(ParseError::new("expected token", self.pos)),
        }
    }

    fn require_token_or_quoted_string(&mut self) -> Result<String, ParseError> {
        self.skip_whitespace();
        if self.peek() != Some('"') {
            return self.require_token().map(str::to_owned);
        }

        let start = self.pos;
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(ParseError::new("unterminated quoted string", start)),
                Some('"') => {
                    self.pos += 1;
                    return Ok(value);
                }
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c) => {
                            value.push(c);
                            self.pos += c.len_utf8();
                        }
                        None => return Err(ParseError::new("unterminated quoted pair", self.pos)),
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii() && !c.is_ascii_control() && c != ' ' && !"()<>@,;:\\\"/[]?=".contains(c)
}
