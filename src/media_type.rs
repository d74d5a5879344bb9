use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::content_type::{ContentType, ParseError};

/// A media type, i.e. the `type/subtype` part of a `Content-Type` header.
///
/// Comparison ignores ASCII case on both the primary type and the subtype.
#[derive(Debug, Clone)]
pub struct MediaType {
    primary_type: Cow<'static, str>,
    sub_type: Cow<'static, str>,
}

impl MediaType {
    /// `text/plain`
    pub const TEXT_PLAIN: MediaType = MediaType::from_static("text", "plain");
    /// `text/xml`
    pub const TEXT_XML: MediaType = MediaType::from_static("text", "xml");
    /// `application/xml`
    pub const APPLICATION_XML: MediaType = MediaType::from_static("application", "xml");
    /// `application/soap+xml`
    pub const APPLICATION_SOAP_XML: MediaType = MediaType::from_static("application", "soap+xml");
    /// `application/xop+xml`
    pub const APPLICATION_XOP_XML: MediaType = MediaType::from_static("application", "xop+xml");
    /// `application/octet-stream`
    pub const APPLICATION_OCTET_STREAM: MediaType = MediaType::from_static("application", "octet-stream");
    /// `multipart/related`
    pub const MULTIPART_RELATED: MediaType = MediaType::from_static("multipart", "related");
    /// `multipart/mixed`
    pub const MULTIPART_MIXED: MediaType = MediaType::from_static("multipart", "mixed");

    /// Creates a media type from its primary type and subtype.
    pub fn new<P: Into<String>, S: Into<String>>(primary_type: P, sub_type: S) -> MediaType {
        MediaType {
            primary_type: Cow::Owned(primary_type.into()),
            sub_type: Cow::Owned(sub_type.into()),
        }
    }

    const fn from_static(primary_type: &'static str, sub_type: &'static str) -> MediaType {
        MediaType {
            primary_type: Cow::Borrowed(primary_type),
            sub_type: Cow::Borrowed(sub_type),
        }
    }

    pub fn primary_type(&self) -> &str {
        &self.primary_type
    }

    pub fn sub_type(&self) -> &str {
        &self.sub_type
    }

    /// Checks the primary type, ignoring case.
    pub fn has_primary_type(&self, primary_type: &str) -> bool {
        self.primary_type.eq_ignore_ascii_case(primary_type)
    }

    /// Checks whether this media type designates XML, i.e. whether the subtype is `xml` or
    /// carries the `+xml` suffix.
    pub fn is_xml(&self) -> bool {
        let sub_type = self.sub_type.to_ascii_lowercase();
        sub_type == "xml" || sub_type.ends_with("+xml")
    }
}

impl PartialEq for MediaType {
    fn eq(&self, other: &Self) -> bool {
        self.primary_type.eq_ignore_ascii_case(&other.primary_type)
            && self.sub_type.eq_ignore_ascii_case(&other.sub_type)
    }
}

impl Eq for MediaType {}

impl Hash for MediaType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.primary_type.to_ascii_lowercase().hash(state);
        self.sub_type.to_ascii_lowercase().hash(state);
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.primary_type, self.sub_type)
    }
}

impl FromStr for MediaType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let content_type = ContentType::from_str(s)?;
        if content_type.parameters().next().is_some() {
            return Err(ParseError::new("unexpected parameters in media type", s.find(';').unwrap_or(0)));
        }
        Ok(content_type.media_type().clone())
    }
}
