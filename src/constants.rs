pub(crate) const MAX_HEADERS: usize = 32;
pub(crate) const BOUNDARY_EXT: &str = "--";
pub(crate) const CR: &str = "\r";
pub(crate) const CRLF: &str = "\r\n";
pub(crate) const CRLF_CRLF: &str = "\r\n\r\n";

/// Number of bytes pulled from the underlying reader per fill.
pub(crate) const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Size of the reusable buffer the writer encodes header text into.
pub(crate) const ASCII_BUFFER_SIZE: usize = 256;

/// Default number of bytes an overflowable blob keeps in memory before it spills to disk.
pub const DEFAULT_OVERFLOW_THRESHOLD: usize = 256 * 1024;

pub(crate) mod header {
    pub(crate) const CONTENT_TYPE: &str = "Content-Type";
    pub(crate) const CONTENT_ID: &str = "Content-ID";
    pub(crate) const CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";
}

pub(crate) mod param {
    pub(crate) const BOUNDARY: &str = "boundary";
    pub(crate) const START: &str = "start";
    pub(crate) const CHARSET: &str = "charset";
}
