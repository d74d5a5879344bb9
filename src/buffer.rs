use std::io::{ErrorKind, Read};

use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;

use crate::constants;

pub(crate) struct StreamBuffer<R> {
    pub(crate) eof: bool,
    pub(crate) buf: BytesMut,
    pub(crate) reader: R,
}

impl<R: Read> StreamBuffer<R> {
    pub fn new(reader: R) -> Self {
        StreamBuffer {
            eof: false,
            buf: BytesMut::new(),
            reader,
        }
    }

    /// Pulls one chunk from the reader into the buffer. Returns `false` once the reader is
    /// exhausted.
    pub fn fill(&mut self) -> crate::Result<bool> {
        if self.eof {
            return Ok(false);
        }

        let len = self.buf.len();
        self.buf.resize(len + constants::READ_CHUNK_SIZE, 0);
        loop {
            match self.reader.read(&mut self.buf[len..]) {
                Ok(0) => {
                    self.buf.truncate(len);
                    self.eof = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.buf.truncate(len + n);
                    return Ok(true);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.buf.truncate(len);
                    return Err(crate::Error::StreamReadFailed(err));
                }
            }
        }
    }

    /// Fills until at least `size` bytes are buffered or the reader is exhausted.
    pub fn fill_to(&mut self, size: usize) -> crate::Result<bool> {
        while self.buf.len() < size {
            if !self.fill()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn read_until(&mut self, pattern: &[u8]) -> Option<Bytes> {
        memmem::find(&self.buf, pattern).map(|idx| self.buf.split_to(idx + pattern.len()).freeze())
    }

    pub fn starts_with(&self, pattern: &[u8]) -> bool {
        self.buf.starts_with(pattern)
    }

    pub fn discard(&mut self, size: usize) {
        self.buf.advance(size.min(self.buf.len()));
    }

    /// Reads the next chunk of part data ending at the `CRLF--boundary` delimiter.
    ///
    /// Returns `Ok(Some((true, bytes)))` once the delimiter is found (the leading CRLF is dropped,
    /// `--boundary` stays in the buffer), `Ok(Some((false, bytes)))` for data that is known not to
    /// be part of a delimiter and `Ok(None)` if more input is needed.
    pub fn read_field_data(&mut self, boundary: &str) -> crate::Result<Option<(bool, Bytes)>> {
        if self.buf.is_empty() {
            return if self.eof {
                Err(crate::Error::IncompleteStream)
            } else {
                Ok(None)
            };
        }

        let boundary_deriv = format!("{}{}{}", constants::CRLF, constants::BOUNDARY_EXT, boundary);
        let b_len = boundary_deriv.len();

        match memmem::find(&self.buf, boundary_deriv.as_bytes()) {
            Some(idx) => {
                let bytes = self.buf.split_to(idx).freeze();

                // discard \r\n.
                self.buf.advance(2);

                Ok(Some((true, bytes)))
            }
            None if self.eof => Err(crate::Error::IncompleteStream),
            None => {
                let buf_len = self.buf.len();
                let rem_boundary_part_max_len = b_len - 1;
                let rem_boundary_part_idx = buf_len.saturating_sub(rem_boundary_part_max_len);

                // A trailing CR may start a delimiter that is split across reads; hold it back.
                match memmem::rfind(&self.buf[rem_boundary_part_idx..], constants::CR.as_bytes()) {
                    Some(rel_idx) => {
                        let idx = rel_idx + rem_boundary_part_idx;

                        if boundary_deriv.as_bytes().starts_with(&self.buf[idx..]) {
                            let bytes = self.buf.split_to(idx).freeze();
                            if bytes.is_empty() {
                                Ok(None)
                            } else {
                                Ok(Some((false, bytes)))
                            }
                        } else {
                            Ok(Some((false, self.read_full_buf())))
                        }
                    }
                    None => Ok(Some((false, self.read_full_buf()))),
                }
            }
        }
    }

    pub fn read_full_buf(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len()).freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out data a few bytes at a time to exercise partial reads.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn collect_field_data<R: Read>(buffer: &mut StreamBuffer<R>, boundary: &str) -> crate::Result<Vec<u8>> {
        let mut data = Vec::new();
        loop {
            match buffer.read_field_data(boundary)? {
                Some((done, bytes)) => {
                    data.extend_from_slice(&bytes);
                    if done {
                        return Ok(data);
                    }
                }
                None => {
                    buffer.fill()?;
                }
            }
        }
    }

    #[test]
    fn test_read_field_data_with_split_delimiter() {
        let input = b"Hello world\nHello\r\nWorld\rAgain\r\n--X-BOUNDARY--\r\n";
        for step in 1..input.len() {
            let mut buffer = StreamBuffer::new(Trickle { data: input, step });
            let data = collect_field_data(&mut buffer, "X-BOUNDARY").unwrap();
            assert_eq!(data, b"Hello world\nHello\r\nWorld\rAgain");
            assert!(buffer.starts_with(b"--X-BOUNDARY"));
        }
    }

    #[test]
    fn test_read_field_data_incomplete() {
        let mut buffer = StreamBuffer::new(&b"abcd\r\n--X-BOUND"[..]);
        assert_eq!(collect_field_data(&mut buffer, "X-BOUNDARY"), Err(crate::Error::IncompleteStream));
    }

    #[test]
    fn test_read_until() {
        let mut buffer = StreamBuffer::new(&b"Content-ID: <a>\r\n\r\nbody"[..]);
        assert!(buffer.fill().unwrap());
        assert_eq!(
            buffer.read_until(constants::CRLF_CRLF.as_bytes()).unwrap(),
            Bytes::from_static(b"Content-ID: <a>\r\n\r\n")
        );
        assert_eq!(buffer.read_full_buf(), Bytes::from_static(b"body"));
        assert!(!buffer.fill().unwrap());
        assert!(buffer.eof);
    }
}
