//! Reassembles a byte stream into newline-terminated lines.
//!
//! Operates on raw bytes end to end so malformed UTF-8 never causes a
//! panic or a dropped write.

/// Splits a byte stream into newline-terminated lines, invoking `sink`
/// once per complete line (trailing newline included). Bytes following
/// the final newline that never terminate are buffered and dropped if
/// the splitter itself is dropped without another trailing newline.
/// This is documented data loss on abrupt end-of-stream.
pub struct LineSplitter<F: FnMut(Vec<u8>)> {
    sink: F,
    buffer: Vec<u8>,
}

impl<F: FnMut(Vec<u8>)> LineSplitter<F> {
    pub fn new(sink: F) -> Self {
        Self {
            sink,
            buffer: Vec::new(),
        }
    }

    /// Consumes all of `bytes`, emitting any complete lines found.
    /// Never fails: this is a write-through accumulator, not an I/O sink.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        for &b in bytes {
            self.buffer.push(b);
            if b == b'\n' {
                let line = std::mem::take(&mut self.buffer);
                (self.sink)(line);
            }
        }
        bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn emits_one_line_per_newline_including_trailing_newline() {
        let lines = RefCell::new(Vec::new());
        let mut splitter = LineSplitter::new(|line: Vec<u8>| lines.borrow_mut().push(line));

        splitter.write(b"hello\nworld\n");

        let lines = lines.into_inner();
        assert_eq!(lines, vec![b"hello\n".to_vec(), b"world\n".to_vec()]);
    }

    #[test]
    fn partial_trailing_bytes_are_buffered_not_emitted() {
        let lines = RefCell::new(Vec::new());
        let mut splitter = LineSplitter::new(|line: Vec<u8>| lines.borrow_mut().push(line));

        splitter.write(b"hello\nworl");
        assert_eq!(lines.borrow().len(), 1);

        splitter.write(b"d\n");
        assert_eq!(lines.borrow().len(), 2);
        assert_eq!(lines.borrow()[1], b"world\n".to_vec());
    }

    #[test]
    fn write_always_consumes_all_input_even_with_invalid_utf8() {
        let lines = RefCell::new(Vec::new());
        let mut splitter = LineSplitter::new(|line: Vec<u8>| lines.borrow_mut().push(line));

        let invalid = [0xff, 0xfe, b'\n'];
        let n = splitter.write(&invalid);
        assert_eq!(n, invalid.len());
        assert_eq!(lines.borrow().len(), 1);
    }

    #[test]
    fn split_across_many_writes_reassembles_correctly() {
        let lines = RefCell::new(Vec::new());
        let mut splitter = LineSplitter::new(|line: Vec<u8>| lines.borrow_mut().push(line));

        for chunk in [b"a".as_slice(), b"b", b"c", b"\n", b"d", b"\n"] {
            splitter.write(chunk);
        }

        assert_eq!(lines.into_inner(), vec![b"abc\n".to_vec(), b"d\n".to_vec()]);
    }
}
