use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// A length-prefixed record stream.
///
/// # WriteLog
///
/// A WriteLog is a sequence of byte strings written to disk. It is read
/// back in the same order and yields the same byte strings; on disk, each
/// one is prefixed by its length as a 4 byte big-endian integer:
///
/// ```text
/// llllbbbbbbllllbbllllbbbbbbbbb...
/// ```
///
/// Where l is a length byte and b are bytes of a bytestring.
///
/// A stream ending exactly at a frame boundary is complete; a stream ending
/// inside a length prefix or a frame body was truncated.
pub struct WriteLogWriter<W: Write> {
    dest: W,

    current_length: u64,
    records_written: u32,
}

fn encode_u32(val: u32) -> [u8; 4] {
    val.to_be_bytes()
}

fn decode_u32(buf: [u8; 4]) -> u32 {
    u32::from_be_bytes(buf)
}

impl<W: Write> WriteLogWriter<W> {
    /// Return a new WriteLog that writes to dest
    pub fn new(dest: W) -> WriteLogWriter<W> {
        WriteLogWriter {
            dest,
            current_length: 0,
            records_written: 0,
        }
    }

    /// Appends one frame.
    pub fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        let len = u32::try_from(buf.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame longer than 4 GiB")
        })?;
        self.dest.write_all(&encode_u32(len))?;
        self.dest.write_all(buf)?;
        self.current_length += 4 + buf.len() as u64;
        self.records_written += 1;
        Ok(())
    }

    /// Return how many (bytes,records) have been written.
    pub fn get_stats(&self) -> (u64, u32) {
        (self.current_length, self.records_written)
    }

    pub fn into_inner(self) -> W {
        self.dest
    }
}

impl WriteLogWriter<BufWriter<fs::File>> {
    /// Opens a WriteLog for writing, truncating an existing file.
    pub fn new_to_file<P: AsRef<Path>>(file: P) -> io::Result<Self> {
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(file)
            .map(|f| WriteLogWriter::new(BufWriter::new(f)))
    }

    /// Flushes buffered frames and syncs the file to disk.
    pub fn finish(mut self) -> io::Result<()> {
        self.dest.flush()?;
        self.dest.get_ref().sync_all()
    }
}

/// A Reader for WriteLog files. (more information on WriteLog files is to
/// be found above at WriteLogWriter).
pub struct WriteLogReader<R: Read> {
    src: R,
}

impl<R: Read> WriteLogReader<R> {
    pub fn new(src: R) -> WriteLogReader<R> {
        WriteLogReader { src }
    }

    /// Fills `buf` completely. Returns the number of bytes read, which is
    /// less than `buf.len()` only if the source ended first.
    #[inline]
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut off = 0;
        while off < buf.len() {
            match self.src.read(&mut buf[off..]) {
                Ok(0) => break,
                Ok(s) => off += s,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(off)
    }

    /// Reads the next frame. Returns `None` at a clean end of the log.
    pub fn read_vec(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut lengthbuf = [0; 4];
        match self.read_bytes(&mut lengthbuf)? {
            0 => return Ok(None),
            4 => (),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated length prefix",
                ))
            }
        }

        // The prefix is untrusted: grow the buffer only as bytes arrive.
        let length = decode_u32(lengthbuf) as u64;
        let mut buffer = Vec::new();
        if ((&mut self.src).take(length).read_to_end(&mut buffer)? as u64) < length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated frame",
            ));
        }
        Ok(Some(buffer))
    }
}

impl WriteLogReader<BufReader<fs::File>> {
    pub fn new_from_file<P: AsRef<Path>>(file: P) -> io::Result<Self> {
        fs::File::open(file).map(|f| WriteLogReader::new(BufReader::new(f)))
    }
}

#[cfg(test)]
mod test {
    use super::{decode_u32, encode_u32};
    use super::{WriteLogReader, WriteLogWriter};
    use std::io::ErrorKind;

    #[test]
    fn test_u32_encoder() {
        let testvals = [0, 1, 2, 31, 199, 100000, 111111, 3000000, 4100000000];

        for val in testvals {
            assert_eq!(decode_u32(encode_u32(val)), val);
        }
        assert_eq!(encode_u32(258), [0, 0, 1, 2]);
    }

    #[test]
    fn test_write() {
        let mut w = WriteLogWriter::new(Vec::new());

        w.append(b"abc").unwrap();
        w.append(b"def").unwrap();

        let (bytes, records) = w.get_stats();
        assert_eq!(bytes, 2 * (4 + 3));
        assert_eq!(records, 2);
        assert_eq!(&w.into_inner()[..7], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_write_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("writelog_test.wlg");
        {
            let mut w = WriteLogWriter::new_to_file(&path).unwrap();
            w.append(b"abc").unwrap();
            w.append(b"").unwrap();
            w.append(b"defgh").unwrap();
            w.finish().unwrap();
        }
        let mut r = WriteLogReader::new_from_file(&path).unwrap();
        assert_eq!(r.read_vec().unwrap().unwrap(), b"abc");
        assert_eq!(r.read_vec().unwrap().unwrap(), b"");
        assert_eq!(r.read_vec().unwrap().unwrap(), b"defgh");
        assert!(r.read_vec().unwrap().is_none());
    }

    #[test]
    fn test_truncated() {
        let mut w = WriteLogWriter::new(Vec::new());
        w.append(b"abcdef").unwrap();
        let mut bytes = w.into_inner();

        bytes.truncate(7);
        let mut r = WriteLogReader::new(&bytes[..]);
        assert_eq!(r.read_vec().unwrap_err().kind(), ErrorKind::UnexpectedEof);

        bytes.truncate(2);
        let mut r = WriteLogReader::new(&bytes[..]);
        assert_eq!(r.read_vec().unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_huge_length_prefix() {
        // Claims a frame of almost 4 GiB but carries three bytes.
        let bytes = [0xff, 0xff, 0xff, 0xf0, 1, 2, 3];
        let mut r = WriteLogReader::new(&bytes[..]);
        assert_eq!(r.read_vec().unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }
}
