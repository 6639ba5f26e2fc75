//! Incremental reader for a growing log file.
//!
//! Tracks a byte offset and the file's inode. A new inode or a file shorter
//! than the offset means the file was replaced or truncated, and reading
//! restarts at byte zero.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Upper bound on lines returned by one `read_new_lines()` call.
const MAX_LINES_PER_READ: usize = 10_000;

pub struct FileTailer {
    path: PathBuf,
    offset: u64,
    inode: u64,
}

impl FileTailer {
    /// Starts at the current end of the file.
    pub fn new(path: PathBuf) -> io::Result<Self> {
        let metadata = fs::metadata(&path)?;
        Ok(Self {
            inode: get_inode(&metadata),
            offset: metadata.len(),
            path,
        })
    }

    /// Starts at the beginning of the file.
    pub fn from_start(path: PathBuf) -> io::Result<Self> {
        let mut tailer = Self::new(path)?;
        tailer.offset = 0;
        Ok(tailer)
    }

    /// Reads complete lines appended since the last call.
    ///
    /// A trailing fragment without a newline is left for the next call.
    /// Invalid UTF-8 is replaced rather than failing the read.
    pub fn read_new_lines(&mut self) -> io::Result<Vec<String>> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            // mid-rotation: the next call will see the new file
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let inode = get_inode(&metadata);
        let size = metadata.len();
        if inode != self.inode || size < self.offset {
            self.inode = inode;
            self.offset = 0;
        }
        if size <= self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(file);

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        while lines.len() < MAX_LINES_PER_READ {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            self.offset += n as u64;
            let line = String::from_utf8_lossy(&buf);
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        Ok(lines)
    }

    /// Re-reads `path` from byte zero. Used after rotation, including when
    /// a download replaces the contents of the same spool file.
    pub fn rewind(&mut self, path: PathBuf) -> io::Result<()> {
        let metadata = fs::metadata(&path)?;
        self.inode = get_inode(&metadata);
        self.offset = 0;
        self.path = path;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[cfg(unix)]
fn get_inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

/// Without inodes only truncation is detected.
#[cfg(not(unix))]
fn get_inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}
