//! Chunk sidecar: on-disk record of a file's chunk layout.
//!
//! Stored next to the output as `<target>.chunks` so an interrupted transfer
//! can resume across restarts. The format is line-oriented UTF-8:
//!
//! ```text
//! name:<file>
//! size:<bytes>
//! #0:
//! \tname:<file>.chunk0
//! \trange:<start>-<end>
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failure loading a sidecar.
#[derive(Debug, Error)]
pub enum SidecarError {
    /// Sidecar missing or unreadable; start fresh.
    #[error("chunk sidecar unreadable: {0}")]
    Io(#[from] std::io::Error),
    /// Sidecar exists but does not parse. Non-recoverable for resume; the
    /// caller must restart from zero.
    #[error("chunk sidecar is malformed")]
    WrongFormat,
}

/// Chunk layout for one target file. Ranges are inclusive byte bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    target: PathBuf,
    size: u64,
    chunks: Vec<(PathBuf, (u64, u64))>,
}

impl ChunkInfo {
    pub fn new(target: &Path) -> Self {
        ChunkInfo {
            target: target.to_path_buf(),
            size: 0,
            chunks: Vec::new(),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_name(&self, index: usize) -> &Path {
        &self.chunks[index].0
    }

    /// Inclusive byte range of chunk `index`.
    pub fn chunk_range(&self, index: usize) -> (u64, u64) {
        self.chunks[index].1
    }

    /// Expected on-disk length of chunk `index`.
    pub fn chunk_len(&self, index: usize) -> u64 {
        let (start, end) = self.chunks[index].1;
        end.saturating_sub(start) + 1
    }

    /// Path of the sidecar file for `target`.
    pub fn sidecar_path(target: &Path) -> PathBuf {
        let mut os = target.as_os_str().to_os_string();
        os.push(".chunks");
        PathBuf::from(os)
    }

    /// Path of chunk file `index` for `target`.
    pub fn chunk_path(target: &Path, index: usize) -> PathBuf {
        let mut os = target.as_os_str().to_os_string();
        os.push(format!(".chunk{}", index));
        PathBuf::from(os)
    }

    /// Splits `[0, size)` into `count` ranges. Chunk i covers
    /// `[i*(size/count), (i+1)*(size/count) - 1]`; the last chunk absorbs the
    /// remainder and ends at `size - 1`.
    pub fn create_chunks(&mut self, count: usize) {
        self.chunks.clear();
        if self.size == 0 || count == 0 {
            return;
        }
        let count = count as u64;
        let chunk_size = self.size / count;
        for i in 0..count {
            let start = i * chunk_size;
            let end = if i == count - 1 {
                self.size - 1
            } else {
                (i + 1) * chunk_size - 1
            };
            self.chunks
                .push((Self::chunk_path(&self.target, i as usize), (start, end)));
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let mut out = fs::File::create(Self::sidecar_path(&self.target))?;
        writeln!(out, "name:{}", self.target.display())?;
        writeln!(out, "size:{}", self.size)?;
        for (i, (name, (start, end))) in self.chunks.iter().enumerate() {
            writeln!(out, "#{}:", i)?;
            writeln!(out, "\tname:{}", name.display())?;
            writeln!(out, "\trange:{}-{}", start, end)?;
        }
        Ok(())
    }

    pub fn load(target: &Path) -> Result<Self, SidecarError> {
        let data = fs::read_to_string(Self::sidecar_path(target))?;
        let mut lines = data.lines();

        let name = lines.next().ok_or(SidecarError::WrongFormat)?;
        let size = lines.next().ok_or(SidecarError::WrongFormat)?;
        let (Some(name), Some(size)) = (name.strip_prefix("name:"), size.strip_prefix("size:"))
        else {
            return Err(SidecarError::WrongFormat);
        };
        let size: u64 = size.trim().parse().map_err(|_| SidecarError::WrongFormat)?;

        let mut info = ChunkInfo::new(Path::new(name));
        info.size = size;

        while let Some(_marker) = lines.next() {
            let name = lines.next().ok_or(SidecarError::WrongFormat)?;
            let range = lines.next().ok_or(SidecarError::WrongFormat)?;
            let (Some(name), Some(range)) = (
                name.trim_start_matches('\t').strip_prefix("name:"),
                range.trim_start_matches('\t').strip_prefix("range:"),
            ) else {
                return Err(SidecarError::WrongFormat);
            };
            let (start, end) = range.split_once('-').ok_or(SidecarError::WrongFormat)?;
            let start: u64 = start.trim().parse().map_err(|_| SidecarError::WrongFormat)?;
            let end: u64 = end.trim().parse().map_err(|_| SidecarError::WrongFormat)?;
            info.chunks.push((PathBuf::from(name), (start, end)));
        }

        Ok(info)
    }

    /// Delete the sidecar; chunk files are the caller's concern.
    pub fn remove(&self) {
        let path = Self::sidecar_path(&self.target);
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_covers_size_without_gaps() {
        let mut info = ChunkInfo::new(Path::new("/tmp/out.bin"));
        info.set_size(1000);
        info.create_chunks(4);
        assert_eq!(info.count(), 4);
        assert_eq!(info.chunk_range(0), (0, 249));
        assert_eq!(info.chunk_range(1), (250, 499));
        assert_eq!(info.chunk_range(2), (500, 749));
        assert_eq!(info.chunk_range(3), (750, 999));
        // contiguous, gap-free cover of [0, size)
        for i in 1..info.count() {
            assert_eq!(info.chunk_range(i).0, info.chunk_range(i - 1).1 + 1);
        }
    }

    #[test]
    fn last_chunk_absorbs_remainder() {
        let mut info = ChunkInfo::new(Path::new("/tmp/out.bin"));
        info.set_size(1003);
        info.create_chunks(4);
        assert_eq!(info.chunk_range(3), (750, 1002));
        assert_eq!(info.chunk_len(3), 253);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("movie.mkv");
        let mut info = ChunkInfo::new(&target);
        info.set_size(10 * 1024 * 1024);
        info.create_chunks(4);
        info.save().unwrap();

        let loaded = ChunkInfo::load(&target).unwrap();
        assert_eq!(loaded, info);

        info.remove();
        assert!(matches!(
            ChunkInfo::load(&target),
            Err(SidecarError::Io(_))
        ));
    }

    #[test]
    fn sidecar_size_parses_to_integer() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f.bin");
        let mut info = ChunkInfo::new(&target);
        info.set_size(4096);
        info.create_chunks(2);
        info.save().unwrap();
        let loaded = ChunkInfo::load(&target).unwrap();
        assert_eq!(loaded.size(), 4096u64);
    }

    #[test]
    fn malformed_header_is_wrong_format() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f.bin");
        fs::write(ChunkInfo::sidecar_path(&target), "garbage\nlines\n").unwrap();
        assert!(matches!(
            ChunkInfo::load(&target),
            Err(SidecarError::WrongFormat)
        ));
    }

    #[test]
    fn truncated_chunk_block_is_wrong_format() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f.bin");
        fs::write(
            ChunkInfo::sidecar_path(&target),
            format!("name:{}\nsize:100\n#0:\n\tname:x.chunk0\n", target.display()),
        )
        .unwrap();
        assert!(matches!(
            ChunkInfo::load(&target),
            Err(SidecarError::WrongFormat)
        ));
    }

    #[test]
    fn malformed_range_is_wrong_format() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f.bin");
        fs::write(
            ChunkInfo::sidecar_path(&target),
            format!(
                "name:{}\nsize:100\n#0:\n\tname:x.chunk0\n\trange:abc-def\n",
                target.display()
            ),
        )
        .unwrap();
        assert!(matches!(
            ChunkInfo::load(&target),
            Err(SidecarError::WrongFormat)
        ));
    }
}
