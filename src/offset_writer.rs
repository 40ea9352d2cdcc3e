//! In-place byte range edits that remember earlier edits to the same file.
//!
//! Offsets handed to [`ByteOffsetWriter::write_range`] are logical: they refer
//! to the file as it looked before this session touched it. Every recorded
//! write shifts the bytes that follow it, so later logical offsets are
//! translated by the net size change of all earlier writes starting at or
//! before them.

use crate::error::WriteError;
use anyhow::{Context, Result};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub local_start_offset: i64,
    pub local_end_offset: i64,
    pub bytes_written: i64,
    /// Net size change; negative when a replacement is shorter than its span.
    pub bytes_added: i64,
}

#[derive(Debug, Default)]
pub struct ByteOffsetWriter {
    writes: HashMap<PathBuf, Vec<WriteRecord>>,
}

impl ByteOffsetWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, path: &Path) -> &[WriteRecord] {
        self.writes.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns false when `[start, end)` starts inside an earlier write, or
    /// (for a non-empty span) ends inside one.
    pub fn can_write(&self, path: &Path, start: i64, end: i64) -> bool {
        self.records(path).iter().all(|record| {
            let inside = |offset: i64| {
                offset > record.local_start_offset && offset < record.local_end_offset
            };
            !(inside(start) || (end != start && inside(end)))
        })
    }

    /// Splices `content` over the logical range `[start, end)` of `path`.
    ///
    /// `start == end` inserts. With `ignore_cache` the offsets are used as
    /// physical offsets and the write is not remembered.
    pub fn write_range(
        &mut self,
        path: &Path,
        content: &[u8],
        start: i64,
        end: i64,
        ignore_cache: bool,
    ) -> Result<WriteRecord> {
        if start < 0 || end < start {
            return Err(WriteError::InvalidRange {
                path: path.to_path_buf(),
                start,
                end,
            }
            .into());
        }

        let (physical_start, physical_end) = if ignore_cache {
            (start, end)
        } else {
            (self.translate(path, start), self.translate(path, end))
        };

        let mut bytes = fs::read(path).with_context(|| format!("read {:?}", path))?;
        let len = bytes.len() as i64;
        if physical_start > len || physical_end > len {
            return Err(WriteError::OutOfBounds {
                path: path.to_path_buf(),
                start: physical_start,
                end: physical_end,
                len,
            }
            .into());
        }

        bytes.splice(
            physical_start as usize..physical_end as usize,
            content.iter().copied(),
        );
        fs::write(path, &bytes).with_context(|| format!("write {:?}", path))?;

        let record = WriteRecord {
            local_start_offset: start,
            local_end_offset: end,
            bytes_written: content.len() as i64,
            bytes_added: content.len() as i64 - (physical_end - physical_start),
        };
        debug!(
            file = %path.display(),
            start,
            end,
            physical_start,
            bytes_added = record.bytes_added,
            "byte range written"
        );
        if !ignore_cache {
            self.writes.entry(path.to_path_buf()).or_default().push(record);
        }
        Ok(record)
    }

    /// Inserts `content` at `start`.
    pub fn insert(&mut self, path: &Path, content: &[u8], start: i64) -> Result<WriteRecord> {
        self.write_range(path, content, start, start, false)
    }

    /// Overwrites `content.len()` bytes starting at `start`.
    pub fn replace(&mut self, path: &Path, content: &[u8], start: i64) -> Result<WriteRecord> {
        self.write_range(path, content, start, start + content.len() as i64, false)
    }

    fn translate(&self, path: &Path, offset: i64) -> i64 {
        let mut records: Vec<&WriteRecord> = self.records(path).iter().collect();
        // Stable sort: writes that share a start offset keep their input order.
        records.sort_by_key(|record| record.local_start_offset);
        offset
            + records
                .iter()
                .filter(|record| record.local_start_offset <= offset)
                .map(|record| record.bytes_added)
                .sum::<i64>()
    }
}

/// Returns `path` if it is free, otherwise the first free `stem_N.ext` sibling.
pub fn unique_path(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }
    let parent = path.parent().context("unique path parent")?;
    let stem = path
        .file_stem()
        .context("unique path stem")?
        .to_string_lossy()
        .to_string();
    let extension = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()));

    let taken: HashSet<String> = fs::read_dir(parent)
        .with_context(|| format!("list {:?}", parent))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();

    let mut index = 1usize;
    loop {
        let name = format!("{stem}_{index}{}", extension.as_deref().unwrap_or(""));
        if !taken.contains(&name) {
            return Ok(parent.join(name));
        }
        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ALPHABET: &str = "abcdefghijklmnopqrstuvqxyz1234567890";

    fn fixture(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("target.txt");
        fs::write(&path, ALPHABET).unwrap();
        path
    }

    #[test]
    fn inserts_land_at_logical_offsets_in_any_order() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let mut writer = ByteOffsetWriter::new();

        writer.insert(&path, b"Test1", 12).unwrap();
        writer.insert(&path, b"Test2", 2).unwrap();
        writer.insert(&path, b"Test3", 30).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "abTest2cdefghijklTest1mnopqrstuvqxyz1234Test3567890"
        );
    }

    #[test]
    fn insert_order_does_not_change_result() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let mut writer = ByteOffsetWriter::new();

        writer.insert(&path, b"Test3", 30).unwrap();
        writer.insert(&path, b"Test1", 12).unwrap();
        writer.insert(&path, b"Test2", 2).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "abTest2cdefghijklTest1mnopqrstuvqxyz1234Test3567890"
        );
    }

    #[test]
    fn replace_reports_net_size_change() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let mut writer = ByteOffsetWriter::new();

        let grow = writer.write_range(&path, b"XYZW", 0, 2, false).unwrap();
        assert_eq!(grow.bytes_added, 2);
        let shrink = writer.write_range(&path, b"!", 10, 14, false).unwrap();
        assert_eq!(shrink.bytes_added, -3);
        let same = writer.replace(&path, b"##", 20).unwrap();
        assert_eq!(same.bytes_added, 0);

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "XYZWcdefghij!opqrst##qxyz1234567890"
        );
    }

    #[test]
    fn replace_past_end_is_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let mut writer = ByteOffsetWriter::new();

        let err = writer.replace(&path, b"too long", 32).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WriteError>(),
            Some(WriteError::OutOfBounds { .. })
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), ALPHABET);
        assert!(writer.records(&path).is_empty());
    }

    #[test]
    fn ignore_cache_uses_physical_offsets_and_is_not_recorded() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let mut writer = ByteOffsetWriter::new();

        writer.insert(&path, b"__", 0).unwrap();
        writer.write_range(&path, b"|", 2, 2, true).unwrap();

        assert_eq!(writer.records(&path).len(), 1);
        assert!(fs::read_to_string(&path).unwrap().starts_with("__|ab"));
    }

    #[test]
    fn overlapping_ranges_cannot_be_written() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let mut writer = ByteOffsetWriter::new();
        writer.write_range(&path, b"0123", 4, 8, false).unwrap();

        assert!(!writer.can_write(&path, 5, 5));
        assert!(!writer.can_write(&path, 0, 6));
        assert!(writer.can_write(&path, 8, 10));
        assert!(writer.can_write(&path, 0, 4));
        assert!(writer.can_write(Path::new("other"), 5, 6));
    }

    #[test]
    fn unique_path_appends_counter_before_extension() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("file.txt");
        assert_eq!(unique_path(&base).unwrap(), base);

        fs::write(&base, "a").unwrap();
        fs::write(dir.path().join("file_1.txt"), "b").unwrap();
        assert_eq!(unique_path(&base).unwrap(), dir.path().join("file_2.txt"));
    }
}
