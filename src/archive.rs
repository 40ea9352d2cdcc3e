//! Zip and unzip, the only archive operations the engine needs.

use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// Writes `entries` (archive name, source file) into a new archive at `dest`.
pub fn zip_files(entries: &[(String, PathBuf)], dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).context("create zip dir")?;
    }
    let file = fs::File::create(dest).with_context(|| format!("create zip {:?}", dest))?;
    let mut writer = zip::ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, source) in entries {
        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("start zip entry {name}"))?;
        let mut input =
            fs::File::open(source).with_context(|| format!("open {:?}", source))?;
        io::copy(&mut input, &mut writer).with_context(|| format!("write zip entry {name}"))?;
    }
    writer.finish().context("finish zip")?;
    Ok(())
}

/// Archive entry names for every file below `dir`, using `/` separators.
pub fn directory_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).context("rel path")?;
        entries.push((
            rel.to_string_lossy().replace('\\', "/"),
            entry.path().to_path_buf(),
        ));
    }
    Ok(entries)
}

/// Extracts `archive` into `dest` and returns the written files in archive order.
pub fn unzip(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let file = fs::File::open(archive).with_context(|| format!("open zip {:?}", archive))?;
    let mut archive = zip::ZipArchive::new(file).context("read zip")?;
    let mut written = Vec::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("zip entry")?;
        let Some(out_path) = file.enclosed_name() else {
            continue;
        };

        let out_path = dest.join(out_path);
        if file.is_dir() {
            fs::create_dir_all(&out_path).context("create zip dir")?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).context("create zip dir")?;
        }

        let mut out_file = fs::File::create(&out_path).context("write zip entry")?;
        io::copy(&mut file, &mut out_file).context("extract zip entry")?;
        if let Some(dt) = file.last_modified() {
            if let Some(mtime) = zip_time_to_unix(dt) {
                let mtime = FileTime::from_unix_time(mtime, 0);
                let _ = set_file_mtime(&out_path, mtime);
            }
        }
        written.push(out_path);
    }

    Ok(written)
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    let datetime = PrimitiveDateTime::new(date, time).assume_utc();
    Some(datetime.unix_timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn directory_zip_unzips_to_same_tree() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), "alpha").unwrap();
        fs::write(src.join("nested").join("b.txt"), "beta").unwrap();

        let archive = dir.path().join("out").join("bundle.zip");
        zip_files(&directory_entries(&src).unwrap(), &archive).unwrap();

        let dest = dir.path().join("dest");
        let written = unzip(&archive, &dest).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "alpha");
        assert_eq!(
            fs::read_to_string(dest.join("nested").join("b.txt")).unwrap(),
            "beta"
        );
    }
}
