//! Flattening extraction and deterministic packing of zip archives.
//!
//! `pack_dir` output depends only on the (relative path, content) pairs under the source
//! directory: entries are visited in a fixed order and every entry carries the same
//! timestamp, permissions and compression settings.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime as ZipDateTime, ZipArchive, ZipWriter};

pub const CRATE_NAME: &str = "mapsnap-archive";

/// Platform metadata directory dropped on both extraction and packing.
pub const JUNK_DIR: &str = "__MACOSX";

/// Timestamp stamped on every packed entry: 2015-11-28 00:00:00.
pub const FIXED_ENTRY_TIME: (u16, u8, u8, u8, u8, u8) = (2015, 11, 28, 0, 0, 0);

pub const COMPRESSION_LEVEL: i64 = 6;
const ENTRY_PERMISSIONS: u32 = 0o644;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("reading archive: {0}")]
    Zip(#[from] ZipError),
    #[error("writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum PackError {
    #[error("walking {}: {source}", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("zip error on entry {entry}: {source}")]
    Zip {
        entry: String,
        #[source]
        source: ZipError,
    },
    #[error("fixed entry timestamp is out of range")]
    Timestamp,
    #[error(
        "archive {} would be written inside its own source {}",
        .archive.display(),
        .source_dir.display()
    )]
    OutputInsideSource { archive: PathBuf, source_dir: PathBuf },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub written: usize,
    pub skipped: usize,
    pub overwritten: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackSummary {
    pub entries: usize,
    pub bytes_in: u64,
}

fn name_components(name: &str) -> impl Iterator<Item = &str> {
    name.split(['/', '\\'])
}

fn is_junk_entry(name: &str) -> bool {
    name_components(name).any(|c| c == JUNK_DIR)
}

/// Final component of an archive entry name, if it names a writable file.
///
/// The basename must join onto the target as exactly one normal component on every
/// platform: drive prefixes (`C:name`) and NTFS stream suffixes (`name:stream`) are refused.
fn flat_basename(name: &str) -> Option<&str> {
    let base = name_components(name).last()?;
    if base.contains(':') {
        return None;
    }
    let mut components = Path::new(base).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(base),
        _ => None,
    }
}

/// Unpacks a zip held in memory into `target_dir`, discarding all directory structure.
///
/// Only the basename of each entry is joined onto `target_dir`, so traversal sequences in
/// entry names cannot escape it. When two entries share a basename the later one wins.
/// Failures abort immediately and leave already written files in place.
pub fn extract_flat(archive_bytes: &[u8], target_dir: &Path) -> Result<ExtractSummary, ExtractError> {
    fs::create_dir_all(target_dir).map_err(|source| ExtractError::Io {
        path: target_dir.to_path_buf(),
        source,
    })?;

    let mut archive = ZipArchive::new(Cursor::new(archive_bytes))?;
    let mut summary = ExtractSummary::default();
    let mut seen: HashSet<String> = HashSet::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();

        if entry.is_dir() || is_junk_entry(&name) {
            summary.skipped += 1;
            continue;
        }
        let Some(base) = flat_basename(&name) else {
            summary.skipped += 1;
            continue;
        };

        let target = target_dir.join(base);
        let mut out = File::create(&target).map_err(|source| ExtractError::Io {
            path: target.clone(),
            source,
        })?;
        io::copy(&mut entry, &mut out).map_err(|source| ExtractError::Io {
            path: target.clone(),
            source,
        })?;

        if !seen.insert(base.to_string()) {
            debug!(entry = %name, basename = base, "flattened entry overwrote an earlier one");
            summary.overwritten += 1;
        }
        summary.written += 1;
    }

    Ok(summary)
}

fn is_junk_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name() == JUNK_DIR
}

fn relative_entry_name(source_dir: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(source_dir).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn entry_options() -> Result<SimpleFileOptions, PackError> {
    let (year, month, day, hour, minute, second) = FIXED_ENTRY_TIME;
    let fixed_time = ZipDateTime::from_date_and_time(year, month, day, hour, minute, second)
        .map_err(|_| PackError::Timestamp)?;
    Ok(SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(COMPRESSION_LEVEL))
        .last_modified_time(fixed_time)
        .unix_permissions(ENTRY_PERMISSIONS))
}

/// Packs every regular file under `source_dir` into a deterministic zip at `archive_path`.
///
/// Within each directory files come before subdirectories and both are sorted by name.
/// On failure the partially written archive is removed.
pub fn pack_dir(source_dir: &Path, archive_path: &Path) -> Result<PackSummary, PackError> {
    if archive_path.starts_with(source_dir) {
        return Err(PackError::OutputInsideSource {
            archive: archive_path.to_path_buf(),
            source_dir: source_dir.to_path_buf(),
        });
    }

    let result = write_archive(source_dir, archive_path);
    if result.is_err() {
        let _ = fs::remove_file(archive_path);
    }
    result
}

fn write_archive(source_dir: &Path, archive_path: &Path) -> Result<PackSummary, PackError> {
    let options = entry_options()?;
    let out = File::create(archive_path).map_err(|source| PackError::Io {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut zip = ZipWriter::new(out);
    let mut summary = PackSummary::default();

    let walker = WalkDir::new(source_dir)
        .sort_by(|a, b| {
            a.file_type()
                .is_dir()
                .cmp(&b.file_type().is_dir())
                .then_with(|| a.file_name().cmp(b.file_name()))
        })
        .into_iter()
        .filter_entry(|e| !is_junk_dir(e));

    for entry in walker {
        let entry = entry.map_err(|source| PackError::Walk {
            path: source_dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = relative_entry_name(source_dir, entry.path()) else {
            continue;
        };

        let mut src = File::open(entry.path()).map_err(|source| PackError::Io {
            path: entry.path().to_path_buf(),
            source,
        })?;
        zip.start_file(name.clone(), options)
            .map_err(|source| PackError::Zip {
                entry: name.clone(),
                source,
            })?;
        let copied = io::copy(&mut src, &mut zip).map_err(|source| PackError::Io {
            path: entry.path().to_path_buf(),
            source,
        })?;

        summary.entries += 1;
        summary.bytes_in += copied;
    }

    zip.finish().map_err(|source| PackError::Zip {
        entry: "<central directory>".to_string(),
        source,
    })?;
    debug!(
        archive = %archive_path.display(),
        entries = summary.entries,
        bytes_in = summary.bytes_in,
        "packed archive"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn zip_bytes(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, body) in entries {
            match body {
                Some(bytes) => {
                    zip.start_file(*name, options).expect("start file");
                    zip.write_all(bytes).expect("write entry");
                }
                None => {
                    zip.add_directory(*name, options).expect("add dir");
                }
            }
        }
        zip.finish().expect("finish").into_inner()
    }

    fn write_with_mtime(path: &Path, bytes: &[u8], secs: u64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("parent");
        }
        fs::write(path, bytes).expect("write");
        let file = File::options().write(true).open(path).expect("open");
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .expect("set mtime");
    }

    fn entry_names(archive_path: &Path) -> Vec<String> {
        let mut archive = ZipArchive::new(File::open(archive_path).expect("open")).expect("zip");
        (0..archive.len())
            .map(|i| archive.by_index(i).expect("entry").name().to_string())
            .collect()
    }

    fn read_entry(archive_path: &Path, name: &str) -> Vec<u8> {
        let mut archive = ZipArchive::new(File::open(archive_path).expect("open")).expect("zip");
        let mut entry = archive.by_name(name).expect("entry");
        let mut out = Vec::new();
        entry.read_to_end(&mut out).expect("read");
        out
    }

    #[test]
    fn extraction_flattens_nested_entries() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("Bank");
        let bytes = zip_bytes(&[
            ("Bank/", None),
            ("Bank/floors/1F.png", Some(b"first floor")),
            ("Bank/floors/deep/2F.png", Some(b"second floor")),
            ("readme.txt", Some(b"hi")),
        ]);

        let summary = extract_flat(&bytes, &target).expect("extract");

        assert_eq!(summary.written, 3);
        assert_eq!(summary.skipped, 1);
        let mut names: Vec<_> = fs::read_dir(&target)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["1F.png", "2F.png", "readme.txt"]);
        assert_eq!(fs::read(target.join("2F.png")).unwrap(), b"second floor");
    }

    #[test]
    fn extraction_skips_junk_and_directory_only_entries() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("out");
        let bytes = zip_bytes(&[
            ("__MACOSX/Bank/._1F.png", Some(b"resource fork")),
            ("Bank/__MACOSX/meta", Some(b"junk")),
            ("Bank/1F.png", Some(b"png")),
            ("Bank/dot/.", Some(b"dot")),
        ]);

        let summary = extract_flat(&bytes, &target).expect("extract");

        assert_eq!(summary.written, 1);
        assert_eq!(summary.skipped, 3);
        assert!(target.join("1F.png").exists());
        assert!(!target.join("._1F.png").exists());
        assert!(!target.join("meta").exists());
    }

    #[test]
    fn later_entry_wins_on_basename_collision() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("out");
        let bytes = zip_bytes(&[
            ("a/map.png", Some(b"from a")),
            ("b/map.png", Some(b"from b")),
        ]);

        let summary = extract_flat(&bytes, &target).expect("extract");

        assert_eq!(summary.overwritten, 1);
        assert_eq!(fs::read_dir(&target).unwrap().count(), 1);
        assert_eq!(fs::read(target.join("map.png")).unwrap(), b"from b");
    }

    #[test]
    fn traversal_names_never_escape_target() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("nested").join("out");
        let bytes = zip_bytes(&[
            ("../../escape.txt", Some(b"x")),
            ("/abs/rooted.txt", Some(b"y")),
            ("..\\..\\windows.txt", Some(b"z")),
            ("evil/..", Some(b"w")),
        ]);

        extract_flat(&bytes, &target).expect("extract");

        assert!(target.join("escape.txt").exists());
        assert!(target.join("rooted.txt").exists());
        assert!(target.join("windows.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
        assert!(!dir.path().join("nested").join("escape.txt").exists());
        let outside: Vec<_> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(outside, vec![std::ffi::OsString::from("out")]);
    }

    #[test]
    fn drive_prefixed_and_stream_names_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("out");
        let bytes = zip_bytes(&[
            ("C:evil.txt", Some(b"drive relative")),
            ("Bank/D:evil.txt", Some(b"drive relative nested")),
            ("Bank/ads.png:stream", Some(b"alternate stream")),
            ("Bank/1F.png", Some(b"png")),
        ]);

        let summary = extract_flat(&bytes, &target).expect("extract");

        assert_eq!(summary.written, 1);
        assert_eq!(summary.skipped, 3);
        let names: Vec<_> = fs::read_dir(&target)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["1F.png"]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn basename_must_be_a_single_normal_component() {
        assert_eq!(flat_basename("Bank/floors/1F.png"), Some("1F.png"));
        assert_eq!(flat_basename("Bank\\1F.png"), Some("1F.png"));
        assert_eq!(flat_basename("C:evil.txt"), None);
        assert_eq!(flat_basename("Bank/.."), None);
        assert_eq!(flat_basename("Bank/"), None);
    }

    #[test]
    fn corrupt_archive_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let err = extract_flat(b"this is not a zip", &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ExtractError::Zip(_)));
    }

    #[test]
    fn pack_is_independent_of_creation_order_and_mtime() {
        let dir = tempdir().expect("tempdir");
        let a = dir.path().join("a");
        let b = dir.path().join("b");

        write_with_mtime(&a.join("Bank/1F.png"), b"bank 1f", 1_000);
        write_with_mtime(&a.join("Bank/2F.png"), b"bank 2f", 2_000);
        write_with_mtime(&a.join("Border/1F.png"), b"border", 3_000);

        write_with_mtime(&b.join("Border/1F.png"), b"border", 900_000);
        write_with_mtime(&b.join("Bank/2F.png"), b"bank 2f", 800_000);
        write_with_mtime(&b.join("Bank/1F.png"), b"bank 1f", 700_000);

        let out_a = dir.path().join("a.zip");
        let out_b = dir.path().join("b.zip");
        let summary = pack_dir(&a, &out_a).expect("pack a");
        pack_dir(&b, &out_b).expect("pack b");

        assert_eq!(summary.entries, 3);
        assert_eq!(fs::read(&out_a).unwrap(), fs::read(&out_b).unwrap());
        assert_eq!(
            mapsnap_storage::sha256_file(&out_a).unwrap(),
            mapsnap_storage::sha256_file(&out_b).unwrap()
        );
    }

    #[test]
    fn pack_orders_entries_and_uses_forward_slashes() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("maps");
        write_with_mtime(&src.join("b/z.png"), b"z", 1);
        write_with_mtime(&src.join("b/a.png"), b"a", 1);
        write_with_mtime(&src.join("a/nested/x.png"), b"x", 1);
        write_with_mtime(&src.join("a/y.png"), b"y", 1);
        write_with_mtime(&src.join("top.txt"), b"t", 1);
        write_with_mtime(&src.join("__MACOSX/._top.txt"), b"junk", 1);

        let out = dir.path().join("maps.zip");
        pack_dir(&src, &out).expect("pack");

        assert_eq!(
            entry_names(&out),
            vec!["top.txt", "a/y.png", "a/nested/x.png", "b/a.png", "b/z.png"]
        );
        assert_eq!(read_entry(&out, "a/nested/x.png"), b"x");
    }

    #[test]
    fn pack_of_empty_dir_is_a_valid_archive() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("empty");
        fs::create_dir_all(&src).unwrap();
        let out = dir.path().join("empty.zip");

        let summary = pack_dir(&src, &out).expect("pack");

        assert_eq!(summary.entries, 0);
        assert!(entry_names(&out).is_empty());
    }

    #[test]
    fn pack_fails_without_output_for_missing_source() {
        let dir = tempdir().expect("tempdir");
        let out = dir.path().join("out.zip");

        let err = pack_dir(&dir.path().join("missing"), &out).unwrap_err();

        assert!(matches!(err, PackError::Walk { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn pack_refuses_to_write_into_its_source() {
        let dir = tempdir().expect("tempdir");
        let err = pack_dir(dir.path(), &dir.path().join("self.zip")).unwrap_err();
        assert!(matches!(err, PackError::OutputInsideSource { .. }));
    }
}
