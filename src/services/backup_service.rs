use std::cmp::Ordering;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::server::BackupReport;

pub const ARCHIVE_EXTENSION: &str = "tar.gz";

lazy_static! {
    static ref BACKUP_NAME: Regex =
        Regex::new(r"^(\d{4}-\d{2}-\d{2})_(\d+)_(.+)\.tar\.gz$").expect("valid backup name pattern");
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("source directory not found: {0}")]
    MissingSource(PathBuf),
    #[error("backup '{0}' already exists")]
    AlreadyExists(PathBuf),
}

/// The parsed components of `{date}_{index}_{server}.tar.gz`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupName<'a> {
    pub date: &'a str,
    pub index: u32,
    pub server: &'a str,
}

pub fn parse_backup_name(file_name: &str) -> Option<BackupName<'_>> {
    let caps = BACKUP_NAME.captures(file_name)?;
    Some(BackupName {
        date: caps.get(1)?.as_str(),
        index: caps.get(2)?.as_str().parse().ok()?,
        server: caps.get(3)?.as_str(),
    })
}

/// Orders backup names by date, then by numeric index.
///
/// Names that don't parse sort before valid ones, by plain string order.
pub fn compare_backup_names(a: &str, b: &str) -> Ordering {
    match (parse_backup_name(a), parse_backup_name(b)) {
        (Some(a), Some(b)) => a
            .date
            .cmp(b.date)
            .then(a.index.cmp(&b.index))
            .then(a.server.cmp(b.server)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

pub fn backup_file_name(date: NaiveDate, index: u32, server_name: &str) -> String {
    format!(
        "{}_{}_{}.{}",
        date.format("%Y-%m-%d"),
        index,
        server_name,
        ARCHIVE_EXTENSION
    )
}

/// Every valid archive of `server_name` in `backup_dir`, oldest first.
pub fn list_backups(backup_dir: &Path, server_name: &str) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    // anything occupying an archive name counts, so its index is never reused
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if parse_backup_name(&name).is_some_and(|parsed| parsed.server == server_name) {
            names.push(name);
        }
    }

    names.sort_by(|a, b| compare_backup_names(a, b));
    Ok(names.into_iter().map(|n| backup_dir.join(n)).collect())
}

/// Index for the next archive made on `date`: one past the highest existing index, or 0.
pub fn next_index(backup_dir: &Path, date: NaiveDate, server_name: &str) -> io::Result<u32> {
    let day = date.format("%Y-%m-%d").to_string();
    let last = list_backups(backup_dir, server_name)?
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
        .filter_map(parse_backup_name)
        .filter(|parsed| parsed.date == day)
        .map(|parsed| parsed.index)
        .max();

    Ok(last.map_or(0, |i| i + 1))
}

/// Deletes the oldest archives until at most `keep` remain. `keep == 0` keeps everything.
///
/// An archive that can't be deleted is logged and skipped, the rest are still pruned.
pub fn enforce_retention(
    backup_dir: &Path,
    server_name: &str,
    keep: u32,
) -> io::Result<Vec<PathBuf>> {
    if keep == 0 {
        return Ok(Vec::new());
    }

    let backups = list_backups(backup_dir, server_name)?;
    let excess = backups.len().saturating_sub(keep as usize);
    let mut removed = Vec::with_capacity(excess);
    for path in backups.into_iter().take(excess) {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(server = %server_name, "removed old backup {}", path.display());
                removed.push(path);
            }
            Err(e) => warn!(
                server = %server_name,
                "failed to remove old backup {}: {}",
                path.display(),
                e
            ),
        }
    }
    Ok(removed)
}

pub fn create_backup(
    source_dir: &Path,
    backup_dir: &Path,
    server_name: &str,
    max_backups: u32,
) -> Result<BackupReport, BackupError> {
    let today = chrono::Local::now().date_naive();
    create_backup_on(today, source_dir, backup_dir, server_name, max_backups)
}

/// Archives `source_dir` into `backup_dir` under the next free index for `date`.
pub fn create_backup_on(
    date: NaiveDate,
    source_dir: &Path,
    backup_dir: &Path,
    server_name: &str,
    max_backups: u32,
) -> Result<BackupReport, BackupError> {
    let started = Instant::now();

    if !source_dir.is_dir() {
        return Err(BackupError::MissingSource(source_dir.to_path_buf()));
    }
    std::fs::create_dir_all(backup_dir)?;

    let index = next_index(backup_dir, date, server_name)?;
    let file_name = backup_file_name(date, index, server_name);
    let final_path = backup_dir.join(&file_name);
    if final_path.exists() {
        return Err(BackupError::AlreadyExists(final_path));
    }

    // Hidden partial name never matches the archive pattern.
    let partial_path = backup_dir.join(format!(".{}.partial", file_name));
    info!(
        server = %server_name,
        "creating '{}' from '{}'",
        final_path.display(),
        source_dir.display()
    );

    if let Err(e) = write_archive(source_dir, &partial_path) {
        if let Err(cleanup) = std::fs::remove_file(&partial_path) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!(server = %server_name, "failed to remove partial backup: {}", cleanup);
            }
        }
        return Err(e.into());
    }
    std::fs::rename(&partial_path, &final_path)?;

    let size_bytes = std::fs::metadata(&final_path)?.len();
    // the archive is complete at this point, pruning problems don't fail it
    let removed = enforce_retention(backup_dir, server_name, max_backups).unwrap_or_else(|e| {
        warn!(server = %server_name, "failed to apply backup retention: {}", e);
        Vec::new()
    });

    Ok(BackupReport {
        path: final_path,
        size_bytes,
        elapsed_ms: started.elapsed().as_millis() as u64,
        removed,
    })
}

// tar framing streams straight into the gzip encoder, no intermediate .tar on disk
fn write_archive(source_dir: &Path, dest: &Path) -> io::Result<()> {
    let file = File::options().write(true).create_new(true).open(dest)?;
    let enc = GzEncoder::new(file, Compression::best());
    let mut tar = tar::Builder::new(enc);

    let root = source_dir
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    tar.append_dir_all(root, source_dir)?;

    let file = tar.into_inner()?.finish()?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn world(dir: &TempDir) -> PathBuf {
        let world = dir.path().join("world");
        std::fs::create_dir_all(world.join("region")).unwrap();
        std::fs::write(world.join("level.dat"), b"level").unwrap();
        std::fs::write(world.join("region/r.0.0.mca"), vec![7u8; 4096]).unwrap();
        world
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    fn file_names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn parses_valid_names_only() {
        let parsed = parse_backup_name("2024-01-01_12_alpha_beta.tar.gz").unwrap();
        assert_eq!(parsed.date, "2024-01-01");
        assert_eq!(parsed.index, 12);
        assert_eq!(parsed.server, "alpha_beta");

        assert!(parse_backup_name("2024-01-01_x_alpha.tar.gz").is_none());
        assert!(parse_backup_name("2024-01-01_1_alpha.zip").is_none());
        assert!(parse_backup_name(".2024-01-01_1_alpha.tar.gz.partial").is_none());
    }

    #[test]
    fn comparator_orders_index_numerically() {
        let mut names = vec![
            "2024-01-02_0_alpha.tar.gz",
            "2024-01-01_10_alpha.tar.gz",
            "2024-01-01_9_alpha.tar.gz",
            "2024-01-01_1_alpha.tar.gz",
        ];
        names.sort_by(|a, b| compare_backup_names(a, b));
        assert_eq!(
            names,
            [
                "2024-01-01_1_alpha.tar.gz",
                "2024-01-01_9_alpha.tar.gz",
                "2024-01-01_10_alpha.tar.gz",
                "2024-01-02_0_alpha.tar.gz",
            ]
        );
    }

    #[test]
    fn next_index_crosses_double_digits() {
        let dir = TempDir::new().unwrap();
        assert_eq!(next_index(dir.path(), day(1), "alpha").unwrap(), 0);

        for i in 0..10 {
            touch(dir.path(), &backup_file_name(day(1), i, "alpha"));
        }
        assert_eq!(next_index(dir.path(), day(1), "alpha").unwrap(), 10);

        touch(dir.path(), &backup_file_name(day(1), 10, "alpha"));
        assert_eq!(next_index(dir.path(), day(1), "alpha").unwrap(), 11);
    }

    #[test]
    fn next_index_ignores_other_days_servers_and_junk() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "2024-01-01_5_alpha.tar.gz");
        touch(dir.path(), "2024-01-02_7_beta.tar.gz");
        touch(dir.path(), "2024-01-02_99_alpha.zip");
        touch(dir.path(), "notes.txt");

        assert_eq!(next_index(dir.path(), day(2), "alpha").unwrap(), 0);
        assert_eq!(next_index(dir.path(), day(1), "alpha").unwrap(), 6);
    }

    #[test]
    fn same_day_backups_increment_index() {
        let dir = TempDir::new().unwrap();
        let source = world(&dir);
        let backups = dir.path().join("backups/alpha");

        let first = create_backup_on(day(1), &source, &backups, "alpha", 0).unwrap();
        let second = create_backup_on(day(1), &source, &backups, "alpha", 0).unwrap();

        assert_eq!(first.path, backups.join("2024-01-01_0_alpha.tar.gz"));
        assert_eq!(second.path, backups.join("2024-01-01_1_alpha.tar.gz"));
        assert!(first.size_bytes > 0);
        assert!(first.removed.is_empty());
    }

    #[test]
    fn archive_contains_world_tree() {
        let dir = TempDir::new().unwrap();
        let source = world(&dir);
        let backups = dir.path().join("backups");

        let report = create_backup_on(day(3), &source, &backups, "alpha", 0).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&report.path).unwrap()));
        let mut entries: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        assert!(entries.contains(&"world/level.dat".to_string()));
        assert!(entries.contains(&"world/region/r.0.0.mca".to_string()));

        let leftovers: Vec<_> = std::fs::read_dir(&backups)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_source_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backups");

        let err = create_backup_on(day(1), &dir.path().join("nope"), &backups, "alpha", 0);
        assert!(matches!(err, Err(BackupError::MissingSource(_))));
        assert!(list_backups(&backups, "alpha").unwrap().is_empty());
    }

    #[test]
    fn retention_removes_oldest_first() {
        let dir = TempDir::new().unwrap();
        let source = world(&dir);
        let backups = dir.path().join("backups");

        touch(&backups_dir(&backups), "2023-12-31_3_alpha.tar.gz");
        for _ in 0..3 {
            create_backup_on(day(1), &source, &backups, "alpha", 0).unwrap();
        }
        let report = create_backup_on(day(2), &source, &backups, "alpha", 3).unwrap();

        assert_eq!(
            file_names(&report.removed),
            ["2023-12-31_3_alpha.tar.gz", "2024-01-01_0_alpha.tar.gz"]
        );
        assert_eq!(
            file_names(&list_backups(&backups, "alpha").unwrap()),
            [
                "2024-01-01_1_alpha.tar.gz",
                "2024-01-01_2_alpha.tar.gz",
                "2024-01-02_0_alpha.tar.gz",
            ]
        );
    }

    #[test]
    fn undeletable_old_archive_does_not_fail_backup() {
        let dir = TempDir::new().unwrap();
        let source = world(&dir);
        let backups = backups_dir(&dir.path().join("backups"));

        std::fs::create_dir(backups.join("2023-12-30_0_alpha.tar.gz")).unwrap();
        touch(&backups, "2023-12-31_0_alpha.tar.gz");

        let report = create_backup_on(day(1), &source, &backups, "alpha", 1).unwrap();

        assert!(report.path.exists());
        assert_eq!(file_names(&report.removed), ["2023-12-31_0_alpha.tar.gz"]);
        assert_eq!(
            file_names(&list_backups(&backups, "alpha").unwrap()),
            ["2023-12-30_0_alpha.tar.gz", "2024-01-01_0_alpha.tar.gz"]
        );
    }

    fn backups_dir(path: &Path) -> PathBuf {
        std::fs::create_dir_all(path).unwrap();
        path.to_path_buf()
    }
}
