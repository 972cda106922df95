// File identity: the stable (device, inode) key used to tell a rotated or
// renamed file apart from a genuinely new one. See spec section 4.C.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Stable cross-rename key for a file: `{device, inode}` on POSIX-like
/// systems, `{volume_serial, file_index}` on systems without inodes. Both
/// fields are named `device`/`inode` regardless of platform so the rest of
/// the crate never has to branch on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

impl FileIdentity {
    /// Synthetic identity for the `"-"` stdin sentinel path. Never equals a
    /// real file's identity (no stat-backed file ever reports `(0, 0)` on a
    /// POSIX device, and Windows file indices start from non-zero roots).
    pub const STDIN: FileIdentity = FileIdentity {
        device: 0,
        inode: 0,
    };

    pub fn from_metadata(meta: &Metadata) -> Self {
        read_identity(meta)
    }
}

/// A point-in-time snapshot of a stat call.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileStat {
    pub identity: FileIdentity,
    pub size: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub mtime: chrono::DateTime<chrono::Utc>,
}

impl FileStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        FileStat {
            identity: FileIdentity::from_metadata(meta),
            size: meta.len(),
            mtime: system_time_to_utc(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
        }
    }
}

pub fn system_time_to_utc(t: SystemTime) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::<chrono::Utc>::from(t)
}

/// `a.device == b.device && a.inode == b.inode`.
pub fn same_identity(a: &FileStat, b: &FileStat) -> bool {
    a.identity == b.identity
}

/// Scan `missing` (paths present last iteration, absent this one) for an
/// entry whose identity matches `new_stat`. Ties break on latest `mtime`,
/// then lexicographically least path.
pub fn is_rename_of<'a>(
    new_stat: &FileStat,
    missing: &'a HashMap<PathBuf, FileStat>,
) -> Option<&'a Path> {
    missing
        .iter()
        .filter(|(_, stat)| same_identity(stat, new_stat))
        .max_by(|(path_a, stat_a), (path_b, stat_b)| {
            stat_a
                .mtime
                .cmp(&stat_b.mtime)
                .then_with(|| path_b.cmp(path_a)) // lexicographically least wins the max_by tie
        })
        .map(|(path, _)| path.as_path())
}

#[cfg(unix)]
fn read_identity(meta: &Metadata) -> FileIdentity {
    use std::os::unix::fs::MetadataExt;
    FileIdentity {
        device: meta.dev(),
        inode: meta.ino(),
    }
}

#[cfg(windows)]
fn read_identity(meta: &Metadata) -> FileIdentity {
    use std::os::windows::fs::MetadataExt;
    FileIdentity {
        device: meta.volume_serial_number().unwrap_or(0) as u64,
        inode: meta.file_index().unwrap_or(0),
    }
}

#[cfg(not(any(unix, windows)))]
fn read_identity(_meta: &Metadata) -> FileIdentity {
    FileIdentity { device: 0, inode: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stat(device: u64, inode: u64, mtime_secs: i64, path_hint: &str) -> (PathBuf, FileStat) {
        (
            PathBuf::from(path_hint),
            FileStat {
                identity: FileIdentity { device, inode },
                size: 0,
                mtime: chrono::Utc.timestamp_opt(mtime_secs, 0).unwrap(),
            },
        )
    }

    #[test]
    fn identical_identities_are_equal() {
        let a = FileIdentity { device: 1, inode: 2 };
        let b = FileIdentity { device: 1, inode: 2 };
        assert_eq!(a, b);
    }

    #[test]
    fn rename_detection_picks_matching_identity() {
        let mut missing = HashMap::new();
        let (p, s) = stat(1, 2, 100, "/var/log/a.log.1");
        missing.insert(p.clone(), s);
        let new_stat = FileStat {
            identity: FileIdentity { device: 1, inode: 2 },
            size: 0,
            mtime: chrono::Utc.timestamp_opt(200, 0).unwrap(),
        };
        assert_eq!(is_rename_of(&new_stat, &missing), Some(p.as_path()));
    }

    #[test]
    fn rename_detection_ties_break_on_mtime_then_path() {
        let mut missing = HashMap::new();
        let (p1, s1) = stat(1, 2, 100, "/var/log/b.log.1");
        let (p2, s2) = stat(1, 2, 100, "/var/log/a.log.1");
        missing.insert(p1, s1);
        missing.insert(p2.clone(), s2);
        let new_stat = FileStat {
            identity: FileIdentity { device: 1, inode: 2 },
            size: 0,
            mtime: chrono::Utc.timestamp_opt(200, 0).unwrap(),
        };
        // same mtime on both candidates -> lexicographically least path wins
        assert_eq!(is_rename_of(&new_stat, &missing), Some(p2.as_path()));
    }

    #[test]
    fn rename_detection_no_match() {
        let mut missing = HashMap::new();
        let (p, s) = stat(1, 2, 100, "/var/log/a.log.1");
        missing.insert(p, s);
        let new_stat = FileStat {
            identity: FileIdentity { device: 9, inode: 9 },
            size: 0,
            mtime: chrono::Utc.timestamp_opt(200, 0).unwrap(),
        };
        assert_eq!(is_rename_of(&new_stat, &missing), None);
    }
}
