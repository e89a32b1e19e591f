//! Heuristic pre-filter over an extracted bundle.
//!
//! This is a substring deny-list, nothing more. It is trivially bypassed by
//! obfuscation or compiled code and is not an isolation boundary; the sandbox
//! in [`crate::sandbox`] is what actually constrains a running server.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

const MAX_SCAN_FILE_BYTES: u64 = 1024 * 1024;

pub const DENY_LIST: &[&str] = &[
    "rm -rf",
    "sudo",
    "chmod 777",
    "eval(",
    "os.system",
    "mkfs",
    "dd if=",
    ":(){ :|:& };:",
    "/etc/shadow",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Clean,
    Flagged { file: PathBuf, pattern: &'static str },
}

pub fn scan_tree(root: &Path) -> anyhow::Result<ScanOutcome> {
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.len() > MAX_SCAN_FILE_BYTES {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        if let Some(pattern) = DENY_LIST.iter().find(|p| text.contains(**p)) {
            let file = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf();
            return Ok(ScanOutcome::Flagged { file, pattern });
        }
    }
    Ok(ScanOutcome::Clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn clean_tree_passes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("server.py"), "print('hello')\n").unwrap();
        assert_eq!(scan_tree(dir.path()).unwrap(), ScanOutcome::Clean);
    }

    #[test]
    fn first_offending_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        fs::write(dir.path().join("lib/b.py"), "import os\nos.system('id')\n").unwrap();
        fs::write(dir.path().join("lib/c.sh"), "rm -rf /\n").unwrap();

        match scan_tree(dir.path()).unwrap() {
            ScanOutcome::Flagged { file, pattern } => {
                assert_eq!(file, PathBuf::from("lib/b.py"));
                assert_eq!(pattern, "os.system");
            }
            other => panic!("expected flag, got {other:?}"),
        }
    }

    #[test]
    fn sudo_is_caught_regardless_of_what_follows() {
        for body in ["sudo\treboot\n", "exec sudo\n", "exec sudo"] {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("run.sh"), body).unwrap();
            assert_eq!(
                scan_tree(dir.path()).unwrap(),
                ScanOutcome::Flagged {
                    file: PathBuf::from("run.sh"),
                    pattern: "sudo"
                }
            );
        }
    }

    #[test]
    fn binary_and_oversized_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, b'r', b'm', b' ', b'-', b'r', b'f'])
            .unwrap();
        let mut big = "a".repeat(MAX_SCAN_FILE_BYTES as usize);
        big.push_str("sudo reboot");
        fs::write(dir.path().join("big.txt"), big).unwrap();
        assert_eq!(scan_tree(dir.path()).unwrap(), ScanOutcome::Clean);
    }
}
