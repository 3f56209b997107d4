//! Workspace snapshots and generated-file policy.
//!
//! A snapshot is the set of file paths present under a CLI workspace at a
//! point in time; diffing a post-run snapshot against a pre-run one yields
//! the files the run created.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Directories never included in snapshots; they churn constantly and their
/// contents are not user deliverables.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "__pycache__", ".venv", "target"];

/// Extensions considered generator scripts rather than deliverables.
const SCRIPT_EXTENSIONS: &[&str] = &["py", "js", "ts", "sh", "rb", "pl", "ps1", "mjs"];

/// Extensions considered user-facing documents.
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "doc", "xlsx", "xls", "csv", "pptx", "md", "txt", "html", "png", "jpg", "jpeg",
    "svg", "json",
];

fn is_skipped_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| SKIPPED_DIRS.contains(&name))
            .unwrap_or(false)
}

/// Record the set of file paths currently present under `root`, recursively.
/// Unreadable entries are skipped; a snapshot is best-effort by design.
pub fn snapshot_workspace(root: &Path) -> HashSet<PathBuf> {
    let mut files = HashSet::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e))
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() {
            files.insert(entry.into_path());
        }
    }
    files
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

fn is_script(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| SCRIPT_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn is_document(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| DOCUMENT_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Apply the delivery policy to files created by a CLI run: when a run
/// produced both scripts and documents, the scripts are dropped. Users want
/// the output, not the generator that made it.
pub fn filter_generated_files(mut files: Vec<PathBuf>) -> Vec<PathBuf> {
    let has_scripts = files.iter().any(|f| is_script(f));
    let has_documents = files.iter().any(|f| is_document(f));
    if has_scripts && has_documents {
        files.retain(|f| !is_script(f));
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_snapshot_skips_noise_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("kept.txt"), "x").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "x").unwrap();

        let snapshot = snapshot_workspace(dir.path());
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(&dir.path().join("kept.txt")));
    }

    #[test]
    fn test_snapshot_diff_finds_created_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("existing.md"), "x").unwrap();
        let before = snapshot_workspace(dir.path());

        fs::write(dir.path().join("new.csv"), "a,b").unwrap();
        let after = snapshot_workspace(dir.path());

        let created: Vec<_> = after.difference(&before).collect();
        assert_eq!(created, vec![&dir.path().join("new.csv")]);
    }

    #[test]
    fn test_scripts_dropped_when_documents_present() {
        let files = vec![PathBuf::from("gen.py"), PathBuf::from("report.docx")];
        let kept = filter_generated_files(files);
        assert_eq!(kept, vec![PathBuf::from("report.docx")]);
    }

    #[test]
    fn test_scripts_kept_when_alone() {
        let files = vec![PathBuf::from("tool.sh"), PathBuf::from("helper.py")];
        let kept = filter_generated_files(files);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_mixed_documents_all_kept() {
        let files = vec![PathBuf::from("report.pdf"), PathBuf::from("data.csv")];
        let kept = filter_generated_files(files);
        assert_eq!(kept.len(), 2);
    }
}
