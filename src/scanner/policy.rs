//! Threat decision functions for scan cycles.
//!
//! A policy looks at the device (or at nothing, for tests) and returns a
//! [`Verdict`]. Policies never act on what they find: isolation is recorded
//! by the scheduler, nothing is moved or killed.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sysinfo::{ProcessesToUpdate, System};

use crate::constants::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    ThreatFound { detail: String },
}

/// Decision function called once per scan cycle. Runs on a blocking thread.
pub trait ScanPolicy: Send + Sync {
    fn evaluate(&self) -> Verdict;

    fn name(&self) -> &str;
}

// ── Heuristic ─────────────────────────────────────────────────────

/// Looks for suspicious process names and risky downloads.
pub struct HeuristicPolicy {
    download_dirs: Vec<PathBuf>,
}

impl HeuristicPolicy {
    pub fn new(download_dirs: Vec<PathBuf>) -> Self {
        Self { download_dirs }
    }
}

impl Default for HeuristicPolicy {
    fn default() -> Self {
        Self::new(vec![downloads_dir(), data_dir().join("Downloads")])
    }
}

impl ScanPolicy for HeuristicPolicy {
    fn evaluate(&self) -> Verdict {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let processes = suspicious_processes(
            sys.processes()
                .iter()
                .map(|(pid, p)| (p.name().to_string_lossy().to_string(), pid.as_u32())),
        );
        let files = risky_files(&self.download_dirs);
        tracing::debug!(
            processes = processes.len(),
            files = files.len(),
            "heuristic scan finished"
        );
        verdict_from_findings(&processes, &files)
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// `name (pid N)` for every process whose name contains a suspicious keyword.
fn suspicious_processes(procs: impl Iterator<Item = (String, u32)>) -> Vec<String> {
    procs
        .filter_map(|(name, pid)| {
            let lower = name.to_lowercase();
            SUSPICIOUS_PROCESS_KEYWORDS
                .iter()
                .any(|k| lower.contains(k))
                .then(|| format!("{} (pid {})", lower, pid))
        })
        .collect()
}

/// Files under `dirs` (recursively) with a risky extension, capped at [`MAX_RISKY_FILES`].
fn risky_files(dirs: &[PathBuf]) -> Vec<String> {
    let mut found = Vec::new();
    for dir in dirs {
        let mut stack = vec![dir.clone()];
        while let Some(current) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&current) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if has_risky_extension(&path) {
                    found.push(path.display().to_string());
                    if found.len() >= MAX_RISKY_FILES {
                        return found;
                    }
                }
            }
        }
    }
    found
}

fn has_risky_extension(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    RISKY_FILE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

fn verdict_from_findings(processes: &[String], files: &[String]) -> Verdict {
    let hits = processes.len() + files.len();
    if hits == 0 {
        return Verdict::Clean;
    }
    let score = (hits as f64 / THREAT_SCORE_SATURATION).min(1.0);
    let mut parts = Vec::new();
    if !processes.is_empty() {
        parts.push(format!("processes: {}", processes.join(", ")));
    }
    if !files.is_empty() {
        parts.push(format!("files: {}", files.join(", ")));
    }
    Verdict::ThreatFound {
        detail: format!("threat score {:.2}; {}", score, parts.join("; ")),
    }
}

// ── Deterministic policies ────────────────────────────────────────

/// Replays a fixed sequence of verdicts, then reports clean.
pub struct ScriptedPolicy {
    verdicts: Mutex<VecDeque<Verdict>>,
}

impl ScriptedPolicy {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
        }
    }
}

impl ScanPolicy for ScriptedPolicy {
    fn evaluate(&self) -> Verdict {
        self.verdicts
            .lock()
            .ok()
            .and_then(|mut v| v.pop_front())
            .unwrap_or(Verdict::Clean)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Always clean.
pub struct CleanPolicy;

impl ScanPolicy for CleanPolicy {
    fn evaluate(&self) -> Verdict {
        Verdict::Clean
    }

    fn name(&self) -> &str {
        "clean"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_keywords_match_case_insensitively() {
        let procs = vec![
            ("bash".to_string(), 1),
            ("CryptoMiner".to_string(), 42),
            ("keylogger-d".to_string(), 7),
        ];
        assert_eq!(
            suspicious_processes(procs.into_iter()),
            vec!["cryptominer (pid 42)", "keylogger-d (pid 7)"]
        );
    }

    #[test]
    fn risky_files_found_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("setup.EXE"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("app.apk"), b"").unwrap();

        let mut files = risky_files(&[dir.path().to_path_buf()]);
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("app.apk"));
        assert!(files[1].ends_with("setup.EXE"));
    }

    #[test]
    fn risky_files_capped() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..(MAX_RISKY_FILES + 5) {
            std::fs::write(dir.path().join(format!("f{}.sh", i)), b"").unwrap();
        }
        assert_eq!(risky_files(&[dir.path().to_path_buf()]).len(), MAX_RISKY_FILES);
    }

    #[test]
    fn missing_dirs_are_skipped() {
        assert!(risky_files(&[PathBuf::from("/nonexistent/cybersentinel")]).is_empty());
    }

    #[test]
    fn verdict_scores_hits() {
        assert_eq!(verdict_from_findings(&[], &[]), Verdict::Clean);
        match verdict_from_findings(&["miner (pid 1)".to_string()], &["/d/a.bat".to_string()]) {
            Verdict::ThreatFound { detail } => {
                assert!(detail.starts_with("threat score 0.20"));
                assert!(detail.contains("miner (pid 1)"));
                assert!(detail.contains("/d/a.bat"));
            }
            other => panic!("expected threat, got {:?}", other),
        }
        let many: Vec<String> = (0..20).map(|i| format!("f{}", i)).collect();
        match verdict_from_findings(&[], &many) {
            Verdict::ThreatFound { detail } => assert!(detail.starts_with("threat score 1.00")),
            other => panic!("expected threat, got {:?}", other),
        }
    }

    #[test]
    fn scripted_policy_replays_then_cleans() {
        let policy = ScriptedPolicy::new(vec![Verdict::ThreatFound {
            detail: "x".to_string(),
        }]);
        assert!(matches!(policy.evaluate(), Verdict::ThreatFound { .. }));
        assert_eq!(policy.evaluate(), Verdict::Clean);
        assert_eq!(CleanPolicy.evaluate(), Verdict::Clean);
    }
}
