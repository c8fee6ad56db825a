//! Host-tool command-line convention for batch sessions.
//!
//! `<hostRoot> <subject>[,<subject>...] [<subject>...]`, recognised only when
//! `<hostRoot>/lead.m` exists.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use warpdrive_io::migrate::default_apply_transforms_path;

use crate::context::SessionMode;

/// File whose presence identifies the host installation root.
pub const HOST_SENTINEL: &str = "lead.m";

/// Subjects handed over by the host tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    host_root: PathBuf,
    subjects: Vec<PathBuf>,
}

impl LaunchArgs {
    /// Recognise the convention in `args` (program name excluded).
    ///
    /// Returns `None` when fewer than two arguments are given, the sentinel
    /// is missing, or no subject path remains after splitting.
    pub fn parse<I, S>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = args.into_iter();
        let host_root = PathBuf::from(args.next()?.as_ref());
        if !host_root.join(HOST_SENTINEL).is_file() {
            return None;
        }

        let subjects: Vec<PathBuf> = args
            .flat_map(|arg| {
                arg.as_ref()
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect::<Vec<_>>()
            })
            .collect();
        if subjects.is_empty() {
            return None;
        }

        tracing::info!(
            host_root = %host_root.display(),
            subjects = subjects.len(),
            "launched by host tool"
        );
        Some(Self { host_root, subjects })
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    pub fn subjects(&self) -> &[PathBuf] {
        &self.subjects
    }

    /// First subject, opened immediately.
    pub fn current(&self) -> &Path {
        &self.subjects[0]
    }

    /// Subjects processed after the current one.
    pub fn queue(&self) -> VecDeque<PathBuf> {
        self.subjects[1..].iter().cloned().collect()
    }

    /// Resampling tool shipped with the host installation.
    pub fn apply_transforms_tool(&self) -> PathBuf {
        default_apply_transforms_path(&self.host_root)
    }

    pub fn session_mode(&self) -> SessionMode {
        SessionMode::SingleSubject { queue: self.queue() }
    }
}
