//! Working-tree inspection for review context and dev-story recovery.
//!
//! Review prompts need a diff of what the story actually touched; when a
//! dev-story reply fails schema validation, the set of modified files is
//! recovered from the working tree so review can still proceed.

use std::path::Path;

use anyhow::{Context, Result};
use git2::{DiffFormat, DiffOptions, Repository, StatusOptions};

pub struct GitWorkspace {
    repo: Repository,
}

impl GitWorkspace {
    pub fn open(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Paths of files that differ from HEAD/index, including untracked.
    pub fn modified_files(&self) -> Result<Vec<String>> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .context("Failed to read git statuses")?;

        let mut files = Vec::new();
        for entry in statuses.iter() {
            if entry.status().is_ignored() {
                continue;
            }
            if let Some(path) = entry.path() {
                files.push(path.to_string());
            }
        }
        Ok(files)
    }

    fn build_diff(&self, paths: Option<&[String]>) -> Result<git2::Diff<'_>> {
        let mut opts = DiffOptions::new();
        opts.include_untracked(true).show_untracked_content(true);
        if let Some(paths) = paths {
            for path in paths {
                opts.pathspec(path);
            }
        }
        self.repo
            .diff_index_to_workdir(None, Some(&mut opts))
            .context("Failed to compute workdir diff")
    }

    /// Unified diff text, optionally scoped to the given paths.
    pub fn diff_text(&self, paths: Option<&[String]>) -> Result<String> {
        let diff = self.build_diff(paths)?;
        let mut text = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            match line.origin() {
                '+' | '-' | ' ' => text.push(line.origin()),
                _ => {}
            }
            text.push_str(std::str::from_utf8(line.content()).unwrap_or(""));
            true
        })
        .context("Failed to render diff")?;
        Ok(text)
    }

    /// File-level stat summary, one line per changed file.
    pub fn diff_stat(&self) -> Result<String> {
        let diff = self.build_diff(None)?;
        let stats = diff.stats().context("Failed to compute diff stats")?;
        let buf = stats
            .to_buf(git2::DiffStatsFormat::FULL, 80)
            .context("Failed to render diff stats")?;
        Ok(buf.as_str().unwrap_or("").to_string())
    }
}
