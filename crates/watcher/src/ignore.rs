//! Ignore pattern management for the change watcher
//!
//! Supports multiple sources of ignore patterns:
//! 1. Excluded directories (the snapshot directory when it is nested inside
//!    the watched tree - always active)
//! 2. Built-in patterns (editor temp files, lock files, VCS and cache dirs)
//! 3. Config-based gitignore-style patterns (`exclude_patterns`)

use ::ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Path, PathBuf};

/// Ignore rule manager
///
/// Combines the sources with this precedence:
/// 1. Excluded directories (highest priority - always enforced)
/// 2. Built-in patterns (unless disabled)
/// 3. Configured patterns
pub struct IgnoreRules {
    /// Watched root directory
    root: PathBuf,

    /// Configured patterns (optional)
    patterns: Option<Gitignore>,

    /// Configuration
    config: IgnoreConfig,
}

impl IgnoreRules {
    /// Compile ignore rules for the tree rooted at `root`
    pub fn new(root: &Path, config: IgnoreConfig) -> Result<Self, ::ignore::Error> {
        let patterns = if config.patterns.is_empty() {
            None
        } else {
            let mut builder = GitignoreBuilder::new(root);
            for pattern in &config.patterns {
                builder.add_line(None, pattern)?;
            }
            Some(builder.build()?)
        };

        Ok(Self {
            root: root.to_path_buf(),
            patterns,
            config,
        })
    }

    /// Check if path should be ignored
    ///
    /// Accepts absolute paths under the root or paths relative to it.
    pub fn should_ignore(&self, path: &Path) -> bool {
        // 1. Excluded directories (e.g. the snapshot directory itself)
        if self
            .config
            .exclude_dirs
            .iter()
            .any(|dir| path.starts_with(dir))
        {
            return true;
        }

        let relative = path.strip_prefix(&self.root).unwrap_or(path);

        // 2. Built-in patterns
        if self.config.use_builtin && is_builtin_ignored(relative) {
            return true;
        }

        // 3. Configured patterns
        if let Some(ref patterns) = self.patterns {
            if relative.is_absolute() {
                // Outside the watched tree, patterns do not apply
                return false;
            }
            let is_dir = self.root.join(relative).is_dir();
            if patterns
                .matched_path_or_any_parents(relative, is_dir)
                .is_ignore()
            {
                return true;
            }
        }

        false
    }

    /// Get number of active ignore sources
    pub fn active_sources(&self) -> usize {
        let mut count = 0;
        if !self.config.exclude_dirs.is_empty() {
            count += 1;
        }
        if self.config.use_builtin {
            count += 1;
        }
        if self.patterns.is_some() {
            count += 1;
        }
        count
    }
}

/// Check if path matches built-in ignore patterns
fn is_builtin_ignored(path: &Path) -> bool {
    // VCS metadata and bytecode caches anywhere in the path
    for component in path.components() {
        if let Some(comp_str) = component.as_os_str().to_str() {
            match comp_str {
                ".git" | "__pycache__" => return true,
                _ => {}
            }
        }
    }

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    matches_editor_temp(filename)
}

/// Check if a file name looks like an editor or office temporary file
fn matches_editor_temp(filename: &str) -> bool {
    // Temp and lock files
    if filename.ends_with(".tmp") || filename.ends_with(".lock") {
        return true;
    }

    // Vim swap files
    if filename.ends_with(".swp") || filename.ends_with(".swx") || filename.ends_with(".swo") {
        return true;
    }

    // Vim/Emacs backup files (~)
    if filename.ends_with('~') {
        return true;
    }

    // Emacs lock files (.#*)
    if filename.starts_with(".#") {
        return true;
    }

    // LibreOffice and MS Office lock files
    if filename.starts_with(".~lock.") || filename.starts_with("~$") {
        return true;
    }

    // Python bytecode
    if filename.ends_with(".pyc") {
        return true;
    }

    // MacOS/Windows system files
    if filename == ".DS_Store" || filename == "Thumbs.db" {
        return true;
    }

    false
}

/// Ignore configuration
#[derive(Debug, Clone)]
pub struct IgnoreConfig {
    /// Directories never reported, matched by path prefix
    pub exclude_dirs: Vec<PathBuf>,

    /// Apply the built-in patterns (default: true)
    pub use_builtin: bool,

    /// Gitignore-style patterns relative to the watched root
    pub patterns: Vec<String>,
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            exclude_dirs: vec![],
            use_builtin: true,
            patterns: vec![],
        }
    }
}
