//! Unified-diff patch engine: parse model-generated diffs, verify them
//! against the working tree, and apply them in place.
//!
//! The engine is deliberately strict: context and removal lines must match
//! the file exactly or the whole apply fails — a patch is never partially
//! applied. Before parsing, [`normalize`] converts the non-standard dialects
//! models commonly emit (`*** Begin Patch` blocks, new-file diffs with wrong
//! hunk counts, JSON-wrapped payloads) into standard unified-diff text, and
//! fails closed on anything it does not recognize.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};

mod normalize;

pub use normalize::normalize;

#[derive(thiserror::Error, Debug)]
pub enum PatchError {
    #[error("malformed patch: {0}")]
    MalformedPatch(String),
    #[error("hunk mismatch at line {line}: expected {expected:?}, found {found:?}")]
    HunkMismatch {
        line: usize,
        expected: String,
        found: String,
    },
    #[error("unsupported patch format: {0}")]
    UnsupportedPatchFormat(String),
    #[error("path outside working directory: {0}")]
    PathOutsideWorkdir(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One line operation within a hunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

/// A contiguous change region in one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    /// 1-based start line in the old file; 0 for new-file hunks.
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    fn added(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| matches!(l, HunkLine::Add(_)))
            .count()
    }

    fn removed(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| matches!(l, HunkLine::Remove(_)))
            .count()
    }
}

/// All hunks targeting one file. `created` means the old side was `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFile {
    pub path: String,
    pub created: bool,
    pub hunks: Vec<Hunk>,
}

/// Parse unified-diff text into per-file hunk lists.
///
/// Fails with [`PatchError::MalformedPatch`] if a `---` header lacks a
/// matching `+++`, if a file section has zero hunks, or if the document has
/// zero files. `/dev/null` destinations (deletions) are rejected.
pub fn parse(diff: &str) -> Result<Vec<PatchFile>, PatchError> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut files = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let Some(old_raw) = line.strip_prefix("--- ") else {
            // Skip `diff --git`, `index`, mode lines and stray text between
            // file sections.
            i += 1;
            continue;
        };
        let Some(new_line) = lines.get(i + 1) else {
            return Err(PatchError::MalformedPatch(
                "`---` header without matching `+++`".to_string(),
            ));
        };
        let Some(new_raw) = new_line.strip_prefix("+++ ") else {
            return Err(PatchError::MalformedPatch(
                "`---` header without matching `+++`".to_string(),
            ));
        };
        i += 2;

        let old_path = parse_patch_path(old_raw);
        let new_path = parse_patch_path(new_raw);
        if new_path.is_none() {
            return Err(PatchError::MalformedPatch(
                "file deletions (`+++ /dev/null`) are not supported".to_string(),
            ));
        }
        let created = old_path.is_none();
        let path = new_path.unwrap_or_default();
        if path.is_empty() {
            return Err(PatchError::MalformedPatch(
                "empty target path in `+++` header".to_string(),
            ));
        }

        let mut hunks = Vec::new();
        while i < lines.len() {
            let Some(header) = parse_hunk_header(lines[i]) else {
                break;
            };
            i += 1;
            let (old_start, old_count, new_start, new_count) = header;
            let mut body = Vec::new();
            let mut seen_old = 0usize;
            let mut seen_new = 0usize;
            while i < lines.len() && (seen_old < old_count || seen_new < new_count) {
                let raw = lines[i];
                if let Some(text) = raw.strip_prefix('+') {
                    body.push(HunkLine::Add(text.to_string()));
                    seen_new += 1;
                } else if let Some(text) = raw.strip_prefix('-') {
                    body.push(HunkLine::Remove(text.to_string()));
                    seen_old += 1;
                } else if let Some(text) = raw.strip_prefix(' ') {
                    body.push(HunkLine::Context(text.to_string()));
                    seen_old += 1;
                    seen_new += 1;
                } else if raw.starts_with('\\') {
                    // `\ No newline at end of file`
                } else if raw.is_empty() {
                    // Some models drop the leading space on blank context lines.
                    body.push(HunkLine::Context(String::new()));
                    seen_old += 1;
                    seen_new += 1;
                } else {
                    return Err(PatchError::MalformedPatch(format!(
                        "unexpected line inside hunk body: {raw:?}"
                    )));
                }
                i += 1;
            }
            // A trailing no-newline marker belongs to this hunk.
            if i < lines.len() && lines[i].starts_with('\\') {
                i += 1;
            }
            hunks.push(Hunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines: body,
            });
        }

        if hunks.is_empty() {
            return Err(PatchError::MalformedPatch(format!(
                "file section for {path:?} has no hunks"
            )));
        }
        files.push(PatchFile {
            path,
            created,
            hunks,
        });
    }

    if files.is_empty() {
        return Err(PatchError::MalformedPatch(
            "patch contains no file sections".to_string(),
        ));
    }
    Ok(files)
}

/// Render parsed patch files back to unified-diff text.
///
/// `parse(render(parse(diff)))` round-trips to an equivalent hunk structure.
pub fn render(files: &[PatchFile]) -> String {
    let mut out = String::new();
    for file in files {
        if file.created {
            out.push_str("--- /dev/null\n");
        } else {
            out.push_str(&format!("--- a/{}\n", file.path));
        }
        out.push_str(&format!("+++ b/{}\n", file.path));
        for hunk in &file.hunks {
            out.push_str(&format!(
                "@@ -{},{} +{},{} @@\n",
                hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
            ));
            for line in &hunk.lines {
                match line {
                    HunkLine::Context(text) => out.push_str(&format!(" {text}\n")),
                    HunkLine::Remove(text) => out.push_str(&format!("-{text}\n")),
                    HunkLine::Add(text) => out.push_str(&format!("+{text}\n")),
                }
            }
        }
    }
    out
}

/// Apply a file's hunks to its current content, returning the updated text.
///
/// Walks hunks in order, tracking the cumulative line-offset correction from
/// earlier hunks. Context and removal lines must match the working buffer
/// exactly or the call fails with [`PatchError::HunkMismatch`].
pub fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
    let had_trailing_newline = original.ends_with('\n') || original.is_empty();
    let mut buf: Vec<String> = original.lines().map(ToString::to_string).collect();
    let mut offset: i64 = 0;

    for hunk in hunks {
        // Header positions are 1-based; a start of 0 means "prepend"
        // (new-file hunks use `-0,0`).
        let base = hunk.old_start.saturating_sub(1) as i64 + offset;
        if base < 0 {
            return Err(PatchError::MalformedPatch(format!(
                "hunk start {} underflows after offset {offset}",
                hunk.old_start
            )));
        }
        let mut pos = base as usize;

        for line in &hunk.lines {
            match line {
                HunkLine::Context(expected) => {
                    let found = buf.get(pos).cloned().unwrap_or_default();
                    if buf.get(pos).map(String::as_str) != Some(expected.as_str()) {
                        return Err(PatchError::HunkMismatch {
                            line: pos + 1,
                            expected: expected.clone(),
                            found,
                        });
                    }
                    pos += 1;
                }
                HunkLine::Remove(expected) => {
                    let found = buf.get(pos).cloned().unwrap_or_default();
                    if buf.get(pos).map(String::as_str) != Some(expected.as_str()) {
                        return Err(PatchError::HunkMismatch {
                            line: pos + 1,
                            expected: expected.clone(),
                            found,
                        });
                    }
                    buf.remove(pos);
                }
                HunkLine::Add(text) => {
                    if pos > buf.len() {
                        return Err(PatchError::HunkMismatch {
                            line: pos + 1,
                            expected: text.clone(),
                            found: "<end of file>".to_string(),
                        });
                    }
                    buf.insert(pos, text.clone());
                    pos += 1;
                }
            }
        }
        offset += hunk.added() as i64 - hunk.removed() as i64;
    }

    let mut out = buf.join("\n");
    if !out.is_empty() && had_trailing_newline {
        out.push('\n');
    }
    Ok(out)
}

/// Relative paths of every file a parsed patch touches, in patch order.
pub fn target_files(files: &[PatchFile]) -> Vec<String> {
    files.iter().map(|f| f.path.clone()).collect()
}

fn parse_patch_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == "/dev/null" {
        return None;
    }
    let normalized = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    if normalized.is_empty() {
        return None;
    }
    Some(normalized.to_string())
}

/// Parse `@@ -a,b +c,d @@` (counts optional, defaulting to 1).
pub(crate) fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let rest = line.strip_prefix("@@ ")?;
    let end = rest.find(" @@")?;
    let ranges = &rest[..end];
    let (old, new) = ranges.split_once(' ')?;
    let (old_start, old_count) = parse_range(old.strip_prefix('-')?)?;
    let (new_start, new_count) = parse_range(new.strip_prefix('+')?)?;
    Some((old_start, old_count, new_start, new_count))
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

/// Summary of one applied file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedFile {
    pub path: String,
    pub created: bool,
    pub hunks: usize,
    pub bytes: usize,
    pub sha256: String,
}

/// Summary of a successful apply call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub files: Vec<AppliedFile>,
}

impl ApplyReport {
    pub fn summary(&self) -> String {
        let names: Vec<&str> = self.files.iter().map(|f| f.path.as_str()).collect();
        format!("applied {} file(s): {}", self.files.len(), names.join(", "))
    }
}

/// Applies normalized patches to files under a fixed working root.
///
/// Every target path is resolved against the root before any write; absolute
/// paths outside the root and `..` escapes fail with
/// [`PatchError::PathOutsideWorkdir`]. All updated contents are computed in
/// memory first — a failing hunk means zero writes.
#[derive(Debug, Clone)]
pub struct PatchEngine {
    workdir: PathBuf,
}

impl PatchEngine {
    pub fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Normalize, parse, verify and apply a patch document.
    pub fn apply(&self, input: &str) -> Result<ApplyReport, PatchError> {
        let diff = normalize(input)?;
        let parsed = parse(&diff)?;

        let mut staged: Vec<(PathBuf, String, &PatchFile)> = Vec::new();
        for file in &parsed {
            let target = resolve_target(&self.workdir, &file.path)?;
            let original = if target.exists() {
                fs::read_to_string(&target).map_err(|source| PatchError::Io {
                    path: file.path.clone(),
                    source,
                })?
            } else {
                String::new()
            };
            let updated = apply_hunks(&original, &file.hunks)?;
            staged.push((target, updated, file));
        }

        let mut report = ApplyReport { files: Vec::new() };
        for (target, updated, file) in staged {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|source| PatchError::Io {
                    path: file.path.clone(),
                    source,
                })?;
            }
            fs::write(&target, &updated).map_err(|source| PatchError::Io {
                path: file.path.clone(),
                source,
            })?;
            report.files.push(AppliedFile {
                path: file.path.clone(),
                created: file.created,
                hunks: file.hunks.len(),
                bytes: updated.len(),
                sha256: format!("{:x}", Sha256::digest(updated.as_bytes())),
            });
        }
        Ok(report)
    }
}

/// Resolve a patch target path against the working root.
///
/// This check is mandatory and not bypassable by patch content.
pub fn resolve_target(workdir: &Path, raw: &str) -> Result<PathBuf, PatchError> {
    if raw.is_empty() {
        return Err(PatchError::MalformedPatch("empty target path".to_string()));
    }
    let candidate = Path::new(raw);
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(PatchError::PathOutsideWorkdir(raw.to_string()));
    }
    if candidate.is_absolute() {
        if !candidate.starts_with(workdir) {
            return Err(PatchError::PathOutsideWorkdir(raw.to_string()));
        }
        return Ok(candidate.to_path_buf());
    }
    Ok(workdir.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_DIFF: &str = "\
--- a/demo.txt
+++ b/demo.txt
@@ -1,3 +1,3 @@
 first
-second
+patched
 third
";

    #[test]
    fn parses_simple_diff() {
        let files = parse(SIMPLE_DIFF).expect("parse");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "demo.txt");
        assert!(!files[0].created);
        assert_eq!(files[0].hunks.len(), 1);
        let hunk = &files[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_count), (1, 3));
        assert_eq!(hunk.lines.len(), 4);
    }

    #[test]
    fn parse_rejects_missing_plus_header() {
        let diff = "--- a/demo.txt\n@@ -1 +1 @@\n-x\n+y\n";
        let err = parse(diff).expect_err("should fail");
        assert!(matches!(err, PatchError::MalformedPatch(_)));
        assert!(err.to_string().contains("matching `+++`"));
    }

    #[test]
    fn parse_rejects_section_without_hunks() {
        let diff = "--- a/demo.txt\n+++ b/demo.txt\n";
        let err = parse(diff).expect_err("should fail");
        assert!(err.to_string().contains("no hunks"));
    }

    #[test]
    fn parse_rejects_empty_document() {
        let err = parse("just some text\n").expect_err("should fail");
        assert!(err.to_string().contains("no file sections"));
    }

    #[test]
    fn parse_rejects_deletion() {
        let diff = "--- a/gone.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-x\n";
        let err = parse(diff).expect_err("should fail");
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn parse_marks_dev_null_source_as_created() {
        let diff = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+a\n+b\n";
        let files = parse(diff).expect("parse");
        assert!(files[0].created);
        assert_eq!(files[0].path, "new.txt");
        assert_eq!(files[0].hunks[0].old_start, 0);
    }

    #[test]
    fn parse_skips_git_prelude_lines() {
        let diff = "\
diff --git a/x.rs b/x.rs
index 1111111..2222222 100644
--- a/x.rs
+++ b/x.rs
@@ -1 +1 @@
-old
+new
";
        let files = parse(diff).expect("parse");
        assert_eq!(files[0].path, "x.rs");
    }

    #[test]
    fn parse_render_round_trips() {
        let multi = "\
--- a/foo.rs
+++ b/foo.rs
@@ -1,2 +1,3 @@
 keep
+added
 tail
--- /dev/null
+++ b/bar.rs
@@ -0,0 +1,1 @@
+hello
";
        let first = parse(multi).expect("first parse");
        let second = parse(&render(&first)).expect("second parse");
        assert_eq!(first, second);
    }

    #[test]
    fn apply_replaces_line() {
        let files = parse(SIMPLE_DIFF).expect("parse");
        let updated = apply_hunks("first\nsecond\nthird\n", &files[0].hunks).expect("apply");
        assert_eq!(updated, "first\npatched\nthird\n");
    }

    #[test]
    fn apply_tracks_offsets_across_hunks() {
        let diff = "\
--- a/list.txt
+++ b/list.txt
@@ -1,2 +1,4 @@
 one
+one-and-a-half
+one-and-three-quarters
 two
@@ -4,2 +6,2 @@
 four
-five
+FIVE
";
        let files = parse(diff).expect("parse");
        let original = "one\ntwo\nthree\nfour\nfive\n";
        let updated = apply_hunks(original, &files[0].hunks).expect("apply");
        assert_eq!(
            updated,
            "one\none-and-a-half\none-and-three-quarters\ntwo\nthree\nfour\nFIVE\n"
        );
    }

    #[test]
    fn apply_fails_on_context_mismatch() {
        let files = parse(SIMPLE_DIFF).expect("parse");
        let err = apply_hunks("first\nDIFFERENT\nthird\n", &files[0].hunks)
            .expect_err("must mismatch");
        match err {
            PatchError::HunkMismatch {
                line,
                expected,
                found,
            } => {
                assert_eq!(line, 2);
                assert_eq!(expected, "second");
                assert_eq!(found, "DIFFERENT");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn apply_fails_on_removal_mismatch_without_partial_result() {
        let diff = "\
--- a/t.txt
+++ b/t.txt
@@ -1,2 +1,2 @@
 keep
-wrong
+right
";
        let files = parse(diff).expect("parse");
        let err = apply_hunks("keep\nactual\n", &files[0].hunks).expect_err("must fail");
        assert!(matches!(err, PatchError::HunkMismatch { .. }));
    }

    #[test]
    fn apply_creates_new_file_content() {
        let diff = "--- /dev/null\n+++ b/foo.py\n@@ -0,0 +1,2 @@\n+print(1)\n+print(2)\n";
        let files = parse(diff).expect("parse");
        let updated = apply_hunks("", &files[0].hunks).expect("apply");
        assert_eq!(updated, "print(1)\nprint(2)\n");
    }

    #[test]
    fn apply_preserves_missing_trailing_newline() {
        let diff = "--- a/t.txt\n+++ b/t.txt\n@@ -1 +1 @@\n-old\n+new\n\\ No newline at end of file\n";
        let files = parse(diff).expect("parse");
        let updated = apply_hunks("old", &files[0].hunks).expect("apply");
        assert_eq!(updated, "new");
    }

    #[test]
    fn resolve_target_rejects_escapes() {
        let workdir = Path::new("/work/project");
        assert!(matches!(
            resolve_target(workdir, "../outside.txt"),
            Err(PatchError::PathOutsideWorkdir(_))
        ));
        assert!(matches!(
            resolve_target(workdir, "src/../../outside.txt"),
            Err(PatchError::PathOutsideWorkdir(_))
        ));
        assert!(matches!(
            resolve_target(workdir, "/etc/passwd"),
            Err(PatchError::PathOutsideWorkdir(_))
        ));
    }

    #[test]
    fn resolve_target_accepts_paths_under_root() {
        let workdir = Path::new("/work/project");
        assert_eq!(
            resolve_target(workdir, "src/lib.rs").expect("relative"),
            PathBuf::from("/work/project/src/lib.rs")
        );
        assert_eq!(
            resolve_target(workdir, "/work/project/a.txt").expect("absolute inside"),
            PathBuf::from("/work/project/a.txt")
        );
    }

    #[test]
    fn engine_creates_file_in_empty_workdir() {
        let workdir = tempfile::tempdir().expect("tempdir");
        let engine = PatchEngine::new(workdir.path());
        let diff = "--- /dev/null\n+++ foo.py\n@@ -0,0 +1,2 @@\n+print(1)\n+print(2)\n";
        let report = engine.apply(diff).expect("apply");
        assert_eq!(report.files.len(), 1);
        assert!(report.files[0].created);
        let content = fs::read_to_string(workdir.path().join("foo.py")).expect("read");
        assert_eq!(content, "print(1)\nprint(2)\n");
    }

    #[test]
    fn engine_leaves_disk_untouched_on_mismatch() {
        let workdir = tempfile::tempdir().expect("tempdir");
        fs::write(workdir.path().join("demo.txt"), "first\nDRIFTED\nthird\n").expect("seed");
        let engine = PatchEngine::new(workdir.path());
        let err = engine.apply(SIMPLE_DIFF).expect_err("must fail");
        assert!(matches!(err, PatchError::HunkMismatch { .. }));
        let content = fs::read_to_string(workdir.path().join("demo.txt")).expect("read");
        assert_eq!(content, "first\nDRIFTED\nthird\n");
    }

    #[test]
    fn engine_rejects_outside_paths_with_zero_writes() {
        let workdir = tempfile::tempdir().expect("tempdir");
        let engine = PatchEngine::new(workdir.path());
        let diff = "--- /dev/null\n+++ /tmp/evil.txt\n@@ -0,0 +1 @@\n+pwned\n";
        let err = engine.apply(diff).expect_err("must fail");
        assert!(matches!(err, PatchError::PathOutsideWorkdir(_)));
        assert!(
            fs::read_dir(workdir.path())
                .expect("read_dir")
                .next()
                .is_none(),
            "workdir must stay empty"
        );
    }

    #[test]
    fn engine_applies_multi_file_patch_atomically() {
        let workdir = tempfile::tempdir().expect("tempdir");
        fs::write(workdir.path().join("a.txt"), "alpha\n").expect("seed a");
        let engine = PatchEngine::new(workdir.path());
        // Second file mismatches: the valid first file must not be written.
        let diff = "\
--- a/a.txt
+++ b/a.txt
@@ -1 +1 @@
-alpha
+ALPHA
--- a/b.txt
+++ b/b.txt
@@ -1 +1 @@
-does-not-exist
+nope
";
        let err = engine.apply(diff).expect_err("must fail");
        assert!(matches!(err, PatchError::HunkMismatch { .. }));
        assert_eq!(
            fs::read_to_string(workdir.path().join("a.txt")).expect("read"),
            "alpha\n"
        );
    }

    #[test]
    fn engine_creates_nested_directories() {
        let workdir = tempfile::tempdir().expect("tempdir");
        let engine = PatchEngine::new(workdir.path());
        let diff = "--- /dev/null\n+++ b/src/deep/mod.rs\n@@ -0,0 +1 @@\n+pub mod deep;\n";
        engine.apply(diff).expect("apply");
        assert!(workdir.path().join("src/deep/mod.rs").exists());
    }

    #[test]
    fn hunk_header_parsing_handles_optional_counts() {
        assert_eq!(parse_hunk_header("@@ -1,3 +2,4 @@"), Some((1, 3, 2, 4)));
        assert_eq!(parse_hunk_header("@@ -5 +6 @@"), Some((5, 1, 6, 1)));
        assert_eq!(
            parse_hunk_header("@@ -0,0 +1,2 @@ fn main()"),
            Some((0, 0, 1, 2))
        );
        assert_eq!(parse_hunk_header("not a header"), None);
    }

    #[test]
    fn target_files_lists_patch_order() {
        let diff = "\
--- a/z.rs
+++ b/z.rs
@@ -1 +1 @@
-x
+y
--- /dev/null
+++ b/a.rs
@@ -0,0 +1 @@
+new
";
        let files = parse(diff).expect("parse");
        assert_eq!(target_files(&files), vec!["z.rs", "a.rs"]);
    }
}
