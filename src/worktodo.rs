//! # Worktodo — Assignment Queue File
//!
//! Reads exponents out of `worktodo.txt` and removes them once a result has
//! been reported. Two line forms are accepted:
//!
//! - a bare decimal exponent, e.g. `77936867`
//! - a PrimeNet PRP assignment, e.g.
//!   `PRP=0123456789ABCDEF0123456789ABCDEF,1,2,77936867,-1`
//!   (k=1, b=2, c=−1 are required — only Mersenne numbers are tested here;
//!   an AID of `N/A` or `0` means no assignment id)
//!
//! Blank lines and `#` comments are preserved and skipped. Deletion rewrites
//! the file through a temp-and-rename so a crash never loses the queue.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub exponent: u32,
    pub aid: Option<String>,
}

/// Parse one worktodo line; `None` when the line holds no assignment.
pub fn parse_line(line: &str) -> Option<Entry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Ok(exponent) = line.parse::<u32>() {
        return Some(Entry {
            exponent,
            aid: None,
        });
    }

    let rest = line.strip_prefix("PRP=")?;
    let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
    if fields.len() < 5 {
        return None;
    }
    if fields[1] != "1" || fields[2] != "2" || fields[4] != "-1" {
        warn!("worktodo entry is not a Mersenne PRP assignment: {line}");
        return None;
    }
    let exponent = fields[3].parse::<u32>().ok()?;
    let aid = match fields[0] {
        "" | "N/A" | "0" => None,
        aid => Some(aid.to_string()),
    };
    Some(Entry { exponent, aid })
}

/// First assignment in the queue, or `None` when the queue is empty or the
/// file does not exist.
pub fn read_entry(path: &Path) -> Result<Option<Entry>> {
    if !path.exists() {
        return Ok(None);
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(text.lines().find_map(parse_line))
}

/// Remove the first entry for `exponent`, leaving everything else intact.
pub fn delete_entry(path: &Path, exponent: u32) -> Result<()> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut removed = false;
    let mut kept = Vec::new();
    for line in text.lines() {
        if !removed && parse_line(line).is_some_and(|e| e.exponent == exponent) {
            removed = true;
            continue;
        }
        kept.push(line);
    }
    if !removed {
        warn!("no worktodo entry found for exponent {exponent}");
        return Ok(());
    }

    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    let temp = path.with_extension("tmp");
    fs::write(&temp, out).with_context(|| format!("writing {}", temp.display()))?;
    fs::rename(&temp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_exponent() {
        assert_eq!(
            parse_line("77936867"),
            Some(Entry {
                exponent: 77_936_867,
                aid: None
            })
        );
    }

    #[test]
    fn parses_prp_assignment_with_aid() {
        let e = parse_line("PRP=0123456789ABCDEF0123456789ABCDEF,1,2,77936867,-1").unwrap();
        assert_eq!(e.exponent, 77_936_867);
        assert_eq!(e.aid.as_deref(), Some("0123456789ABCDEF0123456789ABCDEF"));
    }

    #[test]
    fn na_aid_is_dropped() {
        let e = parse_line("PRP=N/A,1,2,1279,-1").unwrap();
        assert_eq!(e.exponent, 1279);
        assert_eq!(e.aid, None);
    }

    #[test]
    fn rejects_non_mersenne_forms() {
        assert_eq!(parse_line("PRP=N/A,3,2,1279,-1"), None);
        assert_eq!(parse_line("PRP=N/A,1,10,1279,-1"), None);
        assert_eq!(parse_line("PRP=N/A,1,2,1279,1"), None);
        assert_eq!(parse_line("Factor=N/A,1279,1,70"), None);
        assert_eq!(parse_line("# 1279"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_entry(&dir.path().join("worktodo.txt")).unwrap(), None);
    }

    #[test]
    fn read_returns_first_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worktodo.txt");
        std::fs::write(&path, "# queue\nbogus line\n1279\n2203\n").unwrap();
        assert_eq!(read_entry(&path).unwrap().unwrap().exponent, 1279);
    }

    #[test]
    fn delete_removes_only_first_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worktodo.txt");
        std::fs::write(&path, "# queue\n1279\nPRP=N/A,1,2,2203,-1\n1279\n").unwrap();

        delete_entry(&path, 1279).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "# queue\nPRP=N/A,1,2,2203,-1\n1279\n");

        delete_entry(&path, 2203).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "# queue\n1279\n");
    }

    #[test]
    fn delete_of_absent_exponent_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worktodo.txt");
        std::fs::write(&path, "1279\n").unwrap();
        delete_entry(&path, 9999991).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1279\n");
    }
}
