use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::SystemTime;

use regex::Regex;

use crate::error::{IslError, IslResult};
use crate::script::ScriptNode;

/// Expands attribute values before they are interpreted; supplied by
/// the session so fileset resolution sees macro-substituted paths.
pub type AttrExpander<'a> = dyn FnMut(&str) -> IslResult<String> + 'a;

/// Resolve the `<fileset>` children of a node into a file list.
///
/// Returns `None` when the node has no fileset children at all, which
/// callers treat differently from an empty match: a movie tag without
/// filesets captures frames itself, one with an empty fileset has
/// nothing to encode.
pub fn find_files(
    node: &ScriptNode,
    expand: &mut AttrExpander<'_>,
) -> IslResult<Option<Vec<PathBuf>>> {
    let filesets: Vec<&ScriptNode> = node.find_children("fileset").collect();
    if filesets.is_empty() {
        return Ok(None);
    }

    let mut all = Vec::new();
    for fileset in filesets {
        collect(fileset, expand, &mut all)?;
    }

    // Duplicates keep their first position.
    let mut seen = BTreeSet::new();
    all.retain(|path| seen.insert(path.clone()));
    Ok(Some(all))
}

fn collect(
    node: &ScriptNode,
    expand: &mut AttrExpander<'_>,
    out: &mut Vec<PathBuf>,
) -> IslResult<()> {
    let mut files = Vec::new();

    if let Some(file) = node.attr("file") {
        for part in expand(file)?.split(',') {
            let part = part.trim();
            if !part.is_empty() {
                files.push(PathBuf::from(part));
            }
        }
    }

    if let Some(dir) = node.attr("dir") {
        let dir = expand(dir)?;
        let pattern = match node.attr("pattern") {
            Some(p) => {
                let p = expand(p)?;
                Some(Regex::new(&p).map_err(|e| {
                    IslError::parse(format!("bad fileset pattern '{p}': {e}"))
                })?)
            }
            None => None,
        };

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if pattern.as_ref().is_none_or(|re| re.is_match(&name)) {
                entries.push(entry.path());
            }
        }
        // read_dir order is platform-defined.
        entries.sort();
        files.extend(entries);
    }

    for child in node.find_children("fileset") {
        collect(child, expand, &mut files)?;
    }

    if let Some(sort) = node.attr("sort") {
        let sort = expand(sort)?;
        match sort.as_str() {
            "time" => files.sort_by_key(|p| modified(p)),
            "name" => files.sort(),
            other => {
                return Err(IslError::MacroType {
                    attr: "sort".to_string(),
                    expected: "sort order (name or time)",
                    value: other.to_string(),
                });
            }
        }
        let descending = match node.attr("sortdir") {
            Some(dir) => expand(dir)? == "descending",
            None => false,
        };
        if descending {
            files.reverse();
        }
    }

    if let Some(first) = node.attr("first") {
        let count = parse_count(&expand(first)?, "first")?;
        files.truncate(count);
    }
    if let Some(last) = node.attr("last") {
        let count = parse_count(&expand(last)?, "last")?;
        if files.len() > count {
            files.drain(..files.len() - count);
        }
    }

    out.append(&mut files);
    Ok(())
}

fn parse_count(value: &str, attr: &str) -> IslResult<usize> {
    value.parse().map_err(|_| IslError::MacroType {
        attr: attr.to_string(),
        expected: "integer",
        value: value.to_string(),
    })
}

fn modified(path: &std::path::Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}
