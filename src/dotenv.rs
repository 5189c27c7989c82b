//! Reading and writing `KEY=VALUE` env files.
//!
//! The parser accepts the usual dotenv dialect (comments, `export ` prefixes,
//! single and double quotes). Writers only ever emit lines the parser reads
//! back to the same value, and leave comments and ordering of untouched lines
//! alone.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{Result, StackError};

/// Returns true when `key` is a legal env file key (`[A-Za-z_][A-Za-z0-9_.-]*`).
pub fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Parses a single line into a key/value pair.
///
/// Blank lines, comments and lines without a valid key yield `None`.
pub fn parse_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, rest) = trimmed.split_once('=')?;
    let key = key.trim();
    if !is_valid_key(key) {
        return None;
    }
    Some((key.to_string(), parse_value(rest.trim_start())))
}

fn parse_value(raw: &str) -> String {
    if let Some(body) = raw.strip_prefix('"') {
        let mut out = String::with_capacity(body.len());
        let mut chars = body.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '"' => return out,
                '\\' => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some(other) => out.push(other),
                    None => out.push('\\'),
                },
                other => out.push(other),
            }
        }
        // Unterminated quote: keep what was there.
        return out;
    }
    if let Some(body) = raw.strip_prefix('\'') {
        return match body.find('\'') {
            Some(end) => body[..end].to_string(),
            None => body.to_string(),
        };
    }
    let without_comment = match raw.find(" #") {
        Some(idx) => &raw[..idx],
        None => raw,
    };
    without_comment.trim().to_string()
}

/// Parses env file contents. Later keys win.
pub fn parse_dotenv(text: &str) -> BTreeMap<String, String> {
    text.lines().filter_map(parse_line).collect()
}

fn needs_quotes(value: &str) -> bool {
    value.trim() != value
        || value.starts_with('\'')
        || value
            .chars()
            .any(|c| matches!(c, '#' | '"' | '\n' | '\r' | '\t' | '\\'))
}

/// Formats a value so that [`parse_line`] reads it back unchanged.
pub fn format_value(value: &str) -> String {
    if !needs_quotes(value) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Serializes a map, one line per entry. Entries with blank values are dropped.
pub fn stringify_env(env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env {
        if value.trim().is_empty() {
            continue;
        }
        out.push_str(key);
        out.push('=');
        out.push_str(&format_value(value));
        out.push('\n');
    }
    out
}

/// Reads and parses an env file. A missing file reads as empty.
pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(parse_dotenv(&text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(StackError::FileRead(path.to_path_buf(), err)),
    }
}

fn read_text_or_empty(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(StackError::FileRead(path.to_path_buf(), err)),
    }
}

/// Sets keys in an env file in place.
///
/// Existing lines for a key are rewritten (duplicates collapse to the first
/// occurrence), new keys are appended in the order given. A blank value
/// removes the key.
pub fn update_env_file(path: &Path, updates: &[(String, String)]) -> Result<()> {
    let latest = |key: &str| {
        updates
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };
    let text = read_text_or_empty(path)?;
    let mut written: BTreeSet<String> = BTreeSet::new();
    let mut lines: Vec<String> = Vec::new();

    for line in text.lines() {
        if let Some((key, _)) = parse_line(line) {
            if let Some(value) = latest(&key) {
                if written.insert(key.clone()) && !value.trim().is_empty() {
                    lines.push(format!("{}={}", key, format_value(value)));
                }
                continue;
            }
        }
        lines.push(line.to_string());
    }

    for (key, _) in updates {
        if !written.insert(key.clone()) {
            continue;
        }
        if let Some(value) = latest(key).filter(|v| !v.trim().is_empty()) {
            lines.push(format!("{}={}", key, format_value(value)));
        }
    }

    write_lines(path, &lines)
}

/// Removes every line that sets one of `keys`.
pub fn prune_env_file(path: &Path, keys: &[String]) -> Result<()> {
    let text = read_text_or_empty(path)?;
    let lines: Vec<String> = text
        .lines()
        .filter(|line| match parse_line(line) {
            Some((key, _)) => !keys.contains(&key),
            None => true,
        })
        .map(str::to_string)
        .collect();
    write_lines(path, &lines)
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    write_atomic(path, body.as_bytes(), None)
}

/// Writes a file through a sibling temp file and a rename.
pub fn write_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    let write_err = |err| StackError::FileWrite(path.to_path_buf(), err);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp-{}", file_name, std::process::id()));
    fs::write(&tmp, contents).map_err(write_err)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode)).map_err(write_err)?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(write_err(err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_common_dialect() {
        let text = r#"
# comment
export A=1
B = two words # trailing
C="quoted # not a comment"
D='single \n literal'
E="line\nbreak"
bad key=ignored
F=
"#;
        let env = parse_dotenv(text);
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("two words"));
        assert_eq!(
            env.get("C").map(String::as_str),
            Some("quoted # not a comment")
        );
        assert_eq!(env.get("D").map(String::as_str), Some("single \\n literal"));
        assert_eq!(env.get("E").map(String::as_str), Some("line\nbreak"));
        assert_eq!(env.get("F").map(String::as_str), Some(""));
        assert!(!env.contains_key("bad key"));
    }

    #[test]
    fn later_keys_win() {
        let env = parse_dotenv("A=1\nA=2\n");
        assert_eq!(env.get("A").map(String::as_str), Some("2"));
    }

    #[test]
    fn stringify_reads_back_except_blank_values() {
        let mut env = BTreeMap::new();
        env.insert("PLAIN".to_string(), "value".to_string());
        env.insert("HASH".to_string(), "a#b".to_string());
        env.insert("EDGE".to_string(), " padded ".to_string());
        env.insert("QUOTE".to_string(), "say \"hi\"".to_string());
        env.insert("MULTI".to_string(), "one\ntwo".to_string());
        env.insert("PATH_LIKE".to_string(), "C:\\tmp".to_string());
        env.insert("EMPTY".to_string(), String::new());
        env.insert("SPACES".to_string(), "   ".to_string());

        let back = parse_dotenv(&stringify_env(&env));
        let mut expected = env.clone();
        expected.remove("EMPTY");
        expected.remove("SPACES");
        assert_eq!(back, expected);
    }

    #[test]
    fn update_rewrites_in_place_and_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env");
        fs::write(&path, "# header\nA=1\nB=2\nA=3\n").unwrap();

        update_env_file(
            &path,
            &[
                ("A".to_string(), "new".to_string()),
                ("C".to_string(), "added".to_string()),
            ],
        )
        .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "# header\nA=new\nB=2\nC=added\n");
    }

    #[test]
    fn update_with_blank_value_removes_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env");
        fs::write(&path, "A=1\nB=2\n").unwrap();
        update_env_file(&path, &[("A".to_string(), String::new())]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "B=2\n");
    }

    #[test]
    fn update_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("env");
        update_env_file(&path, &[("K".to_string(), "v".to_string())]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "K=v\n");
    }

    #[test]
    fn prune_drops_matching_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env");
        fs::write(&path, "# keep\nA=1\nB=2\n").unwrap();
        prune_env_file(&path, &["A".to_string()]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# keep\nB=2\n");
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let env = read_env_file(&dir.path().join("nope")).unwrap();
        assert!(env.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn write_atomic_applies_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret");
        write_atomic(&path, b"x", Some(0o600)).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
