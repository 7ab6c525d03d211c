pub mod wait;

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use which::which;

use crate::errors::{RestoreError, Result};

static UNQUOTED_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("static regex"));

static VALID_FQN: LazyLock<Regex> = LazyLock::new(|| {
    let ident = r#"(?:"(?:[^"]|"")+"|[a-z_][a-z0-9_]*)"#;
    Regex::new(&format!(r"^{ident}\.{ident}$")).expect("static regex")
});

/// Finds an executable in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|e| {
        RestoreError::Config(format!(
            "{} executable not found in PATH ({}). Please ensure it is installed and in your PATH.",
            name, e
        ))
    })
}

/// Joins an already-quoted schema and object name.
pub fn make_fqn(schema: &str, object: &str) -> String {
    format!("{}.{}", schema, object)
}

/// Quotes an identifier the way the server's quote_ident() does for the
/// common cases: lowercase simple names are left alone.
pub fn quote_ident(ident: &str) -> String {
    if UNQUOTED_IDENTIFIER.is_match(ident) {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

pub fn unquote_ident(ident: &str) -> String {
    if ident.len() >= 2 && ident.starts_with('"') && ident.ends_with('"') {
        ident[1..ident.len() - 1].replace("\"\"", "\"")
    } else {
        ident.to_string()
    }
}

pub fn escape_single_quotes(s: &str) -> String {
    s.replace('\'', "''")
}

/// Returns the schema half of a quoted FQN, honouring dots inside quotes.
pub fn schema_of_fqn(fqn: &str) -> &str {
    let mut in_quotes = false;
    for (i, c) in fqn.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => return &fqn[..i],
            _ => {}
        }
    }
    fqn
}

pub fn validate_fqns(fqns: &[String]) -> Result<()> {
    for fqn in fqns {
        if !VALID_FQN.is_match(fqn) {
            return Err(RestoreError::Config(format!(
                "Table {} is not correctly fully-qualified. Please ensure that it is in the format schema.table, it is quoted appropriately, and it has no preceding or trailing whitespace.",
                fqn
            )));
        }
    }
    Ok(())
}

pub fn validate_full_path(path: &std::path::Path) -> Result<()> {
    let s = path.to_string_lossy();
    if !s.is_empty() && !(s.starts_with('/') || s.starts_with('~')) {
        return Err(RestoreError::Config(format!("{} is not an absolute path.", s)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("table1"), "table1");
        assert_eq!(quote_ident("TABLE_CAPS"), "\"TABLE_CAPS\"");
        assert_eq!(quote_ident("my\"table"), "\"my\"\"table\"");
        assert_eq!(unquote_ident(&quote_ident("my\"table")), "my\"table");
    }

    #[test]
    fn test_schema_of_fqn() {
        assert_eq!(schema_of_fqn("schema.table1"), "schema");
        assert_eq!(schema_of_fqn("\"a.b\".table1"), "\"a.b\"");
        assert_eq!(schema_of_fqn("noschema"), "noschema");
    }

    #[test]
    fn test_validate_fqns() {
        assert!(validate_fqns(&["public.foo".into(), "\"Caps\".\"Tbl\"".into()]).is_ok());
        assert!(validate_fqns(&["foo".into()]).is_err());
        assert!(validate_fqns(&[" public.foo".into()]).is_err());
    }

    #[test]
    fn test_validate_full_path() {
        assert!(validate_full_path(std::path::Path::new("/data/backups")).is_ok());
        assert!(validate_full_path(std::path::Path::new("relative/dir")).is_err());
    }
}
