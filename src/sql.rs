//! Small SQL text utilities: statement splitting and identifier quoting.
//!
//! The splitter understands just enough PostgreSQL lexing to find statement
//! boundaries: single-quoted strings, quoted identifiers, dollar-quoted bodies
//! (`$$ ... $$`, `$fn$ ... $fn$`), line comments and block comments. Comments
//! are dropped from the output.

/// Split `sql` on top-level semicolons, dropping comments and empty statements.
pub fn split_statements(sql: &str) -> Vec<String> {
    scan(sql, false)
}

/// Like [`split_statements`], but also collapses runs of whitespace outside
/// quotes into single spaces. Used for seed files, whose statement text is
/// compared and checksummed.
pub fn split_normalized(sql: &str) -> Vec<String> {
    scan(sql, true)
}

/// `E'...'` strings take backslash escapes. The `E` must stand alone, not
/// end a longer word.
fn escape_prefix(chars: &[char], quote: usize) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_' || c == '$';
    match quote.checked_sub(1).map(|i| chars[i]) {
        Some('E') | Some('e') => quote < 2 || !is_word(chars[quote - 2]),
        _ => false,
    }
}

fn scan(sql: &str, collapse: bool) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let len = chars.len();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < len {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\'' | '"' => {
                let escaped = c == '\'' && escape_prefix(&chars, i);
                current.push(c);
                i += 1;
                while i < len {
                    let d = chars[i];
                    current.push(d);
                    i += 1;
                    if escaped && d == '\\' && i < len {
                        current.push(chars[i]);
                        i += 1;
                        continue;
                    }
                    if d == c {
                        if i < len && chars[i] == c {
                            current.push(c);
                            i += 1;
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if next == Some('-') => {
                while i < len && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if next == Some('*') => {
                i += 2;
                let mut depth = 1;
                while i < len && depth > 0 {
                    if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                        depth += 1;
                        i += 2;
                    } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        depth -= 1;
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
                push_space(&mut current);
            }
            '$' => match dollar_tag(&chars, i) {
                Some(tag) => {
                    let tag_len = tag.len();
                    current.extend(&tag);
                    i += tag_len;
                    match find(&chars, &tag, i) {
                        Some(end) => {
                            current.extend(&chars[i..end + tag_len]);
                            i = end + tag_len;
                        }
                        None => {
                            current.extend(&chars[i..]);
                            i = len;
                        }
                    }
                }
                None => {
                    current.push('$');
                    i += 1;
                }
            },
            ';' => {
                finish(&mut statements, &mut current);
                i += 1;
            }
            c if collapse && c.is_whitespace() => {
                push_space(&mut current);
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    finish(&mut statements, &mut current);
    statements
}

fn push_space(current: &mut String) {
    if !current.is_empty() && !current.ends_with(char::is_whitespace) {
        current.push(' ');
    }
}

fn finish(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

/// `$tag$` starting at `start`, if one does. `$1` style parameters are not tags.
fn dollar_tag(chars: &[char], start: usize) -> Option<Vec<char>> {
    let mut end = start + 1;
    while end < chars.len() {
        let c = chars[end];
        if c == '$' {
            return Some(chars[start..=end].to_vec());
        }
        let valid = c == '_' || c.is_alphabetic() || (end > start + 1 && c.is_ascii_digit());
        if !valid {
            return None;
        }
        end += 1;
    }
    None
}

fn find(chars: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.len() > chars.len() {
        return None;
    }
    (from..=chars.len() - needle.len()).find(|&at| chars[at..at + needle.len()] == *needle)
}

/// Quote an identifier for interpolation into SQL text.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal for interpolation into SQL text.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// First `max` characters of a statement on one line, for logs and errors.
pub fn preview(sql: &str, max: usize) -> String {
    let flat: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_on_top_level_semicolons() {
        let sql = "CREATE TABLE a (id INT);\nCREATE TABLE b (id INT);";
        assert_eq!(
            split_statements(sql),
            vec!["CREATE TABLE a (id INT)", "CREATE TABLE b (id INT)"]
        );
    }

    #[test]
    fn test_respects_quotes_and_comments() {
        let sql = "-- leading comment\nINSERT INTO t VALUES ('a;b', 'it''s');\n/* block; comment */ SELECT \"odd;name\" FROM t";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "INSERT INTO t VALUES ('a;b', 'it''s')");
        assert_eq!(statements[1], "SELECT \"odd;name\" FROM t");
    }

    #[test]
    fn test_dollar_quoted_function_body_stays_whole() {
        let sql = "CREATE FUNCTION touch() RETURNS trigger AS $fn$\nBEGIN\n  NEW.updated_at = now();\n  RETURN NEW;\nEND;\n$fn$ LANGUAGE plpgsql;\nSELECT 1";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("RETURN NEW;"));
        assert!(statements[0].ends_with("LANGUAGE plpgsql"));
    }

    #[test]
    fn test_escape_strings_skip_backslashed_quotes() {
        let sql = "INSERT INTO t VALUES (E'it\\'s; fine', e'\\\\'); SELECT 'plain\\'";
        let statements = split_statements(sql);
        assert_eq!(
            statements,
            vec!["INSERT INTO t VALUES (E'it\\'s; fine', e'\\\\')", "SELECT 'plain\\'"]
        );
    }

    #[test]
    fn test_positional_parameters_are_not_tags() {
        let statements = split_statements("SELECT $1, $2; SELECT 2");
        assert_eq!(statements, vec!["SELECT $1, $2", "SELECT 2"]);
    }

    #[test]
    fn test_normalized_collapses_whitespace_outside_quotes() {
        let sql = "INSERT INTO roles\n   (name)\nVALUES ('two  spaces');\n\n-- trailing comment\n";
        assert_eq!(
            split_normalized(sql),
            vec!["INSERT INTO roles (name) VALUES ('two  spaces')"]
        );
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("user\"s"), "\"user\"\"s\"");
        assert_eq!(quote_literal("o'clock"), "'o''clock'");
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("SELECT\n  1", 20), "SELECT 1");
        assert_eq!(preview("SELECT 123456789", 6), "SELECT...");
    }
}
