//! Minimal RFC 4180 encoding for `tags.csv`.
//!
//! Fields containing a comma, quote, CR or LF are quoted; quotes inside
//! quoted fields are doubled.

/// Append one record (terminated by `\n`) to `out`.
pub fn write_record(out: &mut String, fields: &[&str]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

/// Parse records. Blank lines are skipped.
///
/// # Errors
///
/// Returns a description of the problem if a quoted field is never closed
/// or a closing quote is followed by something other than a separator.
pub fn parse_records(text: &str) -> Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut chars = text.chars().peekable();
    let mut in_quotes = false;
    let mut quoted = false;

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => {
                    in_quotes = false;
                    match chars.peek() {
                        None | Some(',' | '\n' | '\r') => {}
                        Some(other) => {
                            return Err(format!("unexpected `{other}` after closing quote"));
                        }
                    }
                }
                other => field.push(other),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                quoted = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                record.push(std::mem::take(&mut field));
                quoted = false;
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                }
                record.clear();
            }
            other => field.push(other),
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if !field.is_empty() || quoted || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_records() {
        let mut out = String::new();
        write_record(&mut out, &["lr", "0.1"]);
        write_record(&mut out, &["opt", "adam"]);
        assert_eq!(out, "lr,0.1\nopt,adam\n");
        assert_eq!(
            parse_records(&out).unwrap(),
            vec![vec!["lr", "0.1"], vec!["opt", "adam"]]
        );
    }

    #[test]
    fn test_quoting_round_trip() {
        let value = "a, \"quoted\"\nmultiline value";
        let mut out = String::new();
        write_record(&mut out, &["note", value]);
        let records = parse_records(&out).unwrap();
        assert_eq!(records, vec![vec!["note".to_string(), value.to_string()]]);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let records = parse_records("a,1\r\n\r\nb,2").unwrap();
        assert_eq!(records, vec![vec!["a", "1"], vec!["b", "2"]]);
    }

    #[test]
    fn test_empty_quoted_field() {
        let records = parse_records("k,\"\"\n").unwrap();
        assert_eq!(records, vec![vec!["k", ""]]);
    }

    #[test]
    fn test_unterminated_quote() {
        assert!(parse_records("k,\"oops\n").is_err());
    }
}
