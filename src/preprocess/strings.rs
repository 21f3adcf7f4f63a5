use crate::error::PreprocessorErrorKind;

/// Rewrites every `"..."` literal in `line` into a fixed-size `String` constructor:
/// `"hi"` becomes `String(array<u32,N>(104u, 105u, 0u, ...), 2u)`.
///
/// On failure returns the error together with the 1-based column of the literal.
pub fn rewrite_literals(
    line: &str,
    max_len: usize,
) -> Result<String, (usize, PreprocessorErrorKind)> {
    if !line.contains('"') {
        return Ok(line.to_string());
    }

    let mut out = String::with_capacity(line.len());
    let mut chars = line.char_indices().peekable();
    while let Some((index, c)) = chars.next() {
        if c != '"' {
            out.push(c);
            continue;
        }
        let column = line[..index].chars().count() + 1;
        let mut codes = Vec::new();
        let mut closed = false;
        while let Some((_, c)) = chars.next() {
            match c {
                '"' => {
                    closed = true;
                    break;
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => codes.push('\n' as u32),
                    Some((_, 't')) => codes.push('\t' as u32),
                    Some((_, escaped)) => codes.push(escaped as u32),
                    None => break,
                },
                other => codes.push(other as u32),
            }
        }
        if !closed {
            return Err((
                column,
                PreprocessorErrorKind::Directive("unterminated string literal".into()),
            ));
        }
        if codes.len() > max_len {
            return Err((
                column,
                PreprocessorErrorKind::StringTooLong {
                    len: codes.len(),
                    max: max_len,
                },
            ));
        }
        out.push_str(&constructor(&codes, max_len));
    }
    Ok(out)
}

fn constructor(codes: &[u32], max_len: usize) -> String {
    let padded: Vec<String> = codes
        .iter()
        .copied()
        .chain(std::iter::repeat(0))
        .take(max_len)
        .map(|c| format!("{}u", c))
        .collect();
    format!(
        "String(array<u32,{}>({}), {}u)",
        max_len,
        padded.join(", "),
        codes.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_becomes_padded_constructor() {
        let out = rewrite_literals("let s = \"hi\";", 4).unwrap();
        assert_eq!(out, "let s = String(array<u32,4>(104u, 105u, 0u, 0u), 2u);");
    }

    #[test]
    fn lines_without_quotes_are_untouched() {
        assert_eq!(rewrite_literals("let x = 1;", 20).unwrap(), "let x = 1;");
    }

    #[test]
    fn escapes_are_decoded() {
        let out = rewrite_literals(r#"f("a\"b")"#, 3).unwrap();
        assert_eq!(out, "f(String(array<u32,3>(97u, 34u, 98u), 3u))");
    }

    #[test]
    fn oversized_literal_reports_its_column() {
        let err = rewrite_literals("x = \"abcdef\";", 5).unwrap_err();
        assert_eq!(
            err,
            (5, PreprocessorErrorKind::StringTooLong { len: 6, max: 5 })
        );
    }

    #[test]
    fn unterminated_literal_is_rejected() {
        assert!(rewrite_literals("x = \"abc", 20).is_err());
    }
}
