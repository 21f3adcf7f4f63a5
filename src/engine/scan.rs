use std::sync::OnceLock;

use log::error;
use regex::Regex;

use crate::error::{CompileDiagnostic, Severity};
use crate::preprocess::{eval, SourceMap};

/// A `@compute` function found in the assembled program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: String,
    pub workgroup_size: [u32; 3],
}

/// Blanks out `//` and (nested) `/* */` comments, keeping every newline.
pub fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut depth = 0usize;
    let mut line_comment = false;
    while let Some(c) = chars.next() {
        if line_comment {
            if c == '\n' {
                line_comment = false;
                out.push('\n');
            }
            continue;
        }
        match (c, chars.peek()) {
            ('/', Some('*')) => {
                chars.next();
                depth += 1;
                out.push(' ');
            }
            ('*', Some('/')) if depth > 0 => {
                chars.next();
                depth -= 1;
            }
            ('/', Some('/')) if depth == 0 => {
                chars.next();
                line_comment = true;
            }
            ('\n', _) => out.push('\n'),
            _ if depth > 0 => {}
            _ => out.push(c),
        }
    }
    out
}

static FUNCTION: OnceLock<Option<Regex>> = OnceLock::new();
static WORKGROUP_SIZE: OnceLock<Option<Regex>> = OnceLock::new();
static COMPUTE: OnceLock<Option<Regex>> = OnceLock::new();

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| {
        Regex::new(pattern)
            .map_err(|e| error!("entry point pattern {}: {}", pattern, e))
            .ok()
    })
    .as_ref()
}

/// Finds every compute entry point in comment-stripped `text`.
///
/// Entry points whose workgroup size cannot be evaluated are skipped and
/// reported as `(line, message)` pairs, lines counted in `text`.
pub fn scan_entry_points(text: &str) -> (Vec<EntryPoint>, Vec<(usize, String)>) {
    let mut entries = Vec::new();
    let mut problems = Vec::new();
    let (Some(function), Some(workgroup_size), Some(compute)) = (
        // Attribute run followed by `fn NAME`.
        cached(&FUNCTION, r"((?:@\s*[A-Za-z_]\w*\s*(?:\([^)]*\))?\s*)+)fn\s+([A-Za-z_]\w*)"),
        cached(&WORKGROUP_SIZE, r"@\s*workgroup_size\s*\(([^)]*)\)"),
        cached(&COMPUTE, r"@\s*compute\b"),
    ) else {
        return (entries, problems);
    };
    for captures in function.captures_iter(text) {
        let (Some(attributes), Some(name)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        if !compute.is_match(attributes.as_str()) {
            continue;
        }
        let line = text[..attributes.start()].matches('\n').count() + 1;
        let name = name.as_str().to_string();
        let Some(args) = workgroup_size.captures(attributes.as_str()) else {
            problems.push((line, format!("entry point {} has no @workgroup_size", name)));
            continue;
        };
        match parse_workgroup_size(&args[1]) {
            Ok(workgroup_size) => entries.push(EntryPoint {
                name,
                workgroup_size,
            }),
            Err(msg) => problems.push((line, format!("entry point {}: {}", name, msg))),
        }
    }
    (entries, problems)
}

fn parse_workgroup_size(args: &str) -> Result<[u32; 3], String> {
    let parts: Vec<&str> = args
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(format!("invalid @workgroup_size({})", args.trim()));
    }
    let mut size = [1u32; 3];
    for (slot, part) in size.iter_mut().zip(&parts) {
        *slot = eval::evaluate_u32(part)
            .map_err(|e| format!("workgroup size `{}`: {}", part, e))?;
        if *slot == 0 {
            return Err("workgroup size must be positive".into());
        }
    }
    Ok(size)
}

/// Maps a line of the assembled program back onto the user's source.
///
/// Lines inside the generated prelude clamp to line 1.
pub fn remap_line(line: usize, prelude_lines: usize, map: &SourceMap) -> usize {
    if line <= prelude_lines {
        return 1;
    }
    map.original_line(line - prelude_lines)
}

pub fn remap(
    severity: Severity,
    message: &str,
    line: usize,
    column: usize,
    prelude_lines: usize,
    map: &SourceMap,
) -> CompileDiagnostic {
    let message = if line <= prelude_lines {
        format!("{} (in generated prelude)", message)
    } else {
        message.to_string()
    };
    CompileDiagnostic {
        severity,
        message,
        line: remap_line(line, prelude_lines, map),
        column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::{screen_overrides, IncludeResolver, Preprocessor};

    #[test]
    fn comments_are_blanked_but_lines_kept() {
        let text = "a // one\n/* two\n /* nested */ still */b\nc";
        let stripped = strip_comments(text);
        assert_eq!(stripped.lines().count(), text.lines().count());
        assert!(!stripped.contains("one") && !stripped.contains("nested"));
        assert!(stripped.contains('b') && stripped.ends_with('c'));
    }

    #[test]
    fn finds_compute_entry_points_with_default_dimensions() {
        let text = "\
@compute @workgroup_size(8, 4)
fn foo(@builtin(global_invocation_id) id: vec3u) {}

@workgroup_size(16) @compute fn bar() {}
@fragment fn not_compute() {}
fn helper() {}
";
        let (entries, problems) = scan_entry_points(text);
        assert!(problems.is_empty());
        assert_eq!(
            entries,
            vec![
                EntryPoint {
                    name: "foo".into(),
                    workgroup_size: [8, 4, 1]
                },
                EntryPoint {
                    name: "bar".into(),
                    workgroup_size: [16, 1, 1]
                },
            ]
        );
    }

    #[test]
    fn commented_out_entry_points_are_ignored() {
        let text = strip_comments("// @compute @workgroup_size(1) fn ghost() {}\n/* @compute @workgroup_size(1)\nfn ghost2() {} */\n");
        assert!(scan_entry_points(&text).0.is_empty());
    }

    #[test]
    fn unevaluable_workgroup_size_is_reported() {
        let text = "\n\n@compute @workgroup_size(WG, 1) fn main() {}\n";
        let (entries, problems) = scan_entry_points(text);
        assert!(entries.is_empty());
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].0, 3);
    }

    #[test]
    fn diagnostics_map_back_through_the_prelude_and_source_map() {
        let mut includes = IncludeResolver::default();
        let map = Preprocessor::new(&mut includes, screen_overrides(64, 64, 20))
            .run("#define N 2\nlet a = N;\nlet b = a;\n")
            .unwrap();
        // Emitted lines 1 and 2 come from original lines 2 and 3.
        assert_eq!(remap_line(12, 10, &map), 3);
        assert_eq!(remap_line(11, 10, &map), 2);
        assert_eq!(remap_line(4, 10, &map), 1);
        let diag = remap(Severity::Error, "bad", 5, 3, 10, &map);
        assert_eq!(diag.line, 1);
        assert!(diag.message.ends_with("(in generated prelude)"));
    }
}
