//! Text-to-text shader preprocessing.
//!
//! Runs before any device work: expands `#include`s, applies `#define` and
//! `override` substitutions, collects the dispatch directives and produces a
//! [`SourceMap`] whose line table lets compiler diagnostics be reported in the
//! coordinates of the text the user typed.

pub mod eval;
pub mod include;
pub mod strings;

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::bindings::STORAGE_SLOTS;
use crate::error::{PreprocessorError, PreprocessorErrorKind};
pub use include::{
    DirIncludeSource, HttpIncludeSource, IncludePath, IncludeResolver, IncludeSource,
    StaticIncludeSource, DEFAULT_STD_ROOT,
};

/// Default cap on rewritten string literals.
pub const STRING_MAX_LEN: usize = 20;

const MAX_INCLUDE_DEPTH: usize = 16;

/// Output of one preprocessing run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceMap {
    /// `enable ...;` lines, hoisted ahead of the generated prelude.
    pub extensions: String,
    pub source: String,
    /// `map[i]` is the original (1-based) line of emitted line `i`; `map[0]` is unused.
    pub map: Vec<usize>,
    pub workgroup_count: HashMap<String, [u32; 3]>,
    pub dispatch_once: HashSet<String>,
    pub dispatch_count: HashMap<String, u32>,
    /// Number of `#storage` declarations, at most [`STORAGE_SLOTS`]`.len()`.
    pub storage_count: usize,
}

impl SourceMap {
    fn new() -> Self {
        Self {
            map: vec![0],
            ..Default::default()
        }
    }

    fn push_line(&mut self, text: &str, eol: &str, original_line: usize) {
        self.source.push_str(text);
        self.source.push_str(eol);
        self.map.push(original_line);
    }

    pub fn emitted_lines(&self) -> usize {
        self.map.len() - 1
    }

    /// Original line of emitted line `line` (1-based), clamped into range.
    pub fn original_line(&self, line: usize) -> usize {
        if self.map.len() <= 1 {
            return 1;
        }
        self.map[line.clamp(1, self.map.len() - 1)]
    }

    /// How many times `entry` runs per frame; `0` means "once, on frame 0".
    pub fn dispatch_count_for(&self, entry: &str) -> u32 {
        if self.dispatch_once.contains(entry) {
            return 0;
        }
        self.dispatch_count.get(entry).copied().unwrap_or(1)
    }
}

/// Overrides seeded from the current surface size.
pub fn screen_overrides(width: u32, height: u32, string_max_len: usize) -> HashMap<String, String> {
    HashMap::from([
        ("SCREEN_WIDTH".to_string(), width.to_string()),
        ("SCREEN_HEIGHT".to_string(), height.to_string()),
        ("STRING_MAX_LEN".to_string(), string_max_len.to_string()),
    ])
}

pub struct Preprocessor<'a> {
    includes: &'a mut IncludeResolver,
    overrides: HashMap<String, String>,
    defines: HashMap<String, String>,
    string_mode: bool,
    string_max_len: usize,
    /// Terminator of the source line being processed, reused for what it emits.
    eol: &'static str,
    out: SourceMap,
}

impl<'a> Preprocessor<'a> {
    pub fn new(includes: &'a mut IncludeResolver, overrides: HashMap<String, String>) -> Self {
        let string_max_len = overrides
            .get("STRING_MAX_LEN")
            .and_then(|v| v.parse().ok())
            .unwrap_or(STRING_MAX_LEN);
        Self {
            includes,
            overrides,
            defines: HashMap::new(),
            string_mode: false,
            string_max_len,
            eol: "\n",
            out: SourceMap::new(),
        }
    }

    /// Consumes the preprocessor; any error discards all partial output.
    pub fn run(mut self, source: &str) -> Result<SourceMap, PreprocessorError> {
        for (index, raw) in source.split_inclusive('\n').enumerate() {
            let line = match raw.strip_suffix("\r\n") {
                Some(line) => {
                    self.eol = "\r\n";
                    line
                }
                None => match raw.strip_suffix('\n') {
                    Some(line) => {
                        self.eol = "\n";
                        line
                    }
                    None => raw,
                },
            };
            self.process_line(line, index + 1, 0)?;
        }
        if !source.is_empty() && !source.ends_with('\n') && self.out.source.ends_with(self.eol) {
            let len = self.out.source.len() - self.eol.len();
            self.out.source.truncate(len);
        }
        debug!(
            "preprocessed {} lines into {} ({} storage buffers)",
            source.lines().count(),
            self.out.emitted_lines(),
            self.out.storage_count
        );
        Ok(self.out)
    }

    fn process_line(
        &mut self,
        line: &str,
        line_no: usize,
        depth: usize,
    ) -> Result<(), PreprocessorError> {
        let trimmed = line.trim_start();
        let err = |kind| PreprocessorError::new(line_no, kind);

        if trimmed.starts_with("enable ") {
            self.out.extensions.push_str(trimmed);
            self.out.extensions.push('\n');
            return Ok(());
        }
        if trimmed.starts_with("override ") {
            return self.process_override(trimmed, line_no);
        }
        if let Some(directive) = trimmed.strip_prefix('#') {
            return self.process_directive(directive, line_no, depth);
        }

        let substituted = self.substitute(line);
        let emitted = if self.string_mode {
            strings::rewrite_literals(&substituted, self.string_max_len)
                .map_err(|(column, kind)| err(kind).with_column(column))?
        } else {
            substituted
        };
        self.out.push_line(&emitted, self.eol, line_no);
        Ok(())
    }

    // `override NAME = EXPR;` (an optional `: type` is accepted and ignored).
    fn process_override(&mut self, line: &str, line_no: usize) -> Result<(), PreprocessorError> {
        let err = |msg: &str| {
            PreprocessorError::new(line_no, PreprocessorErrorKind::Directive(msg.to_string()))
        };
        let body = line
            .trim_end()
            .strip_prefix("override ")
            .and_then(|rest| rest.strip_suffix(';'))
            .ok_or_else(|| err("override must be a single line ending in `;`"))?;
        let (lhs, expr) = body
            .split_once('=')
            .ok_or_else(|| err("override needs an initializer"))?;
        let name = lhs.split(':').next().unwrap_or_default().trim();
        if !is_identifier(name) {
            return Err(err("override needs a name"));
        }
        let value = eval::evaluate(&self.substitute(expr))
            .map_err(|kind| PreprocessorError::new(line_no, kind))?;
        self.defines
            .insert(name.to_string(), eval::format_value(value));
        Ok(())
    }

    fn process_directive(
        &mut self,
        directive: &str,
        line_no: usize,
        depth: usize,
    ) -> Result<(), PreprocessorError> {
        let err = |kind| PreprocessorError::new(line_no, kind);
        let syntax = |msg: String| err(PreprocessorErrorKind::Directive(msg));
        let (name, rest) = match directive.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (directive.trim(), ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        match name {
            "include" => {
                let path = IncludePath::parse(rest)
                    .ok_or_else(|| syntax(format!("malformed include `{}`", rest)))?;
                if depth >= MAX_INCLUDE_DEPTH {
                    return Err(err(PreprocessorErrorKind::IncludeDepth));
                }
                if path == IncludePath::Std("string".into()) {
                    self.string_mode = true;
                }
                let text = self
                    .includes
                    .resolve(&path)
                    .ok_or_else(|| err(PreprocessorErrorKind::MissingInclude(rest.to_string())))?;
                // Every included line is attributed to the #include line itself.
                for included in text.lines() {
                    self.process_line(included, line_no, depth + 1)?;
                }
            }
            "workgroup_count" => {
                if args.len() != 4 {
                    return Err(syntax(
                        "#workgroup_count expects an entry point and 3 arguments".into(),
                    ));
                }
                let mut count = [0u32; 3];
                for (slot, arg) in count.iter_mut().zip(&args[1..]) {
                    *slot = eval::evaluate_u32(&self.substitute(arg)).map_err(err)?;
                }
                self.out.workgroup_count.insert(args[0].to_string(), count);
            }
            "dispatch_once" => {
                if args.len() != 1 {
                    return Err(syntax("#dispatch_once expects an entry point".into()));
                }
                self.out.dispatch_once.insert(args[0].to_string());
            }
            "dispatch_count" => {
                if args.len() != 2 {
                    return Err(syntax(
                        "#dispatch_count expects an entry point and a count".into(),
                    ));
                }
                let count = eval::evaluate_u32(&self.substitute(args[1])).map_err(err)?;
                self.out.dispatch_count.insert(args[0].to_string(), count);
            }
            "define" => {
                let (define, value) = match rest.split_once(char::is_whitespace) {
                    Some((define, value)) => (define, value.trim()),
                    None => (rest, ""),
                };
                if !is_identifier(define) {
                    return Err(syntax("#define needs a name".into()));
                }
                if contains_word(value, define) {
                    return Err(err(PreprocessorErrorKind::SelfReferentialDefine(
                        define.to_string(),
                    )));
                }
                let value = self.substitute(value);
                self.defines.insert(define.to_string(), value);
            }
            "storage" => {
                let (buffer, ty) = rest
                    .split_once(char::is_whitespace)
                    .map(|(b, t)| (b, t.trim()))
                    .filter(|(b, t)| is_identifier(b) && !t.is_empty())
                    .ok_or_else(|| syntax("#storage expects a name and a type".into()))?;
                let slot = *STORAGE_SLOTS
                    .get(self.out.storage_count)
                    .ok_or_else(|| err(PreprocessorErrorKind::StorageExhausted))?;
                let ty = self.substitute(ty);
                let declaration = format!(
                    "@group(0) @binding({}) var<storage,read_write> {}: {};",
                    slot, buffer, ty
                );
                self.out.push_line(&declaration, self.eol, line_no);
                self.out.storage_count += 1;
            }
            other => {
                return Err(syntax(format!("unrecognised directive #{}", other)));
            }
        }
        Ok(())
    }

    /// Whole-word substitution: host overrides first, then `#define`d names.
    fn substitute(&self, text: &str) -> String {
        let once = replace_words(text, &self.overrides);
        replace_words(&once, &self.defines)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_') && chars.all(is_ident_char)
}

fn contains_word(text: &str, word: &str) -> bool {
    words(text).any(|(_, w)| w == word)
}

// Yields (byte offset, identifier-like word) for every maximal run of identifier chars.
fn words(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut start = None;
    let mut spans = Vec::new();
    for (i, c) in text.char_indices() {
        match (is_ident_char(c), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                spans.push((s, &text[s..i]));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, &text[s..]));
    }
    spans.into_iter()
}

fn replace_words(text: &str, table: &HashMap<String, String>) -> String {
    if table.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (offset, word) in words(text) {
        if let Some(replacement) = table.get(word) {
            out.push_str(&text[last..offset]);
            out.push_str(replacement);
            last = offset + word.len();
        }
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<SourceMap, PreprocessorError> {
        let mut includes = IncludeResolver::default();
        Preprocessor::new(&mut includes, screen_overrides(512, 256, STRING_MAX_LEN)).run(source)
    }

    fn run_with(
        includes: &mut IncludeResolver,
        source: &str,
    ) -> Result<SourceMap, PreprocessorError> {
        Preprocessor::new(includes, screen_overrides(512, 256, STRING_MAX_LEN)).run(source)
    }

    fn assert_map_valid(map: &SourceMap, original_lines: usize) {
        assert_eq!(map.map.len(), map.source.lines().count() + 1);
        for &line in &map.map[1..] {
            assert!(line >= 1 && line <= original_lines, "bad mapping {line}");
        }
    }

    #[test]
    fn plain_source_round_trips_with_identity_map() {
        let source = "fn a() {}\n\nfn b() {\n  let x = 1;\n}\n";
        let out = run(source).unwrap();
        assert_eq!(out.source, source);
        assert_eq!(out.map, vec![0, 1, 2, 3, 4, 5]);

        let unterminated = "let a = 1;\nlet b = 2;";
        assert_eq!(run(unterminated).unwrap().source, unterminated);

        let crlf = "fn a() {}\r\nfn b() {}\r\n";
        assert_eq!(run(crlf).unwrap().source, crlf);
        let mixed = "fn a() {}\r\n\nfn b() {}";
        assert_eq!(run(mixed).unwrap().source, mixed);
    }

    #[test]
    fn directives_accept_crlf_endings() {
        let out = run("#define N 4\r\nlet a = N;\r\n#storage data array<u32>\r\n").unwrap();
        assert_eq!(
            out.source,
            "let a = 4;\r\n@group(0) @binding(0) var<storage,read_write> data: array<u32>;\r\n"
        );
        assert_eq!(out.map, vec![0, 2, 3]);
    }

    #[test]
    fn defines_replace_whole_words_only() {
        let out = run("#define N 4\nlet a = N;\nlet NN = N_x + N;\n").unwrap();
        assert_eq!(out.source, "let a = 4;\nlet NN = N_x + 4;\n");
        assert_eq!(out.map, vec![0, 2, 3]);
    }

    #[test]
    fn self_referential_define_is_rejected() {
        let err = run("#define X 1\n#define X X + 1\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(
            err.kind,
            PreprocessorErrorKind::SelfReferentialDefine("X".into())
        );
    }

    #[test]
    fn screen_overrides_are_substituted() {
        let out = run("let r = vec2(SCREEN_WIDTH, SCREEN_HEIGHT);\n").unwrap();
        assert_eq!(out.source, "let r = vec2(512, 256);\n");
    }

    #[test]
    fn override_is_evaluated_and_folded() {
        let out = run("override HALF = SCREEN_WIDTH / 2;\nlet h = HALF;\n").unwrap();
        assert_eq!(out.source, "let h = 256;\n");
        assert_eq!(out.map, vec![0, 2]);

        let err = run("override BAD = window.x;\n").unwrap_err();
        assert!(matches!(err.kind, PreprocessorErrorKind::UnsafeSymbols(_)));
        assert!(run("override MISSING = 3\n").is_err());
    }

    #[test]
    fn enable_lines_become_extensions() {
        let out = run("enable f16;\nlet a = 1;\n").unwrap();
        assert_eq!(out.extensions, "enable f16;\n");
        assert_eq!(out.source, "let a = 1;\n");
        assert_eq!(out.map, vec![0, 2]);
    }

    #[test]
    fn dispatch_directives_are_collected() {
        let out = run(
            "#workgroup_count splat SCREEN_WIDTH/16 2 1\n#dispatch_once init\n#dispatch_count update 3\n",
        )
        .unwrap();
        assert_eq!(out.workgroup_count["splat"], [32, 2, 1]);
        assert_eq!(out.dispatch_count_for("init"), 0);
        assert_eq!(out.dispatch_count_for("update"), 3);
        assert_eq!(out.dispatch_count_for("other"), 1);
        assert_eq!(out.source, "");
    }

    #[test]
    fn workgroup_count_requires_three_arguments() {
        let err = run("\n#workgroup_count main 1 2\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(matches!(err.kind, PreprocessorErrorKind::Directive(_)));
    }

    #[test]
    fn storage_declarations_take_the_next_slot() {
        let out = run("#storage a array<u32>\n#storage b array<vec4f>\n").unwrap();
        assert_eq!(
            out.source,
            "@group(0) @binding(0) var<storage,read_write> a: array<u32>;\n\
             @group(0) @binding(1) var<storage,read_write> b: array<vec4f>;\n"
        );
        assert_eq!(out.storage_count, 2);
    }

    #[test]
    fn third_storage_declaration_always_fails() {
        let decls = ["#storage a u32", "#storage b u32", "#storage c u32"];
        let orders = [[0, 1, 2], [2, 0, 1], [1, 2, 0]];
        for order in orders {
            let mut source = String::from("let x = 1;\n");
            for (n, i) in order.iter().enumerate() {
                source.push_str(decls[*i]);
                source.push('\n');
                if n == 0 {
                    source.push_str("// between\n");
                }
            }
            let err = run(&source).unwrap_err();
            assert_eq!(err.kind, PreprocessorErrorKind::StorageExhausted);
            assert_eq!(err.line, 5);
        }
    }

    #[test]
    fn unknown_directive_is_an_error() {
        let err = run("#pragma once\n").unwrap_err();
        assert!(matches!(err.kind, PreprocessorErrorKind::Directive(_)));
    }

    #[test]
    fn includes_are_expanded_and_attributed_to_the_directive() {
        let mut includes = IncludeResolver::new(
            Some(Box::new(StaticIncludeSource::new().with(
                IncludePath::Std("math".into()),
                "const TAU = 6.28;\n#define TWO 2\nfn twice(x: f32) -> f32 { return x * TWO; }",
            ))),
            None,
        );
        let source = "let a = 1;\n#include <math>\nlet b = TWO;\n";
        let out = run_with(&mut includes, source).unwrap();
        assert_eq!(
            out.source,
            "let a = 1;\nconst TAU = 6.28;\nfn twice(x: f32) -> f32 { return x * 2; }\nlet b = 2;\n"
        );
        assert_eq!(out.map, vec![0, 1, 2, 2, 3]);
        assert_map_valid(&out, 3);
    }

    #[test]
    fn missing_include_aborts() {
        let mut includes = IncludeResolver::default();
        let err = run_with(&mut includes, "let a = 1;\n#include \"nope.wgsl\"\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(
            err.kind,
            PreprocessorErrorKind::MissingInclude("\"nope.wgsl\"".into())
        );
    }

    #[test]
    fn recursive_include_hits_the_depth_limit() {
        let mut includes = IncludeResolver::new(
            None,
            Some(Box::new(StaticIncludeSource::new().with(
                IncludePath::User("loop.wgsl".into()),
                "#include \"loop.wgsl\"",
            ))),
        );
        let err = run_with(&mut includes, "#include \"loop.wgsl\"\n").unwrap_err();
        assert_eq!(err.kind, PreprocessorErrorKind::IncludeDepth);
    }

    #[test]
    fn string_include_enables_literal_rewriting() {
        let mut includes = IncludeResolver::new(
            Some(Box::new(StaticIncludeSource::new().with(
                IncludePath::Std("string".into()),
                "struct String { chars: array<u32, STRING_MAX_LEN>, len: u32 }",
            ))),
            None,
        );
        let out = run_with(&mut includes, "let before = 1;\n#include <string>\nlet s = \"ok\";\n")
            .unwrap();
        let lines: Vec<&str> = out.source.lines().collect();
        assert_eq!(lines[1], "struct String { chars: array<u32, 20>, len: u32 }");
        assert!(lines[2].starts_with("let s = String(array<u32,20>(111u, 107u, 0u"));
        assert!(lines[2].ends_with(", 2u);"));

        let long = format!("#include <string>\nlet s = \"{}\";\n", "x".repeat(21));
        let err = run_with(&mut includes, &long).unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, Some(9));
        assert_eq!(
            err.kind,
            PreprocessorErrorKind::StringTooLong { len: 21, max: 20 }
        );
    }

    #[test]
    fn mixed_directives_keep_the_map_valid() {
        let source = "\
#define W 8
enable f16;
override H = W * 2;
#storage data array<f32>
#workgroup_count main W H 1
#dispatch_count main 2
@compute @workgroup_size(W, H)
fn main() {
  data[0] = f32(H);
}
";
        let out = run(source).unwrap();
        assert_map_valid(&out, source.lines().count());
        assert_eq!(out.map, vec![0, 4, 7, 8, 9, 10]);
        assert!(out.source.contains("@workgroup_size(8, 16)"));
        assert_eq!(out.workgroup_count["main"], [8, 16, 1]);
    }
}
