//! Line-based shader preprocessor.
//!
//! Supports `#define NAME [value]`, `#ifdef`, `#ifndef`, `#if`, `#elif`,
//! `#else`, `#endif` and `#include <name>`. Conditions are a name, a number,
//! `defined(NAME)` or `NAME <op> NUMBER` with `op` one of
//! `== != < <= > >=`. Undefined names evaluate to zero.

use std::collections::BTreeMap;

const MAX_INCLUDE_DEPTH: usize = 8;

/// Named integer values visible to the preprocessor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Defines(BTreeMap<String, i64>);

impl Defines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: i64) -> &mut Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Defines `name` as 1 when `enabled`.
    pub fn flag(&mut self, name: &str, enabled: bool) -> &mut Self {
        if enabled {
            self.set(name, 1);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// WGSL `const` declarations for every define, in name order.
    pub fn to_wgsl_consts(&self) -> String {
        self.iter()
            .map(|(name, value)| format!("const {}: u32 = {}u;\n", name, value.max(0)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PreprocessError {
    #[error("line {line}: unknown directive `{directive}`")]
    UnknownDirective { line: usize, directive: String },
    #[error("line {line}: malformed directive `{text}`")]
    Malformed { line: usize, text: String },
    #[error("line {line}: `{directive}` without matching #if")]
    Unmatched { line: usize, directive: String },
    #[error("#if opened on line {line} is never closed")]
    Unterminated { line: usize },
    #[error("line {line}: unknown include <{name}>")]
    UnknownInclude { line: usize, name: String },
    #[error("includes nested deeper than {MAX_INCLUDE_DEPTH} at <{name}>")]
    IncludeDepth { name: String },
}

/// Resolves `#include <name>` to source text.
pub trait IncludeResolver {
    fn resolve(&self, name: &str) -> Option<&str>;
}

impl<F> IncludeResolver for F
where
    F: Fn(&str) -> Option<&'static str>,
{
    fn resolve(&self, name: &str) -> Option<&str> {
        self(name)
    }
}

struct Branch {
    line: usize,
    /// Whether the enclosing region emits lines.
    parent_active: bool,
    /// Whether the current arm emits lines.
    active: bool,
    /// Whether any arm of this chain has been taken.
    taken: bool,
    seen_else: bool,
}

/// Runs the preprocessor over `source`. `#define`s in the source extend a
/// copy of `defines` for the rest of the run.
pub fn preprocess(
    source: &str,
    defines: &Defines,
    includes: &dyn IncludeResolver,
) -> Result<String, PreprocessError> {
    let mut defines = defines.clone();
    let mut out = String::with_capacity(source.len());
    process(source, &mut defines, includes, 0, &mut out)?;
    Ok(out)
}

fn process(
    source: &str,
    defines: &mut Defines,
    includes: &dyn IncludeResolver,
    depth: usize,
    out: &mut String,
) -> Result<(), PreprocessError> {
    let mut stack: Vec<Branch> = Vec::new();
    let active = |stack: &[Branch]| stack.last().is_none_or(|b| b.active);

    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim_start();
        let Some(directive) = trimmed.strip_prefix('#') else {
            if active(&stack) {
                out.push_str(raw);
                out.push('\n');
            }
            continue;
        };
        let directive = directive.trim();
        let (keyword, rest) = directive
            .split_once(char::is_whitespace)
            .map(|(k, r)| (k, r.trim()))
            .unwrap_or((directive, ""));

        match keyword {
            "ifdef" | "ifndef" | "if" => {
                let parent_active = active(&stack);
                let cond = match keyword {
                    "ifdef" => defines.contains(name_of(rest, line)?),
                    "ifndef" => !defines.contains(name_of(rest, line)?),
                    _ => evaluate(rest, defines, line)?,
                };
                stack.push(Branch {
                    line,
                    parent_active,
                    active: parent_active && cond,
                    taken: cond,
                    seen_else: false,
                });
            }
            "elif" => {
                let branch = stack.last_mut().filter(|b| !b.seen_else).ok_or_else(|| {
                    PreprocessError::Unmatched {
                        line,
                        directive: "#elif".into(),
                    }
                })?;
                let cond = !branch.taken && evaluate(rest, defines, line)?;
                branch.active = branch.parent_active && cond;
                branch.taken |= cond;
            }
            "else" => {
                let branch = stack.last_mut().filter(|b| !b.seen_else).ok_or_else(|| {
                    PreprocessError::Unmatched {
                        line,
                        directive: "#else".into(),
                    }
                })?;
                branch.active = branch.parent_active && !branch.taken;
                branch.taken = true;
                branch.seen_else = true;
            }
            "endif" => {
                stack.pop().ok_or_else(|| PreprocessError::Unmatched {
                    line,
                    directive: "#endif".into(),
                })?;
            }
            "define" if active(&stack) => {
                let mut parts = rest.split_whitespace();
                let name = parts.next().ok_or_else(|| PreprocessError::Malformed {
                    line,
                    text: directive.to_string(),
                })?;
                let value = match parts.next() {
                    Some(v) => parse_number(v, line)?,
                    None => 1,
                };
                defines.set(name, value);
            }
            "include" if active(&stack) => {
                let name = rest
                    .strip_prefix('<')
                    .and_then(|r| r.strip_suffix('>'))
                    .or_else(|| rest.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
                    .ok_or_else(|| PreprocessError::Malformed {
                        line,
                        text: directive.to_string(),
                    })?;
                if depth >= MAX_INCLUDE_DEPTH {
                    return Err(PreprocessError::IncludeDepth {
                        name: name.to_string(),
                    });
                }
                let text = includes
                    .resolve(name)
                    .ok_or_else(|| PreprocessError::UnknownInclude {
                        line,
                        name: name.to_string(),
                    })?;
                process(text, defines, includes, depth + 1, out)?;
            }
            "define" | "include" => {}
            other => {
                return Err(PreprocessError::UnknownDirective {
                    line,
                    directive: other.to_string(),
                });
            }
        }
    }

    match stack.first() {
        Some(branch) => Err(PreprocessError::Unterminated { line: branch.line }),
        None => Ok(()),
    }
}

fn name_of(rest: &str, line: usize) -> Result<&str, PreprocessError> {
    let name = rest.trim();
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(PreprocessError::Malformed {
            line,
            text: rest.to_string(),
        })
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_number(s: &str, line: usize) -> Result<i64, PreprocessError> {
    s.trim_end_matches('u').parse().map_err(|_| PreprocessError::Malformed {
        line,
        text: s.to_string(),
    })
}

fn operand(s: &str, defines: &Defines, line: usize) -> Result<i64, PreprocessError> {
    let s = s.trim();
    if let Some(inner) = s.strip_prefix("defined(").and_then(|r| r.strip_suffix(')')) {
        return Ok(defines.contains(name_of(inner, line)?) as i64);
    }
    if is_identifier(s) {
        return Ok(defines.get(s).unwrap_or(0));
    }
    parse_number(s, line)
}

fn evaluate(expr: &str, defines: &Defines, line: usize) -> Result<bool, PreprocessError> {
    // Two-character operators first so `>=` is not read as `>`.
    for op in ["==", "!=", "<=", ">=", "<", ">"] {
        if let Some((lhs, rhs)) = expr.split_once(op) {
            let (a, b) = (operand(lhs, defines, line)?, operand(rhs, defines, line)?);
            return Ok(match op {
                "==" => a == b,
                "!=" => a != b,
                "<=" => a <= b,
                ">=" => a >= b,
                "<" => a < b,
                _ => a > b,
            });
        }
    }
    if expr.trim().is_empty() {
        return Err(PreprocessError::Malformed {
            line,
            text: expr.to_string(),
        });
    }
    Ok(operand(expr, defines, line)? != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_includes(_: &str) -> Option<&'static str> {
        None
    }

    fn run(source: &str, defines: &Defines) -> Result<String, PreprocessError> {
        preprocess(source, defines, &no_includes)
    }

    #[test]
    fn test_ifdef_else() {
        let src = "a\n#ifdef X\nb\n#else\nc\n#endif\nd\n";
        let mut defines = Defines::new();
        assert_eq!(run(src, &defines).unwrap(), "a\nc\nd\n");
        defines.flag("X", true);
        assert_eq!(run(src, &defines).unwrap(), "a\nb\nd\n");
    }

    #[test]
    fn test_numeric_conditions() {
        let src = "#if NUM > 1\nmany\n#elif NUM == 1\none\n#else\nnone\n#endif\n";
        let mut defines = Defines::new();
        assert_eq!(run(src, &defines).unwrap(), "none\n");
        defines.set("NUM", 1);
        assert_eq!(run(src, &defines).unwrap(), "one\n");
        defines.set("NUM", 3);
        assert_eq!(run(src, &defines).unwrap(), "many\n");
    }

    #[test]
    fn test_nested_inactive_region_stays_inactive() {
        let src = "#ifdef A\n#ifndef B\nx\n#else\ny\n#endif\n#endif\nz\n";
        assert_eq!(run(src, &Defines::new()).unwrap(), "z\n");
    }

    #[test]
    fn test_define_and_include() {
        let includes = |name: &str| match name {
            "common" => Some("#define FROM_COMMON 2\ncommon\n"),
            _ => None,
        };
        let src = "#include <common>\n#if FROM_COMMON >= 2\nok\n#endif\n";
        assert_eq!(preprocess(src, &Defines::new(), &includes).unwrap(), "common\nok\n");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            run("#ifdef X\n", &Defines::new()),
            Err(PreprocessError::Unterminated { line: 1 })
        ));
        assert!(matches!(
            run("#endif\n", &Defines::new()),
            Err(PreprocessError::Unmatched { line: 1, .. })
        ));
        assert!(matches!(
            run("#include <missing>\n", &Defines::new()),
            Err(PreprocessError::UnknownInclude { .. })
        ));
        assert!(matches!(
            run("#pragma once\n", &Defines::new()),
            Err(PreprocessError::UnknownDirective { .. })
        ));
    }

    #[test]
    fn test_wgsl_consts() {
        let mut defines = Defines::new();
        defines.set("NUM_DIR_LIGHTS", 2).flag("HAS_SHADOWS", true);
        assert_eq!(
            defines.to_wgsl_consts(),
            "const HAS_SHADOWS: u32 = 1u;\nconst NUM_DIR_LIGHTS: u32 = 2u;\n"
        );
    }
}
