//! Placeholder substitution for build and test command lines.
//!
//! Supports `${name}`, `$name` and `$$` (a literal dollar sign).

use derive_more::derive::{Display, Error};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum TemplateError {
    #[display("undefined placeholder \"{name}\" in \"{template}\"")]
    Undefined { name: String, template: String },
    #[display("malformed placeholder at offset {offset} in \"{template}\"")]
    Malformed { offset: usize, template: String },
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_ascii_alphabetic()
}

fn is_ident_char(c: char) -> bool {
    c == '_' || c.is_ascii_alphanumeric()
}

/// Substitutes every placeholder of a single template.
pub fn substitute(template: &str, values: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    let lookup = |name: &str| {
        values
            .get(name)
            .cloned()
            .ok_or_else(|| TemplateError::Undefined {
                name: name.to_string(),
                template: template.to_string(),
            })
    };
    let malformed = |offset: usize| TemplateError::Malformed {
        offset,
        template: template.to_string(),
    };

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                let valid = name.chars().next().is_some_and(is_ident_start)
                    && name.chars().all(is_ident_char);
                if !closed || !valid {
                    return Err(malformed(i));
                }
                out.push_str(&lookup(&name)?);
            }
            Some((_, c)) if is_ident_start(c) => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek().copied() {
                    if !is_ident_char(c) {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                out.push_str(&lookup(&name)?);
            }
            _ => return Err(malformed(i)),
        }
    }
    Ok(out)
}

/// Substitutes every argument of a command line.
pub fn substitute_all<S: AsRef<str>>(
    args: &[S],
    values: &BTreeMap<String, String>,
) -> Result<Vec<String>, TemplateError> {
    args.iter()
        .map(|a| substitute(a.as_ref(), values))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    fn values() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("source_dir".to_string(), "/work/src".to_string()),
            ("build_dir".to_string(), "/work/bin".to_string()),
            ("cc".to_string(), "gcc".to_string()),
        ])
    }

    #[test]
    fn test_braced_and_bare() {
        let args = ["${cc}", "-o", "${build_dir}/a.out", "$source_dir/main.c"];
        assert_that!(substitute_all(&args, &values())).has_value(vec![
            "gcc".to_string(),
            "-o".to_string(),
            "/work/bin/a.out".to_string(),
            "/work/src/main.c".to_string(),
        ]);
    }

    #[test]
    fn test_literal_dollar() {
        assert_that!(substitute("cost: $$5", &values())).has_value("cost: $5".to_string());
        assert_that!(substitute("no placeholders", &values()))
            .has_value("no placeholders".to_string());
    }

    #[test]
    fn test_undefined_is_error() {
        assert_that!(substitute("${nope}", &values())).is_equal_to(Err(TemplateError::Undefined {
            name: "nope".to_string(),
            template: "${nope}".to_string(),
        }));
        assert_that!(substitute("$nope/x", &values())).is_err();
    }

    #[test]
    fn test_malformed_is_error() {
        for t in ["${cc", "${}", "${1abc}", "trailing $", "$-x", "${a b}"] {
            assert_that!(substitute(t, &values())).is_err();
        }
    }
}
