//! Round-trip between an argv vector and a shell-safe one-line rendering.
//!
//! `format_argv` produces the command text shown to operators and recorded in
//! audit events; `parse_argv` is used only on shell-wrapped content. The pair
//! must round-trip exactly, otherwise the text an operator approves can drift
//! from the argv that executes.

/// Characters that force a token into quoted form.
///
/// Anything the POSIX shell or cmd.exe treats as structure (operators,
/// expansion, globbing, comments) plus whitespace and both quote characters.
fn is_plain_token(token: &str) -> bool {
    !token.is_empty()
        && !token.chars().any(|c| {
            matches!(
                c,
                ' ' | '\t'
                    | '\''
                    | '"'
                    | '\\'
                    | '$'
                    | '`'
                    | '&'
                    | '|'
                    | ';'
                    | '<'
                    | '>'
                    | '('
                    | ')'
                    | '*'
                    | '?'
                    | '['
                    | ']'
                    | '{'
                    | '}'
                    | '#'
                    | '~'
                    | '!'
            ) || c.is_control()
        })
}

/// Render argv as a single shell-safe line.
///
/// Plain tokens are emitted verbatim; everything else is wrapped in double
/// quotes with embedded `"` and `\` escaped by backslash. Tokens join with a
/// single space. Total and injective over NUL-free argv.
pub fn format_argv<S: AsRef<str>>(argv: &[S]) -> String {
    let mut out = String::new();
    for (i, token) in argv.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let token = token.as_ref();
        if is_plain_token(token) {
            out.push_str(token);
        } else {
            out.push('"');
            for c in token.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuoteState {
    None,
    Single,
    Double,
}

/// Split a one-line shell rendering back into argv tokens.
///
/// Honors single quotes (fully literal), double quotes (backslash escapes
/// `"` `\` `$` `` ` `` only), and backslash escapes outside quotes.
/// Fails on an unterminated quote or a trailing backslash.
pub fn parse_argv(line: &str) -> anyhow::Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote = QuoteState::None;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match quote {
            QuoteState::Single => {
                if ch == '\'' {
                    quote = QuoteState::None;
                } else {
                    current.push(ch);
                }
            }
            QuoteState::Double => match ch {
                '"' => quote = QuoteState::None,
                '\\' => match chars.peek() {
                    Some(&next @ ('"' | '\\' | '$' | '`')) => {
                        current.push(next);
                        chars.next();
                    }
                    Some(_) => current.push('\\'),
                    None => anyhow::bail!("trailing backslash in double quotes"),
                },
                _ => current.push(ch),
            },
            QuoteState::None => match ch {
                '\'' => {
                    quote = QuoteState::Single;
                    in_token = true;
                }
                '"' => {
                    quote = QuoteState::Double;
                    in_token = true;
                }
                '\\' => {
                    let Some(next) = chars.next() else {
                        anyhow::bail!("trailing backslash");
                    };
                    current.push(next);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(ch);
                    in_token = true;
                }
            },
        }
    }

    if quote != QuoteState::None {
        anyhow::bail!("unterminated quote");
    }
    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(argv: &[&str]) {
        let rendered = format_argv(argv);
        let parsed = parse_argv(&rendered).expect("rendered line should parse");
        assert_eq!(parsed, argv, "round-trip failed for {rendered:?}");
    }

    #[test]
    fn plain_tokens_verbatim() {
        assert_eq!(format_argv(&["echo", "hi"]), "echo hi");
        assert_eq!(format_argv(&["/usr/bin/git", "status"]), "/usr/bin/git status");
    }

    #[test]
    fn empty_token_is_quoted() {
        assert_eq!(format_argv(&["echo", ""]), "echo \"\"");
        roundtrip(&["echo", ""]);
    }

    #[test]
    fn metacharacters_force_quoting() {
        assert_eq!(format_argv(&["echo", "a b"]), "echo \"a b\"");
        assert_eq!(format_argv(&["echo", "$(whoami)"]), "echo \"$(whoami)\"");
        assert_eq!(format_argv(&["echo", "a&&b"]), "echo \"a&&b\"");
    }

    #[test]
    fn embedded_quote_and_backslash_escaped() {
        assert_eq!(format_argv(&["echo", "a\"b"]), "echo \"a\\\"b\"");
        assert_eq!(format_argv(&["echo", "a\\b"]), "echo \"a\\\\b\"");
    }

    #[test]
    fn roundtrip_covers_awkward_tokens() {
        roundtrip(&["echo", "hi"]);
        roundtrip(&["echo", "a b", "c\td"]);
        roundtrip(&["grep", "-e", "fo*o?", "[ab]"]);
        roundtrip(&["sh", "-c", "echo 'one' && echo \"two\""]);
        roundtrip(&["printf", "%s\\n", "back\\slash"]);
        roundtrip(&["echo", "~user", "#comment", "!bang"]);
        roundtrip(&["echo", "uni🦀code", "café"]);
        roundtrip(&["cmd.exe", "/c", "echo", "SAFE&&whoami"]);
    }

    #[test]
    fn parse_honors_single_quotes_literally() {
        let argv = parse_argv("echo '$(rm -rf /)' end").unwrap();
        assert_eq!(argv, vec!["echo", "$(rm -rf /)", "end"]);
    }

    #[test]
    fn parse_double_quote_escapes() {
        let argv = parse_argv(r#"echo "a\"b" "c\$d" "e\nf""#).unwrap();
        // \n inside double quotes is not an escape; backslash is literal.
        assert_eq!(argv, vec!["echo", "a\"b", "c$d", "e\\nf"]);
    }

    #[test]
    fn parse_rejects_unterminated_quote() {
        assert!(parse_argv("echo 'oops").is_err());
        assert!(parse_argv("echo \"oops").is_err());
        assert!(parse_argv("echo oops\\").is_err());
    }

    #[test]
    fn parse_collapses_runs_of_whitespace() {
        let argv = parse_argv("  echo   hi\t there  ").unwrap();
        assert_eq!(argv, vec!["echo", "hi", "there"]);
    }
}
