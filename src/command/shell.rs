//! Shell command analysis.
//!
//! Splits a shell command string into segments (one program invocation each)
//! and the operators between them, and recognizes the shell-wrapper argv
//! forms (`sh -lc …`, `cmd.exe /c …`) whose embedded command is what the
//! operator actually approves. The lexer reasons about the *structure* of a
//! command (separators, operators, quoting) rather than treating it as a
//! flat string; anything it cannot model soundly marks the whole command
//! unanalyzable instead of guessing.

use super::resolve::Resolution;
use crate::util::program_basename;

/// Operator encountered between or attached to segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Pipe,
    And,
    Or,
    Semicolon,
    Background,
    Redirect,
    Subshell,
}

/// A redirection attached to a segment, e.g. `> out.log` or `2>&1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    /// Operator text as written (`>`, `>>`, `2>`, `&>`, `>&1`, …).
    pub operator: String,
    /// Target word, when the operator takes one. `None` for fd-duplication
    /// forms and for an operator dangling at end of input.
    pub target: Option<String>,
}

/// One program invocation between shell operators.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub argv: Vec<String>,
    pub redirections: Vec<Redirection>,
    pub resolution: Option<Resolution>,
}

/// Result of analyzing a command, shell or argv form.
///
/// `ok == false` means the command used constructs that prevent safe
/// analysis (substitution, unterminated quoting, …); segment contents are
/// then best-effort and must not be trusted for allow decisions.
#[derive(Debug, Clone, Default)]
pub struct AnalyzedCommand {
    pub ok: bool,
    pub segments: Vec<Segment>,
    pub operators: Vec<Op>,
}

impl AnalyzedCommand {
    fn not_analyzable() -> Self {
        Self::default()
    }

    /// Analysis of a direct argv invocation: no shell sits between the
    /// gatekeeper and the program, so the argv is a single literal segment.
    pub fn from_argv(argv: &[String]) -> Self {
        if argv.is_empty() {
            return Self::not_analyzable();
        }
        Self {
            ok: true,
            segments: vec![Segment {
                argv: argv.to_vec(),
                ..Segment::default()
            }],
            operators: Vec::new(),
        }
    }
}

/// Extract the embedded command from a recognized shell-wrapper argv.
///
/// POSIX form: `sh|bash|dash|zsh -c|-lc <command> [args…]` — the command is
/// `argv[2]`; further entries are positional parameters and never part of
/// the command text.
///
/// Windows form: `cmd[.exe] …flags… /c|/k <t1> <t2> … <tn>` — cmd.exe
/// receives everything after the switch as a single command line, so the
/// extraction joins all remaining entries with single spaces. Returning
/// only `t1` would let `t2…tn` smuggle operators past the approval prompt.
pub fn extract_shell_command_from_argv(argv: &[String]) -> Option<String> {
    let first = argv.first()?;
    let base = program_basename(first);

    if matches!(base, "sh" | "bash" | "dash" | "zsh") {
        if argv.len() >= 3 && matches!(argv[1].as_str(), "-c" | "-lc") {
            return Some(argv[2].clone());
        }
        return None;
    }

    if base.eq_ignore_ascii_case("cmd.exe") || base.eq_ignore_ascii_case("cmd") {
        let switch = argv
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, a)| a.eq_ignore_ascii_case("/c") || a.eq_ignore_ascii_case("/k"))?;
        let rest = &argv[switch.0 + 1..];
        if !rest.is_empty() {
            return Some(rest.join(" "));
        }
        return None;
    }

    None
}

/// True when the outer invocation is cmd.exe (wrapped or not). The Windows
/// decision rule keys off this even after wrapper extraction.
pub fn outer_is_cmd_exe(argv: &[String]) -> bool {
    argv.first().is_some_and(|first| {
        let base = program_basename(first);
        base.eq_ignore_ascii_case("cmd.exe") || base.eq_ignore_ascii_case("cmd")
    })
}

/// True if any raw argument still carries shell operator metacharacters.
///
/// Used to re-check safe-bin / skill-bin segments before they auto-satisfy
/// the allowlist: the program may be trusted, its arguments still must not
/// carry structure a downstream shell could interpret.
pub fn args_contain_metachars<S: AsRef<str>>(args: &[S]) -> bool {
    args.iter().any(|arg| {
        arg.as_ref()
            .chars()
            .any(|c| matches!(c, '&' | '|' | ';' | '<' | '>' | '$' | '`' | '(' | ')' | '\n'))
    })
}

fn is_env_assignment(word: &str) -> bool {
    let Some((name, _)) = word.split_once('=') else {
        return false;
    };
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuoteState {
    None,
    Single,
    Double,
}

struct Lexer {
    segments: Vec<Segment>,
    operators: Vec<Op>,
    words: Vec<String>,
    redirections: Vec<Redirection>,
    current: String,
    in_word: bool,
    pending_redirect: Option<String>,
}

impl Lexer {
    fn new() -> Self {
        Self {
            segments: Vec::new(),
            operators: Vec::new(),
            words: Vec::new(),
            redirections: Vec::new(),
            current: String::new(),
            in_word: false,
            pending_redirect: None,
        }
    }

    fn push_char(&mut self, c: char) {
        self.current.push(c);
        self.in_word = true;
    }

    fn flush_word(&mut self) {
        if !self.in_word {
            return;
        }
        let text = std::mem::take(&mut self.current);
        if let Some(operator) = self.pending_redirect.take() {
            self.redirections.push(Redirection {
                operator,
                target: Some(text),
            });
        } else {
            self.words.push(text);
        }
        self.in_word = false;
    }

    fn end_segment(&mut self, op: Option<Op>) {
        self.flush_word();
        if let Some(operator) = self.pending_redirect.take() {
            // Dangling redirection operator; recorded targetless so the
            // evaluator treats it as escaping.
            self.redirections.push(Redirection {
                operator,
                target: None,
            });
        }
        if !self.words.is_empty() || !self.redirections.is_empty() {
            self.segments.push(Segment {
                argv: std::mem::take(&mut self.words),
                redirections: std::mem::take(&mut self.redirections),
                resolution: None,
            });
        }
        if let Some(op) = op {
            self.operators.push(op);
        }
    }

    /// Begin a redirection. An all-digit word already being lexed becomes
    /// the fd prefix (`2>`, `12>>`).
    fn start_redirect(
        &mut self,
        mut operator: String,
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    ) {
        if self.in_word
            && !self.current.is_empty()
            && self.current.chars().all(|c| c.is_ascii_digit())
        {
            let fd = std::mem::take(&mut self.current);
            self.in_word = false;
            operator = format!("{fd}{operator}");
        } else {
            self.flush_word();
        }

        // Doubled operator: `>>`, `<<`.
        let repeat = operator.chars().last();
        if let (Some(tail), Some(&next)) = (repeat, chars.peek()) {
            if (tail == '>' || tail == '<') && next == tail {
                chars.next();
                operator.push(next);
            }
        }

        // fd duplication (`>&2`, `2>&1`) is complete without a target word.
        if chars.peek() == Some(&'&') {
            chars.next();
            operator.push('&');
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    operator.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            self.redirections.push(Redirection {
                operator,
                target: None,
            });
        } else {
            if let Some(dangling) = self.pending_redirect.take() {
                self.redirections.push(Redirection {
                    operator: dangling,
                    target: None,
                });
            }
            self.pending_redirect = Some(operator);
        }
        self.operators.push(Op::Redirect);
    }
}

/// Tokenize a shell command into segments and operators.
///
/// Splitters: `|`, `||`, `&&`, `;`, newline, and background `&`. Redirection
/// tokens stay attached to their segment. Constructs that defeat static
/// analysis — command substitution (`$(…)`, backquotes), process
/// substitution (`<(…)`, `>(…)`), `${…}` expansion, unterminated quotes,
/// leading variable assignments, and a glob in command position — yield
/// `ok == false`.
pub fn parse_shell(command: &str) -> AnalyzedCommand {
    let mut lexer = Lexer::new();
    let mut quote = QuoteState::None;
    let mut chars = command.chars().peekable();

    while let Some(ch) = chars.next() {
        match quote {
            QuoteState::Single => {
                if ch == '\'' {
                    quote = QuoteState::None;
                } else {
                    lexer.push_char(ch);
                }
            }
            QuoteState::Double => match ch {
                '"' => quote = QuoteState::None,
                // Substitution stays live inside double quotes.
                '`' => return AnalyzedCommand::not_analyzable(),
                '$' if matches!(chars.peek(), Some('(' | '{')) => {
                    return AnalyzedCommand::not_analyzable();
                }
                '\\' => match chars.peek() {
                    Some(&next @ ('"' | '\\' | '$' | '`')) => {
                        lexer.push_char(next);
                        chars.next();
                    }
                    Some(_) => lexer.push_char('\\'),
                    None => return AnalyzedCommand::not_analyzable(),
                },
                _ => lexer.push_char(ch),
            },
            QuoteState::None => match ch {
                '\'' => {
                    quote = QuoteState::Single;
                    lexer.in_word = true;
                }
                '"' => {
                    quote = QuoteState::Double;
                    lexer.in_word = true;
                }
                '`' => return AnalyzedCommand::not_analyzable(),
                '$' if matches!(chars.peek(), Some('(' | '{')) => {
                    return AnalyzedCommand::not_analyzable();
                }
                '\\' => match chars.next() {
                    Some(next) => lexer.push_char(next),
                    None => return AnalyzedCommand::not_analyzable(),
                },
                ' ' | '\t' => lexer.flush_word(),
                '\n' => lexer.end_segment(Some(Op::Semicolon)),
                ';' => lexer.end_segment(Some(Op::Semicolon)),
                '|' => {
                    if chars.peek() == Some(&'|') {
                        chars.next();
                        lexer.end_segment(Some(Op::Or));
                    } else {
                        lexer.end_segment(Some(Op::Pipe));
                    }
                }
                '&' => match chars.peek() {
                    Some('&') => {
                        chars.next();
                        lexer.end_segment(Some(Op::And));
                    }
                    Some('>') => {
                        chars.next();
                        lexer.start_redirect("&>".to_string(), &mut chars);
                    }
                    _ => lexer.end_segment(Some(Op::Background)),
                },
                '<' => {
                    if chars.peek() == Some(&'(') {
                        return AnalyzedCommand::not_analyzable();
                    }
                    lexer.start_redirect("<".to_string(), &mut chars);
                }
                '>' => {
                    if chars.peek() == Some(&'(') {
                        return AnalyzedCommand::not_analyzable();
                    }
                    lexer.start_redirect(">".to_string(), &mut chars);
                }
                '(' | ')' => {
                    lexer.flush_word();
                    lexer.operators.push(Op::Subshell);
                }
                '#' if !lexer.in_word => {
                    // Comment runs to end of line.
                    for c in chars.by_ref() {
                        if c == '\n' {
                            lexer.end_segment(Some(Op::Semicolon));
                            break;
                        }
                    }
                }
                _ => lexer.push_char(ch),
            },
        }
    }

    if quote != QuoteState::None {
        return AnalyzedCommand::not_analyzable();
    }

    lexer.end_segment(None);

    finish_analysis(AnalyzedCommand {
        ok: true,
        segments: lexer.segments,
        operators: lexer.operators,
    })
}

fn finish_analysis(analyzed: AnalyzedCommand) -> AnalyzedCommand {
    if analyzed.segments.is_empty() {
        return AnalyzedCommand::not_analyzable();
    }

    for segment in &analyzed.segments {
        match segment.argv.first() {
            None => {}
            // A leading variable assignment changes how the shell resolves
            // and runs the program (PATH, LD_PRELOAD) out from under the
            // analysis.
            Some(first) if is_env_assignment(first) => {
                return AnalyzedCommand::not_analyzable();
            }
            // Glob in command position: the program executed depends on
            // directory contents. Quoting information is gone by this point,
            // so a quoted glob over-rejects rather than under-rejects.
            Some(first)
                if first.contains('*') || first.contains('?') || first.contains('[') =>
            {
                return AnalyzedCommand::not_analyzable();
            }
            Some(_) => {}
        }
    }

    analyzed
}
