//! Just enough shell lexing to classify a command line: split it into
//! simple commands, note redirections and substitutions. Quotes and
//! backslash escapes are respected; nothing is expanded.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    And,
    Or,
    Seq,
    Pipe,
    Background,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::And => "&&",
            Operator::Or => "||",
            Operator::Seq => ";",
            Operator::Pipe => "|",
            Operator::Background => "&",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    /// The simple command with redirections removed and whitespace collapsed.
    pub text: String,
    /// Output redirected somewhere other than `/dev/null`.
    pub writes_file: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCommand {
    /// One entry per simple command; empty text for gaps like `a ;; b`.
    pub segments: Vec<Segment>,
    /// `operators[i]` sits between `segments[i]` and `segments[i + 1]`.
    pub operators: Vec<Operator>,
    /// `$(...)`, backticks, or `<(...)` / `>(...)` outside single quotes.
    pub has_substitution: bool,
    /// A quote was left open.
    pub unterminated: bool,
}

impl ParsedCommand {
    pub fn non_empty(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| !s.text.is_empty())
    }

    pub fn writes_file(&self) -> bool {
        self.segments.iter().any(|s| s.writes_file)
    }

    pub fn only_pipes(&self) -> bool {
        self.operators.iter().all(|op| *op == Operator::Pipe)
    }

    /// Rebuild a command line from (possibly rewritten) segment texts.
    pub fn join_with(&self, texts: &[String]) -> String {
        let mut out = String::new();
        for (i, text) in texts.iter().enumerate() {
            if i > 0 {
                if let Some(op) = self.operators.get(i - 1) {
                    out.push(' ');
                    out.push_str(op.as_str());
                }
                if !text.is_empty() {
                    out.push(' ');
                }
            }
            out.push_str(text);
        }
        out.trim().to_string()
    }
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_word_end(c: char) -> bool {
    c.is_whitespace() || matches!(c, ';' | '&' | '|' | '<' | '>' | '(' | ')')
}

pub fn parse(input: &str) -> ParsedCommand {
    let chars: Vec<char> = input.chars().collect();
    let mut parsed = ParsedCommand::default();
    let mut current = String::new();
    let mut writes = false;
    let mut quote: Option<char> = None;
    let mut i = 0;

    let finish = |parsed: &mut ParsedCommand, current: &mut String, writes: &mut bool| {
        parsed.segments.push(Segment {
            text: collapse(current),
            writes_file: *writes,
        });
        current.clear();
        *writes = false;
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            } else if q == '"' {
                match c {
                    '\\' => {
                        if let Some(n) = next {
                            current.push(n);
                            i += 1;
                        }
                    }
                    '`' => parsed.has_substitution = true,
                    '$' if next == Some('(') => parsed.has_substitution = true,
                    _ => {}
                }
            }
            i += 1;
            continue;
        }

        match c {
            '\\' => {
                current.push(c);
                if let Some(n) = next {
                    current.push(n);
                    i += 1;
                }
            }
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            '`' => {
                parsed.has_substitution = true;
                current.push(c);
            }
            '$' if next == Some('(') => {
                parsed.has_substitution = true;
                current.push(c);
            }
            '<' | '>' if next == Some('(') => {
                parsed.has_substitution = true;
                current.push(c);
            }
            '>' => {
                // `2>` / `1>`: the descriptor belongs to the redirection.
                let so_far: Vec<char> = current.chars().collect();
                if let Some(last) = so_far.last() {
                    let lone = so_far.len() == 1 || so_far[so_far.len() - 2].is_whitespace();
                    if last.is_ascii_digit() && lone {
                        current.pop();
                    }
                }
                let mut j = i + 1;
                if chars.get(j) == Some(&'>') {
                    j += 1;
                }
                if chars.get(j) == Some(&'&') {
                    // Descriptor duplication such as `2>&1`.
                    j += 1;
                    while chars.get(j).is_some_and(|c| c.is_ascii_digit() || *c == '-') {
                        j += 1;
                    }
                    i = j;
                    current.push(' ');
                    continue;
                }
                if chars.get(j) == Some(&'|') {
                    j += 1;
                }
                while chars.get(j).is_some_and(|c| c.is_whitespace() && *c != '\n') {
                    j += 1;
                }
                let mut target = String::new();
                let mut target_quote: Option<char> = None;
                while let Some(&t) = chars.get(j) {
                    match target_quote {
                        Some(q) if t == q => target_quote = None,
                        Some(_) => target.push(t),
                        None if t == '\'' || t == '"' => target_quote = Some(t),
                        None if is_word_end(t) => break,
                        None => target.push(t),
                    }
                    j += 1;
                }
                if target != "/dev/null" {
                    writes = true;
                }
                current.push(' ');
                i = j;
                continue;
            }
            '&' if next == Some('>') => {
                // `&>file`: handled as `>` on the next pass.
                current.push(' ');
            }
            '&' if next == Some('&') => {
                finish(&mut parsed, &mut current, &mut writes);
                parsed.operators.push(Operator::And);
                i += 2;
                continue;
            }
            '&' => {
                finish(&mut parsed, &mut current, &mut writes);
                parsed.operators.push(Operator::Background);
            }
            '|' if next == Some('|') => {
                finish(&mut parsed, &mut current, &mut writes);
                parsed.operators.push(Operator::Or);
                i += 2;
                continue;
            }
            '|' if next == Some('&') => {
                finish(&mut parsed, &mut current, &mut writes);
                parsed.operators.push(Operator::Pipe);
                i += 2;
                continue;
            }
            '|' => {
                finish(&mut parsed, &mut current, &mut writes);
                parsed.operators.push(Operator::Pipe);
            }
            ';' | '\n' => {
                finish(&mut parsed, &mut current, &mut writes);
                parsed.operators.push(Operator::Seq);
            }
            _ => current.push(c),
        }
        i += 1;
    }

    parsed.unterminated = quote.is_some();
    finish(&mut parsed, &mut current, &mut writes);

    // Trailing separators (`cmd;`, `cmd &`) leave an empty last segment.
    while parsed.segments.len() > 1
        && parsed.segments.last().is_some_and(|s| s.text.is_empty() && !s.writes_file)
    {
        parsed.segments.pop();
        parsed.operators.pop();
    }
    parsed
}
