//! Markdown-like message styling.
//!
//! Turns `**bold** and *italic*` into plain text plus Signal text-style
//! ranges (`"start:length:STYLE"`). Offsets and lengths count Unicode code
//! points of the cleaned text.
//!
//! | Delimiter | Style           |
//! |-----------|-----------------|
//! | `**`      | `BOLD`          |
//! | `*`       | `ITALIC`        |
//! | `~`       | `STRIKETHROUGH` |
//! | `` ` ``   | `MONOSPACE`     |
//! | `\|\|`    | `SPOILER`       |
//!
//! A backslash makes the following delimiter character (or backslash)
//! literal. Delimiters without a partner, and pairs enclosing nothing, are
//! kept as text.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextStyle {
    Bold,
    Italic,
    Strikethrough,
    Monospace,
    Spoiler,
}

impl TextStyle {
    const ALL: [TextStyle; 5] = [
        TextStyle::Bold,
        TextStyle::Italic,
        TextStyle::Strikethrough,
        TextStyle::Monospace,
        TextStyle::Spoiler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TextStyle::Bold => "BOLD",
            TextStyle::Italic => "ITALIC",
            TextStyle::Strikethrough => "STRIKETHROUGH",
            TextStyle::Monospace => "MONOSPACE",
            TextStyle::Spoiler => "SPOILER",
        }
    }

    fn delimiter(&self) -> &'static str {
        match self {
            TextStyle::Bold => "**",
            TextStyle::Italic => "*",
            TextStyle::Strikethrough => "~",
            TextStyle::Monospace => "`",
            TextStyle::Spoiler => "||",
        }
    }

    fn slot(&self) -> usize {
        match self {
            TextStyle::Bold => 0,
            TextStyle::Italic => 1,
            TextStyle::Strikethrough => 2,
            TextStyle::Monospace => 3,
            TextStyle::Spoiler => 4,
        }
    }
}

/// A styled range of the cleaned text, in code points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StyleAnnotation {
    pub start: usize,
    pub length: usize,
    pub style: TextStyle,
}

impl fmt::Display for StyleAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.start, self.length, self.style.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Text(char),
    Delimiter(TextStyle),
}

fn is_escapable(c: char) -> bool {
    matches!(c, '*' | '~' | '`' | '|' | '\\')
}

fn tokenize(raw: &str) -> Vec<Token> {
    let chars: Vec<char> = raw.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    let mut i = 0;

    while i < chars.len() {
        let next = chars.get(i + 1).copied();
        let (token, width) = match (chars[i], next) {
            ('\\', Some(escaped)) if is_escapable(escaped) => (Token::Text(escaped), 2),
            ('*', Some('*')) => (Token::Delimiter(TextStyle::Bold), 2),
            ('*', _) => (Token::Delimiter(TextStyle::Italic), 1),
            ('~', _) => (Token::Delimiter(TextStyle::Strikethrough), 1),
            ('`', _) => (Token::Delimiter(TextStyle::Monospace), 1),
            ('|', Some('|')) => (Token::Delimiter(TextStyle::Spoiler), 2),
            (c, _) => (Token::Text(c), 1),
        };
        tokens.push(token);
        i += width;
    }

    tokens
}

/// Pair opening and closing delimiters. Returns `(open, close)` token
/// indices; every delimiter not in a pair is literal.
fn pair_delimiters(tokens: &[Token]) -> Vec<(usize, usize)> {
    let mut open: [Option<usize>; TextStyle::ALL.len()] = [None; TextStyle::ALL.len()];
    let mut pairs = Vec::new();

    for (index, token) in tokens.iter().enumerate() {
        let Token::Delimiter(style) = token else {
            continue;
        };
        let slot = style.slot();
        match open[slot] {
            // Adjacent delimiters enclose nothing: the older one becomes
            // text and the newer one may still open a span.
            Some(start) if start + 1 == index => open[slot] = Some(index),
            Some(start) => {
                pairs.push((start, index));
                open[slot] = None;
            }
            None => open[slot] = Some(index),
        }
    }

    pairs
}

/// Strip style delimiters from `raw` and return the cleaned text with its
/// annotations, ordered by start offset and then by opening position.
pub fn annotate(raw: &str) -> (String, Vec<StyleAnnotation>) {
    let tokens = tokenize(raw);
    let pairs = pair_delimiters(&tokens);

    let mut matched = vec![false; tokens.len()];
    for &(open, close) in &pairs {
        matched[open] = true;
        matched[close] = true;
    }

    // Code-point offset in the cleaned text at which each token starts.
    let mut offsets = Vec::with_capacity(tokens.len() + 1);
    let mut text = String::with_capacity(raw.len());
    let mut position = 0;
    for (index, token) in tokens.iter().enumerate() {
        offsets.push(position);
        match token {
            Token::Text(c) => {
                text.push(*c);
                position += 1;
            }
            Token::Delimiter(style) if !matched[index] => {
                let literal = style.delimiter();
                text.push_str(literal);
                position += literal.chars().count();
            }
            Token::Delimiter(_) => {}
        }
    }

    let mut spans: Vec<(usize, StyleAnnotation)> = pairs
        .into_iter()
        .filter_map(|(open, close)| {
            let Token::Delimiter(style) = tokens[open] else {
                return None;
            };
            let start = offsets[open];
            let length = offsets[close] - start;
            (length > 0).then_some((
                open,
                StyleAnnotation {
                    start,
                    length,
                    style,
                },
            ))
        })
        .collect();
    spans.sort_by_key(|(open, annotation)| (annotation.start, *open));

    (text, spans.into_iter().map(|(_, annotation)| annotation).collect())
}

/// Like [`annotate`], with annotations rendered as `"start:length:STYLE"`.
pub fn parse(raw: &str) -> (String, Vec<String>) {
    let (text, annotations) = annotate(raw);
    (text, annotations.iter().map(ToString::to_string).collect())
}
