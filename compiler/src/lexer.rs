// lexer.rs — Lexer for textual IR and attribute expressions
//
// One token set serves both grammars: the class/method IR syntax printed by
// `ir.rs` and the small expression language of actor attributes. Uses the
// `logos` crate for DFA-based lexing.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Token types.
///
/// Literals carry parsed values; integer literals are unsigned magnitudes and
/// a leading `-` is applied by the parser. Identifiers carry no value — use
/// the span to retrieve the text from the source.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+|//[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("class")]
    Class,
    #[token("extends")]
    Extends,
    #[token("field")]
    Field,
    #[token("static")]
    Static,
    #[token("native")]
    Native,
    #[token("abstract")]
    Abstract,
    #[token("dynamic")]
    Dynamic,
    #[token("method")]
    Method,
    #[token("local")]
    Local,
    #[token("if")]
    If,
    #[token("goto")]
    Goto,
    #[token("return")]
    Return,
    #[token("nop")]
    Nop,
    #[token("new")]
    New,
    #[token("newarray")]
    NewArray,
    #[token("lengthof")]
    LengthOf,
    #[token("instanceof")]
    InstanceOf,
    #[token("virtualinvoke")]
    VirtualInvoke,
    #[token("specialinvoke")]
    SpecialInvoke,
    #[token("staticinvoke")]
    StaticInvoke,
    #[token("arraycopy")]
    ArrayCopy,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    // ── Special method names ──
    #[token("<init>")]
    Init,
    #[token("<clinit>")]
    Clinit,

    // ── Symbols ──
    #[token("::")]
    ColonColon,
    #[token(":")]
    Colon,
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("=")]
    Assign,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("!")]
    Bang,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,

    // ── Literals ──
    //
    // Long and double regexes are longer matches than a bare integer, so
    // `5L` and `5.0` never split into `5` + suffix.
    /// Long literal (e.g. `5L`).
    #[regex(r"[0-9]+L", parse_long)]
    LongLit(u64),

    /// Double literal (fraction and/or exponent required).
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", parse_double)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", parse_double)]
    DoubleLit(f64),

    /// Integer literal.
    #[regex(r"[0-9]+", parse_int)]
    IntLit(u64),

    /// String literal with `\"`, `\\`, `\n` and `\t` escapes.
    #[regex(r#""([^"\\]|\\.)*""#, parse_string)]
    StringLit(String),

    // ── Identifier ──
    //
    // Placed after keywords — logos prioritises fixed `#[token]` matches
    // over regex for the same length, so `new` matches New, not Ident.
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_$]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_$]*")]
    Ident,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Class => write!(f, "class"),
            Token::Extends => write!(f, "extends"),
            Token::Field => write!(f, "field"),
            Token::Static => write!(f, "static"),
            Token::Native => write!(f, "native"),
            Token::Abstract => write!(f, "abstract"),
            Token::Dynamic => write!(f, "dynamic"),
            Token::Method => write!(f, "method"),
            Token::Local => write!(f, "local"),
            Token::If => write!(f, "if"),
            Token::Goto => write!(f, "goto"),
            Token::Return => write!(f, "return"),
            Token::Nop => write!(f, "nop"),
            Token::New => write!(f, "new"),
            Token::NewArray => write!(f, "newarray"),
            Token::LengthOf => write!(f, "lengthof"),
            Token::InstanceOf => write!(f, "instanceof"),
            Token::VirtualInvoke => write!(f, "virtualinvoke"),
            Token::SpecialInvoke => write!(f, "specialinvoke"),
            Token::StaticInvoke => write!(f, "staticinvoke"),
            Token::ArrayCopy => write!(f, "arraycopy"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Null => write!(f, "null"),
            Token::Init => write!(f, "<init>"),
            Token::Clinit => write!(f, "<clinit>"),
            Token::ColonColon => write!(f, "::"),
            Token::Colon => write!(f, ":"),
            Token::Semi => write!(f, ";"),
            Token::Comma => write!(f, ","),
            Token::Dot => write!(f, "."),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Assign => write!(f, "="),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Bang => write!(f, "!"),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Amp => write!(f, "&"),
            Token::Pipe => write!(f, "|"),
            Token::LongLit(v) => write!(f, "{v}L"),
            Token::DoubleLit(v) => write!(f, "{v:?}"),
            Token::IntLit(v) => write!(f, "{v}"),
            Token::StringLit(s) => write!(f, "\"{s}\""),
            Token::Ident => write!(f, "<ident>"),
        }
    }
}

// ── Callbacks ──

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<u64> {
    lex.slice().parse().ok()
}

fn parse_long(lex: &mut logos::Lexer<'_, Token>) -> Option<u64> {
    let slice = lex.slice();
    slice[..slice.len() - 1].parse().ok()
}

fn parse_double(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_string(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let slice = lex.slice();
    let inner = &slice[1..slice.len() - 1]; // strip quotes
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next()? {
                '"' => result.push('"'),
                '\\' => result.push('\\'),
                'n' => result.push('\n'),
                't' => result.push('\t'),
                _ => return None,
            }
        } else {
            result.push(c);
        }
    }
    Some(result)
}

// ── Public API ──

/// Lex a source string into tokens.
///
/// Returns all successfully parsed tokens together with any errors for
/// unrecognised characters. Lexing is non-fatal: errors are collected and
/// the lexer continues past bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_ok(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(
            result.errors.is_empty(),
            "unexpected lex errors: {:?}",
            result.errors
        );
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn keywords_and_idents() {
        let tokens = lex_ok("class Gain extends Actor newarray newest");
        assert_eq!(
            tokens,
            vec![
                Token::Class,
                Token::Ident,
                Token::Extends,
                Token::Ident,
                Token::NewArray,
                Token::Ident,
            ]
        );
    }

    #[test]
    fn dollar_in_identifiers() {
        let result = lex("t$1 _CGToken_gain$isNull");
        assert!(result.errors.is_empty());
        assert_eq!(result.tokens.len(), 2);
        assert_eq!(result.tokens[1].1, Span { start: 4, end: 24 });
    }

    #[test]
    fn numeric_literals() {
        let tokens = lex_ok("5 5L 2.0 1e3 2.5e-1");
        assert_eq!(
            tokens,
            vec![
                Token::IntLit(5),
                Token::LongLit(5),
                Token::DoubleLit(2.0),
                Token::DoubleLit(1000.0),
                Token::DoubleLit(0.25),
            ]
        );
    }

    #[test]
    fn special_names_and_operators() {
        let tokens = lex_ok("x.<init>() C::<clinit> a <= b != c");
        assert_eq!(
            tokens,
            vec![
                Token::Ident,
                Token::Dot,
                Token::Init,
                Token::LParen,
                Token::RParen,
                Token::Ident,
                Token::ColonColon,
                Token::Clinit,
                Token::Ident,
                Token::Le,
                Token::Ident,
                Token::NotEq,
                Token::Ident,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = lex_ok("nop; // trailing\n  goto L1;");
        assert_eq!(
            tokens,
            vec![
                Token::Nop,
                Token::Semi,
                Token::Goto,
                Token::Ident,
                Token::Semi
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let tokens = lex_ok(r#""a\"b\n""#);
        assert_eq!(tokens, vec![Token::StringLit("a\"b\n".to_string())]);
    }

    #[test]
    fn unknown_character_is_reported() {
        let result = lex("x = a # b;");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].span, Span { start: 6, end: 7 });
    }
}
