//! Tokens and a tokenizer for the source language.

use logos::{Lexer, Logos};
use slog::{o, trace, Discard, Logger};

use std::fmt;

use crate::ast::{BinaryOperator, Position, Type};
use crate::parsing::Span;

/// Tokens as recognized by the generated lexer.
///
/// Number literals are not distinguished here, they are reclassified from [RawToken::Variable]
/// after tokenization.
#[derive(Logos, Debug, PartialEq, Clone)]
enum RawToken<'a> {
    #[error]
    #[regex(r"[ \t\r\f]+", logos::skip)]
    #[regex(r"//[^\n]*", logos::skip)]
    Error,

    #[token("/*", block_comment)]
    BlockComment,

    #[regex("[\"'`]", string_literal)]
    String(&'a str),

    #[token(";")]
    #[token("\n")]
    Separator,

    #[regex(r"&&|\|\||>>|<<|!=|==|[+\-%*<>]", operator)]
    Operator(BinaryOperator),

    #[token(",")]
    Comma,

    #[token("=")]
    Assign,

    #[token("[")]
    OpenBracket,

    #[token("]")]
    CloseBracket,

    #[token("(")]
    OpenParen,

    #[token(")")]
    CloseParen,

    #[token("{")]
    OpenBrace,

    #[token("}")]
    CloseBrace,

    #[token("do")]
    Do,

    #[token("while")]
    While,

    #[token("for")]
    For,

    #[token("if")]
    If,

    #[token("return")]
    Return,

    #[regex("int32|int16|int8|str|void", type_keyword)]
    Type(Type),

    #[regex(r#"[^ \t\r\n\f;,<>+\-%*!=&|\[\](){}"'`/]+"#, Lexer::slice)]
    Variable(&'a str),
}

/// Skips to the end of a block comment. Fails if the comment is never closed.
fn block_comment<'a>(lex: &mut Lexer<'a, RawToken<'a>>) -> bool {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            true
        },
        None => false,
    }
}

/// Consumes the body of a string literal up to the same quote character it was opened with.
fn string_literal<'a>(lex: &mut Lexer<'a, RawToken<'a>>) -> Option<&'a str> {
    let quote = lex.slice().chars().next()?;
    let rest: &'a str = lex.remainder();
    let end = rest.find(quote)?;

    lex.bump(end + quote.len_utf8());

    Some(&rest[..end])
}

fn operator<'a>(lex: &mut Lexer<'a, RawToken<'a>>) -> Option<BinaryOperator> {
    use BinaryOperator::*;

    Some(match lex.slice() {
        "&&" => And,
        "||" => Or,
        ">>" => ShiftRight,
        "<<" => ShiftLeft,
        "!=" => NotEqual,
        "==" => Equal,
        "+" => Add,
        "-" => Sub,
        "%" => Mod,
        "*" => Mul,
        "<" => Less,
        ">" => Greater,
        _ => return None,
    })
}

fn type_keyword<'a>(lex: &mut Lexer<'a, RawToken<'a>>) -> Option<Type> {
    Some(match lex.slice() {
        "int32" => Type::Int32,
        "int16" => Type::Int16,
        "int8" => Type::Int8,
        "str" => Type::Str,
        "void" => Type::Void,
        _ => return None,
    })
}

/// Enumeration of all tokens of the source language.
#[derive(Debug, PartialEq, Clone)]
pub enum Token<'a> {
    /// An identifier.
    Variable(&'a str),

    /// An unsigned integer literal. Values above `i32::MAX` wrap around.
    Number(i32),

    /// Contents of a string literal, without the quotes.
    String(&'a str),

    /// A binary operator.
    Operator(BinaryOperator),

    Comma,
    Assign,
    OpenBracket,
    CloseBracket,
    OpenParen,
    CloseParen,
    OpenBrace,
    CloseBrace,

    /// `;` or a line break.
    Separator,

    Do,
    While,
    For,
    If,
    Return,

    /// One of the type keywords.
    Type(Type),
}

impl<'a> fmt::Display for Token<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Variable(name) => write!(f, "{}", name),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "{:?}", s),
            Token::Operator(op) => write!(f, "{}", op),
            Token::Comma => write!(f, ","),
            Token::Assign => write!(f, "="),
            Token::OpenBracket => write!(f, "["),
            Token::CloseBracket => write!(f, "]"),
            Token::OpenParen => write!(f, "("),
            Token::CloseParen => write!(f, ")"),
            Token::OpenBrace => write!(f, "{{"),
            Token::CloseBrace => write!(f, "}}"),
            Token::Separator => write!(f, "separator"),
            Token::Do => write!(f, "do"),
            Token::While => write!(f, "while"),
            Token::For => write!(f, "for"),
            Token::If => write!(f, "if"),
            Token::Return => write!(f, "return"),
            Token::Type(ty) => write!(f, "{}", ty),
        }
    }
}

/// Errors that abort tokenization.
#[derive(Clone, Debug, PartialEq)]
pub enum LexError {
    UnterminatedString { position: Position },
    UnterminatedComment { position: Position },
    UnexpectedCharacter { position: Position, character: char },
    NumberOutOfRange { span: Span },
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LexError::UnterminatedString { position } =>
                write!(f, "unterminated string literal starting at {}", position),
            LexError::UnterminatedComment { position } =>
                write!(f, "unterminated block comment starting at {}", position),
            LexError::UnexpectedCharacter { position, character } =>
                write!(f, "unexpected character {:?} at {}", character, position),
            LexError::NumberOutOfRange { span } =>
                write!(f, "number literal at {}-{} does not fit in 32 bits", span.start, span.end),
        }
    }
}

impl std::error::Error for LexError {}

fn classify_error(source: &str, span: Span) -> LexError {
    let position = span.start;
    let text = &source[span];

    if text.starts_with("/*") {
        return LexError::UnterminatedComment { position };
    }

    match text.chars().next() {
        Some('"') | Some('\'') | Some('`') => LexError::UnterminatedString { position },
        Some(character) => LexError::UnexpectedCharacter { position, character },
        None => LexError::UnexpectedCharacter { position, character: '\0' },
    }
}

fn is_number(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

/// Splits `source` into tokens with their byte spans.
///
/// The first lexical error aborts the whole tokenization.
pub fn tokenize<'a, L>(source: &'a str, logger: L) -> Result<Vec<(Token<'a>, Span)>, LexError>
where
    L: Into<Option<Logger>>,
{
    let logger = logger
        .into()
        .unwrap_or(Logger::root(Discard, o!()))
        .new(o!("stage" => "lex"));

    let mut tokens = Vec::new();

    for (raw, span) in RawToken::lexer(source).spanned() {
        let token = match raw {
            RawToken::Error => return Err(classify_error(source, span)),
            RawToken::BlockComment => continue,
            RawToken::Variable(text) if is_number(text) => {
                let value = text
                    .parse::<u32>()
                    .map_err(|_| LexError::NumberOutOfRange { span: span.clone() })?;

                Token::Number(value as i32)
            },
            RawToken::Variable(text) => Token::Variable(text),
            RawToken::String(text) => Token::String(text),
            RawToken::Separator => Token::Separator,
            RawToken::Operator(op) => Token::Operator(op),
            RawToken::Comma => Token::Comma,
            RawToken::Assign => Token::Assign,
            RawToken::OpenBracket => Token::OpenBracket,
            RawToken::CloseBracket => Token::CloseBracket,
            RawToken::OpenParen => Token::OpenParen,
            RawToken::CloseParen => Token::CloseParen,
            RawToken::OpenBrace => Token::OpenBrace,
            RawToken::CloseBrace => Token::CloseBrace,
            RawToken::Do => Token::Do,
            RawToken::While => Token::While,
            RawToken::For => Token::For,
            RawToken::If => Token::If,
            RawToken::Return => Token::Return,
            RawToken::Type(ty) => Token::Type(ty),
        };

        trace!(logger, "token"; "token" => %token, "start" => span.start);

        tokens.push((token, span));
    }

    Ok(tokens)
}
