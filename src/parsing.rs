//! Generic infrastructure for hand-written parsers over token streams.

use std::fmt;
use std::ops::Range;
use itertools::Itertools;

#[derive(Clone, Debug, PartialEq)]
pub struct Error<Context> {
    pub kind: ErrorKind,
    pub context: Vec<Context>,
}

impl<C> Error<C> {
    pub fn new<T>(span: Span, ctx: T) -> Error<C> where T: Into<C> {
        Error {
            kind: ErrorKind::UnexpectedToken { span },
            context: vec![ctx.into()],
        }
    }

    pub fn eos<T>(ctx: T) -> Error<C> where T: Into<C> {
        Error {
            kind: ErrorKind::EndOfStream,
            context: vec![ctx.into()],
        }
    }

    pub fn unbalanced<T>(span: Span, ctx: T) -> Error<C> where T: Into<C> {
        Error {
            kind: ErrorKind::Unbalanced { span },
            context: vec![ctx.into()],
        }
    }

    pub fn span(&self) -> Option<&Span> {
        match self.kind {
            ErrorKind::EndOfStream => None,
            ErrorKind::UnexpectedToken { ref span } => Some(span),
            ErrorKind::Unbalanced { ref span } => Some(span),
        }
    }
}

pub trait ErrorExt<R,C> {
    fn context<T>(self, ctx: T) -> Self where T: Into<C>;
}

impl<R,C> ErrorExt<R,C> for Result<R, Error<C>> {
    fn context<T>(mut self, ctx: T) -> Self where T: Into<C> {
        if let Err(ref mut err) = self {
            err.context.push(ctx.into());
        }

        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ErrorKind {
    EndOfStream,
    UnexpectedToken {
        span: Span,
    },
    /// A bracket without its counterpart.
    Unbalanced {
        span: Span,
    },
}

pub type Span = Range<usize>;

impl<C> fmt::Display for Error<C>
where
    C: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ctx = self.context.iter()
            .rev()
            .join(": ");

        match self.kind {
            ErrorKind::EndOfStream =>
                write!(f, "{}: unexpected end of stream", ctx),
            ErrorKind::UnexpectedToken { ref span } =>
                write!(f, "error at position {}-{}: {}: unexpected token", span.start, span.end, ctx),
            ErrorKind::Unbalanced { ref span } =>
                write!(f, "error at position {}-{}: {}: unbalanced bracket", span.start, span.end, ctx),
        }
    }
}

impl<C> std::error::Error for Error<C> where C: fmt::Display + fmt::Debug {}

pub trait SeekStream: Iterator {
    fn offset(&self) -> usize;
    fn seek(&mut self, amount: isize);
    fn seek_boundary(&self) -> Range<isize>;
    fn at_offset(&self, offset: isize) -> Option<&Self::Item>;
}

impl<S> SeekStream for &mut S where S: SeekStream {
    fn offset(&self) -> usize {
        SeekStream::offset(*self)
    }

    fn seek(&mut self, amount: isize) {
        SeekStream::seek(*self, amount)
    }

    fn seek_boundary(&self) -> Range<isize> {
        SeekStream::seek_boundary(*self)
    }

    fn at_offset(&self, offset: isize) -> Option<&Self::Item> {
        SeekStream::at_offset(*self, offset)
    }
}

/// Wraps an iterator and remembers every item it has produced so that the
/// stream can be rewound.
pub struct BufferedStream<S: Iterator> {
    stream: S,
    position: usize,
    buffer: Vec<S::Item>,
}

impl<S> From<S> for BufferedStream<S>
where
    S: Iterator,
{
    fn from(stream: S) -> BufferedStream<S> {
        BufferedStream {
            stream,
            position: 0,
            buffer: Vec::new(),
        }
    }
}

impl<S> Iterator for BufferedStream<S>
where
    S: Iterator,
    S::Item: Clone,
{
    type Item = S::Item;

    fn next(&mut self) -> Option<S::Item> {
        if let Some(item) = self.buffer.get(self.position) {
            self.position += 1;
            return Some(item.clone());
        }

        match self.stream.next() {
            Some(item) => {
                self.position += 1;
                self.buffer.push(item.clone());
                Some(item)
            },
            None => None,
        }
    }
}

impl<S> SeekStream for BufferedStream<S>
where
    S: Iterator,
    S::Item: Clone,
{
    fn offset(&self) -> usize {
        self.position
    }

    fn seek(&mut self, amount: isize) {
        assert!(self.seek_boundary().contains(&amount));
        self.position = ((self.position as isize) + amount) as usize;
    }

    fn seek_boundary(&self) -> Range<isize> {
        let backwards = - (self.position as isize);
        let forwards = (self.buffer.len() as isize) - (self.position as isize);

        backwards .. forwards + 1
    }

    fn at_offset(&self, offset: isize) -> Option<&Self::Item> {
        if !self.seek_boundary().contains(&offset) {
            return None;
        }

        let index = (self.position as isize) + offset;

        self.buffer.get(index as usize)
    }
}

/// A parser reading `(token, span)` pairs from a rewindable stream.
pub trait Parser<T> {
    type Stream: SeekStream<Item=(T, Span)>;

    fn stream(&self) -> &Self::Stream;
    fn stream_mut(&mut self) -> &mut Self::Stream;

    /// Start offset of the next token, or the end of the last token at the end of the stream.
    fn boundary_right(&mut self) -> usize {
        let stream = self.stream_mut();

        match stream.next() {
            Some((_, span)) => {
                stream.seek(-1);
                span.start
            },
            None => stream.at_offset(-1)
                .map(|(_, span)| span.end)
                .unwrap_or(0)
        }
    }

    /// Returns the next token without consuming it.
    fn peek(&mut self) -> Option<(T, Span)>
    where
        T: Clone,
    {
        let stream = self.stream_mut();
        let item = stream.next();

        if item.is_some() {
            stream.seek(-1);
        }

        item
    }

    /// Runs `op`, leaving the stream where it was if `op` fails.
    fn apply<F,O,X>(&mut self, op: F) -> Result<O, Error<X>>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> Result<O, Error<X>>,
    {
        let position = self.stream_mut().offset() as isize;

        let result = op(self);

        if result.is_err() {
            let stream = self.stream_mut();
            let delta = position - stream.offset() as isize;
            stream.seek(delta);
        }

        result
    }

    /// Consumes the next token if it equals `token`.
    fn assert_token<X>(&mut self, token: T) -> Result<(), Error<X>>
    where
        T: PartialEq,
        Self: Sized,
    {
        self.apply(|parser| match parser.stream_mut().next() {
            Some((t, _)) if t == token => Ok(()),
            Some((_, span)) => Err(Error {
                kind: ErrorKind::UnexpectedToken { span },
                context: Vec::new(),
            }),
            None => Err(Error {
                kind: ErrorKind::EndOfStream,
                context: Vec::new(),
            }),
        })
    }
}

impl<P,T> Parser<T> for &mut P where P: Parser<T> {
    type Stream = P::Stream;

    fn stream(&self) -> &Self::Stream {
        (**self).stream()
    }

    fn stream_mut(&mut self) -> &mut Self::Stream {
        (**self).stream_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Numbers {
        stream: BufferedStream<std::vec::IntoIter<(u8, Span)>>,
    }

    impl Parser<u8> for Numbers {
        type Stream = BufferedStream<std::vec::IntoIter<(u8, Span)>>;

        fn stream(&self) -> &Self::Stream {
            &self.stream
        }

        fn stream_mut(&mut self) -> &mut Self::Stream {
            &mut self.stream
        }
    }

    fn numbers(items: &[u8]) -> Numbers {
        let tokens = items.iter()
            .enumerate()
            .map(|(i, n)| (*n, i..i + 1))
            .collect::<Vec<_>>();

        Numbers { stream: tokens.into_iter().into() }
    }

    #[test]
    fn test_apply_rewinds_on_error() {
        let mut parser = numbers(&[1, 2, 3]);

        let result: Result<(), Error<&str>> = parser.apply(|p: &mut Numbers| {
            p.assert_token(1)?;
            p.assert_token(5)
        });

        assert_eq!(result.unwrap_err().kind, ErrorKind::UnexpectedToken { span: 1..2 });
        assert_eq!(parser.stream.offset(), 0);
        assert_eq!(parser.peek(), Some((1, 0..1)));
    }

    #[test]
    fn test_boundary_right_at_end() {
        let mut parser = numbers(&[7, 8]);

        assert_eq!(parser.boundary_right(), 0);
        parser.stream_mut().next();
        parser.stream_mut().next();
        assert_eq!(parser.boundary_right(), 2);
    }

    #[test]
    fn test_error_display_joins_context() {
        let err: Result<(), Error<&str>> = Err(Error::new(3..4, "formula"));
        let err = err.context("while statement").unwrap_err();

        assert_eq!(err.to_string(), "error at position 3-4: while statement: formula: unexpected token");
    }
}
