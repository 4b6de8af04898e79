//! Parser from the token stream into the [AST](crate::ast).
//!
//! Statements are parsed by recursive descent. Formulas are first collected by bracket depth
//! and then reduced with an operator stack and an output queue.
//!
//! Errors do not stop the parser. Each failed instruction is recorded and the parser skips to
//! the next separator, so a single run reports every problem in the source.

use slog::{debug, o, trace, Discard, Logger};

use crate::ast::{
    Branching, Declaration, Formula, FormulaKind, Function, Node, NodeKind, Parameter, Program,
    Type, RETURN_SLOT,
};
use crate::lexer::Token;
use crate::parsing::{BufferedStream, Error, ErrorExt, Parser, Span};

pub type ParseError = Error<&'static str>;

type TokenStream<'a> = BufferedStream<std::vec::IntoIter<(Token<'a>, Span)>>;

pub struct SourceParser<'a> {
    stream: TokenStream<'a>,
    errors: Vec<ParseError>,
    logger: Logger,
}

impl<'a> Parser<Token<'a>> for SourceParser<'a> {
    type Stream = TokenStream<'a>;

    fn stream(&self) -> &Self::Stream {
        &self.stream
    }

    fn stream_mut(&mut self) -> &mut Self::Stream {
        &mut self.stream
    }
}

/// Parses a token stream into a [Program].
///
/// # Errors
/// Every error encountered in the source, in the order they were found.
pub fn parse<'a, L>(tokens: Vec<(Token<'a>, Span)>, logger: L) -> Result<Program, Vec<ParseError>>
where
    L: Into<Option<Logger>>,
{
    let logger = logger
        .into()
        .unwrap_or(Logger::root(Discard, o!()))
        .new(o!("stage" => "parse"));

    SourceParser::new(tokens, logger).parse()
}

impl<'a> SourceParser<'a> {
    pub fn new(tokens: Vec<(Token<'a>, Span)>, logger: Logger) -> SourceParser<'a> {
        SourceParser {
            stream: tokens.into_iter().into(),
            errors: Vec::new(),
            logger,
        }
    }

    pub fn parse(mut self) -> Result<Program, Vec<ParseError>> {
        let body = self.instructions(false);

        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        Ok(Program { body })
    }

    fn skip_separators(&mut self) {
        while let Some((Token::Separator, _)) = self.peek() {
            self.stream.next();
        }
    }

    fn instructions(&mut self, nested: bool) -> Vec<Node> {
        let mut nodes = Vec::new();

        loop {
            self.skip_separators();

            match self.peek() {
                None => break,
                Some((Token::CloseBrace, _)) if nested => break,
                Some((Token::CloseBrace, span)) => {
                    self.errors.push(ParseError::unbalanced(span, "program"));
                    self.stream.next();
                    continue;
                },
                Some(_) => (),
            }

            let result = self.instruction()
                .and_then(|node| {
                    self.end_of_instruction()?;
                    Ok(node)
                });

            match result {
                Ok(node) => {
                    trace!(self.logger, "instruction"; "position" => node.position);
                    nodes.push(node);
                },
                Err(err) => {
                    debug!(self.logger, "recovering from a parse error"; "error" => %err);
                    self.errors.push(err);
                    self.recover();
                },
            }
        }

        nodes
    }

    /// Skips the remains of a broken instruction, up to and including the next separator
    /// outside of any braces opened on the way.
    fn recover(&mut self) {
        let mut depth = 0usize;

        while let Some((token, _)) = self.peek() {
            match token {
                Token::Separator if depth == 0 => {
                    self.stream.next();
                    return;
                },
                Token::CloseBrace if depth == 0 => return,
                Token::CloseBrace => depth -= 1,
                Token::OpenBrace => depth += 1,
                _ => (),
            }

            self.stream.next();
        }
    }

    fn end_of_instruction(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            None | Some((Token::Separator, _)) | Some((Token::CloseBrace, _)) => Ok(()),
            Some((_, span)) => Err(ParseError::new(span, "end of instruction")),
        }
    }

    fn instruction(&mut self) -> Result<Node, ParseError> {
        let (token, span) = self.peek()
            .ok_or_else(|| ParseError::eos("instruction"))?;

        match token {
            Token::Do => self.do_while(),
            Token::While => self.while_loop(),
            Token::For => self.for_loop(),
            Token::If => self.if_statement(),
            Token::Type(_) => self.declaration(),
            Token::Return => self.return_statement(),
            Token::Variable(_) => self.named_statement(),
            Token::OpenBrace => {
                let body = self.block()?;

                Ok(Node {
                    position: span.start,
                    kind: NodeKind::Instructions(body),
                })
            },
            _ => Err(ParseError::new(span, "instruction")),
        }
    }

    fn identifier(&mut self) -> Result<(String, Span), ParseError> {
        match self.stream.next() {
            Some((Token::Variable(name), span)) => Ok((name.to_string(), span)),
            Some((_, span)) => Err(ParseError::new(span, "name")),
            None => Err(ParseError::eos("name")),
        }
    }

    fn block(&mut self) -> Result<Vec<Node>, ParseError> {
        self.assert_token(Token::OpenBrace).context("block")?;
        let body = self.instructions(true);
        self.assert_token(Token::CloseBrace).context("block")?;

        Ok(body)
    }

    /// A braced block or a single instruction.
    fn body(&mut self) -> Result<Vec<Node>, ParseError> {
        self.skip_separators();

        match self.peek() {
            Some((Token::OpenBrace, _)) => self.block(),
            Some(_) => Ok(vec![self.instruction()?]),
            None => Err(ParseError::eos("body")),
        }
    }

    fn condition(&mut self) -> Result<Formula, ParseError> {
        self.assert_token(Token::OpenParen).context("condition")?;
        let formula = self.formula().context("condition")?;
        self.assert_token(Token::CloseParen).context("condition")?;

        Ok(formula)
    }

    fn do_while(&mut self) -> Result<Node, ParseError> {
        let position = self.boundary_right();
        self.assert_token(Token::Do)?;

        self.skip_separators();
        let body = self.block().context("do statement")?;

        self.skip_separators();
        self.assert_token(Token::While).context("do statement")?;
        let condition = self.condition().context("do statement")?;

        Ok(Node {
            position,
            kind: NodeKind::Branching(Branching::DoWhile { body, condition }),
        })
    }

    fn while_loop(&mut self) -> Result<Node, ParseError> {
        let position = self.boundary_right();
        self.assert_token(Token::While)?;

        let condition = self.condition().context("while statement")?;
        let body = self.body().context("while statement")?;

        Ok(Node {
            position,
            kind: NodeKind::Branching(Branching::While { condition, body }),
        })
    }

    fn for_loop(&mut self) -> Result<Node, ParseError> {
        let position = self.boundary_right();
        self.assert_token(Token::For)?;

        self.assert_token(Token::OpenParen).context("for statement")?;
        let init = self.instruction().context("for statement")?;
        self.assert_token(Token::Separator).context("for statement")?;
        let condition = self.formula().context("for statement")?;
        self.assert_token(Token::Separator).context("for statement")?;
        let step = self.instruction().context("for statement")?;
        self.assert_token(Token::CloseParen).context("for statement")?;

        let body = self.body().context("for statement")?;

        Ok(Node {
            position,
            kind: NodeKind::Branching(Branching::For {
                init: Box::new(init),
                condition,
                step: Box::new(step),
                body,
            }),
        })
    }

    fn if_statement(&mut self) -> Result<Node, ParseError> {
        let position = self.boundary_right();
        self.assert_token(Token::If)?;

        let condition = self.condition().context("if statement")?;
        let body = self.body().context("if statement")?;

        Ok(Node {
            position,
            kind: NodeKind::Branching(Branching::If { condition, body }),
        })
    }

    fn return_statement(&mut self) -> Result<Node, ParseError> {
        let position = self.boundary_right();
        self.assert_token(Token::Return)?;

        let value = match self.peek() {
            None | Some((Token::Separator, _)) | Some((Token::CloseBrace, _)) => None,
            Some(_) => Some(self.formula().context("return statement")?),
        };

        Ok(Node {
            position,
            kind: NodeKind::Return(value),
        })
    }

    fn declaration(&mut self) -> Result<Node, ParseError> {
        let position = self.boundary_right();

        let ty = match self.stream.next() {
            Some((Token::Type(ty), _)) => ty,
            Some((_, span)) => return Err(ParseError::new(span, "declaration")),
            None => return Err(ParseError::eos("declaration")),
        };

        let (name, _) = self.identifier().context("declaration")?;
        let decl = Declaration { ty, name, position };

        let kind = match self.stream.next() {
            Some((Token::Assign, _)) => {
                let value = self.formula().context("variable declaration")?;
                NodeKind::DeclareVariable { decl, value }
            },
            Some((Token::OpenBracket, _)) => {
                let size = self.formula().context("array declaration")?;
                self.assert_token(Token::CloseBracket).context("array declaration")?;
                NodeKind::DeclareArray { decl, size }
            },
            Some((Token::OpenParen, _)) => {
                let mut params = self.parameters().context("function declaration")?;

                self.skip_separators();
                let body = self.block().context("function declaration")?;

                if ty != Type::Void {
                    params.insert(0, Parameter {
                        ty: Type::Int32,
                        name: RETURN_SLOT.to_string(),
                        position,
                    });
                }

                NodeKind::DeclareFunction(Function { decl, params, body })
            },
            Some((_, span)) => return Err(ParseError::new(span, "declaration")),
            None => return Err(ParseError::eos("declaration")),
        };

        Ok(Node { position, kind })
    }

    /// Parses a typed parameter list. The opening parenthesis has already been consumed.
    fn parameters(&mut self) -> Result<Vec<Parameter>, ParseError> {
        let mut params = Vec::new();

        if let Some((Token::CloseParen, _)) = self.peek() {
            self.stream.next();
            return Ok(params);
        }

        loop {
            let position = self.boundary_right();

            let ty = match self.stream.next() {
                Some((Token::Type(ty), _)) => ty,
                Some((_, span)) => return Err(ParseError::new(span, "parameter")),
                None => return Err(ParseError::eos("parameter")),
            };

            let (name, _) = self.identifier().context("parameter")?;

            params.push(Parameter { ty, name, position });

            match self.stream.next() {
                Some((Token::Comma, _)) => continue,
                Some((Token::CloseParen, _)) => return Ok(params),
                Some((_, span)) => return Err(ParseError::new(span, "parameter list")),
                None => return Err(ParseError::eos("parameter list")),
            }
        }
    }

    /// Parses a call argument list. The opening parenthesis has already been consumed.
    fn arguments(&mut self) -> Result<Vec<Formula>, ParseError> {
        let mut args = Vec::new();

        if let Some((Token::CloseParen, _)) = self.peek() {
            self.stream.next();
            return Ok(args);
        }

        loop {
            args.push(self.formula().context("argument list")?);

            match self.stream.next() {
                Some((Token::Comma, _)) => continue,
                Some((Token::CloseParen, _)) => return Ok(args),
                Some((_, span)) => return Err(ParseError::new(span, "argument list")),
                None => return Err(ParseError::eos("argument list")),
            }
        }
    }

    /// Assignment, array element assignment or procedure call.
    fn named_statement(&mut self) -> Result<Node, ParseError> {
        let position = self.boundary_right();
        let (name, _) = self.identifier()?;

        let kind = match self.stream.next() {
            Some((Token::Assign, _)) => {
                let value = self.formula().context("assignment")?;
                NodeKind::Assign { name, value }
            },
            Some((Token::OpenBracket, _)) => {
                let index = self.formula().context("array assignment")?;
                self.assert_token(Token::CloseBracket).context("array assignment")?;
                self.assert_token(Token::Assign).context("array assignment")?;
                let value = self.formula().context("array assignment")?;
                NodeKind::AssignArray { name, index, value }
            },
            Some((Token::OpenParen, _)) => {
                let args = self.arguments().context("procedure call")?;
                NodeKind::EvalProcedure { name, args }
            },
            Some((_, span)) => return Err(ParseError::new(span, "instruction")),
            None => return Err(ParseError::eos("instruction")),
        };

        Ok(Node { position, kind })
    }

    fn formula(&mut self) -> Result<Formula, ParseError> {
        let tokens = self.formula_tokens()?;

        if tokens.is_empty() {
            return match self.peek() {
                Some((_, span)) => Err(ParseError::new(span, "formula")),
                None => Err(ParseError::eos("formula")),
            };
        }

        reduce(tokens).context("formula")
    }

    /// Collects the tokens of one formula.
    ///
    /// Stops before a top-level comma, separator, unmatched closing bracket or any token that
    /// cannot appear in a formula. Separators inside brackets are dropped.
    fn formula_tokens(&mut self) -> Result<Vec<(Token<'a>, Span)>, ParseError> {
        let mut tokens = Vec::new();
        let mut open: Vec<(Token<'a>, Span)> = Vec::new();

        loop {
            let (token, span) = match (self.peek(), open.last()) {
                (Some(item), _) => item,
                (None, None) => break,
                (None, Some((_, span))) => return Err(ParseError::unbalanced(span.clone(), "formula")),
            };

            match token {
                Token::Number(_) | Token::String(_) | Token::Variable(_) | Token::Operator(_) => (),
                Token::OpenParen | Token::OpenBracket => open.push((token.clone(), span.clone())),
                Token::CloseParen | Token::CloseBracket => match open.last() {
                    None => break,
                    Some((opening, _)) if closes(opening, &token) => {
                        open.pop();
                    },
                    Some(_) => return Err(ParseError::unbalanced(span, "formula")),
                },
                Token::Comma if !open.is_empty() => (),
                Token::Separator if !open.is_empty() => {
                    self.stream.next();
                    continue;
                },
                _ if open.is_empty() => break,
                _ => return Err(ParseError::new(span, "formula")),
            }

            self.stream.next();
            tokens.push((token, span));
        }

        Ok(tokens)
    }
}

fn closes(opening: &Token, closing: &Token) -> bool {
    match (opening, closing) {
        (Token::OpenParen, Token::CloseParen) => true,
        (Token::OpenBracket, Token::CloseBracket) => true,
        _ => false,
    }
}

/// Entries of the operator stack.
enum Pending {
    Operator(crate::ast::BinaryOperator, Span),
    Paren(Span),
    Call {
        name: String,
        base: usize,
        span: Span,
    },
    Index {
        name: String,
        base: usize,
        span: Span,
    },
}

/// Pops the operator on top of the stack and combines the two topmost outputs with it.
fn apply_operator(output: &mut Vec<Formula>, pending: &mut Vec<Pending>) -> Result<(), ParseError> {
    let (op, span) = match pending.pop() {
        Some(Pending::Operator(op, span)) => (op, span),
        _ => return Err(ParseError::eos("operator")),
    };

    let rhs = output.pop().ok_or_else(|| ParseError::new(span.clone(), "operand"))?;
    let lhs = output.pop().ok_or_else(|| ParseError::new(span.clone(), "operand"))?;

    output.push(Formula {
        position: span.start,
        kind: FormulaKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    });

    Ok(())
}

fn apply_operators(output: &mut Vec<Formula>, pending: &mut Vec<Pending>) -> Result<(), ParseError> {
    while let Some(Pending::Operator(..)) = pending.last() {
        apply_operator(output, pending)?;
    }

    Ok(())
}

/// Reduces the collected tokens of a formula into a tree.
fn reduce(tokens: Vec<(Token, Span)>) -> Result<Formula, ParseError> {
    let mut output: Vec<Formula> = Vec::new();
    let mut pending: Vec<Pending> = Vec::new();
    let mut expect_operand = true;
    let mut last = 0..0;

    let mut tokens = tokens.into_iter().peekable();

    while let Some((token, span)) = tokens.next() {
        last = span.clone();

        match token {
            Token::Number(_) | Token::String(_) | Token::Variable(_) if !expect_operand => {
                return Err(ParseError::new(span, "operator"));
            },
            Token::Number(n) => {
                output.push(Formula { position: span.start, kind: FormulaKind::Number(n) });
                expect_operand = false;
            },
            Token::String(s) => {
                output.push(Formula { position: span.start, kind: FormulaKind::String(s.to_string()) });
                expect_operand = false;
            },
            Token::Variable(name) => match tokens.peek() {
                Some((Token::OpenParen, _)) => {
                    tokens.next();

                    if let Some((Token::CloseParen, _)) = tokens.peek() {
                        tokens.next();

                        output.push(Formula {
                            position: span.start,
                            kind: FormulaKind::CalcFunction { name: name.to_string(), args: Vec::new() },
                        });
                        expect_operand = false;
                    } else {
                        pending.push(Pending::Call { name: name.to_string(), base: output.len(), span });
                    }
                },
                Some((Token::OpenBracket, _)) => {
                    tokens.next();
                    pending.push(Pending::Index { name: name.to_string(), base: output.len(), span });
                },
                _ => {
                    output.push(Formula { position: span.start, kind: FormulaKind::Variable(name.to_string()) });
                    expect_operand = false;
                },
            },
            Token::Operator(op) => {
                if expect_operand {
                    return Err(ParseError::new(span, "operand"));
                }

                while let Some(&Pending::Operator(top, _)) = pending.last() {
                    if top.precedence() < op.precedence() {
                        break;
                    }

                    apply_operator(&mut output, &mut pending)?;
                }

                pending.push(Pending::Operator(op, span));
                expect_operand = true;
            },
            Token::OpenParen => {
                if !expect_operand {
                    return Err(ParseError::new(span, "operator"));
                }

                pending.push(Pending::Paren(span));
            },
            Token::Comma => {
                if expect_operand {
                    return Err(ParseError::new(span, "argument"));
                }

                apply_operators(&mut output, &mut pending)?;

                match pending.last() {
                    Some(Pending::Call { .. }) => (),
                    _ => return Err(ParseError::new(span, "argument list")),
                }

                expect_operand = true;
            },
            Token::CloseParen => {
                if expect_operand {
                    return Err(ParseError::new(span, "operand"));
                }

                apply_operators(&mut output, &mut pending)?;

                match pending.pop() {
                    Some(Pending::Paren(_)) => (),
                    Some(Pending::Call { name, base, span }) => {
                        let args = output.split_off(base);

                        output.push(Formula {
                            position: span.start,
                            kind: FormulaKind::CalcFunction { name, args },
                        });
                    },
                    _ => return Err(ParseError::unbalanced(span, "parenthesis")),
                }
            },
            Token::CloseBracket => {
                if expect_operand {
                    return Err(ParseError::new(span, "operand"));
                }

                apply_operators(&mut output, &mut pending)?;

                match pending.pop() {
                    Some(Pending::Index { name, base, span }) if output.len() == base + 1 => {
                        let index = output.pop()
                            .ok_or_else(|| ParseError::new(span.clone(), "array index"))?;

                        output.push(Formula {
                            position: span.start,
                            kind: FormulaKind::CalcArray { name, index: Box::new(index) },
                        });
                    },
                    _ => return Err(ParseError::unbalanced(span, "array index")),
                }
            },
            _ => return Err(ParseError::new(span, "formula")),
        }
    }

    if expect_operand {
        return Err(ParseError::new(last, "operand"));
    }

    apply_operators(&mut output, &mut pending)?;

    match pending.pop() {
        Some(Pending::Paren(span)) | Some(Pending::Call { span, .. }) | Some(Pending::Index { span, .. }) =>
            return Err(ParseError::unbalanced(span, "formula")),
        Some(Pending::Operator(_, span)) => return Err(ParseError::new(span, "operand")),
        None => (),
    }

    match (output.pop(), output.is_empty()) {
        (Some(formula), true) => Ok(formula),
        _ => Err(ParseError::new(last, "formula")),
    }
}
