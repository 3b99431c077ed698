// parser.rs — Parser for textual IR and attribute expressions
//
// Parses a token stream (from the lexer) into the syntax trees of `ast.rs`.
// Uses chumsky combinators. Two entry points share the token set:
// `parse_unit` for class declarations and `parse_expr` for attribute values.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns a syntax tree plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::ir::{BinOp, CallKind, IrType, UnOp};
use crate::lexer::{LexError, Token};

/// Result of parsing: syntax tree plus any errors.
#[derive(Debug)]
pub struct ParseResult<T> {
    pub output: Option<T>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

impl<T> ParseResult<T> {
    /// Flatten errors into one message per line, with byte offsets.
    pub fn error_message(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}..{}: {}", e.span().start(), e.span().end(), e))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

type Errors = Vec<Rich<'static, Token, SimpleSpan>>;

fn lex_errors(errors: Vec<LexError>) -> Errors {
    errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect()
}

/// Parse a textual IR unit (a sequence of classes). Lexes then parses.
pub fn parse_unit(source: &str) -> ParseResult<Unit> {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let (unit, parse_errors) = unit_parser(source).parse(stream).into_output_errors();

    let mut all_errors = lex_errors(lex_result.errors);
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));
    ParseResult {
        output: unit,
        errors: all_errors,
    }
}

/// Parse an attribute expression such as `{1.0, gain * 2}`.
pub fn parse_expr(source: &str) -> ParseResult<Expr> {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let (expr, parse_errors) = expr_parser(source).parse(stream).into_output_errors();

    let mut all_errors = lex_errors(lex_result.errors);
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));
    ParseResult {
        output: expr,
        errors: all_errors,
    }
}

// ── Shared pieces ──

enum Number {
    Int(u64),
    Long(u64),
    Double(f64),
}

/// Apply an optional leading minus and range-check the magnitude.
fn number_literal(negative: bool, n: Number) -> Option<Literal> {
    let signed = |v: u64| {
        if negative {
            -(v as i128)
        } else {
            v as i128
        }
    };
    match n {
        Number::Int(v) => i32::try_from(signed(v)).ok().map(Literal::Int),
        Number::Long(v) => i64::try_from(signed(v)).ok().map(Literal::Long),
        Number::Double(v) => Some(Literal::Double(if negative { -v } else { v })),
    }
}

fn literal<'tokens, I>(
) -> impl Parser<'tokens, I, (Literal, SimpleSpan), extra::Err<Rich<'tokens, Token, SimpleSpan>>> + Clone
where
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let number = just(Token::Minus)
        .or_not()
        .map(|m| m.is_some())
        .then(select! {
            Token::IntLit(v) => Number::Int(v),
            Token::LongLit(v) => Number::Long(v),
            Token::DoubleLit(v) => Number::Double(v),
        })
        .try_map(|(negative, n), span| {
            number_literal(negative, n)
                .ok_or_else(|| Rich::custom(span, "numeric literal out of range"))
        });

    let other = select! {
        Token::True => Literal::Bool(true),
        Token::False => Literal::Bool(false),
        Token::Null => Literal::Null,
        Token::StringLit(s) => Literal::Str(s),
    };

    number.or(other).map_with(|lit, e| (lit, e.span()))
}

/// Map a type name to an IR type; unknown names are class types.
fn named_type(name: &str) -> IrType {
    match name {
        "void" => IrType::Void,
        "boolean" => IrType::Bool,
        "int" => IrType::Int,
        "long" => IrType::Long,
        "double" => IrType::Double,
        "string" => IrType::Str,
        other => IrType::Object(other.to_string()),
    }
}

// ── IR unit parser ──
//
// All grammar rules are built inside `unit_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn unit_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Unit, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Names ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    let method_name = just(Token::Ident)
        .or(just(Token::Init))
        .or(just(Token::Clinit))
        .map_with(move |_, e| {
            let span: SimpleSpan = e.span();
            Ident {
                name: source[span.start()..span.end()].to_string(),
                span,
            }
        });

    // ── Type: IDENT ('[' ']')* ──

    let ty = ident
        .clone()
        .then(
            just(Token::LBracket)
                .then(just(Token::RBracket))
                .repeated()
                .collect::<Vec<_>>(),
        )
        .map(|(name, dims)| {
            let mut t = named_type(&name.name);
            for _ in 0..dims.len() {
                t = IrType::array(t);
            }
            t
        });

    // ── Operands and places ──

    let qualifier = ident
        .clone()
        .then_ignore(just(Token::ColonColon))
        .or_not();

    let operand = literal()
        .map(|(lit, span)| Operand::Lit(lit, span))
        .or(ident.clone().map(Operand::Name));

    enum Suffix {
        Field(Option<Ident>, Ident),
        Static(Ident),
        Elem(Operand),
    }

    let place = ident
        .clone()
        .then(
            choice((
                just(Token::Dot)
                    .ignore_then(qualifier.clone())
                    .then(ident.clone())
                    .map(|(q, f)| Suffix::Field(q, f)),
                just(Token::ColonColon)
                    .ignore_then(ident.clone())
                    .map(Suffix::Static),
                operand
                    .clone()
                    .delimited_by(just(Token::LBracket), just(Token::RBracket))
                    .map(Suffix::Elem),
            ))
            .or_not(),
        )
        .map(|(base, suffix)| match suffix {
            None => Place::Name(base),
            Some(Suffix::Field(q, f)) => Place::Field(base, q, f),
            Some(Suffix::Static(f)) => Place::Static(base, f),
            Some(Suffix::Elem(i)) => Place::Elem(base, i),
        });

    // ── Calls ──

    let args = operand
        .clone()
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let instance_call = just(Token::VirtualInvoke)
        .to(CallKind::Virtual)
        .or(just(Token::SpecialInvoke).to(CallKind::Special))
        .then(ident.clone())
        .then_ignore(just(Token::Dot))
        .then(qualifier)
        .then(method_name.clone())
        .then(args.clone())
        .map(|((((kind, target), qualifier), method), args)| Call {
            kind,
            target,
            qualifier,
            method,
            args,
        });

    let static_call = just(Token::StaticInvoke)
        .ignore_then(ident.clone())
        .then_ignore(just(Token::ColonColon))
        .then(method_name.clone())
        .then(args)
        .map(|((target, method), args)| Call {
            kind: CallKind::Static,
            target,
            qualifier: None,
            method,
            args,
        });

    let call = instance_call.or(static_call);

    // ── Rvalues ──

    let binop = select! {
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        Token::Percent => BinOp::Rem,
        Token::Amp => BinOp::And,
        Token::Pipe => BinOp::Or,
        Token::EqEq => BinOp::Eq,
        Token::NotEq => BinOp::Ne,
        Token::Lt => BinOp::Lt,
        Token::Le => BinOp::Le,
        Token::Gt => BinOp::Gt,
        Token::Ge => BinOp::Ge,
    };

    let cmp = select! {
        Token::EqEq => BinOp::Eq,
        Token::NotEq => BinOp::Ne,
        Token::Lt => BinOp::Lt,
        Token::Le => BinOp::Le,
        Token::Gt => BinOp::Gt,
        Token::Ge => BinOp::Ge,
    };

    // A negative literal wins over unary minus, so `x = -5;` is a constant.
    let rvalue = choice((
        call.clone().map(Rvalue::Call),
        just(Token::New)
            .ignore_then(ident.clone())
            .map(Rvalue::New),
        just(Token::NewArray)
            .ignore_then(ty.clone())
            .then(
                operand
                    .clone()
                    .delimited_by(just(Token::LBracket), just(Token::RBracket)),
            )
            .map(|(t, n)| Rvalue::NewArray(t, n)),
        just(Token::LengthOf)
            .ignore_then(ident.clone())
            .map(Rvalue::Length),
        ty.clone()
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .then(operand.clone())
            .map(|(t, o)| Rvalue::Cast(t, o)),
        operand
            .clone()
            .then(binop)
            .then(operand.clone())
            .map(|((a, op), b)| Rvalue::Binary(op, a, b)),
        operand
            .clone()
            .then_ignore(just(Token::InstanceOf))
            .then(ident.clone())
            .map(|(o, c)| Rvalue::InstanceOf(o, c)),
        literal().map(|(lit, span)| Rvalue::Lit(lit, span)),
        place.clone().map(Rvalue::Place),
        just(Token::Minus)
            .ignore_then(operand.clone())
            .map(|o| Rvalue::Unary(UnOp::Neg, o)),
        just(Token::Bang)
            .ignore_then(operand.clone())
            .map(|o| Rvalue::Unary(UnOp::Not, o)),
    ));

    // ── Statements ──

    let semi = just(Token::Semi);

    let label_stmt = ident
        .clone()
        .then_ignore(just(Token::Colon))
        .map(StmtKind::Label);

    let assign = place
        .then_ignore(just(Token::Assign))
        .then(rvalue)
        .then_ignore(semi.clone())
        .map(|(p, r)| StmtKind::Assign(p, r));

    let invoke = call.then_ignore(semi.clone()).map(StmtKind::Invoke);

    let if_stmt = just(Token::If)
        .ignore_then(operand.clone())
        .then(cmp)
        .then(operand.clone())
        .then_ignore(just(Token::Goto))
        .then(ident.clone())
        .then_ignore(semi.clone())
        .map(|(((a, op), b), target)| StmtKind::If(op, a, b, target));

    let goto = just(Token::Goto)
        .ignore_then(ident.clone())
        .then_ignore(semi.clone())
        .map(StmtKind::Goto);

    let ret = just(Token::Return)
        .ignore_then(operand.clone().or_not())
        .then_ignore(semi.clone())
        .map(StmtKind::Return);

    let nop = just(Token::Nop).then(semi.clone()).to(StmtKind::Nop);

    let arraycopy = just(Token::ArrayCopy)
        .ignore_then(
            operand
                .clone()
                .separated_by(just(Token::Comma))
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then_ignore(semi.clone())
        .try_map(|ops, span| {
            <[Operand; 5]>::try_from(ops)
                .map(StmtKind::ArrayCopy)
                .map_err(|_| Rich::custom(span, "arraycopy takes exactly five arguments"))
        });

    let stmt = choice((label_stmt, assign, invoke, if_stmt, goto, ret, nop, arraycopy))
        .map_with(|kind, e| Stmt {
            kind,
            span: e.span(),
        });

    let local_decl = just(Token::Local)
        .ignore_then(ident.clone())
        .then_ignore(just(Token::Colon))
        .then(ty.clone())
        .then_ignore(semi.clone())
        .map(|(name, t)| BodyItem::Local(name, t));

    let body_item = local_decl.or(stmt.map(BodyItem::Stmt));

    // ── Members ──

    let field = just(Token::Static)
        .or_not()
        .then_ignore(just(Token::Field))
        .then(ident.clone())
        .then_ignore(just(Token::Colon))
        .then(ty.clone())
        .then_ignore(semi.clone())
        .map(|((is_static, name), ty)| {
            Member::Field(FieldDecl {
                name,
                ty,
                is_static: is_static.is_some(),
            })
        });

    let modifier = select! {
        Token::Static => Modifier::Static,
        Token::Native => Modifier::Native,
        Token::Abstract => Modifier::Abstract,
        Token::Dynamic => Modifier::Dynamic,
    };

    let params = ident
        .clone()
        .then_ignore(just(Token::Colon))
        .then(ty.clone())
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let body = body_item
        .repeated()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBrace), just(Token::RBrace))
        .map(Some)
        .or(semi.to(None));

    let method = modifier
        .repeated()
        .collect::<Vec<_>>()
        .then_ignore(just(Token::Method))
        .then(method_name)
        .then(params)
        .then(just(Token::Colon).ignore_then(ty).or_not())
        .then(body)
        .map_with(|((((modifiers, name), params), ret), body), e| {
            Member::Method(MethodDecl {
                name,
                modifiers,
                params,
                return_type: ret.unwrap_or(IrType::Void),
                body,
                span: e.span(),
            })
        });

    let member = field.or(method);

    // ── Class ──

    let class = just(Token::Class)
        .ignore_then(ident.clone())
        .then(just(Token::Extends).ignore_then(ident).or_not())
        .then(
            member
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .map_with(|((name, superclass), members), e| ClassDecl {
            name,
            superclass,
            members,
            span: e.span(),
        });

    class
        .repeated()
        .collect::<Vec<_>>()
        .map(|classes| Unit { classes })
}

// ── Attribute expression parser ──

fn expr_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Expr, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    let join = |left: Expr, (op, right): (BinOp, Expr)| {
        let span: SimpleSpan = (left.span().start()..right.span().end()).into();
        Expr::Binary(op, Box::new(left), Box::new(right), span)
    };

    recursive(|expr| {
        let array = expr
            .clone()
            .separated_by(just(Token::Comma))
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBrace), just(Token::RBrace))
            .map_with(|items, e| Expr::Array(items, e.span()));

        let atom = choice((
            literal().map(|(lit, span)| Expr::Lit(lit, span)),
            ident.map(Expr::Name),
            array,
            expr.delimited_by(just(Token::LParen), just(Token::RParen)),
        ));

        let unary = just(Token::Minus)
            .map_with(|_, e| e.span())
            .repeated()
            .foldr(atom, |span: SimpleSpan, operand: Expr| {
                let whole: SimpleSpan = (span.start()..operand.span().end()).into();
                Expr::Neg(Box::new(operand), whole)
            });

        let product = unary.clone().foldl(
            choice((
                just(Token::Star).to(BinOp::Mul),
                just(Token::Slash).to(BinOp::Div),
            ))
            .then(unary)
            .repeated(),
            join,
        );

        product.clone().foldl(
            choice((
                just(Token::Plus).to(BinOp::Add),
                just(Token::Minus).to(BinOp::Sub),
            ))
            .then(product)
            .repeated(),
            join,
        )
    })
}

// ── Tests ──
