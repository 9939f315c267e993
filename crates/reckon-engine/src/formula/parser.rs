//! Recursive-descent parser for the expression language.
//!
//! The grammar is a deliberately small Python-expression subset: boolean
//! operators, a single (non-chained) comparison, arithmetic, attribute
//! access, calls with keyword arguments, and list/tuple displays.

use super::lexer::{lex, SyntaxError, Token, TokenKind};
use super::{BinOp, CmpOp, Kwarg, Literal, ParseNode};

/// Parse a complete expression; trailing comments are ignored here (the
/// predicate entry point collects them from the lexer separately).
pub fn parse_expression(src: &str) -> Result<ParseNode, SyntaxError> {
    let (tokens, _comments) = lex(src)?;
    parse_tokens(&tokens, src)
}

pub(super) fn parse_tokens(tokens: &[Token], src: &str) -> Result<ParseNode, SyntaxError> {
    let mut parser = Parser { tokens, src, index: 0 };
    let node = parser.or_expr()?;
    parser.expect_eof()?;
    Ok(node)
}

struct Parser<'a> {
    tokens: &'a [Token],
    src: &'a str,
    index: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.index].kind
    }

    fn peek_next(&self) -> &TokenKind {
        match self.tokens.get(self.index + 1) {
            Some(token) => &token.kind,
            None => &TokenKind::Eof,
        }
    }

    fn pos(&self) -> usize {
        self.tokens[self.index].pos
    }

    fn advance(&mut self) -> &Token {
        let token = &self.tokens[self.index];
        if self.index + 1 < self.tokens.len() {
            self.index += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), SyntaxError> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn expect_eof(&mut self) -> Result<(), SyntaxError> {
        if matches!(self.peek(), TokenKind::Eof) {
            Ok(())
        } else {
            Err(self.error("unexpected token"))
        }
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::at(self.src, self.pos(), message)
    }

    fn or_expr(&mut self) -> Result<ParseNode, SyntaxError> {
        let first = self.and_expr()?;
        if !matches!(self.peek(), TokenKind::Or) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.eat(&TokenKind::Or) {
            parts.push(self.and_expr()?);
        }
        Ok(ParseNode::Or(parts))
    }

    fn and_expr(&mut self) -> Result<ParseNode, SyntaxError> {
        let first = self.not_expr()?;
        if !matches!(self.peek(), TokenKind::And) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.eat(&TokenKind::And) {
            parts.push(self.not_expr()?);
        }
        Ok(ParseNode::And(parts))
    }

    fn not_expr(&mut self) -> Result<ParseNode, SyntaxError> {
        if self.eat(&TokenKind::Not) {
            return Ok(ParseNode::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<ParseNode, SyntaxError> {
        let lhs = self.arith()?;
        let Some(op) = self.comparison_op()? else {
            return Ok(lhs);
        };
        let rhs = self.arith()?;
        if self.comparison_op()?.is_some() {
            return Err(self.error("Can't use chained comparisons"));
        }
        Ok(ParseNode::Compare { op, lhs: Box::new(lhs), rhs: Box::new(rhs) })
    }

    fn comparison_op(&mut self) -> Result<Option<CmpOp>, SyntaxError> {
        let op = match self.peek() {
            TokenKind::EqEq => CmpOp::Eq,
            TokenKind::NotEq => CmpOp::NotEq,
            TokenKind::Lt => CmpOp::Lt,
            TokenKind::LtE => CmpOp::LtE,
            TokenKind::Gt => CmpOp::Gt,
            TokenKind::GtE => CmpOp::GtE,
            TokenKind::In => CmpOp::In,
            TokenKind::Is => {
                self.advance();
                return Ok(Some(if self.eat(&TokenKind::Not) { CmpOp::IsNot } else { CmpOp::Is }));
            }
            TokenKind::Not => {
                // "not in" is the only comparison starting with "not" here;
                // bare "not" never follows an operand.
                self.advance();
                self.expect(TokenKind::In, "'in' after 'not'")?;
                return Ok(Some(CmpOp::NotIn));
            }
            _ => return Ok(None),
        };
        self.advance();
        Ok(Some(op))
    }

    fn arith(&mut self) -> Result<ParseNode, SyntaxError> {
        let mut node = self.term()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.term()?;
            node = ParseNode::BinOp { op, lhs: Box::new(node), rhs: Box::new(rhs) };
        }
        Ok(node)
    }

    fn term(&mut self) -> Result<ParseNode, SyntaxError> {
        let mut node = self.factor()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mult,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.factor()?;
            node = ParseNode::BinOp { op, lhs: Box::new(node), rhs: Box::new(rhs) };
        }
        Ok(node)
    }

    fn factor(&mut self) -> Result<ParseNode, SyntaxError> {
        // Unary minus is supported only as a numeric literal sign.
        if matches!(self.peek(), TokenKind::Minus) {
            return match self.peek_next().clone() {
                TokenKind::Int(n) => {
                    self.advance();
                    self.advance();
                    Ok(ParseNode::Const(Literal::Int(-n)))
                }
                TokenKind::Float(f) => {
                    self.advance();
                    self.advance();
                    Ok(ParseNode::Const(Literal::Float(-f)))
                }
                _ => Err(self.error("unexpected '-'")),
            };
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<ParseNode, SyntaxError> {
        let mut node = self.atom()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let pos = self.pos();
                let TokenKind::Name(name) = self.peek().clone() else {
                    return Err(self.error("expected attribute name after '.'"));
                };
                self.advance();
                node = ParseNode::Attr { obj: Box::new(node), name, pos };
            } else if self.eat(&TokenKind::LParen) {
                node = self.call_args(node)?;
            } else {
                break;
            }
        }
        Ok(node)
    }

    fn call_args(&mut self, func: ParseNode) -> Result<ParseNode, SyntaxError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<Kwarg> = Vec::new();
        loop {
            if self.eat(&TokenKind::RParen) {
                break;
            }
            // A keyword argument is NAME '=' value.
            if let TokenKind::Name(name) = self.peek().clone() {
                if matches!(self.peek_next(), TokenKind::Assign) {
                    let pos = self.pos();
                    self.advance();
                    self.advance();
                    let value = self.or_expr()?;
                    kwargs.push(Kwarg { name, pos, value });
                    if !self.eat(&TokenKind::Comma) {
                        self.expect(TokenKind::RParen, "')'")?;
                        break;
                    }
                    continue;
                }
            }
            if !kwargs.is_empty() {
                return Err(self.error("positional argument after keyword argument"));
            }
            args.push(self.or_expr()?);
            if !self.eat(&TokenKind::Comma) {
                self.expect(TokenKind::RParen, "')'")?;
                break;
            }
        }
        Ok(ParseNode::Call { func: Box::new(func), args, kwargs })
    }

    fn atom(&mut self) -> Result<ParseNode, SyntaxError> {
        let pos = self.pos();
        match self.peek().clone() {
            TokenKind::Name(name) => {
                self.advance();
                Ok(ParseNode::Name { name, pos })
            }
            TokenKind::Int(n) => {
                self.advance();
                Ok(ParseNode::Const(Literal::Int(n)))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(ParseNode::Const(Literal::Float(f)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(ParseNode::Const(Literal::Str(s)))
            }
            TokenKind::True => {
                self.advance();
                Ok(ParseNode::Const(Literal::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(ParseNode::Const(Literal::Bool(false)))
            }
            TokenKind::None => {
                self.advance();
                Ok(ParseNode::Const(Literal::Null))
            }
            TokenKind::LParen => {
                self.advance();
                let first = self.or_expr()?;
                // Tuples and lists are not distinguished.
                if self.eat(&TokenKind::Comma) {
                    let mut items = vec![first];
                    while !matches!(self.peek(), TokenKind::RParen) {
                        items.push(self.or_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen, "')'")?;
                    return Ok(ParseNode::List(items));
                }
                self.expect(TokenKind::RParen, "')'")?;
                Ok(first)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !matches!(self.peek(), TokenKind::RBracket) {
                    items.push(self.or_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "']'")?;
                Ok(ParseNode::List(items))
            }
            _ => Err(self.error("unexpected token")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let node = parse_expression("1 + 2 * 3").unwrap();
        assert_eq!(
            node,
            ParseNode::BinOp {
                op: BinOp::Add,
                lhs: Box::new(ParseNode::Const(Literal::Int(1))),
                rhs: Box::new(ParseNode::BinOp {
                    op: BinOp::Mult,
                    lhs: Box::new(ParseNode::Const(Literal::Int(2))),
                    rhs: Box::new(ParseNode::Const(Literal::Int(3))),
                }),
            }
        );
    }

    #[test]
    fn test_boolean_ops_flatten() {
        let node = parse_expression("a or b or c").unwrap();
        match node {
            ParseNode::Or(parts) => assert_eq!(parts.len(), 3),
            other => panic!("expected Or, got {:?}", other),
        }
    }

    #[test]
    fn test_attr_chain_and_call() {
        let node = parse_expression("Students.lookupRecords(State=rec.State)").unwrap();
        let ParseNode::Call { func, args, kwargs } = node else {
            panic!("expected call");
        };
        assert!(args.is_empty());
        assert_eq!(kwargs.len(), 1);
        assert_eq!(kwargs[0].name, "State");
        let ParseNode::Attr { obj, name, .. } = *func else {
            panic!("expected attr");
        };
        assert_eq!(name, "lookupRecords");
        assert_eq!(*obj, ParseNode::Name { name: "Students".into(), pos: 0 });
    }

    #[test]
    fn test_is_not_and_not_in() {
        let node = parse_expression("a is not None").unwrap();
        assert!(matches!(node, ParseNode::Compare { op: CmpOp::IsNot, .. }));
        let node = parse_expression("a not in [1, 2]").unwrap();
        assert!(matches!(node, ParseNode::Compare { op: CmpOp::NotIn, .. }));
    }

    #[test]
    fn test_negative_literals() {
        assert_eq!(parse_expression("-5").unwrap(), ParseNode::Const(Literal::Int(-5)));
        assert_eq!(
            parse_expression("1 - -2").unwrap(),
            ParseNode::BinOp {
                op: BinOp::Sub,
                lhs: Box::new(ParseNode::Const(Literal::Int(1))),
                rhs: Box::new(ParseNode::Const(Literal::Int(-2))),
            }
        );
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(parse_expression("a b").is_err());
        assert!(parse_expression("(a").is_err());
    }
}
