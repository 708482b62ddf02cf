//! Recursive-descent parser producing the expression tree.
//!
//! Precedence, lowest first:
//!
//! | level | operators |
//! |---|---|
//! | or | `or` |
//! | and | `and` |
//! | not | `not` (prefix) |
//! | comparison | `== != < <= > >=`, `is [not] null` |
//! | additive | `+ - \|\|` |
//! | multiplicative | `* / %` |
//! | unary | `-` (prefix) |
//! | primary | literal, field path, `( ... )` |

use super::lexer::{tokenize, SpannedToken, Token};
use super::ExpressionError;
use serde_json::{Number, Value};

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// Source spelling of the operator.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Concat => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

/// Prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value.
    Literal(Value),
    /// Field path such as `address.city`.
    Field(Vec<String>),
    /// Prefix operation.
    Unary { op: UnaryOp, operand: Box<Expr> },
    /// Infix operation.
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `operand is null` or `operand is not null`.
    IsNull { operand: Box<Expr>, negated: bool },
}

/// Deepest allowed nesting of parentheses and prefix operators.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Longest allowed expression, in tokens. Bounds the depth of operator chains.
pub const MAX_EXPRESSION_TOKENS: usize = 1024;

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if let Some(extra) = tokens.get(MAX_EXPRESSION_TOKENS) {
            return Err(ExpressionError::syntax(
                format!("expression longer than {} tokens", MAX_EXPRESSION_TOKENS),
                extra.span.start,
            ));
        }
        Ok(Self {
            tokens,
            pos: 0,
            end: source.len(),
            depth: 0,
        })
    }

    /// Enter one nesting level, failing past [`MAX_NESTING_DEPTH`].
    fn descend(&mut self, offset: usize) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ExpressionError::syntax("expression nested too deeply", offset));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| t.span.start)
            .unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|t| t.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        if self.eat(&expected) {
            return Ok(());
        }
        let found = match self.peek() {
            Some(token) => format!("'{}'", token),
            None => "end of input".to_string(),
        };
        Err(ExpressionError::syntax(
            format!("expected '{}', found {}", expected, found),
            self.offset(),
        ))
    }

    fn parse_expression(&mut self) -> Result<Expr, ExpressionError> {
        let expr = self.parse_or()?;
        if let Some(token) = self.peek() {
            return Err(ExpressionError::syntax(
                format!("unexpected '{}'", token),
                self.offset(),
            ));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        if self.eat(&Token::Not) {
            self.descend(offset)?;
            let operand = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_additive()?;

        if self.eat(&Token::Is) {
            let negated = self.eat(&Token::Not);
            self.expect(Token::Null)?;
            return Ok(Expr::IsNull {
                operand: Box::new(left),
                negated,
            });
        }

        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_additive()?;
        Ok(binary(op, left, right))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                Some(Token::Concat) => BinaryOp::Concat,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        if self.eat(&Token::Minus) {
            self.descend(offset)?;
            let operand = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        let Some(token) = self.advance() else {
            return Err(ExpressionError::syntax("unexpected end of input", offset));
        };

        match token {
            Token::Int(i) => Ok(Expr::Literal(Value::from(i))),
            Token::Float(x) => Number::from_f64(x)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| ExpressionError::syntax("invalid number", offset)),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(first) => {
                let mut path = vec![first];
                while self.eat(&Token::Dot) {
                    let offset = self.offset();
                    match self.advance() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        _ => {
                            return Err(ExpressionError::syntax(
                                "expected field name after '.'",
                                offset,
                            ))
                        }
                    }
                }
                Ok(Expr::Field(path))
            }
            Token::LParen => {
                self.descend(offset)?;
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            other => Err(ExpressionError::syntax(
                format!("unexpected '{}'", other),
                offset,
            )),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Parse an expression source string.
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let mut parser = Parser::new(source)?;
    if parser.peek().is_none() {
        return Err(ExpressionError::syntax("empty expression", 0));
    }
    parser.parse_expression()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str) -> Expr {
        Expr::Field(name.split('.').map(String::from).collect())
    }

    #[test]
    fn test_precedence() {
        let expr = parse("a + b * 2").unwrap();
        assert_eq!(
            expr,
            binary(
                BinaryOp::Add,
                field("a"),
                binary(BinaryOp::Mul, field("b"), Expr::Literal(json!(2)))
            )
        );
    }

    #[test]
    fn test_logic_binds_looser_than_comparison() {
        let expr = parse("not a > 1 or b.c == 'x'").unwrap();
        let Expr::Binary { op: BinaryOp::Or, left, .. } = expr else {
            panic!("expected or at the root");
        };
        assert!(matches!(*left, Expr::Unary { op: UnaryOp::Not, .. }));
    }

    #[test]
    fn test_is_not_null() {
        let expr = parse("email is not null").unwrap();
        assert_eq!(
            expr,
            Expr::IsNull {
                operand: Box::new(field("email")),
                negated: true
            }
        );
    }

    #[test]
    fn test_parentheses_and_unary_minus() {
        let expr = parse("-(a - 1)").unwrap();
        assert!(matches!(expr, Expr::Unary { op: UnaryOp::Neg, .. }));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("").is_err());
        assert!(parse("a +").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("a.").is_err());
        assert!(parse("a is 3").is_err());
    }

    #[test]
    fn test_nesting_is_bounded() {
        let nested = |depth: usize| format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(parse(&nested(MAX_NESTING_DEPTH)).is_ok());

        let err = parse(&nested(MAX_NESTING_DEPTH + 1)).unwrap_err();
        assert!(err.to_string().contains("nested too deeply"));

        let err = parse(&format!("{}a", "not ".repeat(MAX_NESTING_DEPTH + 1))).unwrap_err();
        assert!(err.to_string().contains("nested too deeply"));
        assert!(parse(&format!("{}1", "-".repeat(MAX_NESTING_DEPTH + 1))).is_err());
    }

    #[test]
    fn test_huge_input_is_rejected() {
        let err = parse(&nested_huge()).unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { .. }));

        let chain = vec!["1"; MAX_EXPRESSION_TOKENS].join(" + ");
        let err = parse(&chain).unwrap_err();
        assert!(err.to_string().contains("tokens"));
    }

    fn nested_huge() -> String {
        format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000))
    }

    #[test]
    fn test_function_calls_are_rejected() {
        let err = parse("exec('rm')").unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { .. }));
    }
}
