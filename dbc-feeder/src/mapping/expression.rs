//! Arithmetic expressions for `math` transforms
//!
//! Expressions use the single variable `x`, the operators `+ - * / % ^`,
//! unary minus, parentheses, numeric literals and the functions
//! `abs floor ceil round sqrt min max`. They are parsed once when the
//! mapping is loaded and evaluated for every value.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Abs,
    Floor,
    Ceil,
    Round,
    Sqrt,
    Min,
    Max,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Function::Abs,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "round" => Function::Round,
            "sqrt" => Function::Sqrt,
            "min" => Function::Min,
            "max" => Function::Max,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Function::Min | Function::Max => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Function::Abs => args[0].abs(),
            Function::Floor => args[0].floor(),
            Function::Ceil => args[0].ceil(),
            Function::Round => args[0].round(),
            Function::Sqrt => args[0].sqrt(),
            Function::Min => args[0].min(args[1]),
            Function::Max => args[0].max(args[1]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(f64),
    Variable,
    Negate(Box<Node>),
    Binary(char, Box<Node>, Box<Node>),
    Call(Function, Vec<Node>),
}

impl Node {
    fn eval(&self, x: f64) -> f64 {
        match self {
            Node::Number(n) => *n,
            Node::Variable => x,
            Node::Negate(inner) => -inner.eval(x),
            Node::Binary(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(x), rhs.eval(x));
                match op {
                    '+' => a + b,
                    '-' => a - b,
                    '*' => a * b,
                    '/' => a / b,
                    '%' => a % b,
                    _ => a.powf(b),
                }
            }
            Node::Call(function, args) => {
                let values: Vec<f64> = args.iter().map(|arg| arg.eval(x)).collect();
                function.apply(&values)
            }
        }
    }
}

/// A parsed `math` expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Parse an expression
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expression()?;
        if let Some(token) = parser.peek() {
            return Err(format!("unexpected {} in '{}'", token, source));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Evaluate for `x`; `None` if the result is not a finite number
    pub fn eval(&self, x: f64) -> Option<f64> {
        let result = self.root.eval(x);
        result.is_finite().then_some(result)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    Open,
    Close,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {}", n),
            Token::Ident(name) => write!(f, "'{}'", name),
            Token::Op(op) => write!(f, "'{}'", op),
            Token::Open => write!(f, "'('"),
            Token::Close => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' | '-' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {}, found {}", expected, token)),
            None => Err(format!("expected {}, found end of expression", expected)),
        }
    }

    // expression := term (('+' | '-') term)*
    fn expression(&mut self) -> Result<Node, String> {
        let mut node = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            node = Node::Binary(op, Box::new(node), Box::new(self.term()?));
        }
        Ok(node)
    }

    // term := unary (('*' | '/' | '%') unary)*
    fn term(&mut self) -> Result<Node, String> {
        let mut node = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.pos += 1;
            node = Node::Binary(op, Box::new(node), Box::new(self.unary()?));
        }
        Ok(node)
    }

    // unary := '-' unary | power
    fn unary(&mut self) -> Result<Node, String> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(Node::Negate(Box::new(self.unary()?)));
        }
        self.power()
    }

    // power := primary ('^' unary)?, right associative
    fn power(&mut self) -> Result<Node, String> {
        let base = self.primary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Node::Binary('^', Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Node, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Node::Number(n)),
            Some(Token::Open) => {
                let node = self.expression()?;
                self.expect(Token::Close)?;
                Ok(node)
            }
            Some(Token::Ident(name)) if name == "x" => Ok(Node::Variable),
            Some(Token::Ident(name)) => {
                let function = Function::from_name(&name)
                    .ok_or_else(|| format!("unknown function or variable '{}'", name))?;
                self.expect(Token::Open)?;

                let mut args = vec![self.expression()?];
                while let Some(Token::Comma) = self.peek() {
                    self.pos += 1;
                    args.push(self.expression()?);
                }
                self.expect(Token::Close)?;

                if args.len() != function.arity() {
                    return Err(format!(
                        "{} takes {} argument(s), got {}",
                        name,
                        function.arity(),
                        args.len()
                    ));
                }
                Ok(Node::Call(function, args))
            }
            Some(token) => Err(format!("unexpected {}", token)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str, x: f64) -> Option<f64> {
        Expression::parse(source).unwrap().eval(x)
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval("1 + 2 * x", 3.0), Some(7.0));
        assert_eq!(eval("(1 + 2) * x", 3.0), Some(9.0));
        assert_eq!(eval("x % 4 + 1", 10.0), Some(3.0));
        assert_eq!(eval("-x ^ 2", 3.0), Some(-9.0));
        assert_eq!(eval("2 ^ 3 ^ 2", 0.0), Some(512.0));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("floor(x / 3.6)", 100.0), Some(27.0));
        assert_eq!(eval("abs(x) + round(0.6)", -2.0), Some(3.0));
        assert_eq!(eval("max(min(x, 100), 0)", 140.0), Some(100.0));
        assert_eq!(eval("sqrt(x)", 16.0), Some(4.0));
    }

    #[test]
    fn test_non_finite_result() {
        assert_eq!(eval("1 / x", 0.0), None);
        assert_eq!(eval("sqrt(x)", -1.0), None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expression::parse("x +").is_err());
        assert!(Expression::parse("y * 2").is_err());
        assert!(Expression::parse("min(x)").is_err());
        assert!(Expression::parse("(x").is_err());
        assert!(Expression::parse("x $ 2").is_err());
        assert!(Expression::parse("x 2").is_err());
    }
}
