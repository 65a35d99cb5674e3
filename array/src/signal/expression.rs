//! Arithmetic formulas over named variables, used by expression signals and by
//! formula calibrators.
use std::{fmt::Display, str::FromStr};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unexpected character '{0}' at position {1}")]
    UnexpectedCharacter(char, usize),
    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("Unexpected end of formula")]
    UnexpectedEnd,
    #[error("Invalid number '{0}'")]
    InvalidNumber(String),
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
    #[error("Function '{name}' takes {expected} argument(s), got {got}")]
    WrongArity {
        name: String,
        expected: usize,
        got: usize,
    },
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Operator(char),
    LeftParen,
    RightParen,
    Comma,
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(value) => write!(f, "{value}"),
            Token::Identifier(name) => write!(f, "{name}"),
            Token::Operator(op) => write!(f, "{op}"),
            Token::LeftParen => write!(f, "("),
            Token::RightParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();
    while let Some(&(position, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    let exponent_sign = (c == '-' || c == '+')
                        && literal.ends_with(['e', 'E'])
                        && literal.starts_with(|c: char| c.is_ascii_digit() || c == '.');
                    if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || exponent_sign {
                        literal.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal
                    .parse()
                    .map_err(|_| ExpressionError::InvalidNumber(literal.clone()))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Identifier(name));
            }
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push(Token::Operator(c));
                chars.next();
            }
            '(' => {
                tokens.push(Token::LeftParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RightParen);
                chars.next();
            }
            ',' => {
                tokens.push(Token::Comma);
                chars.next();
            }
            _ => return Err(ExpressionError::UnexpectedCharacter(c, position)),
        }
    }
    Ok(tokens)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Function {
    Sqrt,
    Log,
    Exp,
    Abs,
    Pow,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sqrt" => Some(Self::Sqrt),
            "log" | "ln" => Some(Self::Log),
            "exp" => Some(Self::Exp),
            "abs" => Some(Self::Abs),
            "pow" => Some(Self::Pow),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::Pow => 2,
            _ => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Node {
    Number(f64),
    Variable(String),
    Negate(Box<Node>),
    Binary(char, Box<Node>, Box<Node>),
    Call(Function, Vec<Node>),
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ExpressionError::UnexpectedToken(token.to_string())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    // sum := product (('+'|'-') product)*
    fn sum(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.product()?;
        while let Some(Token::Operator(op @ ('+' | '-'))) = self.peek().cloned() {
            self.next();
            node = Node::Binary(op, Box::new(node), Box::new(self.product()?));
        }
        Ok(node)
    }

    // product := unary (('*'|'/') unary)*
    fn product(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.unary()?;
        while let Some(Token::Operator(op @ ('*' | '/'))) = self.peek().cloned() {
            self.next();
            node = Node::Binary(op, Box::new(node), Box::new(self.unary()?));
        }
        Ok(node)
    }

    // unary := '-' unary | power
    fn unary(&mut self) -> Result<Node, ExpressionError> {
        match self.peek() {
            Some(Token::Operator('-')) => {
                self.next();
                Ok(Node::Negate(Box::new(self.unary()?)))
            }
            Some(Token::Operator('+')) => {
                self.next();
                self.unary()
            }
            _ => self.power(),
        }
    }

    // power := atom ('^' unary)?
    fn power(&mut self) -> Result<Node, ExpressionError> {
        let base = self.atom()?;
        if let Some(Token::Operator('^')) = self.peek() {
            self.next();
            let exponent = self.unary()?;
            return Ok(Node::Binary('^', Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Node, ExpressionError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(Node::Number(value)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LeftParen) = self.peek() {
                    self.next();
                    let function = Function::from_name(&name)
                        .ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;
                    let mut arguments = vec![self.sum()?];
                    while let Some(Token::Comma) = self.peek() {
                        self.next();
                        arguments.push(self.sum()?);
                    }
                    self.expect(Token::RightParen)?;
                    if arguments.len() != function.arity() {
                        return Err(ExpressionError::WrongArity {
                            name,
                            expected: function.arity(),
                            got: arguments.len(),
                        });
                    }
                    Ok(Node::Call(function, arguments))
                } else {
                    Ok(Node::Variable(name))
                }
            }
            Some(Token::LeftParen) => {
                let node = self.sum()?;
                self.expect(Token::RightParen)?;
                Ok(node)
            }
            Some(token) => Err(ExpressionError::UnexpectedToken(token.to_string())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

/// A parsed formula.
#[derive(Clone, Debug, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of all variables referenced by the formula, without duplicates.
    pub fn variables(&self) -> Vec<&str> {
        fn collect<'a>(node: &'a Node, names: &mut Vec<&'a str>) {
            match node {
                Node::Number(_) => {}
                Node::Variable(name) => {
                    if !names.contains(&name.as_str()) {
                        names.push(name);
                    }
                }
                Node::Negate(inner) => collect(inner, names),
                Node::Binary(_, lhs, rhs) => {
                    collect(lhs, names);
                    collect(rhs, names);
                }
                Node::Call(_, arguments) => arguments.iter().for_each(|a| collect(a, names)),
            }
        }
        let mut names = Vec::new();
        collect(&self.root, &mut names);
        names
    }

    /// Evaluates the formula; `None` if any variable cannot be resolved.
    pub fn evaluate<F: Fn(&str) -> Option<f64>>(&self, lookup: &F) -> Option<f64> {
        fn eval<F: Fn(&str) -> Option<f64>>(node: &Node, lookup: &F) -> Option<f64> {
            Some(match node {
                Node::Number(value) => *value,
                Node::Variable(name) => lookup(name)?,
                Node::Negate(inner) => -eval(inner, lookup)?,
                Node::Binary(op, lhs, rhs) => {
                    let (lhs, rhs) = (eval(lhs, lookup)?, eval(rhs, lookup)?);
                    match op {
                        '+' => lhs + rhs,
                        '-' => lhs - rhs,
                        '*' => lhs * rhs,
                        '/' => lhs / rhs,
                        _ => lhs.powf(rhs),
                    }
                }
                Node::Call(function, arguments) => {
                    let mut values = arguments.iter().map(|a| eval(a, lookup));
                    let x = values.next()??;
                    match function {
                        Function::Sqrt => x.sqrt(),
                        Function::Log => x.ln(),
                        Function::Exp => x.exp(),
                        Function::Abs => x.abs(),
                        Function::Pow => x.powf(values.next()??),
                    }
                }
            })
        }
        eval(&self.root, lookup)
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser {
            tokens: tokenize(s)?,
            position: 0,
        };
        let root = parser.sum()?;
        if let Some(token) = parser.next() {
            return Err(ExpressionError::UnexpectedToken(token.to_string()));
        }
        Ok(Self {
            source: s.trim().to_owned(),
            root,
        })
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn lookup(name: &str) -> Option<f64> {
        match name {
            "QH1" => Some(1200.0),
            "PED" => Some(200.0),
            "x" => Some(2.0),
            _ => None,
        }
    }

    #[test]
    fn precedence() {
        let expression: Expression = "1 + 2 * 3 - 4 / 2".parse().unwrap();
        assert_eq!(expression.evaluate(&lookup), Some(5.0));
        let expression: Expression = "-x^2".parse().unwrap();
        assert_eq!(expression.evaluate(&lookup), Some(-4.0));
        let expression: Expression = "2^3^2".parse().unwrap();
        assert_eq!(expression.evaluate(&lookup), Some(512.0));
    }

    #[test]
    fn signals_and_functions() {
        let expression: Expression = "sqrt(QH1 - PED) + pow(x, 3) * 1.5e-1".parse().unwrap();
        assert_approx_eq!(expression.evaluate(&lookup).unwrap(), 1000f64.sqrt() + 1.2, 1e-12);
        assert_eq!(expression.variables(), vec!["QH1", "PED", "x"]);
    }

    #[test]
    fn unresolved_variable() {
        let expression: Expression = "QH1 + QL1".parse().unwrap();
        assert_eq!(expression.evaluate(&lookup), None);
    }

    #[test]
    fn syntax_errors() {
        assert_eq!(
            "1 +".parse::<Expression>(),
            Err(ExpressionError::UnexpectedEnd)
        );
        assert_eq!(
            "foo(1)".parse::<Expression>(),
            Err(ExpressionError::UnknownFunction("foo".to_owned()))
        );
        assert_eq!(
            "pow(1)".parse::<Expression>(),
            Err(ExpressionError::WrongArity {
                name: "pow".to_owned(),
                expected: 2,
                got: 1
            })
        );
        assert!(matches!(
            "2 # 3".parse::<Expression>(),
            Err(ExpressionError::UnexpectedCharacter('#', 2))
        ));
        assert_eq!(
            "(1 2)".parse::<Expression>(),
            Err(ExpressionError::UnexpectedToken("2".to_owned()))
        );
    }
}
