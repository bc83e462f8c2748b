use std::fmt;

use serde_json::Value;

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Path(Vec<Seg>),
    Call { name: String, args: Vec<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Seg {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Path(segs) => {
                for (i, s) in segs.iter().enumerate() {
                    match s {
                        Seg::Key(k) if i == 0 => write!(f, "{k}")?,
                        Seg::Key(k) => write!(f, ".{k}")?,
                        Seg::Index(n) => write!(f, "[{n}]")?,
                    }
                }
                Ok(())
            }
            Expr::Call { name, args } => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Expr::Unary { op, expr } => {
                let op = match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Neg => "-",
                };
                write!(f, "{op}{expr}")
            }
            Expr::Binary { op, lhs, rhs } => write!(f, "{lhs} {} {rhs}", op.symbol()),
        }
    }
}

impl BinOp {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    AndAnd,
    OrOr,
    Not,
    Plus,
    Minus,
}

fn lex(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (at, c) = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                out.push((at, Token::LParen));
                i += 1;
            }
            ')' => {
                out.push((at, Token::RParen));
                i += 1;
            }
            '[' => {
                out.push((at, Token::LBracket));
                i += 1;
            }
            ']' => {
                out.push((at, Token::RBracket));
                i += 1;
            }
            '.' => {
                out.push((at, Token::Dot));
                i += 1;
            }
            ',' => {
                out.push((at, Token::Comma));
                i += 1;
            }
            '+' => {
                out.push((at, Token::Plus));
                i += 1;
            }
            '-' => {
                out.push((at, Token::Minus));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two = chars.get(i + 1).map(|&(_, c)| c) == Some('=');
                let tok = match (c, two) {
                    ('=', true) => Token::Eq,
                    ('!', true) => Token::Ne,
                    ('<', true) => Token::Le,
                    ('>', true) => Token::Ge,
                    ('<', false) => Token::Lt,
                    ('>', false) => Token::Gt,
                    ('!', false) => Token::Not,
                    _ => {
                        return Err(ExprError::Syntax {
                            pos: at,
                            msg: "`=` is not an operator (use `==`)".to_string(),
                        })
                    }
                };
                out.push((at, tok));
                i += if two { 2 } else { 1 };
            }
            '&' | '|' => {
                if chars.get(i + 1).map(|&(_, c2)| c2) != Some(c) {
                    return Err(ExprError::Syntax {
                        pos: at,
                        msg: format!("expected `{c}{c}`"),
                    });
                }
                out.push((at, if c == '&' { Token::AndAnd } else { Token::OrOr }));
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = at;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&(_, c2)) if c2 == quote => {
                            i += 1;
                            break;
                        }
                        Some(&(esc_at, '\\')) => {
                            let (_, esc) = *chars.get(i + 1).ok_or(ExprError::Syntax {
                                pos: esc_at,
                                msg: "dangling escape".to_string(),
                            })?;
                            s.push(match esc {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            i += 2;
                        }
                        Some(&(_, c2)) => {
                            s.push(c2);
                            i += 1;
                        }
                        None => {
                            return Err(ExprError::Syntax {
                                pos: start,
                                msg: "unterminated string".to_string(),
                            })
                        }
                    }
                }
                out.push((start, Token::Str(s)));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    // A trailing dot not followed by a digit belongs to the
                    // surrounding expression, not the number literal.
                    if chars[i].1 == '.'
                        && !chars.get(i + 1).map(|&(_, c)| c.is_ascii_digit()).unwrap_or(false)
                    {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|&(_, c)| c).collect();
                if text.contains('.') {
                    let f: f64 = text.parse().map_err(|_| ExprError::Syntax {
                        pos: at,
                        msg: format!("invalid number {text:?}"),
                    })?;
                    out.push((at, Token::Float(f)));
                } else {
                    let n: i64 = text.parse().map_err(|_| ExprError::Syntax {
                        pos: at,
                        msg: format!("invalid number {text:?}"),
                    })?;
                    out.push((at, Token::Int(n)));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|&(_, c)| c).collect();
                out.push((at, Token::Ident(text)));
            }
            other => {
                return Err(ExprError::Syntax {
                    pos: at,
                    msg: format!("unexpected character {other:?}"),
                })
            }
        }
    }
    Ok(out)
}

pub(crate) fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = lex(src)?;
    let mut p = Parser { tokens, pos: 0, len: src.len() };
    let expr = p.or_expr()?;
    if let Some((at, _)) = p.peek() {
        return Err(ExprError::Syntax {
            pos: at,
            msg: "trailing input".to_string(),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<(usize, &Token)> {
        self.tokens.get(self.pos).map(|(at, t)| (*at, t))
    }

    fn bump(&mut self) -> Option<(usize, Token)> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat(&mut self, want: &Token) -> bool {
        if self.peek().map(|(_, t)| t == want).unwrap_or(false) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, want: Token, what: &str) -> Result<(), ExprError> {
        if self.eat(&want) {
            Ok(())
        } else {
            Err(ExprError::Syntax {
                pos: self.peek().map(|(at, _)| at).unwrap_or(self.len),
                msg: format!("expected {what}"),
            })
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.cmp_expr()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.cmp_expr()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.add_expr()?;
        let op = match self.peek() {
            Some((_, Token::Eq)) => BinOp::Eq,
            Some((_, Token::Ne)) => BinOp::Ne,
            Some((_, Token::Lt)) => BinOp::Lt,
            Some((_, Token::Le)) => BinOp::Le,
            Some((_, Token::Gt)) => BinOp::Gt,
            Some((_, Token::Ge)) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.add_expr()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn add_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Some((_, Token::Plus)) => BinOp::Add,
                Some((_, Token::Minus)) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary_expr()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary_expr(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let expr = self.unary_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        if self.eat(&Token::Minus) {
            let expr = self.unary_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let (at, tok) = self.bump().ok_or(ExprError::Syntax {
            pos: self.len,
            msg: "unexpected end of expression".to_string(),
        })?;
        match tok {
            Token::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Float(f) => Ok(Expr::Literal(Value::from(f))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "nil" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    if self.eat(&Token::LParen) {
                        let mut args = Vec::new();
                        if !self.eat(&Token::RParen) {
                            loop {
                                args.push(self.or_expr()?);
                                if self.eat(&Token::RParen) {
                                    break;
                                }
                                self.expect(Token::Comma, "`,` or `)`")?;
                            }
                        }
                        Ok(Expr::Call { name, args })
                    } else {
                        let mut segs = vec![Seg::Key(name)];
                        self.path_tail(&mut segs)?;
                        Ok(Expr::Path(segs))
                    }
                }
            },
            _ => Err(ExprError::Syntax {
                pos: at,
                msg: "expected a value".to_string(),
            }),
        }
    }

    fn path_tail(&mut self, segs: &mut Vec<Seg>) -> Result<(), ExprError> {
        loop {
            if self.eat(&Token::Dot) {
                match self.bump() {
                    Some((_, Token::Ident(k))) => segs.push(Seg::Key(k)),
                    other => {
                        return Err(ExprError::Syntax {
                            pos: other.map(|(at, _)| at).unwrap_or(self.len),
                            msg: "expected a key after `.`".to_string(),
                        })
                    }
                }
            } else if self.eat(&Token::LBracket) {
                match self.bump() {
                    Some((at, Token::Int(n))) => {
                        let idx = usize::try_from(n).map_err(|_| ExprError::Syntax {
                            pos: at,
                            msg: "negative index".to_string(),
                        })?;
                        segs.push(Seg::Index(idx));
                    }
                    Some((_, Token::Str(k))) => segs.push(Seg::Key(k)),
                    other => {
                        return Err(ExprError::Syntax {
                            pos: other.map(|(at, _)| at).unwrap_or(self.len),
                            msg: "expected an index or key inside `[]`".to_string(),
                        })
                    }
                }
                self.expect(Token::RBracket, "`]`")?;
            } else {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comparison_over_path() {
        let e = parse("steps[0].res.status == 0").unwrap();
        match e {
            Expr::Binary { op: BinOp::Eq, lhs, .. } => match *lhs {
                Expr::Path(segs) => assert_eq!(
                    segs,
                    vec![
                        Seg::Key("steps".to_string()),
                        Seg::Index(0),
                        Seg::Key("res".to_string()),
                        Seg::Key("status".to_string()),
                    ]
                ),
                other => panic!("unexpected lhs: {other:?}"),
            },
            other => panic!("unexpected expr: {other:?}"),
        }
    }

    #[test]
    fn display_round_trips_source() {
        for src in [
            "vars.token == 'abc'",
            "len(steps) > 2 && !vars.done",
            "current.rows[0].count >= 1 || previous.run",
        ] {
            let e = parse(src).unwrap();
            assert_eq!(parse(&e.to_string()).unwrap(), e);
        }
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(matches!(parse("1 2"), Err(ExprError::Syntax { .. })));
        assert!(matches!(parse("a ="), Err(ExprError::Syntax { .. })));
    }
}
