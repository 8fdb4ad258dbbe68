// Restricted expression language for per-edge conversion functions.
// Replaces raw code strings on connections: literals, reads of the edge
// value rooted at `input` (with `[*]` mapping over arrays), object and
// array construction, string interpolation, and comparisons. Parsed and
// rejected at deploy time; evaluation is pure.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum PathStep {
    Key(String),
    Index(usize),
    /// `[*]`: apply the remaining steps to every element
    MapAll,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterpPart {
    Literal(String),
    Path(Vec<PathStep>),
}

/// Parsed conversion expression
#[derive(Debug, Clone, PartialEq)]
pub enum ConvExpr {
    Literal(Value),
    /// Read of the inbound edge value, rooted at `input`
    Path(Vec<PathStep>),
    Object(Vec<(String, ConvExpr)>),
    Array(Vec<ConvExpr>),
    /// String literal containing `{{input.path}}` interpolations
    Interp(Vec<InterpPart>),
    Compare(Box<ConvExpr>, CmpOp, Box<ConvExpr>),
}

impl ConvExpr {
    pub fn parse(src: &str) -> Result<Self, String> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!(
                "Unexpected trailing input at token {}",
                parser.pos
            ));
        }
        Ok(expr)
    }

    /// Evaluate against the inbound edge value. Pure; missing paths read
    /// as null.
    pub fn eval(&self, input: &Value) -> Value {
        match self {
            ConvExpr::Literal(v) => v.clone(),
            ConvExpr::Path(steps) => eval_path(input, steps),
            ConvExpr::Object(fields) => {
                let mut map = Map::new();
                for (key, expr) in fields {
                    map.insert(key.clone(), expr.eval(input));
                }
                Value::Object(map)
            }
            ConvExpr::Array(items) => {
                Value::Array(items.iter().map(|e| e.eval(input)).collect())
            }
            ConvExpr::Interp(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        InterpPart::Literal(s) => out.push_str(s),
                        InterpPart::Path(steps) => match eval_path(input, steps) {
                            Value::String(s) => out.push_str(&s),
                            Value::Null => {}
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Value::String(out)
            }
            ConvExpr::Compare(lhs, op, rhs) => {
                Value::Bool(compare(&lhs.eval(input), *op, &rhs.eval(input)))
            }
        }
    }
}

fn eval_path(input: &Value, steps: &[PathStep]) -> Value {
    let mut current = input.clone();
    for (i, step) in steps.iter().enumerate() {
        match step {
            PathStep::Key(k) => {
                current = current.get(k).cloned().unwrap_or(Value::Null);
            }
            PathStep::Index(idx) => {
                current = current.get(idx).cloned().unwrap_or(Value::Null);
            }
            PathStep::MapAll => {
                let rest = &steps[i + 1..];
                return match current {
                    Value::Array(items) => Value::Array(
                        items.iter().map(|item| eval_path(item, rest)).collect(),
                    ),
                    _ => Value::Null,
                };
            }
        }
    }
    current
}

fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> bool {
    match op {
        CmpOp::Eq => json_eq(lhs, rhs),
        CmpOp::Ne => !json_eq(lhs, rhs),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
                match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                }
            } else if let (Some(a), Some(b)) = (lhs.as_str(), rhs.as_str()) {
                match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                }
            } else {
                false
            }
        }
    }
}

fn json_eq(lhs: &Value, rhs: &Value) -> bool {
    // Numbers compare by value so 1 == 1.0
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return a == b;
    }
    lhs == rhs
}

// ---------------------------------------------------------------------
// Tokenizer / parser
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Dot,
    Star,
    Cmp(CmpOp),
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err("Expected '==' (assignment is not supported)".to_string());
                }
                tokens.push(Token::Cmp(CmpOp::Eq));
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err("Expected '!='".to_string());
                }
                tokens.push(Token::Cmp(CmpOp::Ne));
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Cmp(CmpOp::Le));
                } else {
                    tokens.push(Token::Cmp(CmpOp::Lt));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Cmp(CmpOp::Ge));
                } else {
                    tokens.push(Token::Cmp(CmpOp::Gt));
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            Some('n') => s.push('\n'),
                            Some(other) => {
                                return Err(format!("Unknown escape '\\{other}'"));
                            }
                            None => return Err("Unterminated string".to_string()),
                        },
                        Some(c) => s.push(c),
                        None => return Err("Unterminated string".to_string()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: f64 = num
                    .parse()
                    .map_err(|_| format!("Invalid number '{num}'"))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("Unexpected character '{other}'")),
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
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(format!("Expected {token:?}, got {other:?}")),
        }
    }

    fn expression(&mut self) -> Result<ConvExpr, String> {
        let lhs = self.term()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.term()?;
            return Ok(ConvExpr::Compare(Box::new(lhs), op, Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<ConvExpr, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(ConvExpr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(parse_interp(&s)?),
            Some(Token::Ident(ident)) => match ident.as_str() {
                "true" => Ok(ConvExpr::Literal(Value::Bool(true))),
                "false" => Ok(ConvExpr::Literal(Value::Bool(false))),
                "null" => Ok(ConvExpr::Literal(Value::Null)),
                "input" => Ok(ConvExpr::Path(self.path_steps()?)),
                other => Err(format!(
                    "Unknown identifier '{other}' (paths must start with 'input')"
                )),
            },
            Some(Token::LBrace) => self.object(),
            Some(Token::LBracket) => self.array(),
            other => Err(format!("Unexpected token {other:?}")),
        }
    }

    fn path_steps(&mut self) -> Result<Vec<PathStep>, String> {
        let mut steps = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(key)) => steps.push(PathStep::Key(key)),
                        other => return Err(format!("Expected field name after '.', got {other:?}")),
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    match self.next() {
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            steps.push(PathStep::Index(n as usize));
                        }
                        Some(Token::Star) => steps.push(PathStep::MapAll),
                        other => {
                            return Err(format!(
                                "Expected array index or '*' in brackets, got {other:?}"
                            ))
                        }
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(steps)
    }

    fn object(&mut self) -> Result<ConvExpr, String> {
        let mut fields = Vec::new();
        if self.peek() == Some(&Token::RBrace) {
            self.next();
            return Ok(ConvExpr::Object(fields));
        }
        loop {
            let key = match self.next() {
                Some(Token::Ident(k)) => k,
                Some(Token::Str(k)) => k,
                other => return Err(format!("Expected object key, got {other:?}")),
            };
            self.expect(Token::Colon)?;
            let value = self.expression()?;
            fields.push((key, value));
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RBrace) => break,
                other => return Err(format!("Expected ',' or '}}', got {other:?}")),
            }
        }
        Ok(ConvExpr::Object(fields))
    }

    fn array(&mut self) -> Result<ConvExpr, String> {
        let mut items = Vec::new();
        if self.peek() == Some(&Token::RBracket) {
            self.next();
            return Ok(ConvExpr::Array(items));
        }
        loop {
            items.push(self.expression()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => break,
                other => return Err(format!("Expected ',' or ']', got {other:?}")),
            }
        }
        Ok(ConvExpr::Array(items))
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// Split a string literal into literal and `{{input.path}}` parts.
fn parse_interp(s: &str) -> Result<ConvExpr, String> {
    if !s.contains("{{") {
        return Ok(ConvExpr::Literal(Value::String(s.to_string())));
    }

    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        let close = rest[open..]
            .find("}}")
            .ok_or_else(|| "Unterminated '{{' in string".to_string())?
            + open;
        if open > 0 {
            parts.push(InterpPart::Literal(rest[..open].to_string()));
        }
        let inner = rest[open + 2..close].trim();
        let inner = inner
            .strip_prefix("input")
            .ok_or_else(|| format!("Interpolation '{inner}' must start with 'input'"))?;
        let tokens = tokenize(inner).map_err(|e| format!("Bad interpolation path: {e}"))?;
        let mut parser = Parser { tokens, pos: 0 };
        let steps = parser.path_steps()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!("Bad interpolation path '{inner}'"));
        }
        parts.push(InterpPart::Path(steps));
        rest = &rest[close + 2..];
    }
    if !rest.is_empty() {
        parts.push(InterpPart::Literal(rest.to_string()));
    }
    Ok(ConvExpr::Interp(parts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_path() {
        let expr = ConvExpr::parse("input").unwrap();
        assert_eq!(expr.eval(&json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_nested_path_and_index() {
        let expr = ConvExpr::parse("input.items[1].name").unwrap();
        let v = json!({"items": [{"name": "x"}, {"name": "y"}]});
        assert_eq!(expr.eval(&v), json!("y"));
    }

    #[test]
    fn test_missing_path_is_null() {
        let expr = ConvExpr::parse("input.absent.deep").unwrap();
        assert_eq!(expr.eval(&json!({})), Value::Null);
    }

    #[test]
    fn test_object_construction() {
        let expr = ConvExpr::parse(r#"{title: input.name, count: input.n, fixed: "v1"}"#).unwrap();
        let v = json!({"name": "pr", "n": 3});
        assert_eq!(
            expr.eval(&v),
            json!({"title": "pr", "count": 3, "fixed": "v1"})
        );
    }

    #[test]
    fn test_array_map() {
        let expr = ConvExpr::parse("input.items[*].id").unwrap();
        let v = json!({"items": [{"id": 1}, {"id": 2}, {"id": 3}]});
        assert_eq!(expr.eval(&v), json!([1, 2, 3]));
    }

    #[test]
    fn test_string_interpolation() {
        let expr = ConvExpr::parse(r#""pr {{input.number}} by {{input.author}}""#).unwrap();
        let v = json!({"number": 12, "author": "ada"});
        assert_eq!(expr.eval(&v), json!("pr 12 by ada"));
    }

    #[test]
    fn test_comparisons() {
        let v = json!({"value": 5});
        assert_eq!(
            ConvExpr::parse("input.value > 10").unwrap().eval(&v),
            json!(false)
        );
        assert_eq!(
            ConvExpr::parse("input.value <= 5").unwrap().eval(&v),
            json!(true)
        );
        assert_eq!(
            ConvExpr::parse(r#"input.value == 5"#).unwrap().eval(&v),
            json!(true)
        );
        assert_eq!(
            ConvExpr::parse(r#"input.value != 5"#).unwrap().eval(&v),
            json!(false)
        );
    }

    #[test]
    fn test_number_equality_across_int_float() {
        let expr = ConvExpr::parse("input.v == 1.0").unwrap();
        assert_eq!(expr.eval(&json!({"v": 1})), json!(true));
    }

    #[test]
    fn test_rejects_unknown_roots_and_code() {
        assert!(ConvExpr::parse("payload.x").is_err());
        assert!(ConvExpr::parse("input.x = 1").is_err());
        assert!(ConvExpr::parse("lambda x: x").is_err());
        assert!(ConvExpr::parse("input.items[1").is_err());
    }

    #[test]
    fn test_literals() {
        assert_eq!(ConvExpr::parse("true").unwrap().eval(&json!({})), json!(true));
        assert_eq!(ConvExpr::parse("null").unwrap().eval(&json!({})), json!(null));
        assert_eq!(ConvExpr::parse("-2.5").unwrap().eval(&json!({})), json!(-2.5));
        assert_eq!(
            ConvExpr::parse("[1, input.a]").unwrap().eval(&json!({"a": 2})),
            json!([1, 2])
        );
    }
}
