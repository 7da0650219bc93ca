//! Template expressions and the condition mini-grammar.
//!
//! Templates are parsed once at workflow load time into an AST of path
//! accesses; resolution is a walk over a context snapshot. A binding that
//! is exactly one `${...}` reference yields the referenced subtree; any
//! surrounding text turns the result into string interpolation.
//!
//! Conditions (switch expressions, edge conditions, transition guards,
//! `while` loops) use a small boolean/comparison grammar over literals and
//! `${path}` references:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | cmp
//! cmp     := term ( ("==" | "!=" | "<=" | ">=" | "<" | ">") term )?
//! term    := literal | reference | "(" expr ")"
//! ```

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("invalid template '{template}': {message}")]
    Syntax { template: String, message: String },
    #[error("unresolved reference '${{{path}}}'")]
    Unresolved { path: String },
    #[error("invalid condition '{condition}': {message}")]
    Condition { condition: String, message: String },
}

/// One step of a path access.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed `${path.with.dots[index]}` reference. `nullable` references
/// (`${path?}`) resolve to `null` instead of erroring when missing.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    pub segments: Vec<PathSegment>,
    pub nullable: bool,
    raw: String,
}

impl PathExpr {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let (body, nullable) = match raw.strip_suffix('?') {
            Some(body) => (body, true),
            None => (raw, false),
        };
        if body.is_empty() {
            return Err(TemplateError::Syntax {
                template: raw.to_string(),
                message: "empty path".into(),
            });
        }
        let mut segments = Vec::new();
        for part in body.split('.') {
            if part.is_empty() {
                return Err(TemplateError::Syntax {
                    template: raw.to_string(),
                    message: "empty path segment".into(),
                });
            }
            let mut rest = part;
            // Leading name up to the first bracket, then any [n] suffixes.
            if let Some(bracket) = rest.find('[') {
                let name = &rest[..bracket];
                if !name.is_empty() {
                    segments.push(PathSegment::Key(name.to_string()));
                }
                rest = &rest[bracket..];
                while let Some(stripped) = rest.strip_prefix('[') {
                    let close = stripped.find(']').ok_or_else(|| TemplateError::Syntax {
                        template: raw.to_string(),
                        message: "unterminated index".into(),
                    })?;
                    let index: usize =
                        stripped[..close].parse().map_err(|_| TemplateError::Syntax {
                            template: raw.to_string(),
                            message: format!("invalid index '{}'", &stripped[..close]),
                        })?;
                    segments.push(PathSegment::Index(index));
                    rest = &stripped[close + 1..];
                }
                if !rest.is_empty() {
                    return Err(TemplateError::Syntax {
                        template: raw.to_string(),
                        message: format!("trailing characters '{rest}'"),
                    });
                }
            } else {
                segments.push(PathSegment::Key(rest.to_string()));
            }
        }
        Ok(Self {
            segments,
            nullable,
            raw: body.to_string(),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Walk the snapshot. Missing paths error unless the reference is
    /// nullable.
    pub fn resolve(&self, root: &Value) -> Result<Value, TemplateError> {
        let mut current = root;
        for segment in &self.segments {
            let next = match segment {
                PathSegment::Key(key) => current.as_object().and_then(|map| map.get(key)),
                PathSegment::Index(index) => current.as_array().and_then(|arr| arr.get(*index)),
            };
            match next {
                Some(value) => current = value,
                None if self.nullable => return Ok(Value::Null),
                None => {
                    return Err(TemplateError::Unresolved {
                        path: self.raw.clone(),
                    });
                }
            }
        }
        Ok(current.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Text(String),
    Ref(PathExpr),
}

/// A parsed input binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    parts: Vec<Part>,
    raw: String,
}

impl Template {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let mut parts = Vec::new();
        let mut rest = raw;
        while let Some(start) = rest.find("${") {
            if start > 0 {
                parts.push(Part::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let close = after.find('}').ok_or_else(|| TemplateError::Syntax {
                template: raw.to_string(),
                message: "unterminated '${'".into(),
            })?;
            parts.push(Part::Ref(PathExpr::parse(&after[..close])?));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }
        Ok(Self {
            parts,
            raw: raw.to_string(),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Resolve against a snapshot. A lone reference returns the subtree;
    /// anything else interpolates into a string.
    pub fn resolve(&self, root: &Value) -> Result<Value, TemplateError> {
        if self.parts.len() == 1 {
            if let Part::Ref(path) = &self.parts[0] {
                return path.resolve(root);
            }
        }
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Ref(path) => match path.resolve(root)? {
                    Value::String(s) => out.push_str(&s),
                    Value::Null => {}
                    other => out.push_str(&other.to_string()),
                },
            }
        }
        Ok(Value::String(out))
    }
}

/// Condition AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Literal(Value),
    Ref(PathExpr),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Compare {
        op: CompareOp,
        left: Box<Condition>,
        right: Box<Condition>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        let mut parser = ConditionParser::new(input);
        let expr = parser.parse_or()?;
        parser.skip_ws();
        if !parser.at_end() {
            return Err(parser.error("trailing input"));
        }
        Ok(expr)
    }

    /// Evaluate to a JSON value (comparisons and logic yield booleans).
    pub fn eval(&self, root: &Value) -> Result<Value, TemplateError> {
        match self {
            Condition::Literal(value) => Ok(value.clone()),
            Condition::Ref(path) => path.resolve(root),
            Condition::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(root)?))),
            Condition::And(lhs, rhs) => {
                Ok(Value::Bool(truthy(&lhs.eval(root)?) && truthy(&rhs.eval(root)?)))
            }
            Condition::Or(lhs, rhs) => {
                Ok(Value::Bool(truthy(&lhs.eval(root)?) || truthy(&rhs.eval(root)?)))
            }
            Condition::Compare { op, left, right } => {
                let lhs = left.eval(root)?;
                let rhs = right.eval(root)?;
                Ok(Value::Bool(compare(*op, &lhs, &rhs)))
            }
        }
    }

    /// Evaluate and coerce to a boolean.
    pub fn eval_bool(&self, root: &Value) -> Result<bool, TemplateError> {
        Ok(truthy(&self.eval(root)?))
    }
}

/// Truthiness: bool is itself, null is false, numbers by non-zero,
/// strings and containers by non-emptiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> bool {
    match op {
        CompareOp::Eq => json_eq(lhs, rhs),
        CompareOp::Ne => !json_eq(lhs, rhs),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            match ordering {
                Some(ord) => match op {
                    CompareOp::Lt => ord.is_lt(),
                    CompareOp::Le => ord.is_le(),
                    CompareOp::Gt => ord.is_gt(),
                    CompareOp::Ge => ord.is_ge(),
                    _ => unreachable!(),
                },
                None => false,
            }
        }
    }
}

fn json_eq(lhs: &Value, rhs: &Value) -> bool {
    // Numbers compare numerically so 1 == 1.0.
    if let (Value::Number(a), Value::Number(b)) = (lhs, rhs) {
        return a.as_f64() == b.as_f64();
    }
    lhs == rhs
}

struct ConditionParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> ConditionParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_ws(&mut self) {
        while self.rest().starts_with(|c: char| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn error(&self, message: &str) -> TemplateError {
        TemplateError::Condition {
            condition: self.input.to_string(),
            message: format!("{message} at offset {}", self.pos),
        }
    }

    fn parse_or(&mut self) -> Result<Condition, TemplateError> {
        let mut left = self.parse_and()?;
        while self.eat("||") {
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, TemplateError> {
        let mut left = self.parse_unary()?;
        while self.eat("&&") {
            let right = self.parse_unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Condition, TemplateError> {
        self.skip_ws();
        // `!` but not `!=`
        if self.rest().starts_with('!') && !self.rest().starts_with("!=") {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Condition, TemplateError> {
        let left = self.parse_term()?;
        self.skip_ws();
        let op = if self.eat("==") {
            CompareOp::Eq
        } else if self.eat("!=") {
            CompareOp::Ne
        } else if self.eat("<=") {
            CompareOp::Le
        } else if self.eat(">=") {
            CompareOp::Ge
        } else if self.eat("<") {
            CompareOp::Lt
        } else if self.eat(">") {
            CompareOp::Gt
        } else {
            return Ok(left);
        };
        let right = self.parse_term()?;
        Ok(Condition::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_term(&mut self) -> Result<Condition, TemplateError> {
        self.skip_ws();
        if self.eat("(") {
            let expr = self.parse_or()?;
            if !self.eat(")") {
                return Err(self.error("expected ')'"));
            }
            return Ok(expr);
        }
        if self.rest().starts_with("${") {
            self.pos += 2;
            let close = self.rest().find('}').ok_or_else(|| self.error("unterminated '${'"))?;
            let path = PathExpr::parse(&self.rest()[..close])?;
            self.pos += close + 1;
            return Ok(Condition::Ref(path));
        }
        if let Some(quote) = self.rest().chars().next().filter(|c| *c == '\'' || *c == '"') {
            self.pos += 1;
            let close = self
                .rest()
                .find(quote)
                .ok_or_else(|| self.error("unterminated string"))?;
            let text = self.rest()[..close].to_string();
            self.pos += close + 1;
            return Ok(Condition::Literal(Value::String(text)));
        }
        if self.eat("true") {
            return Ok(Condition::Literal(Value::Bool(true)));
        }
        if self.eat("false") {
            return Ok(Condition::Literal(Value::Bool(false)));
        }
        if self.eat("null") {
            return Ok(Condition::Literal(Value::Null));
        }
        // Number literal.
        let rest = self.rest();
        let mut len = 0;
        for (i, c) in rest.char_indices() {
            if c.is_ascii_digit() || c == '.' || (i == 0 && c == '-') {
                len = i + c.len_utf8();
            } else {
                break;
            }
        }
        if len > 0 {
            let text = &rest[..len];
            let number: f64 = text.parse().map_err(|_| self.error("invalid number"))?;
            let value = if text.contains('.') {
                serde_json::Number::from_f64(number).map(Value::Number)
            } else {
                Some(Value::Number((number as i64).into()))
            };
            self.pos += len;
            return value
                .map(Condition::Literal)
                .ok_or_else(|| self.error("invalid number"));
        }
        Err(self.error("expected literal, reference, or '('"))
    }
}
