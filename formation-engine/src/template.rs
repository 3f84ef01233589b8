//! Restricted text templates.
//!
//! Webhook URL, header, input and output templates as well as constraint
//! operator inputs are written in a small action language embedded in text:
//!
//! ```text
//! {{ .Path.To.Field }}               field lookup, missing fields render empty
//! {{ "literal" }}                    string literal
//! {{ json .Assignment.Configuration }}  JSON encoding, missing fields render `null`
//! {{ if .Runtime }}..{{ else if eq .Operation "assign" }}..{{ else }}..{{ end }}
//! {{- .Trimmed -}}                   trims surrounding whitespace
//! ```
//!
//! Functions: `json`, `eq`, `ne`, `not`, `and`, `or`. Nested calls use parentheses.
//! Templates are evaluated against a `serde_json::Value`; rendering never fails.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("unclosed action starting at offset {0}")]
    UnclosedAction(usize),
    #[error("empty action at offset {0}")]
    EmptyAction(usize),
    #[error("unterminated string literal at offset {0}")]
    UnterminatedString(usize),
    #[error("unexpected {found} at offset {offset}")]
    Unexpected { found: String, offset: usize },
    #[error("unknown function {name} at offset {offset}")]
    UnknownFunction { name: String, offset: usize },
    #[error("function {name} expects {expected} argument(s), got {got}")]
    Arity {
        name: &'static str,
        expected: &'static str,
        got: usize,
    },
    #[error("block opened at offset {0} has no end action")]
    MissingEnd(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Func {
    Json,
    Eq,
    Ne,
    Not,
    And,
    Or,
}

impl Func {
    fn lookup(name: &str) -> Option<Func> {
        match name {
            "json" => Some(Func::Json),
            "eq" => Some(Func::Eq),
            "ne" => Some(Func::Ne),
            "not" => Some(Func::Not),
            "and" => Some(Func::And),
            "or" => Some(Func::Or),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Func::Json => "json",
            Func::Eq => "eq",
            Func::Ne => "ne",
            Func::Not => "not",
            Func::And => "and",
            Func::Or => "or",
        }
    }

    fn check_arity(self, got: usize) -> Result<(), TemplateError> {
        let (ok, expected) = match self {
            Func::Json | Func::Not => (got == 1, "1"),
            Func::Eq | Func::Ne => (got == 2, "2"),
            Func::And | Func::Or => (got >= 1, "at least 1"),
        };
        if ok {
            Ok(())
        } else {
            Err(TemplateError::Arity {
                name: self.name(),
                expected,
                got,
            })
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Path(Vec<String>),
    Literal(String),
    Call(Func, Vec<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
enum Node {
    Text(String),
    Output(Expr),
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
}

/// A root field referenced by a template, e.g. `Application` for `.Application.ID`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    pub root: String,
    /// The reference only renders inside a block conditioned on the same root.
    pub guarded: bool,
}

/// A parsed template. Serializes as its source text.
#[derive(Clone)]
pub struct Template {
    source: String,
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let segments = split(source)?;
        let nodes = Parser::default().parse(segments)?;
        Ok(Template {
            source: source.to_string(),
            nodes,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, context: &Value) -> String {
        let mut out = String::with_capacity(self.source.len());
        render_nodes(&self.nodes, context, &mut out);
        out
    }

    /// Root fields referenced anywhere in the template, deduplicated.
    pub fn references(&self) -> Vec<Reference> {
        let mut refs = BTreeSet::new();
        collect_references(&self.nodes, &mut Vec::new(), &mut refs);
        // A root referenced both guarded and unguarded is reported unguarded only.
        let unguarded: BTreeSet<String> = refs
            .iter()
            .filter(|r| !r.guarded)
            .map(|r| r.root.clone())
            .collect();
        refs.into_iter()
            .filter(|r| !r.guarded || !unguarded.contains(&r.root))
            .collect()
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Template").field(&self.source).finish()
    }
}

impl PartialEq for Template {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Serialize for Template {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Template::parse(&source).map_err(serde::de::Error::custom)
    }
}

enum Segment<'a> {
    Text(Cow<'a, str>),
    Action { body: &'a str, offset: usize },
}

fn split(source: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut pos = 0;
    let mut trim_next = false;

    while let Some(found) = source[pos..].find("{{") {
        let start = pos + found;
        let body_start = start + 2;
        let end = source[body_start..]
            .find("}}")
            .map(|e| body_start + e)
            .ok_or(TemplateError::UnclosedAction(start))?;

        let mut body = &source[body_start..end];
        let mut text = &source[pos..start];
        if trim_next {
            text = text.trim_start();
        }
        if let Some(stripped) = body.strip_prefix('-') {
            body = stripped;
            text = text.trim_end();
        }
        trim_next = false;
        if let Some(stripped) = body.strip_suffix('-') {
            body = stripped;
            trim_next = true;
        }

        if !text.is_empty() {
            segments.push(Segment::Text(Cow::Borrowed(text)));
        }
        segments.push(Segment::Action {
            body,
            offset: body_start,
        });
        pos = end + 2;
    }

    let mut tail = &source[pos..];
    if trim_next {
        tail = tail.trim_start();
    }
    if !tail.is_empty() {
        segments.push(Segment::Text(Cow::Borrowed(tail)));
    }
    Ok(segments)
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Path(Vec<String>),
    Str(String),
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier {name:?}"),
            Token::Path(path) => format!("field .{}", path.join(".")),
            Token::Str(s) => format!("string {s:?}"),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }
}

fn is_field_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn tokenize(body: &str, offset: usize) -> Result<Vec<(Token, usize)>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = body.char_indices().peekable();

    while let Some(&(i, c)) = chars.peek() {
        let at = offset + i;
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push((Token::LParen, at));
            }
            ')' => {
                chars.next();
                tokens.push((Token::RParen, at));
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, 'n')) => value.push('\n'),
                            Some((_, 't')) => value.push('\t'),
                            Some((_, other)) => value.push(other),
                            None => break,
                        },
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(TemplateError::UnterminatedString(at));
                }
                tokens.push((Token::Str(value), at));
            }
            '.' => {
                let mut path = Vec::new();
                while let Some(&(_, '.')) = chars.peek() {
                    chars.next();
                    let mut segment = String::new();
                    while let Some(&(_, c)) = chars.peek() {
                        if !is_field_char(c) {
                            break;
                        }
                        segment.push(c);
                        chars.next();
                    }
                    if !segment.is_empty() {
                        path.push(segment);
                    }
                }
                tokens.push((Token::Path(path), at));
            }
            c if c.is_ascii_alphabetic() => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if !is_field_char(c) {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                tokens.push((Token::Ident(ident), at));
            }
            other => {
                return Err(TemplateError::Unexpected {
                    found: format!("character {other:?}"),
                    offset: at,
                });
            }
        }
    }
    Ok(tokens)
}

struct ExprParser<'t> {
    tokens: &'t [(Token, usize)],
    pos: usize,
    end_offset: usize,
}

impl<'t> ExprParser<'t> {
    fn peek(&self) -> Option<&'t (Token, usize)> {
        self.tokens.get(self.pos)
    }

    fn unexpected(&self) -> TemplateError {
        match self.peek() {
            Some((token, offset)) => TemplateError::Unexpected {
                found: token.describe(),
                offset: *offset,
            },
            None => TemplateError::Unexpected {
                found: "end of action".to_string(),
                offset: self.end_offset,
            },
        }
    }

    /// A call consumes operands until the end of the action or a closing paren.
    fn expr(&mut self) -> Result<Expr, TemplateError> {
        match self.peek() {
            Some((Token::Ident(name), offset)) => {
                let func = Func::lookup(name).ok_or_else(|| TemplateError::UnknownFunction {
                    name: name.clone(),
                    offset: *offset,
                })?;
                self.pos += 1;
                let mut args = Vec::new();
                while let Some((token, _)) = self.peek() {
                    if *token == Token::RParen {
                        break;
                    }
                    args.push(self.operand()?);
                }
                func.check_arity(args.len())?;
                Ok(Expr::Call(func, args))
            }
            Some(_) => self.operand(),
            None => Err(self.unexpected()),
        }
    }

    fn operand(&mut self) -> Result<Expr, TemplateError> {
        let Some((token, _)) = self.peek() else {
            return Err(self.unexpected());
        };
        match token {
            Token::Path(path) => {
                self.pos += 1;
                Ok(Expr::Path(path.clone()))
            }
            Token::Str(value) => {
                self.pos += 1;
                Ok(Expr::Literal(value.clone()))
            }
            Token::LParen => {
                self.pos += 1;
                let inner = self.expr()?;
                match self.peek() {
                    Some((Token::RParen, _)) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(self.unexpected()),
                }
            }
            Token::Ident(_) | Token::RParen => Err(self.unexpected()),
        }
    }

    fn finish(mut self) -> Result<Expr, TemplateError> {
        let expr = self.expr()?;
        if self.pos != self.tokens.len() {
            return Err(self.unexpected());
        }
        Ok(expr)
    }
}

fn parse_expr(tokens: &[(Token, usize)], end_offset: usize) -> Result<Expr, TemplateError> {
    ExprParser {
        tokens,
        pos: 0,
        end_offset,
    }
    .finish()
}

struct Frame {
    offset: usize,
    branches: Vec<(Expr, Vec<Node>)>,
    condition: Option<Expr>,
    current: Vec<Node>,
}

impl Frame {
    fn close_branch(&mut self) {
        let nodes = std::mem::take(&mut self.current);
        if let Some(cond) = self.condition.take() {
            self.branches.push((cond, nodes));
        }
    }
}

#[derive(Default)]
struct Parser {
    root: Vec<Node>,
    stack: Vec<Frame>,
}

impl Parser {
    fn push(&mut self, node: Node) {
        match self.stack.last_mut() {
            Some(frame) => frame.current.push(node),
            None => self.root.push(node),
        }
    }

    fn parse(mut self, segments: Vec<Segment<'_>>) -> Result<Vec<Node>, TemplateError> {
        for segment in segments {
            match segment {
                Segment::Text(text) => self.push(Node::Text(text.into_owned())),
                Segment::Action { body, offset } => self.action(body, offset)?,
            }
        }
        if let Some(frame) = self.stack.last() {
            return Err(TemplateError::MissingEnd(frame.offset));
        }
        Ok(self.root)
    }

    fn action(&mut self, body: &str, offset: usize) -> Result<(), TemplateError> {
        let tokens = tokenize(body, offset)?;
        let end_offset = offset + body.len();
        let keyword = match tokens.first() {
            Some((Token::Ident(word), _)) => word.as_str(),
            Some(_) => "",
            None => return Err(TemplateError::EmptyAction(offset)),
        };

        match keyword {
            "if" => {
                let condition = parse_expr(&tokens[1..], end_offset)?;
                self.stack.push(Frame {
                    offset,
                    branches: Vec::new(),
                    condition: Some(condition),
                    current: Vec::new(),
                });
            }
            "else" => {
                let unexpected = || TemplateError::Unexpected {
                    found: "else".to_string(),
                    offset,
                };
                let frame = self.stack.last_mut().ok_or_else(unexpected)?;
                // A second plain else leaves the frame without a pending condition.
                if frame.condition.is_none() {
                    return Err(unexpected());
                }
                frame.close_branch();
                match tokens.get(1) {
                    Some((Token::Ident(word), _)) if word == "if" => {
                        frame.condition = Some(parse_expr(&tokens[2..], end_offset)?);
                    }
                    Some((token, at)) => {
                        return Err(TemplateError::Unexpected {
                            found: token.describe(),
                            offset: *at,
                        });
                    }
                    None => {}
                }
            }
            "end" => {
                if tokens.len() > 1 {
                    return Err(TemplateError::Unexpected {
                        found: tokens[1].0.describe(),
                        offset: tokens[1].1,
                    });
                }
                let mut frame = self.stack.pop().ok_or(TemplateError::Unexpected {
                    found: "end".to_string(),
                    offset,
                })?;
                let otherwise = if frame.condition.is_some() {
                    frame.close_branch();
                    Vec::new()
                } else {
                    std::mem::take(&mut frame.current)
                };
                self.push(Node::If {
                    branches: frame.branches,
                    otherwise,
                });
            }
            _ => {
                let expr = parse_expr(&tokens, end_offset)?;
                self.push(Node::Output(expr));
            }
        }
        Ok(())
    }
}

fn lookup<'a>(context: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(context, |value, segment| value.as_object()?.get(segment))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn display(value: &Value) -> Cow<'_, str> {
    match value {
        Value::Null => Cow::Borrowed(""),
        Value::String(s) => Cow::Borrowed(s),
        other => Cow::Owned(other.to_string()),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || display(a) == display(b)
}

fn eval<'a>(expr: &Expr, context: &'a Value) -> Cow<'a, Value> {
    match expr {
        Expr::Path(path) => lookup(context, path)
            .map(Cow::Borrowed)
            .unwrap_or(Cow::Owned(Value::Null)),
        Expr::Literal(value) => Cow::Owned(Value::String(value.clone())),
        Expr::Call(func, args) => {
            let value = match func {
                Func::Json => Value::String(eval(&args[0], context).to_string()),
                Func::Eq => Value::Bool(values_equal(
                    &eval(&args[0], context),
                    &eval(&args[1], context),
                )),
                Func::Ne => Value::Bool(!values_equal(
                    &eval(&args[0], context),
                    &eval(&args[1], context),
                )),
                Func::Not => Value::Bool(!truthy(&eval(&args[0], context))),
                Func::And => Value::Bool(args.iter().all(|a| truthy(&eval(a, context)))),
                Func::Or => Value::Bool(args.iter().any(|a| truthy(&eval(a, context)))),
            };
            Cow::Owned(value)
        }
    }
}

fn render_nodes(nodes: &[Node], context: &Value, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Output(expr) => out.push_str(&display(&eval(expr, context))),
            Node::If {
                branches,
                otherwise,
            } => {
                let taken = branches
                    .iter()
                    .find(|(cond, _)| truthy(&eval(cond, context)))
                    .map(|(_, body)| body.as_slice())
                    .unwrap_or(otherwise.as_slice());
                render_nodes(taken, context, out);
            }
        }
    }
}

fn expr_roots(expr: &Expr, roots: &mut Vec<String>) {
    match expr {
        Expr::Path(path) => {
            if let Some(root) = path.first() {
                roots.push(root.clone());
            }
        }
        Expr::Literal(_) => {}
        Expr::Call(_, args) => args.iter().for_each(|a| expr_roots(a, roots)),
    }
}

fn collect_references(nodes: &[Node], guards: &mut Vec<String>, out: &mut BTreeSet<Reference>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Output(expr) => {
                let mut roots = Vec::new();
                expr_roots(expr, &mut roots);
                for root in roots {
                    let guarded = guards.contains(&root);
                    out.insert(Reference { root, guarded });
                }
            }
            Node::If {
                branches,
                otherwise,
            } => {
                let depth = guards.len();
                for (cond, body) in branches {
                    let mut roots = Vec::new();
                    expr_roots(cond, &mut roots);
                    for root in &roots {
                        out.insert(Reference {
                            root: root.clone(),
                            guarded: true,
                        });
                    }
                    guards.extend(roots);
                    collect_references(body, guards, out);
                }
                collect_references(otherwise, guards, out);
                guards.truncate(depth);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(source: &str, context: Value) -> String {
        Template::parse(source).unwrap().render(&context)
    }

    #[test]
    fn test_field_lookup() {
        let ctx = json!({"Application": {"ID": "app-1", "Labels": {"region": "eu"}}});
        assert_eq!(render("id={{.Application.ID}}", ctx.clone()), "id=app-1");
        assert_eq!(render("{{ .Application.Labels.region }}", ctx.clone()), "eu");
        assert_eq!(render("{{.Application.Labels}}", ctx), r#"{"region":"eu"}"#);
    }

    #[test]
    fn test_missing_field_renders_empty() {
        let ctx = json!({"Runtime": {"ID": "rt-1"}});
        assert_eq!(render(r#"{"app":"{{.Application.ID}}"}"#, ctx.clone()), r#"{"app":""}"#);
        assert_eq!(render("{{ json .Application }}", ctx), "null");
    }

    #[test]
    fn test_json_function() {
        let ctx = json!({"Config": {"a": [1, 2]}, "Name": "quote\"d"});
        assert_eq!(render("{{json .Config}}", ctx.clone()), r#"{"a":[1,2]}"#);
        assert_eq!(render("{{ json .Name }}", ctx), r#""quote\"d""#);
    }

    #[test]
    fn test_conditionals() {
        let tpl = r#"{{ if .Application }}app{{ else if eq .Operation "assign" }}assign{{ else }}other{{ end }}"#;
        assert_eq!(render(tpl, json!({"Application": {"ID": "a"}})), "app");
        assert_eq!(render(tpl, json!({"Operation": "assign"})), "assign");
        assert_eq!(render(tpl, json!({"Operation": "unassign"})), "other");

        let nested = r#"{{ if and .A (not .B) }}yes{{ end }}"#;
        assert_eq!(render(nested, json!({"A": true, "B": false})), "yes");
        assert_eq!(render(nested, json!({"A": true, "B": "x"})), "");
    }

    #[test]
    fn test_trim_markers() {
        let tpl = "{\n  {{- if .A }}\n  \"a\": 1\n  {{- end }}\n}";
        assert_eq!(render(tpl, json!({"A": 1})), "{\n  \"a\": 1\n}");
        assert_eq!(render("a  {{- .X -}}  b", json!({"X": "-"})), "a-b");
    }

    #[test]
    fn test_eq_compares_across_types() {
        assert_eq!(render(r#"{{ eq .Code "200" }}"#, json!({"Code": 200})), "true");
        assert_eq!(render(r#"{{ ne .Code "200" }}"#, json!({"Code": 204})), "true");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Template::parse("{{ .A ").unwrap_err(),
            TemplateError::UnclosedAction(0)
        );
        assert!(matches!(
            Template::parse("{{ upper .A }}").unwrap_err(),
            TemplateError::UnknownFunction { .. }
        ));
        assert!(matches!(
            Template::parse("{{ eq .A }}").unwrap_err(),
            TemplateError::Arity { name: "eq", .. }
        ));
        assert!(matches!(
            Template::parse("{{ if .A }}x").unwrap_err(),
            TemplateError::MissingEnd(_)
        ));
        assert!(matches!(
            Template::parse("{{ end }}").unwrap_err(),
            TemplateError::Unexpected { .. }
        ));
        assert!(matches!(
            Template::parse("{{ if .A }}{{ else }}{{ else }}{{ end }}").unwrap_err(),
            TemplateError::Unexpected { .. }
        ));
        assert!(matches!(
            Template::parse(r#"{{ "open }}"#).unwrap_err(),
            TemplateError::UnterminatedString(_)
        ));
        assert!(matches!(
            Template::parse("{{  }}").unwrap_err(),
            TemplateError::EmptyAction(_)
        ));
    }

    #[test]
    fn test_references() {
        let tpl = Template::parse(
            "{{ .FormationID }}{{ if .Application }}{{ .Application.ID }}{{ end }}{{ .Runtime.ID }}",
        )
        .unwrap();
        let refs = tpl.references();
        assert!(refs.contains(&Reference {
            root: "FormationID".into(),
            guarded: false
        }));
        assert!(refs.contains(&Reference {
            root: "Application".into(),
            guarded: true
        }));
        assert!(refs.contains(&Reference {
            root: "Runtime".into(),
            guarded: false
        }));

        // Unguarded use elsewhere wins over a guarded one.
        let tpl = Template::parse("{{ if .A }}{{ .A.X }}{{ end }}{{ .A.Y }}").unwrap();
        assert_eq!(
            tpl.references(),
            vec![Reference {
                root: "A".into(),
                guarded: false
            }]
        );
    }

    #[test]
    fn test_serde_round_trip_validates() {
        let tpl: Template = serde_json::from_value(json!("{{ .A }}")).unwrap();
        assert_eq!(tpl.source(), "{{ .A }}");
        assert!(serde_json::from_value::<Template>(json!("{{ .A")).is_err());
    }
}
