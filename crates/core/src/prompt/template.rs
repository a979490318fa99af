use std::collections::HashMap;
use std::error::Error as StdError;

use model_io_model::ModelMessage;
use tera::ast::{Expr, ExprVal, Node};
use tera::{Context, Tera};

use super::{PromptError, Variables};

const TEMPLATE_NAME: &str = "prompt";

// Tests that only ask whether a name exists.
const PRESENCE_TESTS: [&str; 2] = ["defined", "undefined"];

/// The syntax of a template.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TemplateFormat {
    /// `{name}` placeholders, `{{` and `}}` for literal braces.
    #[default]
    FString,
    /// `{{ name }}` placeholders rendered by tera.
    Jinja2,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

#[derive(Clone, Debug)]
enum Compiled {
    FString(Vec<Segment>),
    Jinja2(Box<Tera>),
}

/// A text template with named variables.
///
/// Variables are discovered when the template is created, so malformed
/// templates are rejected up front rather than at format time.
#[derive(Clone, Debug)]
pub struct PromptTemplate {
    template: String,
    compiled: Compiled,
    variables: Vec<String>,
    partials: Variables,
}

impl PromptTemplate {
    /// Creates a template in [`TemplateFormat::FString`] syntax.
    pub fn new<S: Into<String>>(template: S) -> Result<Self, PromptError> {
        Self::with_format(template, TemplateFormat::FString)
    }

    /// Creates a template in [`TemplateFormat::Jinja2`] syntax.
    pub fn jinja2<S: Into<String>>(template: S) -> Result<Self, PromptError> {
        Self::with_format(template, TemplateFormat::Jinja2)
    }

    /// Creates a template in the given syntax.
    pub fn with_format<S: Into<String>>(
        template: S,
        format: TemplateFormat,
    ) -> Result<Self, PromptError> {
        let template = template.into();
        let (compiled, variables) = match format {
            TemplateFormat::FString => {
                let segments = parse_fstring(&template)?;
                let mut variables = vec![];
                for segment in &segments {
                    if let Segment::Variable(name) = segment {
                        push_unique(&mut variables, name);
                    }
                }
                (Compiled::FString(segments), variables)
            }
            TemplateFormat::Jinja2 => {
                let mut tera = Tera::default();
                tera.autoescape_on(vec![]);
                tera.add_raw_template(TEMPLATE_NAME, &template)
                    .map_err(|err| PromptError::InvalidTemplate(describe(&err)))?;
                let ast = &tera
                    .get_template(TEMPLATE_NAME)
                    .map_err(|err| PromptError::InvalidTemplate(describe(&err)))?
                    .ast;
                let mut undeclared = Undeclared::default();
                undeclared.nodes(ast, &mut vec![]);
                (Compiled::Jinja2(Box::new(tera)), undeclared.names)
            }
        };
        Ok(Self {
            template,
            compiled,
            variables,
            partials: Variables::new(),
        })
    }

    /// Pre-fills a variable. Values passed to [`Self::format`] win over
    /// partials of the same name.
    #[inline]
    pub fn partial<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.partials.insert(name.into(), value.into());
        self
    }

    /// Returns the template syntax.
    #[inline]
    pub fn format_kind(&self) -> TemplateFormat {
        match self.compiled {
            Compiled::FString(_) => TemplateFormat::FString,
            Compiled::Jinja2(_) => TemplateFormat::Jinja2,
        }
    }

    /// Returns the raw template text.
    #[inline]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Returns the variables the caller still has to provide, in order of
    /// first appearance.
    pub fn input_variables(&self) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|name| !self.partials.contains_key(*name))
            .map(String::as_str)
            .collect()
    }

    /// Renders the template.
    pub fn format(&self, vars: &Variables) -> Result<String, PromptError> {
        if let Some(missing) = self
            .variables
            .iter()
            .find(|name| self.lookup(vars, name).is_none())
        {
            return Err(PromptError::MissingVariable(missing.clone()));
        }

        match &self.compiled {
            Compiled::FString(segments) => {
                let mut out = String::with_capacity(self.template.len());
                for segment in segments {
                    match segment {
                        Segment::Literal(text) => out.push_str(text),
                        Segment::Variable(name) => {
                            out.push_str(
                                self.lookup(vars, name).map_or("", String::as_str),
                            );
                        }
                    }
                }
                Ok(out)
            }
            Compiled::Jinja2(tera) => {
                let mut context = Context::new();
                for (name, value) in self.partials.iter().chain(vars) {
                    context.insert(name.as_str(), value);
                }
                tera.render(TEMPLATE_NAME, &context)
                    .map_err(|err| PromptError::Render(describe(&err)))
            }
        }
    }

    fn lookup<'a>(&'a self, vars: &'a Variables, name: &str) -> Option<&'a String> {
        vars.get(name).or_else(|| self.partials.get(name))
    }

    /// Renders the template as a single user message.
    pub fn format_messages(
        &self,
        vars: &Variables,
    ) -> Result<Vec<ModelMessage>, PromptError> {
        Ok(vec![ModelMessage::user(self.format(vars)?)])
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|existing| existing == name) {
        list.push(name.to_owned());
    }
}

/// Collects the names a tera template reads from its context.
///
/// Names bound by `set` or `for` are skipped while they are in scope, as
/// are names only probed with `is defined` or guarded by `default`.
#[derive(Default)]
struct Undeclared {
    names: Vec<String>,
}

impl Undeclared {
    fn nodes(&mut self, nodes: &[Node], bound: &mut Vec<String>) {
        for node in nodes {
            match node {
                Node::VariableBlock(_, expr) => self.expr(expr, bound),
                Node::Set(_, set) => {
                    self.expr(&set.value, bound);
                    bound.push(set.key.clone());
                }
                Node::Forloop(_, forloop, _) => {
                    self.expr(&forloop.container, bound);
                    let mut inner = bound.clone();
                    inner.push(forloop.value.clone());
                    inner.extend(forloop.key.iter().cloned());
                    inner.push("loop".to_owned());
                    self.nodes(&forloop.body, &mut inner);
                    if let Some(empty) = &forloop.empty_body {
                        self.nodes(empty, &mut bound.clone());
                    }
                }
                Node::If(cond, _) => {
                    for (_, expr, body) in &cond.conditions {
                        self.expr(expr, bound);
                        self.nodes(body, bound);
                    }
                    if let Some((_, body)) = &cond.otherwise {
                        self.nodes(body, bound);
                    }
                }
                Node::FilterSection(_, section, _) => {
                    self.args(&section.filter.args, bound);
                    self.nodes(&section.body, bound);
                }
                Node::Block(_, block, _) => self.nodes(&block.body, bound),
                _ => {}
            }
        }
    }

    fn expr(&mut self, expr: &Expr, bound: &[String]) {
        let guarded =
            expr.has_default_filter() && matches!(expr.val, ExprVal::Ident(_));
        if !guarded {
            self.val(&expr.val, bound);
        }
        for filter in &expr.filters {
            self.args(&filter.args, bound);
        }
    }

    fn val(&mut self, val: &ExprVal, bound: &[String]) {
        match val {
            ExprVal::Ident(ident) => self.ident(ident, bound),
            ExprVal::Math(math) => {
                self.expr(&math.lhs, bound);
                self.expr(&math.rhs, bound);
            }
            ExprVal::Logic(logic) => {
                self.expr(&logic.lhs, bound);
                self.expr(&logic.rhs, bound);
            }
            ExprVal::In(contains) => {
                self.expr(&contains.lhs, bound);
                self.expr(&contains.rhs, bound);
            }
            ExprVal::Test(test) => {
                if !PRESENCE_TESTS.contains(&test.name.as_str()) {
                    self.ident(&test.ident, bound);
                }
                for arg in &test.args {
                    self.expr(arg, bound);
                }
            }
            ExprVal::FunctionCall(call) => self.args(&call.args, bound),
            ExprVal::MacroCall(call) => self.args(&call.args, bound),
            ExprVal::Array(items) => {
                for item in items {
                    self.expr(item, bound);
                }
            }
            ExprVal::StringConcat(concat) => {
                for value in &concat.values {
                    self.val(value, bound);
                }
            }
            ExprVal::String(_) | ExprVal::Int(_) | ExprVal::Float(_) | ExprVal::Bool(_) => {}
        }
    }

    // Keyword arguments are visited in name order to keep discovery stable.
    fn args(&mut self, args: &HashMap<String, Expr>, bound: &[String]) {
        let mut args: Vec<_> = args.iter().collect();
        args.sort_by(|a, b| a.0.cmp(b.0));
        for (_, arg) in args {
            self.expr(arg, bound);
        }
    }

    fn ident(&mut self, ident: &str, bound: &[String]) {
        // `user.name` and `items[0]` read `user` and `items`.
        let root = ident.split(['.', '[']).next().unwrap_or(ident);
        if root.is_empty()
            || root.starts_with("__tera")
            || bound.iter().any(|name| name == root)
        {
            return;
        }
        push_unique(&mut self.names, root);
    }
}

// Tera nests the useful detail in the source chain.
fn describe(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

fn parse_fstring(template: &str) -> Result<Vec<Segment>, PromptError> {
    let mut segments = vec![];
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((pos, ch)) = chars.next() {
        match ch {
            '{' if chars.peek().is_some_and(|&(_, c)| c == '{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek().is_some_and(|&(_, c)| c == '}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(PromptError::InvalidTemplate(format!(
                        "unclosed `{{` at byte {pos}"
                    )));
                }
                let name = name.trim();
                if !is_identifier(name) {
                    return Err(PromptError::InvalidTemplate(format!(
                        "invalid variable name `{name}` at byte {pos}"
                    )));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Variable(name.to_owned()));
            }
            '}' => {
                return Err(PromptError::InvalidTemplate(format!(
                    "single `}}` at byte {pos}"
                )));
            }
            _ => literal.push(ch),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::variables;

    #[test]
    fn test_fstring_format() {
        let template =
            PromptTemplate::new("你是一个有帮助的AI机器人，你的名字是{name}。{user_input} {name}")
                .unwrap();
        assert_eq!(template.input_variables(), ["name", "user_input"]);

        let text = template
            .format(&variables([("name", "小张"), ("user_input", "你叫什么名字？")]))
            .unwrap();
        assert_eq!(text, "你是一个有帮助的AI机器人，你的名字是小张。你叫什么名字？ 小张");
    }

    #[test]
    fn test_fstring_escapes() {
        let template = PromptTemplate::new(r#"{{"age": {age}}}"#).unwrap();
        assert_eq!(template.input_variables(), ["age"]);
        let text = template.format(&variables([("age", "30")])).unwrap();
        assert_eq!(text, r#"{"age": 30}"#);
    }

    #[test]
    fn test_fstring_rejects_malformed() {
        for bad in ["{name", "name}", "{}", "{a b}"] {
            let err = PromptTemplate::new(bad).unwrap_err();
            assert!(matches!(err, PromptError::InvalidTemplate(_)), "{bad}");
        }
    }

    #[test]
    fn test_missing_variable() {
        let template = PromptTemplate::new("{name}: {user_input}").unwrap();
        let err = template
            .format(&variables([("name", "小张")]))
            .unwrap_err();
        assert!(matches!(err, PromptError::MissingVariable(name) if name == "user_input"));
    }

    #[test]
    fn test_partials() {
        let template = PromptTemplate::new("{greeting}, {name}")
            .unwrap()
            .partial("greeting", "你好");
        assert_eq!(template.input_variables(), ["name"]);
        assert_eq!(
            template.format(&variables([("name", "小张")])).unwrap(),
            "你好, 小张"
        );
        // Explicit values override partials.
        assert_eq!(
            template
                .format(&variables([("name", "小张"), ("greeting", "早")]))
                .unwrap(),
            "早, 小张"
        );
    }

    #[test]
    fn test_jinja2_format() {
        let template =
            PromptTemplate::jinja2("格式：{{ format_instructions }}\n输入：{{medical_text}}")
                .unwrap()
                .partial("format_instructions", r#"{"name": "<string>"}"#);
        assert_eq!(template.format_kind(), TemplateFormat::Jinja2);
        assert_eq!(template.input_variables(), ["medical_text"]);

        let text = template
            .format(&variables([("medical_text", "赵敏 & <头晕>")]))
            .unwrap();
        // No HTML escaping.
        assert_eq!(text, "格式：{\"name\": \"<string>\"}\n输入：赵敏 & <头晕>");

        let err = template.format(&Variables::new()).unwrap_err();
        assert!(matches!(err, PromptError::MissingVariable(name) if name == "medical_text"));
        assert!(matches!(
            PromptTemplate::jinja2("{{ unclosed").unwrap_err(),
            PromptError::InvalidTemplate(_)
        ));
    }

    #[test]
    fn test_jinja2_set_binds_locally() {
        let template =
            PromptTemplate::jinja2(r#"{% set greeting = "你好" %}{{ greeting }}，{{ name }}"#)
                .unwrap();
        assert_eq!(template.input_variables(), ["name"]);
        assert_eq!(
            template.format(&variables([("name", "小张")])).unwrap(),
            "你好，小张"
        );

        // The value of a `set` is still read from the context.
        let template =
            PromptTemplate::jinja2("{% set shown = name | upper %}{{ shown }}").unwrap();
        assert_eq!(template.input_variables(), ["name"]);
        assert_eq!(template.format(&variables([("name", "ann")])).unwrap(), "ANN");
    }

    #[test]
    fn test_jinja2_if_condition_is_required() {
        let template =
            PromptTemplate::jinja2("{% if urgent %}【加急】{% endif %}{{ name }}").unwrap();
        assert_eq!(template.input_variables(), ["urgent", "name"]);

        let err = template
            .format(&variables([("name", "张三")]))
            .unwrap_err();
        assert!(matches!(err, PromptError::MissingVariable(name) if name == "urgent"));
        assert_eq!(
            template
                .format(&variables([("urgent", "yes"), ("name", "张三")]))
                .unwrap(),
            "【加急】张三"
        );
        assert_eq!(
            template
                .format(&variables([("urgent", ""), ("name", "张三")]))
                .unwrap(),
            "张三"
        );
    }

    #[test]
    fn test_jinja2_for_loop_variables() {
        let template = PromptTemplate::jinja2(
            "{% for c in symptoms %}{{ loop.index }}.{{ c }}{{ sep }}{% endfor %}",
        )
        .unwrap();
        // The loop value and `loop` are bound by the loop itself.
        assert_eq!(template.input_variables(), ["symptoms", "sep"]);
        assert_eq!(
            template
                .format(&variables([("symptoms", "头痛"), ("sep", ";")]))
                .unwrap(),
            "1.头;2.痛;"
        );
    }

    #[test]
    fn test_jinja2_optional_names() {
        let template = PromptTemplate::jinja2(
            r#"{% if note is defined %}复诊{% endif %}{{ title | default(value="病历") }}"#,
        )
        .unwrap();
        assert!(template.input_variables().is_empty());
        assert_eq!(template.format(&Variables::new()).unwrap(), "病历");
        assert_eq!(
            template
                .format(&variables([("note", "x"), ("title", "门诊记录")]))
                .unwrap(),
            "复诊门诊记录"
        );
    }

    #[test]
    fn test_format_messages() {
        let template = PromptTemplate::new("[human] {user_input}").unwrap();
        let messages = template
            .format_messages(&variables([("user_input", "你好")]))
            .unwrap();
        assert_eq!(messages, [ModelMessage::user("[human] 你好")]);
    }
}
