//! Dockerfile parser for the kiln build system.
//!
//! Parses a single-stage Dockerfile into a structured representation that
//! the planner lowers into typed build stages. Supports:
//! - `FROM`, `WORKDIR`, `COPY`, `RUN`, `ENV`, `ARG`, `LABEL`, `EXPOSE`,
//!   `USER`, `ENTRYPOINT` and `CMD`
//! - line continuations and full-line comments
//! - `$VAR`, `${VAR}` and `${VAR:-default}` substitution from `ARG` and `ENV` values

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

/// A parsed Dockerfile.
#[derive(Debug, Clone, PartialEq)]
pub struct Dockerfile {
    /// Base image from the single `FROM` instruction
    pub from: ImageRef,
    /// Instructions in file order, starting with `FROM`
    pub instructions: Vec<Instruction>,
    /// ARG declarations that appear before `FROM`
    pub global_args: BTreeMap<String, Option<String>>,
}

/// Reference to an image: `name[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parses `name[:tag][@digest]`. A registry port (`host:5000/app`) is
    /// not mistaken for a tag.
    pub fn parse(s: &str) -> Self {
        let (name_tag, digest) = match s.split_once('@') {
            Some((left, digest)) => (left, Some(digest.to_string())),
            None => (s, None),
        };

        let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        Self { name: name.to_string(), tag, digest }
    }

    /// Tag, defaulting to `latest`.
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// A single Dockerfile instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// FROM [--platform=<platform>] image
    From {
        image: ImageRef,
        platform: Option<String>,
    },

    /// RUN command
    Run { command: RunCommand },

    /// COPY [--chown=user:group] src... dest
    Copy {
        sources: Vec<String>,
        destination: String,
        chown: Option<String>,
    },

    /// ENV key=value... or ENV key value
    Env { vars: BTreeMap<String, String> },

    /// ARG name[=default]; `value` is the build argument if one was given,
    /// else the default in scope
    Arg { name: String, value: Option<String> },

    /// LABEL key=value...
    Label { labels: BTreeMap<String, String> },

    /// EXPOSE port[/protocol]...
    Expose { ports: Vec<PortSpec> },

    /// WORKDIR /path
    Workdir { path: String },

    /// USER user[:group]
    User { user: String },

    /// ENTRYPOINT ["exec", "form"] or ENTRYPOINT command
    Entrypoint { command: RunCommand },

    /// CMD ["exec", "form"] or CMD command
    Cmd { command: RunCommand },
}

/// RUN/CMD/ENTRYPOINT command format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunCommand {
    /// Shell form: `RUN apt-get update`
    Shell(String),
    /// Exec form: `RUN ["apt-get", "update"]`
    Exec(Vec<String>),
}

impl RunCommand {
    /// Argument vector a process runner would execute.
    ///
    /// Shell form becomes `["/bin/sh", "-c", command]`.
    pub fn argv(&self) -> Vec<String> {
        match self {
            RunCommand::Shell(cmd) => vec!["/bin/sh".to_string(), "-c".to_string(), cmd.clone()],
            RunCommand::Exec(args) => args.clone(),
        }
    }
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunCommand::Shell(cmd) => write!(f, "{}", cmd),
            RunCommand::Exec(args) => {
                let json = serde_json::to_string(args).map_err(|_| fmt::Error)?;
                write!(f, "{}", json.replace("\",\"", "\", \""))
            }
        }
    }
}

/// Port specification for EXPOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Dockerfile parse error.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
    pub hint: Option<String>,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self { line, message: message.into(), hint: None }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Line {}: {}", self.line, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  Hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Parses a Dockerfile from a string.
///
/// # Examples
/// ```
/// use kiln_core::builder::parser::parse_dockerfile;
///
/// let dockerfile = r#"
/// FROM python:3.12-slim
/// WORKDIR /app
/// CMD ["python", "app.py"]
/// "#;
///
/// let parsed = parse_dockerfile(dockerfile).unwrap();
/// assert_eq!(parsed.from.name, "python");
/// assert_eq!(parsed.instructions.len(), 3);
/// ```
pub fn parse_dockerfile(content: &str) -> Result<Dockerfile, ParseError> {
    parse_dockerfile_with_args(content, &HashMap::new())
}

/// Parses a Dockerfile, overriding `ARG` defaults with `build_args`.
pub fn parse_dockerfile_with_args(
    content: &str,
    build_args: &HashMap<String, String>,
) -> Result<Dockerfile, ParseError> {
    DockerfileParser::new(content, build_args).parse()
}

/// Parses a Dockerfile from a file.
pub fn parse_dockerfile_file(
    path: &Path,
    build_args: &HashMap<String, String>,
) -> Result<Dockerfile, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ParseError::new(0, format!("Failed to read Dockerfile: {}", e))
            .with_hint(format!("Check that {} exists and is readable", path.display()))
    })?;

    parse_dockerfile_with_args(&content, build_args)
}

/// Internal parser state.
struct DockerfileParser<'a> {
    /// Logical lines after joining continuations: (first line number, text)
    lines: Vec<(usize, String)>,
    build_args: &'a HashMap<String, String>,
    /// ARG values visible for substitution
    scope: HashMap<String, String>,
    global_args: BTreeMap<String, Option<String>>,
}

impl<'a> DockerfileParser<'a> {
    fn new(content: &str, build_args: &'a HashMap<String, String>) -> Self {
        Self {
            lines: Self::logical_lines(content),
            build_args,
            scope: HashMap::new(),
            global_args: BTreeMap::new(),
        }
    }

    /// Joins `\` continuations and drops blank and comment lines.
    ///
    /// Only lines whose first non-blank character is `#` are comments, so
    /// `RUN echo "#1"` keeps its argument.
    fn logical_lines(content: &str) -> Vec<(usize, String)> {
        let mut result = Vec::new();
        let mut pending: Option<(usize, String)> = None;

        for (idx, raw) in content.lines().enumerate() {
            let line_num = idx + 1;
            let trimmed = raw.trim();

            if trimmed.starts_with('#') || (trimmed.is_empty() && pending.is_none()) {
                continue;
            }

            let continues = trimmed.ends_with('\\');
            let body = trimmed.trim_end_matches('\\').trim_end();

            match pending.as_mut() {
                Some((_, text)) => {
                    if !body.is_empty() {
                        text.push(' ');
                        text.push_str(body);
                    }
                }
                None => pending = Some((line_num, body.to_string())),
            }

            if !continues {
                if let Some(done) = pending.take() {
                    if !done.1.is_empty() {
                        result.push(done);
                    }
                }
            }
        }

        if let Some(done) = pending {
            if !done.1.is_empty() {
                result.push(done);
            }
        }

        result
    }

    fn parse(mut self) -> Result<Dockerfile, ParseError> {
        let lines = std::mem::take(&mut self.lines);
        let mut instructions = Vec::new();
        let mut from: Option<ImageRef> = None;

        for (line_num, line) in &lines {
            let (keyword, rest) = split_keyword(line);

            if from.is_none() {
                match keyword.as_str() {
                    "ARG" => {
                        let (name, default) = self.parse_arg(*line_num, rest)?;
                        self.global_args.insert(name, default);
                        continue;
                    }
                    "FROM" => {
                        let inst = self.parse_from(*line_num, rest)?;
                        if let Instruction::From { image, .. } = &inst {
                            from = Some(image.clone());
                        }
                        instructions.push(inst);
                        continue;
                    }
                    _ => {
                        return Err(ParseError::new(
                            *line_num,
                            format!("Expected ARG or FROM, found {}", keyword),
                        )
                        .with_hint("A Dockerfile must start with ARG or FROM"));
                    }
                }
            }

            if keyword == "FROM" {
                return Err(ParseError::new(*line_num, "Multi-stage builds are not supported")
                    .with_hint("Use a single FROM instruction"));
            }

            let inst = self.parse_instruction(*line_num, &keyword, rest)?;
            instructions.push(inst);
        }

        let from = from.ok_or_else(|| {
            ParseError::new(lines.last().map(|(n, _)| *n).unwrap_or(1), "Dockerfile has no FROM")
                .with_hint("Add a base image, e.g. FROM python:3.12-slim")
        })?;

        Ok(Dockerfile { from, instructions, global_args: self.global_args })
    }

    fn parse_instruction(
        &mut self,
        line_num: usize,
        keyword: &str,
        rest: &str,
    ) -> Result<Instruction, ParseError> {
        match keyword {
            "RUN" => {
                let command = parse_command(line_num, "RUN", rest)?;
                Ok(Instruction::Run { command })
            }
            "COPY" => self.parse_copy(line_num, rest),
            "ENV" => self.parse_env(line_num, rest),
            "ARG" => {
                let (name, _) = self.parse_arg(line_num, rest)?;
                let value = self.scope.get(&name).cloned();
                Ok(Instruction::Arg { name, value })
            }
            "LABEL" => self.parse_label(line_num, rest),
            "EXPOSE" => self.parse_expose(line_num, rest),
            "WORKDIR" => {
                let path = self.substitute(rest.trim());
                if path.is_empty() {
                    return Err(ParseError::new(line_num, "WORKDIR requires a path"));
                }
                Ok(Instruction::Workdir { path })
            }
            "USER" => {
                let user = self.substitute(rest.trim());
                if user.is_empty() {
                    return Err(ParseError::new(line_num, "USER requires a user name or UID"));
                }
                Ok(Instruction::User { user })
            }
            "ENTRYPOINT" => {
                let command = parse_command(line_num, "ENTRYPOINT", rest)?;
                Ok(Instruction::Entrypoint { command })
            }
            "CMD" => {
                let command = parse_command(line_num, "CMD", rest)?;
                Ok(Instruction::Cmd { command })
            }
            "ADD" | "VOLUME" | "HEALTHCHECK" | "STOPSIGNAL" | "SHELL" | "ONBUILD" => {
                Err(ParseError::new(line_num, format!("Unsupported instruction: {}", keyword))
                    .with_hint("Supported: FROM, WORKDIR, COPY, RUN, ENV, ARG, LABEL, EXPOSE, USER, ENTRYPOINT, CMD"))
            }
            _ => Err(ParseError::new(line_num, format!("Unknown instruction: {}", keyword))),
        }
    }

    fn parse_from(&mut self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        // FROM [--platform=<platform>] <image> [AS <name>]
        let args = tokenize(rest);
        let mut platform = None;
        let mut idx = 0;

        if let Some(value) = args.first().and_then(|a| a.strip_prefix("--platform=")) {
            platform = Some(self.substitute(value));
            idx = 1;
        }

        let image = args.get(idx).ok_or_else(|| {
            ParseError::new(line_num, "FROM requires an image reference")
                .with_hint("Usage: FROM <image>[:tag]")
        })?;

        if args.len() > idx + 1 {
            return Err(ParseError::new(line_num, "Named build stages are not supported")
                .with_hint("Remove the `AS <name>` suffix"));
        }

        let image = self.substitute(image);
        if image.eq_ignore_ascii_case("scratch") {
            return Err(ParseError::new(line_num, "FROM scratch is not supported")
                .with_hint("A base runtime environment is required"));
        }

        Ok(Instruction::From { image: ImageRef::parse(&image), platform })
    }

    fn parse_copy(&self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        // COPY [--chown=<user>:<group>] <src>... <dest>
        let mut args = tokenize(rest);
        let mut chown = None;

        while args.first().map(|a| a.starts_with("--")).unwrap_or(false) {
            let flag = args.remove(0);
            match flag.strip_prefix("--chown=") {
                Some(value) => chown = Some(self.substitute(value)),
                None => {
                    return Err(ParseError::new(line_num, format!("Unsupported COPY flag: {}", flag))
                        .with_hint("Only --chown is supported"));
                }
            }
        }

        let mut args: Vec<String> = if args.len() == 1 && args[0].starts_with('[') {
            serde_json::from_str(&args[0]).map_err(|_| {
                ParseError::new(line_num, "Invalid JSON array for COPY")
            })?
        } else {
            args.iter().map(|a| self.substitute(&unquote(a))).collect()
        };

        if args.len() < 2 {
            return Err(ParseError::new(line_num, "COPY requires at least a source and a destination")
                .with_hint("Usage: COPY <src>... <dest>"));
        }

        let destination = args.pop().unwrap_or_default();
        Ok(Instruction::Copy { sources: args, destination, chown })
    }

    fn parse_env(&mut self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        let args = tokenize(rest);
        if args.is_empty() {
            return Err(ParseError::new(line_num, "ENV requires at least one key=value pair"));
        }

        let mut vars = BTreeMap::new();
        if args[0].contains('=') {
            for arg in &args {
                let (key, value) = arg.split_once('=').ok_or_else(|| {
                    ParseError::new(line_num, format!("Expected key=value, found {}", arg))
                })?;
                vars.insert(key.to_string(), self.substitute(&unquote(value)));
            }
        } else {
            // Legacy `ENV key value with spaces` form sets a single variable
            let (key, value) = rest.trim().split_once(char::is_whitespace).ok_or_else(|| {
                ParseError::new(line_num, "ENV requires a value")
            })?;
            vars.insert(key.to_string(), self.substitute(&unquote(value.trim())));
        }

        // Later instructions see the new values
        for (key, value) in &vars {
            self.scope.insert(key.clone(), value.clone());
        }

        Ok(Instruction::Env { vars })
    }

    fn parse_arg(
        &mut self,
        line_num: usize,
        rest: &str,
    ) -> Result<(String, Option<String>), ParseError> {
        let arg = rest.trim();
        if arg.is_empty() {
            return Err(ParseError::new(line_num, "ARG requires a name")
                .with_hint("Usage: ARG <name>[=<default>]"));
        }

        let (name, default) = match arg.split_once('=') {
            Some((name, default)) => (name.to_string(), Some(unquote(default))),
            None => (arg.to_string(), None),
        };

        // Build arguments win over defaults
        let value = self.build_args.get(&name).cloned().or_else(|| default.clone());
        if let Some(value) = value {
            self.scope.insert(name.clone(), value);
        }

        Ok((name, default))
    }

    fn parse_label(&self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        let mut labels = BTreeMap::new();
        for arg in tokenize(rest) {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                ParseError::new(line_num, format!("Expected key=value, found {}", arg))
            })?;
            labels.insert(unquote(key), self.substitute(&unquote(value)));
        }

        if labels.is_empty() {
            return Err(ParseError::new(line_num, "LABEL requires at least one key=value pair"));
        }

        Ok(Instruction::Label { labels })
    }

    fn parse_expose(&self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        let mut ports = Vec::new();

        for arg in tokenize(rest) {
            let arg = self.substitute(&arg);
            let (port_str, protocol) = match arg.split_once('/') {
                Some((port, proto)) => (port.to_string(), proto.to_lowercase()),
                None => (arg.clone(), "tcp".to_string()),
            };

            let port = port_str
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ParseError::new(line_num, format!("Invalid port number: {}", port_str)))?;

            let protocol = match protocol.as_str() {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                other => {
                    return Err(ParseError::new(line_num, format!("Unknown protocol: {}", other))
                        .with_hint("Protocol must be 'tcp' or 'udp'"));
                }
            };

            ports.push(PortSpec { port, protocol });
        }

        if ports.is_empty() {
            return Err(ParseError::new(line_num, "EXPOSE requires at least one port"));
        }

        Ok(Instruction::Expose { ports })
    }

    /// Expands `$VAR`, `${VAR}` and `${VAR:-default}` from ARG and ENV values.
    /// Unknown variables expand to the empty string; `\$` is a literal `$`.
    fn substitute(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'$') => {
                    out.push('$');
                    chars.next();
                }
                '$' => match chars.peek() {
                    Some('{') => {
                        chars.next();
                        let mut expr = String::new();
                        for c in chars.by_ref() {
                            if c == '}' {
                                break;
                            }
                            expr.push(c);
                        }
                        let (name, fallback) = match expr.split_once(":-") {
                            Some((name, fallback)) => (name, Some(fallback)),
                            None => (expr.as_str(), None),
                        };
                        match (self.scope.get(name), fallback) {
                            (Some(value), _) if !value.is_empty() => out.push_str(value),
                            (_, Some(fallback)) => out.push_str(fallback),
                            (Some(value), None) => out.push_str(value),
                            (None, None) => {}
                        }
                    }
                    Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                        let mut name = String::new();
                        while let Some(&c) = chars.peek() {
                            if c.is_ascii_alphanumeric() || c == '_' {
                                name.push(c);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        if let Some(value) = self.scope.get(&name) {
                            out.push_str(value);
                        }
                    }
                    _ => out.push('$'),
                },
                _ => out.push(c),
            }
        }

        out
    }
}

/// Splits a logical line into its upper-cased keyword and the raw remainder.
fn split_keyword(line: &str) -> (String, &str) {
    let line = line.trim_start();
    match line.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword.to_uppercase(), rest.trim_start()),
        None => (line.to_uppercase(), ""),
    }
}

/// Parses the argument of RUN/CMD/ENTRYPOINT into shell or exec form.
fn parse_command(line_num: usize, keyword: &str, rest: &str) -> Result<RunCommand, ParseError> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(ParseError::new(line_num, format!("{} requires a command", keyword))
            .with_hint(format!("Usage: {} <command> or {} [\"executable\", \"arg\"]", keyword, keyword)));
    }

    if rest.starts_with('[') {
        if let Ok(args) = serde_json::from_str::<Vec<String>>(rest) {
            if args.is_empty() {
                return Err(ParseError::new(line_num, format!("{} exec form is empty", keyword)));
            }
            return Ok(RunCommand::Exec(args));
        }
    }

    Ok(RunCommand::Shell(rest.to_string()))
}

/// Whitespace tokenizer that keeps quoted strings and JSON arrays whole.
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;

    for c in s.chars() {
        match c {
            '"' | '\'' if depth == 0 => {
                match quote {
                    Some(q) if q == c => quote = None,
                    None => quote = Some(c),
                    _ => {}
                }
                current.push(c);
            }
            '[' if quote.is_none() => {
                depth += 1;
                current.push(c);
            }
            ']' if quote.is_none() && depth > 0 => {
                depth -= 1;
                current.push(c);
            }
            c if c.is_whitespace() && quote.is_none() && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Removes quotes from a token (`KEY="a b"` values, quoted paths).
fn unquote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut quote: Option<char> = None;
    for c in s.chars() {
        match (quote, c) {
            (None, '"') | (None, '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            _ => out.push(c),
        }
    }
    out
}
