//! In-memory filter graph, rendered to the engine's textual syntax in one place.
//!
//! Values pass through two escaping levels: the option level (inside a filter's
//! argument list) and the graph level (inside the whole `-filter_complex` string).

use std::fmt;

/// A labelled stream endpoint such as `[0:v]` or `[vtrim]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pad(String);

impl Pad {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Stream `kind` (`v` or `a`) of input file `index`.
    pub fn input(index: usize, kind: char) -> Self {
        Self(format!("{index}:{kind}"))
    }

    pub fn label(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterArg {
    key: Option<String>,
    value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    name: &'static str,
    args: Vec<FilterArg>,
}

impl Filter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }

    /// Positional argument.
    pub fn arg(mut self, value: impl ToString) -> Self {
        self.args.push(FilterArg {
            key: None,
            value: value.to_string(),
        });
        self
    }

    /// Named argument, rendered as `key=value`.
    pub fn opt(mut self, key: &str, value: impl ToString) -> Self {
        self.args.push(FilterArg {
            key: Some(key.to_string()),
            value: value.to_string(),
        });
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|arg| arg.key.as_deref() == Some(key))
            .map(|arg| arg.value.as_str())
    }

    fn render(&self) -> String {
        if self.args.is_empty() {
            return self.name.to_string();
        }
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                let value = escape_graph(&escape_value(&arg.value));
                match &arg.key {
                    Some(key) => format!("{key}={value}"),
                    None => value,
                }
            })
            .collect();
        format!("{}={}", self.name, args.join(":"))
    }
}

/// Linear run of filters from `inputs` to `outputs`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterChain {
    pub inputs: Vec<Pad>,
    pub filters: Vec<Filter>,
    pub outputs: Vec<Pad>,
}

impl FilterChain {
    fn render(&self) -> String {
        let mut out = String::new();
        for pad in &self.inputs {
            out.push_str(&pad.to_string());
        }
        let filters: Vec<String> = self.filters.iter().map(Filter::render).collect();
        out.push_str(&filters.join(","));
        for pad in &self.outputs {
            out.push_str(&pad.to_string());
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterGraph {
    chains: Vec<FilterChain>,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chain(&mut self, inputs: Vec<Pad>, filters: Vec<Filter>, outputs: Vec<Pad>) {
        self.chains.push(FilterChain {
            inputs,
            filters,
            outputs,
        });
    }

    pub fn chains(&self) -> &[FilterChain] {
        &self.chains
    }

    pub fn filters(&self) -> impl Iterator<Item = &Filter> {
        self.chains.iter().flat_map(|chain| chain.filters.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn render(&self) -> String {
        self.chains
            .iter()
            .map(FilterChain::render)
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Option-level escaping: `\`, `'` and `:` are special inside a filter argument.
pub fn escape_value(value: &str) -> String {
    escape_chars(value, &['\\', '\'', ':'])
}

/// Graph-level escaping: `\`, `'`, `[`, `]`, `,` and `;` delimit the graph itself.
pub fn escape_graph(value: &str) -> String {
    escape_chars(value, &['\\', '\'', '[', ']', ',', ';'])
}

fn escape_chars(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
