//! URI templates (RFC 6570, levels 1-4) with reverse matching
//!
//! Routes and URL builders share one template type, so expansion and
//! matching must be inverses for the same template. Expansion keeps
//! pre-existing percent-triplets byte-for-byte, which makes it idempotent
//! over its own output.

use crate::error::Error;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::fmt::Write;

/// A variable assignment used for expansion, or produced by matching.
#[derive(Clone, Debug, PartialEq)]
pub enum VarValue {
    /// A single string value
    String(String),
    /// An ordered list of values
    List(Vec<String>),
    /// An ordered association of keys to values
    Assoc(Vec<(String, String)>),
}

impl VarValue {
    /// Returns the value as a single string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            VarValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for VarValue {
    fn from(value: &str) -> Self {
        VarValue::String(value.to_string())
    }
}

impl From<String> for VarValue {
    fn from(value: String) -> Self {
        VarValue::String(value)
    }
}

/// Variable assignments keyed by name.
pub type VarMap = HashMap<String, VarValue>;

/// How matched values handle percent-encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EncodingPolicy {
    /// Keep raw `%XX` bytes. Guarantees `expand(match(u)) == u` for
    /// canonical inputs.
    #[default]
    Opaque,
    /// Decode valid triplets exactly once.
    Cooked,
}

/// Options for [Template::matches].
#[derive(Clone, Copy, Debug, Default)]
pub struct MatchOptions {
    /// Encoding policy applied to captured values
    pub policy: EncodingPolicy,
    /// Fail the match on a bare `%` or an invalid triplet. Non-strict
    /// accepts them verbatim.
    pub strict: bool,
}

/// One captured value with both its raw and decoded renditions.
#[derive(Clone, Debug, PartialEq)]
pub struct LosslessValue {
    /// Bytes exactly as they appeared in the URL
    pub raw: VarValue,
    /// The same value with valid triplets decoded once
    pub decoded: VarValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operator {
    Simple,
    Reserved,
    Fragment,
    Label,
    Path,
    PathParam,
    Query,
    QueryContinuation,
}

impl Operator {
    fn from_char(c: char) -> Option<Operator> {
        match c {
            '+' => Some(Operator::Reserved),
            '#' => Some(Operator::Fragment),
            '.' => Some(Operator::Label),
            '/' => Some(Operator::Path),
            ';' => Some(Operator::PathParam),
            '?' => Some(Operator::Query),
            '&' => Some(Operator::QueryContinuation),
            _ => None,
        }
    }

    fn first(self) -> &'static str {
        match self {
            Operator::Simple | Operator::Reserved => "",
            Operator::Fragment => "#",
            Operator::Label => ".",
            Operator::Path => "/",
            Operator::PathParam => ";",
            Operator::Query => "?",
            Operator::QueryContinuation => "&",
        }
    }

    fn separator(self) -> char {
        match self {
            Operator::Simple | Operator::Reserved | Operator::Fragment => ',',
            Operator::Label => '.',
            Operator::Path => '/',
            Operator::PathParam => ';',
            Operator::Query | Operator::QueryContinuation => '&',
        }
    }

    fn named(self) -> bool {
        matches!(
            self,
            Operator::PathParam | Operator::Query | Operator::QueryContinuation
        )
    }

    /// Empty named values render as `name=` under query operators and as a
    /// bare `name` under `;`.
    fn empty_equals(self) -> bool {
        matches!(self, Operator::Query | Operator::QueryContinuation)
    }

    fn allow_reserved(self) -> bool {
        matches!(self, Operator::Reserved | Operator::Fragment)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Modifier {
    None,
    Prefix(usize),
    Explode,
}

#[derive(Clone, Debug)]
struct VarSpec {
    name: String,
    modifier: Modifier,
}

#[derive(Clone, Debug)]
struct Expression {
    operator: Operator,
    variables: Vec<VarSpec>,
}

#[derive(Clone, Debug)]
enum Part {
    Literal(String),
    Expression(Expression),
}

/// A parsed RFC 6570 template.
#[derive(Clone, Debug)]
pub struct Template {
    parts: Vec<Part>,
    source: String,
}

impl Template {
    /// Parses a template string.
    pub fn parse(source: &str) -> Result<Template, Error> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '}' {
                return Err(Error::Template(format!("unbalanced '}}' in {source}")));
            }
            if c != '{' {
                literal.push(c);
                continue;
            }
            if !literal.is_empty() {
                parts.push(Part::Literal(std::mem::take(&mut literal)));
            }
            let mut expr = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some('{') => {
                        return Err(Error::Template(format!("nested '{{' in {source}")));
                    }
                    Some(c) => expr.push(c),
                    None => {
                        return Err(Error::Template(format!("unterminated expression in {source}")));
                    }
                }
            }
            parts.push(Part::Expression(parse_expression(&expr)?));
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Template {
            parts,
            source: source.to_string(),
        })
    }

    /// The template source string.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of all variables appearing in the template, in order.
    pub fn var_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for part in &self.parts {
            if let Part::Expression(expr) = part {
                for var in &expr.variables {
                    names.push(var.name.as_str());
                }
            }
        }
        names
    }

    /// Expands the template with the given variables.
    ///
    /// Undefined variables are skipped per RFC 6570. Values are treated as
    /// not-yet-encoded except that valid `%XX` triplets already present are
    /// copied through unchanged, so expanding a previously matched (opaque)
    /// value reproduces the original bytes.
    pub fn expand(&self, vars: &VarMap) -> Result<String, Error> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(lit) => out.push_str(lit),
                Part::Expression(expr) => expand_expression(&mut out, expr, vars)?,
            }
        }
        Ok(out)
    }

    /// Matches a URL (or URL path) against the template.
    ///
    /// Returns the captured variables, or `None` if the input does not have
    /// the template's shape. Capture is greedy but stops at the next
    /// literal or at the operator's item separator.
    pub fn matches(&self, input: &str, options: &MatchOptions) -> Option<VarMap> {
        let raw = self.match_raw(input)?;
        let mut vars = VarMap::new();
        for (name, value) in raw {
            let value = match options.policy {
                EncodingPolicy::Opaque => value,
                EncodingPolicy::Cooked => decode_value(value, options.strict)?,
            };
            vars.insert(name, value);
        }
        Some(vars)
    }

    /// Matches like [Template::matches] but returns each captured value in
    /// both raw and decoded form.
    pub fn matches_lossless(
        &self,
        input: &str,
        strict: bool,
    ) -> Option<HashMap<String, LosslessValue>> {
        let raw = self.match_raw(input)?;
        let mut vars = HashMap::new();
        for (name, value) in raw {
            let decoded = decode_value(value.clone(), strict)?;
            vars.insert(name, LosslessValue { raw: value, decoded });
        }
        Some(vars)
    }

    /// Raw (opaque) matching: all captured values keep their input bytes.
    fn match_raw(&self, input: &str) -> Option<VarMap> {
        let mut vars = VarMap::new();
        let mut pos = 0;

        for (index, part) in self.parts.iter().enumerate() {
            match part {
                Part::Literal(lit) => {
                    if !input[pos..].starts_with(lit.as_str()) {
                        return None;
                    }
                    pos += lit.len();
                }
                Part::Expression(expr) => {
                    let segment_end = self.segment_end(input, pos, index);
                    let segment = &input[pos..segment_end];
                    match_expression(expr, segment, &mut vars)?;
                    pos = segment_end;
                }
            }
        }

        if pos == input.len() {
            Some(vars)
        } else {
            None
        }
    }

    /// Where the capture for the expression at `index` must stop: the next
    /// literal if one follows, else the first-character of the next
    /// expression, else the end of input.
    fn segment_end(&self, input: &str, pos: usize, index: usize) -> usize {
        match self.parts.get(index + 1) {
            Some(Part::Literal(lit)) => input[pos..]
                .find(lit.as_str())
                .map(|offset| pos + offset)
                .unwrap_or(input.len()),
            Some(Part::Expression(next)) => {
                let first = next.operator.first();
                if first.is_empty() {
                    input.len()
                } else {
                    input[pos..]
                        .find(first)
                        .map(|offset| pos + offset)
                        .unwrap_or(input.len())
                }
            }
            None => input.len(),
        }
    }
}

fn parse_expression(body: &str) -> Result<Expression, Error> {
    if body.is_empty() {
        return Err(Error::Template("empty expression".to_string()));
    }
    let mut chars = body.chars().peekable();
    let operator = match chars.peek().copied().and_then(Operator::from_char) {
        Some(op) => {
            chars.next();
            op
        }
        None => Operator::Simple,
    };
    let rest: String = chars.collect();

    let mut variables = Vec::new();
    for spec in rest.split(',') {
        if spec.is_empty() {
            return Err(Error::Template(format!("empty varspec in {{{body}}}")));
        }
        let (name, modifier) = if let Some(name) = spec.strip_suffix('*') {
            (name, Modifier::Explode)
        } else if let Some((name, len)) = spec.split_once(':') {
            let len = len
                .parse::<usize>()
                .map_err(|_| Error::Template(format!("bad prefix length in {spec}")))?;
            if len == 0 || len > 9999 {
                return Err(Error::Template(format!("prefix length out of range in {spec}")));
            }
            (name, Modifier::Prefix(len))
        } else {
            (spec, Modifier::None)
        };
        if name.is_empty() || !name.chars().all(is_varchar) {
            return Err(Error::Template(format!("invalid variable name {name:?}")));
        }
        variables.push(VarSpec {
            name: name.to_string(),
            modifier,
        });
    }

    Ok(Expression {
        operator,
        variables,
    })
}

fn is_varchar(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '%'
}

fn expand_expression(out: &mut String, expr: &Expression, vars: &VarMap) -> Result<(), Error> {
    let op = expr.operator;
    let mut first_item = true;

    for var in &expr.variables {
        let Some(value) = vars.get(&var.name) else {
            continue;
        };
        if matches!(value, VarValue::List(l) if l.is_empty())
            || matches!(value, VarValue::Assoc(a) if a.is_empty())
        {
            continue;
        }
        if first_item {
            out.push_str(op.first());
            first_item = false;
        } else {
            out.push(op.separator());
        }
        expand_variable(out, op, var, value)?;
    }
    Ok(())
}

fn expand_variable(
    out: &mut String,
    op: Operator,
    var: &VarSpec,
    value: &VarValue,
) -> Result<(), Error> {
    let allow = op.allow_reserved();
    match (value, &var.modifier) {
        (VarValue::String(s), modifier) => {
            let s = match modifier {
                Modifier::Prefix(len) => truncate_chars(s, *len),
                _ => s.as_str(),
            };
            if op.named() {
                out.push_str(&var.name);
                if s.is_empty() && !op.empty_equals() {
                    return Ok(());
                }
                out.push('=');
            }
            out.push_str(&encode_value(s, allow));
        }
        (VarValue::List(items), Modifier::Explode) => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(op.separator());
                }
                if op.named() {
                    out.push_str(&var.name);
                    out.push('=');
                }
                out.push_str(&encode_value(item, allow));
            }
        }
        (VarValue::List(items), _) => {
            if op.named() {
                out.push_str(&var.name);
                out.push('=');
            }
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&encode_value(item, allow));
            }
        }
        (VarValue::Assoc(pairs), Modifier::Explode) => {
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(op.separator());
                }
                out.push_str(&encode_value(k, allow));
                out.push('=');
                out.push_str(&encode_value(v, allow));
            }
        }
        (VarValue::Assoc(pairs), _) => {
            if op.named() {
                out.push_str(&var.name);
                out.push('=');
            }
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&encode_value(k, allow));
                out.push(',');
                out.push_str(&encode_value(v, allow));
            }
        }
    }
    Ok(())
}

fn truncate_chars(s: &str, len: usize) -> &str {
    match s.char_indices().nth(len) {
        Some((index, _)) => &s[..index],
        None => s,
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn is_reserved(b: u8) -> bool {
    matches!(
        b,
        b':' | b'/'
            | b'?'
            | b'#'
            | b'['
            | b']'
            | b'@'
            | b'!'
            | b'$'
            | b'&'
            | b'\''
            | b'('
            | b')'
            | b'*'
            | b'+'
            | b','
            | b';'
            | b'='
    )
}

fn is_hex(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

/// Percent-encodes a value. Unicode scalars become UTF-8 byte triplets;
/// valid pre-existing `%XX` triplets are copied through byte-for-byte so
/// encoding is idempotent.
fn encode_value(value: &str, allow_reserved: bool) -> String {
    let bytes = value.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' && i + 2 < bytes.len() && is_hex(bytes[i + 1]) && is_hex(bytes[i + 2]) {
            out.push_str(&value[i..i + 3]);
            i += 3;
            continue;
        }
        if is_unreserved(b) || (allow_reserved && (is_reserved(b) || b == b'%')) {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
        i += 1;
    }
    out
}

/// Decodes valid triplets exactly once. In strict mode a bare `%` or an
/// invalid triplet fails the match; otherwise the bytes pass verbatim.
fn decode_str(raw: &str, strict: bool) -> Option<String> {
    if strict {
        let bytes = raw.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' {
                if i + 2 >= bytes.len() || !is_hex(bytes[i + 1]) || !is_hex(bytes[i + 2]) {
                    return None;
                }
                i += 3;
            } else {
                i += 1;
            }
        }
        return Some(percent_decode_str(raw).decode_utf8_lossy().into_owned());
    }

    // Non-strict: decode valid triplets, keep malformed sequences as-is.
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() && is_hex(bytes[i + 1]) && is_hex(bytes[i + 2]) {
            let hex = &raw[i + 1..i + 3];
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                decoded.push(b);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    Some(String::from_utf8_lossy(&decoded).into_owned())
}

fn decode_value(value: VarValue, strict: bool) -> Option<VarValue> {
    Some(match value {
        VarValue::String(s) => VarValue::String(decode_str(&s, strict)?),
        VarValue::List(items) => VarValue::List(
            items
                .into_iter()
                .map(|i| decode_str(&i, strict))
                .collect::<Option<_>>()?,
        ),
        VarValue::Assoc(pairs) => VarValue::Assoc(
            pairs
                .into_iter()
                .map(|(k, v)| Some((decode_str(&k, strict)?, decode_str(&v, strict)?)))
                .collect::<Option<_>>()?,
        ),
    })
}

/// Expansion percent-encodes reserved characters unless the operator
/// allows them, so a reverse capture containing a raw `/`, `?` or `#`
/// cannot be one of this expression's expansions.
fn capture_ok(op: Operator, piece: &str) -> bool {
    op.allow_reserved() || !piece.contains(['/', '?', '#'])
}

fn match_expression(expr: &Expression, segment: &str, vars: &mut VarMap) -> Option<()> {
    let op = expr.operator;
    let body = match segment.strip_prefix(op.first()) {
        Some(rest) => rest,
        None if segment.is_empty() && expr.variables.is_empty() => segment,
        // An expression whose variables were all undefined expands to
        // nothing, so an empty segment still matches.
        None if segment.is_empty() => return Some(()),
        None => return None,
    };

    if op.named() {
        match_named(expr, body, vars)
    } else {
        match_unnamed(expr, body, vars)
    }
}

fn match_unnamed(expr: &Expression, body: &str, vars: &mut VarMap) -> Option<()> {
    let sep = expr.operator.separator();
    let pieces: Vec<&str> = if body.is_empty() {
        Vec::new()
    } else {
        body.split(sep).collect()
    };

    let mut index = 0;
    for (vi, var) in expr.variables.iter().enumerate() {
        let last = vi + 1 == expr.variables.len();
        if var.modifier == Modifier::Explode {
            // Explode must come last to be reversible; it takes every
            // remaining piece.
            if !last {
                return None;
            }
            if !pieces[index..].iter().all(|p| capture_ok(expr.operator, p)) {
                return None;
            }
            let items: Vec<String> = pieces[index..].iter().map(|p| (*p).to_string()).collect();
            vars.insert(var.name.clone(), VarValue::List(items));
            index = pieces.len();
        } else {
            let piece = pieces.get(index)?;
            if !capture_ok(expr.operator, piece) {
                return None;
            }
            vars.insert(var.name.clone(), VarValue::String((*piece).to_string()));
            index += 1;
        }
    }

    if index == pieces.len() {
        Some(())
    } else {
        None
    }
}

fn match_named(expr: &Expression, body: &str, vars: &mut VarMap) -> Option<()> {
    let sep = expr.operator.separator();
    let elements: Vec<&str> = if body.is_empty() {
        Vec::new()
    } else {
        body.split(sep).collect()
    };

    for var in &expr.variables {
        if var.modifier == Modifier::Explode {
            let matching: Vec<&str> = elements
                .iter()
                .copied()
                .filter(|e| {
                    e.strip_prefix(var.name.as_str())
                        .map(|rest| rest.is_empty() || rest.starts_with('='))
                        .unwrap_or(false)
                })
                .collect();
            // All elements carrying `name=` make a list; a mixed bag is an
            // exploded map.
            if !matching.is_empty() && matching.len() == elements.len() {
                let items = matching
                    .iter()
                    .map(|e| e.split_once('=').map(|(_, v)| v).unwrap_or("").to_string())
                    .collect();
                vars.insert(var.name.clone(), VarValue::List(items));
            } else {
                let pairs = elements
                    .iter()
                    .map(|e| match e.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => ((*e).to_string(), String::new()),
                    })
                    .collect();
                vars.insert(var.name.clone(), VarValue::Assoc(pairs));
            }
            return Some(());
        }

        let element = elements.iter().copied().find(|e| {
            e.strip_prefix(var.name.as_str())
                .map(|rest| rest.is_empty() || rest.starts_with('='))
                .unwrap_or(false)
        });
        if let Some(element) = element {
            let value = element.split_once('=').map(|(_, v)| v).unwrap_or("");
            if !capture_ok(expr.operator, value) {
                return None;
            }
            vars.insert(var.name.clone(), VarValue::String(value.to_string()));
        }
    }
    Some(())
}
