//! XML binding for the tree-node contract.
//!
//! Reading tokenizes through the pest grammar in `xml.pest` and assembles an
//! owned [`Element`] tree. Writing is event based ([`XmlWriter`]) and iterative, so
//! arbitrarily deep trees can be emitted without recursing on the stack.

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::error::{DecladError, Result};
use crate::tree::Element;

#[derive(Parser)]
#[grammar = "xml.pest"]
pub struct XmlParser;

/// An element whose close tag has not been seen yet.
struct Open {
    element: Element,
    text: String,
    literal: bool,
    col: usize,
}

impl Open {
    fn close(mut self) -> Element {
        if self.literal || !self.text.trim().is_empty() {
            self.element.text = Some(self.text);
        }
        self.element
    }
}

fn parse_error(message: String, (line, col): (usize, usize)) -> DecladError {
    DecladError::Parse { message, line: Some(line), col: Some(col) }
}

/// Parses a complete document and returns its root element.
///
/// Nesting is tracked on an explicit stack, so arbitrarily deep documents
/// parse without recursion.
pub fn parse_document(text: &str) -> Result<Element> {
    let document = XmlParser::parse(Rule::document, text)?
        .next()
        .ok_or_else(|| DecladError::Invariant("document rule produced no pair".into()))?;
    let mut open: Vec<Open> = Vec::new();
    let mut root: Option<Element> = None;
    for token in document.into_inner() {
        let position = token.line_col();
        match token.as_rule() {
            Rule::open_tag | Rule::empty_tag => {
                let self_closing = token.as_rule() == Rule::empty_tag;
                let element = start_element(token)?;
                if open.is_empty() && root.is_some() {
                    return Err(parse_error(format!("<{}> follows the root element", element.name), position));
                }
                if self_closing {
                    attach(&mut open, &mut root, element);
                } else {
                    open.push(Open { element, text: String::new(), literal: false, col: position.1 });
                }
            }
            Rule::close_tag => {
                let name = token.into_inner().next().map(|p| p.as_str()).unwrap_or_default();
                let Some(current) = open.pop() else {
                    return Err(parse_error(format!("closing tag </{name}> without an open element"), position));
                };
                if current.element.name != name {
                    return Err(parse_error(
                        format!("closing tag </{name}> does not match <{}>", current.element.name),
                        (current.element.line.unwrap_or(position.0), current.col),
                    ));
                }
                attach(&mut open, &mut root, current.close());
            }
            Rule::text => match open.last_mut() {
                Some(current) => {
                    let decoded = unescape(token.as_str()).map_err(|message| parse_error(message, position))?;
                    current.text.push_str(&decoded);
                }
                None if token.as_str().trim().is_empty() => {}
                None => return Err(parse_error("text outside the root element".into(), position)),
            },
            Rule::cdata => {
                let Some(current) = open.last_mut() else {
                    return Err(parse_error("CDATA outside the root element".into(), position));
                };
                current.literal = true;
                if let Some(body) = token.into_inner().next() {
                    current.text.push_str(body.as_str());
                }
            }
            _ => {}
        }
    }
    if let Some(unclosed) = open.last() {
        return Err(parse_error(
            format!("<{}> is never closed", unclosed.element.name),
            (unclosed.element.line.unwrap_or(1), unclosed.col),
        ));
    }
    root.ok_or_else(|| DecladError::Parse { message: "document has no root element".into(), line: None, col: None })
}

fn attach(open: &mut [Open], root: &mut Option<Element>, element: Element) {
    match open.last_mut() {
        Some(parent) => parent.element.children.push(element),
        None => *root = Some(element),
    }
}

/// Name and attributes of an open or self-closing tag.
fn start_element(pair: Pair<'_, Rule>) -> Result<Element> {
    let (line, _) = pair.line_col();
    let mut inner = pair.into_inner();
    let name = inner
        .next()
        .map(|p| p.as_str().to_string())
        .ok_or_else(|| DecladError::Invariant("element without a name".into()))?;
    let mut element = Element::new(name);
    element.line = Some(line);
    for part in inner {
        let position = part.line_col();
        let mut kv = part.into_inner();
        let key = kv.next().map(|p| p.as_str().to_string()).unwrap_or_default();
        let raw = kv.next().map(|p| p.as_str()).unwrap_or_default();
        if element.attributes.iter().any(|(k, _)| *k == key) {
            return Err(parse_error(format!("duplicate attribute `{key}` on <{}>", element.name), position));
        }
        let value = unescape(raw).map_err(|message| parse_error(message, position))?;
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn unescape(raw: &str) -> std::result::Result<String, String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find(';').ok_or_else(|| format!("unterminated entity in `{raw}`"))?;
        let entity = &after[..end];
        let decoded = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32).ok_or_else(|| format!("unknown entity `&{entity};`"))?
            }
        };
        out.push(decoded);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn escape_into(out: &mut String, raw: &str, attribute: bool) {
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\n' if attribute => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' if attribute => out.push_str("&#9;"),
            _ => out.push(c),
        }
    }
}

// ------------- Writer -------------

/// Streaming writer. Callers drive it with `open`/`close`/`leaf` events.
pub struct XmlWriter {
    out: String,
    pretty: bool,
    depth: usize,
}

impl XmlWriter {
    pub fn new(pretty: bool) -> Self {
        Self { out: String::new(), pretty, depth: 0 }
    }

    fn indent(&mut self) {
        if self.pretty {
            for _ in 0..self.depth {
                self.out.push_str("  ");
            }
        }
    }

    fn newline(&mut self) {
        if self.pretty {
            self.out.push('\n');
        }
    }

    fn tag_start(&mut self, name: &str, attributes: &[(String, String)]) {
        self.indent();
        self.out.push('<');
        self.out.push_str(name);
        for (key, value) in attributes {
            self.out.push(' ');
            self.out.push_str(key);
            self.out.push_str("=\"");
            escape_into(&mut self.out, value, true);
            self.out.push('"');
        }
    }

    fn text_content(&mut self, text: &str) {
        if !text.is_empty() && text.trim().is_empty() && !text.contains("]]>") {
            // whitespace-only text would otherwise vanish on the way back in
            self.out.push_str("<![CDATA[");
            self.out.push_str(text);
            self.out.push_str("]]>");
        } else {
            escape_into(&mut self.out, text, false);
        }
    }

    /// Starts an element that will receive children.
    pub fn open(&mut self, name: &str, attributes: &[(String, String)], text: Option<&str>) {
        self.tag_start(name, attributes);
        self.out.push('>');
        if let Some(text) = text {
            self.text_content(text);
        }
        self.newline();
        self.depth += 1;
    }

    pub fn close(&mut self, name: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.indent();
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push('>');
        self.newline();
    }

    /// Writes a childless element, self-closing when it has no text.
    pub fn leaf(&mut self, name: &str, attributes: &[(String, String)], text: Option<&str>) {
        self.tag_start(name, attributes);
        match text {
            Some(text) => {
                self.out.push('>');
                self.text_content(text);
                self.out.push_str("</");
                self.out.push_str(name);
                self.out.push('>');
            }
            None => self.out.push_str(" />"),
        }
        self.newline();
    }

    pub fn finish(self) -> String {
        self.out
    }
}

enum Step<'a> {
    Enter(&'a Element),
    Exit(&'a str),
}

/// Serializes an owned tree without recursion.
pub fn write_element(root: &Element, pretty: bool) -> String {
    let mut writer = XmlWriter::new(pretty);
    let mut stack = vec![Step::Enter(root)];
    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(element) if element.children.is_empty() => {
                writer.leaf(&element.name, &element.attributes, element.text.as_deref());
            }
            Step::Enter(element) => {
                writer.open(&element.name, &element.attributes, element.text.as_deref());
                stack.push(Step::Exit(&element.name));
                for child in element.children.iter().rev() {
                    stack.push(Step::Enter(child));
                }
            }
            Step::Exit(name) => writer.close(name),
        }
    }
    writer.finish()
}
