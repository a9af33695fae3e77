use nom::{IResult, Parser};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_until, take_while, take_while1};
use nom::character::complete::{char, multispace0, multispace1};
use nom::combinator::{map, opt, verify};
use nom::multi::many0;
use nom::sequence::delimited;
use crate::core::error::{Error, Result};
use crate::xml::escape::{escape_attr, escape_text, unescape};

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An element of a parsed document with namespaces resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub namespace: Option<String>,
    pub attributes: Vec<Attribute>,
    /// `xmlns` declarations made on this element; the default namespace has prefix "".
    pub namespaces: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.namespace.as_deref() == Some(namespace) && self.local_name() == local_name
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn first_child(&self, namespace: &str, local_name: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.is(namespace, local_name))
    }

    /// Concatenated text and CDATA content of the direct children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Every prefixed namespace declared anywhere in this subtree, outermost first.
    pub fn declared_namespaces(&self) -> Vec<(String, String)> {
        let mut found = Vec::new();
        self.collect_namespaces(&mut found);
        found
    }

    fn collect_namespaces(&self, found: &mut Vec<(String, String)>) {
        for (prefix, uri) in &self.namespaces {
            if !prefix.is_empty() && !found.iter().any(|(p, _)| p == prefix) {
                found.push((prefix.clone(), uri.clone()));
            }
        }
        for child in self.child_elements() {
            child.collect_namespaces(found);
        }
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (prefix, uri) in &self.namespaces {
            if prefix.is_empty() {
                out.push_str(&format!(" xmlns=\"{}\"", escape_attr(uri)));
            } else {
                out.push_str(&format!(" xmlns:{}=\"{}\"", prefix, escape_attr(uri)));
            }
        }
        for attr in &self.attributes {
            out.push_str(&format!(" {}=\"{}\"", attr.name, escape_attr(&attr.value)));
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_xml(out),
                Node::Text(t) => out.push_str(&escape_text(t)),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Parses a complete document and returns its root element.
pub fn parse_document(input: &str) -> Result<Element> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let (rest, raw) = document(input).map_err(|e| {
        let position = match &e {
            nom::Err::Error(err) | nom::Err::Failure(err) => input.len() - err.input.len(),
            nom::Err::Incomplete(_) => input.len(),
        };
        Error::bad_request(format!("Malformed XML at offset {}", position))
    })?;
    if !rest.is_empty() {
        return Err(Error::bad_request(format!(
            "Malformed XML at offset {}: content after root element",
            input.len() - rest.len()
        )));
    }

    let mut scopes = vec![("xml".to_string(), "http://www.w3.org/XML/1998/namespace".to_string())];
    build(raw, &mut scopes)
}

/// Returns `Ok(())` when `input` is a well-formed document.
pub fn check_well_formed(input: &str) -> Result<()> {
    parse_document(input).map(|_| ())
}

struct RawElement<'a> {
    name: &'a str,
    attributes: Vec<(&'a str, &'a str)>,
    children: Vec<RawNode<'a>>,
}

enum RawNode<'a> {
    Element(RawElement<'a>),
    Text(&'a str),
    CData(&'a str),
    Skip,
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == ':'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

fn name(input: &str) -> IResult<&str, &str> {
    verify(take_while1(is_name_char), |s: &str| {
        s.chars().next().is_some_and(is_name_start)
    })
    .parse(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
    ))
    .parse(input)
}

fn attribute(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, _) = multispace1(input)?;
    let (input, key) = name(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char('=')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, value) = quoted(input)?;
    Ok((input, (key, value)))
}

fn comment(input: &str) -> IResult<&str, &str> {
    delimited(tag("<!--"), take_until("-->"), tag("-->")).parse(input)
}

fn cdata(input: &str) -> IResult<&str, &str> {
    delimited(tag("<![CDATA["), take_until("]]>"), tag("]]>")).parse(input)
}

fn processing_instruction(input: &str) -> IResult<&str, &str> {
    delimited(tag("<?"), take_until("?>"), tag("?>")).parse(input)
}

fn doctype(input: &str) -> IResult<&str, &str> {
    delimited(tag("<!DOCTYPE"), take_until(">"), char('>')).parse(input)
}

fn misc(input: &str) -> IResult<&str, ()> {
    alt((
        map(multispace1, |_| ()),
        map(comment, |_| ()),
        map(processing_instruction, |_| ()),
        map(doctype, |_| ()),
    ))
    .parse(input)
}

fn node(input: &str) -> IResult<&str, RawNode<'_>> {
    alt((
        map(comment, |_| RawNode::Skip),
        map(cdata, RawNode::CData),
        map(processing_instruction, |_| RawNode::Skip),
        map(element, RawNode::Element),
        map(take_while1(|c: char| c != '<'), RawNode::Text),
    ))
    .parse(input)
}

fn element(input: &str) -> IResult<&str, RawElement<'_>> {
    let (input, _) = char('<')(input)?;
    let (input, tag_name) = name(input)?;
    let (input, attributes) = many0(attribute).parse(input)?;
    let (input, _) = multispace0(input)?;
    let (input, empty) = opt(tag("/>")).parse(input)?;
    if empty.is_some() {
        return Ok((input, RawElement { name: tag_name, attributes, children: Vec::new() }));
    }

    let (input, _) = char('>')(input)?;
    let (input, children) = many0(node).parse(input)?;
    let (input, _) = tag("</")(input)?;
    let (input, _) = verify(name, |end: &str| end == tag_name).parse(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char('>')(input)?;
    Ok((input, RawElement { name: tag_name, attributes, children }))
}

fn document(input: &str) -> IResult<&str, RawElement<'_>> {
    let (input, _) = many0(misc).parse(input)?;
    let (input, root) = element(input)?;
    let (input, _) = many0(misc).parse(input)?;
    Ok((input, root))
}

fn build(raw: RawElement<'_>, scopes: &mut Vec<(String, String)>) -> Result<Element> {
    let mark = scopes.len();
    let mut namespaces = Vec::new();
    let mut attributes = Vec::new();
    for (key, value) in raw.attributes {
        let value = unescape(value)?;
        if key == "xmlns" {
            namespaces.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            namespaces.push((prefix.to_string(), value));
        } else {
            attributes.push(Attribute { name: key.to_string(), value });
        }
    }
    scopes.extend(namespaces.iter().cloned());

    let prefix = raw.name.split_once(':').map(|(p, _)| p);
    let namespace = lookup(scopes, prefix.unwrap_or(""));
    if let (Some(p), None) = (prefix, &namespace) {
        scopes.truncate(mark);
        return Err(Error::bad_request(format!("Unbound namespace prefix '{}'", p)));
    }

    let mut children = Vec::new();
    for child in raw.children {
        match child {
            RawNode::Element(e) => children.push(Node::Element(build(e, scopes)?)),
            RawNode::Text(t) => push_text(&mut children, unescape(t)?),
            RawNode::CData(t) => push_text(&mut children, t.to_string()),
            RawNode::Skip => {}
        }
    }
    scopes.truncate(mark);

    Ok(Element {
        name: raw.name.to_string(),
        namespace,
        attributes,
        namespaces,
        children,
    })
}

fn push_text(children: &mut Vec<Node>, text: String) {
    if let Some(Node::Text(previous)) = children.last_mut() {
        previous.push_str(&text);
    } else {
        children.push(Node::Text(text));
    }
}

fn lookup(scopes: &[(String, String)], prefix: &str) -> Option<String> {
    scopes
        .iter()
        .rev()
        .find(|(p, _)| p == prefix)
        .map(|(_, uri)| uri.clone())
        .filter(|uri| !uri.is_empty())
}
