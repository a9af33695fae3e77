use tracing::debug;
use crate::core::error::{Error, Result};
use crate::query::context::QName;
use crate::query::engine::{Item, Sequence};
use crate::query::session::SessionId;
use crate::xml::parser::{parse_document, Element};
use crate::xml::{EXIST_NS, SERIALIZED_NS};

/// A variable declared by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDecl {
    pub name: QName,
    pub value: Sequence,
}

/// Variables and namespaces from an `exist:variables` document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Declarations {
    pub namespaces: Vec<(String, String)>,
    pub variables: Vec<VariableDecl>,
}

impl Declarations {
    /// Parses the `variables` request parameter.
    pub fn parse(xml: &str) -> Result<Self> {
        let root = parse_document(xml)?;
        let mut declarations = Declarations {
            namespaces: root.declared_namespaces(),
            variables: Vec::new(),
        };
        declarations.read_variables(&root)?;
        Ok(declarations)
    }

    fn read_variables(&mut self, variables: &Element) -> Result<()> {
        for variable in variables.child_elements().filter(|e| e.is(EXIST_NS, "variable")) {
            let Some(qname) = variable.first_child(EXIST_NS, "qname") else {
                continue;
            };
            let part = |name: &str| {
                qname
                    .child_elements()
                    .find(|e| e.local_name() == name)
                    .map(|e| e.text().trim().to_string())
            };
            let (Some(local_name), prefix, namespace) = (part("localname"), part("prefix"), part("namespace")) else {
                continue;
            };
            if let (Some(prefix), Some(uri)) = (&prefix, &namespace) {
                self.namespaces.push((prefix.clone(), uri.clone()));
            }

            let value = match variable.first_child(SERIALIZED_NS, "sequence") {
                Some(sequence) => demarshall(sequence)?,
                None => Sequence::empty(),
            };
            self.variables.push(VariableDecl {
                name: QName { prefix, local_name, namespace },
                value,
            });
        }
        Ok(())
    }
}

/// Reads a serialized `sx:sequence` of `sx:value` items.
fn demarshall(sequence: &Element) -> Result<Sequence> {
    let mut items = Vec::new();
    for value in sequence.child_elements() {
        if !value.is(SERIALIZED_NS, "value") {
            return Err(Error::bad_request(format!(
                "Unexpected element in serialized sequence: {}",
                value.name
            )));
        }
        let nodes: Vec<&Element> = value.child_elements().collect();
        if nodes.is_empty() {
            let type_name = value.attribute("type").unwrap_or("xs:string");
            items.push(Item::atomic(type_name, value.text()));
        } else {
            items.extend(nodes.into_iter().map(|node| Item::node(node.to_xml())));
        }
    }
    Ok(Sequence::from(items))
}

/// An `exist:query` request document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryEnvelope {
    pub query: Option<String>,
    pub start: Option<i64>,
    pub howmany: Option<i64>,
    pub wrap: Option<bool>,
    pub method: Option<String>,
    pub typed: Option<bool>,
    pub mime: Option<String>,
    pub cache: Option<bool>,
    pub session: Option<SessionId>,
    pub declarations: Declarations,
    pub properties: Vec<(String, String)>,
}

impl QueryEnvelope {
    /// Unparsable numeric attributes are ignored.
    pub fn parse(root: &Element) -> Result<Self> {
        let attr = |name: &str| root.attribute(name).filter(|v| !v.is_empty());
        let mut envelope = QueryEnvelope {
            start: attr("start").and_then(|v| v.trim().parse().ok()),
            howmany: attr("max").and_then(|v| v.trim().parse().ok()),
            wrap: attr("enclose").or_else(|| attr("wrap")).map(|v| v != "no"),
            method: attr("method").map(str::to_string),
            typed: attr("typed").map(|v| v == "yes"),
            mime: attr("mime").map(str::to_string),
            cache: attr("cache").map(|v| v == "yes"),
            session: attr("session")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(SessionId::from_raw),
            ..QueryEnvelope::default()
        };
        envelope.declarations.namespaces = root.declared_namespaces();

        for child in root.child_elements() {
            if child.namespace.as_deref() != Some(EXIST_NS) {
                continue;
            }
            match child.local_name() {
                "text" => envelope.query = Some(child.text()),
                "variables" => envelope.declarations.read_variables(child)?,
                "properties" => {
                    for property in child.child_elements().filter(|e| e.is(EXIST_NS, "property")) {
                        if let (Some(name), Some(value)) = (property.attribute("name"), property.attribute("value")) {
                            debug!(property = name, value, "output property");
                            envelope.properties.push((name.to_string(), value.to_string()));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(envelope)
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}
