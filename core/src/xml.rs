//! XML bodies decoded into the same generic tree JSON bodies produce.
//!
//! Elements become maps keyed by local name, repeated siblings become
//! arrays, text-only elements become strings and empty elements become
//! null. Attributes are folded into the element's map (namespace
//! declarations are dropped); text that sits beside attributes or children
//! is kept under `__content__`.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

pub const CONTENT_KEY: &str = "__content__";

struct Frame {
    name: String,
    children: Map<String, Value>,
    text: String,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Result<Self, String> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut children = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|err| err.to_string())?;
            if attr.key.as_ref().starts_with(b"xmlns") {
                continue;
            }
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|err| err.to_string())?;
            children.insert(key, Value::String(value.into_owned()));
        }
        Ok(Self {
            name,
            children,
            text: String::new(),
        })
    }

    fn close(self) -> (String, Value) {
        let value = match (self.children.is_empty(), self.text.is_empty()) {
            (true, true) => Value::Null,
            (true, false) => Value::String(self.text),
            (false, true) => Value::Object(self.children),
            (false, false) => {
                let mut children = self.children;
                children.insert(CONTENT_KEY.to_string(), Value::String(self.text));
                Value::Object(children)
            }
        };
        (self.name, value)
    }
}

fn attach(parent: &mut Map<String, Value>, name: String, value: Value) {
    match parent.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.insert(name, value);
        }
    }
}

/// Parse an XML document into `{root_name: tree}`.
pub fn parse(input: &str) -> Result<Value, String> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(true);

    let mut document = Map::new();
    let mut stack: Vec<Frame> = Vec::new();
    loop {
        match reader.read_event().map_err(|err| err.to_string())? {
            Event::Start(start) => stack.push(Frame::open(&start)?),
            Event::Empty(start) => {
                let (name, value) = Frame::open(&start)?.close();
                match stack.last_mut() {
                    Some(parent) => attach(&mut parent.children, name, value),
                    None => attach(&mut document, name, value),
                }
            }
            Event::Text(text) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&text.unescape().map_err(|err| err.to_string())?);
                }
            }
            Event::CData(data) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                let frame = stack.pop().ok_or_else(|| "unbalanced closing tag".to_string())?;
                let (name, value) = frame.close();
                match stack.last_mut() {
                    Some(parent) => attach(&mut parent.children, name, value),
                    None => attach(&mut document, name, value),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err("unexpected end of document".to_string());
    }
    if document.is_empty() {
        return Err("document has no root element".to_string());
    }
    Ok(Value::Object(document))
}

/// Unwrap `root` when it is the document's root element.
pub fn strip_root(document: Value, root: &str) -> Value {
    match document {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(root) => {
            map.remove(root).unwrap_or(Value::Null)
        }
        other => other,
    }
}
