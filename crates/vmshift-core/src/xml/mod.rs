//! A small mutable XML tree on top of quick-xml.
//!
//! The VirtualBox and libvirt codecs both need to read a document, edit it in
//! place and write it back. [`Document`] keeps elements, text, CDATA and
//! comments in document order, including comments before and after the root
//! element; whitespace-only text between elements is dropped on parse and
//! regenerated by the indenting writer.

mod query;

pub use query::Query;

use crate::error::{Error, Result};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// One node of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    /// Attributes in document order.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder form of [`Element::set_attr`].
    pub fn with_attr(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.iter().any(|(k, _)| k == name)
    }

    /// Set an attribute, keeping its position if it already exists.
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let pos = self.attributes.iter().position(|(k, _)| k == name)?;
        Some(self.attributes.remove(pos).1)
    }

    /// Child elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements_mut().find(|e| e.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements().filter(move |e| e.name == name)
    }

    /// Append a child element and return it.
    pub fn append(&mut self, element: Element) -> &mut Element {
        self.children.push(Node::Element(element));
        match self.children.last_mut() {
            Some(Node::Element(e)) => e,
            _ => unreachable!("just pushed an element"),
        }
    }

    /// The first child named `name`, created at the end if missing.
    pub fn child_or_insert(&mut self, name: &str) -> &mut Element {
        let pos = self
            .children
            .iter()
            .position(|n| matches!(n, Node::Element(e) if e.name == name));
        match pos {
            Some(i) => match &mut self.children[i] {
                Node::Element(e) => e,
                _ => unreachable!("position matched an element"),
            },
            None => self.append(Element::new(name)),
        }
    }

    /// Remove child elements matching the predicate. Returns how many went.
    pub fn remove_children_where(&mut self, mut predicate: impl FnMut(&Element) -> bool) -> usize {
        let before = self.children.len();
        self.children
            .retain(|node| !matches!(node, Node::Element(e) if predicate(e)));
        before - self.children.len()
    }

    /// Concatenated text and CDATA content of this element.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) | Node::CData(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replace the text content, leaving child elements alone.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children
            .retain(|node| !matches!(node, Node::Text(_) | Node::CData(_)));
        self.children.insert(0, Node::Text(text.into()));
    }

    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(Element::text)
    }

    /// Elements matching a query evaluated relative to this element.
    pub fn find_all(&self, query: &Query) -> Vec<&Element> {
        query
            .select_from(self)
            .iter()
            .filter_map(|path| self.element_at(path))
            .collect()
    }

    pub fn find(&self, query: &Query) -> Option<&Element> {
        query
            .select_from(self)
            .first()
            .and_then(|path| self.element_at(path))
    }

    /// Descend along child indices. An empty path is `self`.
    pub fn element_at(&self, path: &[usize]) -> Option<&Element> {
        let mut current = self;
        for &i in path {
            current = match current.children.get(i)? {
                Node::Element(e) => e,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn element_at_mut(&mut self, path: &[usize]) -> Option<&mut Element> {
        let mut current = self;
        for &i in path {
            current = match current.children.get_mut(i)? {
                Node::Element(e) => e,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// XML declaration fields as they appeared in the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub version: String,
    pub encoding: Option<String>,
    pub standalone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub declaration: Option<Declaration>,
    /// Comments between the declaration and the root element.
    pub leading_comments: Vec<String>,
    pub root: Element,
    /// Comments after the root element.
    pub trailing_comments: Vec<String>,
}

impl Document {
    pub fn new(root: Element) -> Self {
        Self {
            declaration: None,
            leading_comments: Vec::new(),
            root,
            trailing_comments: Vec::new(),
        }
    }

    /// Parse a UTF-8 document.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::from_reader(data);
        let mut buf = Vec::new();
        let mut declaration = None;
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;
        let mut leading_comments = Vec::new();
        let mut trailing_comments = Vec::new();

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| Error::xml(format!("at byte {}: {}", reader.buffer_position(), e)))?;
            match event {
                Event::Decl(ref d) => {
                    declaration = Some(read_declaration(d)?);
                }
                Event::Start(ref e) => {
                    stack.push(element_from_start(e)?);
                }
                Event::Empty(ref e) => {
                    let element = element_from_start(e)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::xml("closing tag without an open element"))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(ref t) => {
                    let text = t.unescape().map_err(|e| Error::xml(e.to_string()))?;
                    if let Some(parent) = stack.last_mut() {
                        if !text.trim().is_empty() {
                            parent.children.push(Node::Text(text.into_owned()));
                        }
                    }
                }
                Event::CData(ref c) => {
                    if let Some(parent) = stack.last_mut() {
                        parent
                            .children
                            .push(Node::CData(String::from_utf8_lossy(c).into_owned()));
                    }
                }
                Event::Comment(ref c) => {
                    let comment = String::from_utf8_lossy(c).into_owned();
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Comment(comment)),
                        None if root.is_none() => leading_comments.push(comment),
                        None => trailing_comments.push(comment),
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if let Some(open) = stack.last() {
            return Err(Error::xml(format!("unclosed element <{}>", open.name)));
        }
        let root = root.ok_or_else(|| Error::xml("document has no root element"))?;
        Ok(Self {
            declaration,
            leading_comments,
            root,
            trailing_comments,
        })
    }

    /// Serialize with two-space indentation.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        if let Some(decl) = &self.declaration {
            // Output is always UTF-8, whatever the input declared.
            let encoding = decl.encoding.as_ref().map(|_| "UTF-8");
            writer
                .write_event(Event::Decl(BytesDecl::new(
                    &decl.version,
                    encoding,
                    decl.standalone.as_deref(),
                )))
                .map_err(|e| Error::xml(e.to_string()))?;
        }
        for comment in &self.leading_comments {
            write_comment(&mut writer, comment)?;
        }
        write_element(&mut writer, &self.root)?;
        for comment in &self.trailing_comments {
            write_comment(&mut writer, comment)?;
        }
        let mut out = writer.into_inner();
        out.push(b'\n');
        Ok(out)
    }

    /// Index paths (from the root) of every element matching `query`, in
    /// document order.
    pub fn select(&self, query: &Query) -> Vec<Vec<usize>> {
        query.select_from_document(&self.root)
    }

    pub fn find_all(&self, query: &Query) -> Vec<&Element> {
        self.select(query)
            .iter()
            .filter_map(|path| self.root.element_at(path))
            .collect()
    }

    pub fn find(&self, query: &Query) -> Option<&Element> {
        self.select(query)
            .first()
            .and_then(|path| self.root.element_at(path))
    }

    pub fn find_mut(&mut self, query: &Query) -> Option<&mut Element> {
        let path = self.select(query).into_iter().next()?;
        self.root.element_at_mut(&path)
    }

    /// Apply `f` to every matching element. Returns the match count.
    pub fn for_each_mut(&mut self, query: &Query, mut f: impl FnMut(&mut Element)) -> usize {
        let paths = self.select(query);
        for path in &paths {
            if let Some(element) = self.root.element_at_mut(path) {
                f(element);
            }
        }
        paths.len()
    }

    /// Remove every matching element. The root itself is never removed.
    pub fn remove_all(&mut self, query: &Query) -> usize {
        let mut paths = self.select(query);
        paths.retain(|p| !p.is_empty());
        // Later siblings and deeper nodes first so earlier indices stay valid.
        paths.sort_by(|a, b| b.cmp(a));
        let mut removed = 0;
        for path in paths {
            let Some((last, parent_path)) = path.split_last() else {
                continue;
            };
            if let Some(parent) = self.root.element_at_mut(parent_path) {
                if *last < parent.children.len() {
                    parent.children.remove(*last);
                    removed += 1;
                }
            }
        }
        removed
    }
}

fn read_declaration(decl: &BytesDecl) -> Result<Declaration> {
    let version = decl.version().map_err(|e| Error::xml(e.to_string()))?;
    let encoding = decl
        .encoding()
        .transpose()
        .map_err(|e| Error::xml(e.to_string()))?;
    let standalone = decl
        .standalone()
        .transpose()
        .map_err(|e| Error::xml(e.to_string()))?;
    Ok(Declaration {
        version: String::from_utf8_lossy(&version).into_owned(),
        encoding: encoding.map(|e| String::from_utf8_lossy(&e).into_owned()),
        standalone: standalone.map(|s| String::from_utf8_lossy(&s).into_owned()),
    })
}

fn element_from_start(start: &BytesStart) -> Result<Element> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::xml(e.to_string()))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(Error::xml(format!(
                "second root element <{}>",
                element.name
            )))
        }
    }
    Ok(())
}

fn write_comment(writer: &mut Writer<Vec<u8>>, comment: &str) -> Result<()> {
    writer
        .write_event(Event::Comment(BytesText::from_escaped(comment)))
        .map_err(|e| Error::xml(e.to_string()))
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(|e| Error::xml(e.to_string()));
    }

    writer
        .write_event(Event::Start(start))
        .map_err(|e| Error::xml(e.to_string()))?;
    for child in &element.children {
        let result = match child {
            Node::Element(e) => {
                write_element(writer, e)?;
                continue;
            }
            Node::Text(t) => writer.write_event(Event::Text(BytesText::new(t))),
            Node::CData(t) => writer.write_event(Event::CData(BytesCData::new(t.as_str()))),
            Node::Comment(t) => {
                write_comment(writer, t)?;
                continue;
            }
        };
        result.map_err(|e| Error::xml(e.to_string()))?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(|e| Error::xml(e.to_string()))
}
