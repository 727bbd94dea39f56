//! Path queries over [`Element`] trees.
//!
//! Supported syntax is a small XPath subset: `/` child steps, `//` descendant
//! steps, `*` for any name, and attribute predicates `[@a]`, `[@a='v']` and
//! `[@a!='v']`. Queries evaluate to index paths so callers can mutate or
//! remove the matched elements afterwards.

use super::{Element, Node};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    Has(String),
    Equals(String, String),
    NotEquals(String, String),
}

impl Predicate {
    fn matches(&self, element: &Element) -> bool {
        match self {
            Predicate::Has(name) => element.has_attr(name),
            Predicate::Equals(name, value) => element.attr(name) == Some(value.as_str()),
            // An absent attribute is "not equal" too.
            Predicate::NotEquals(name, value) => element.attr(name) != Some(value.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    descendant: bool,
    /// `None` matches any element name.
    name: Option<String>,
    predicates: Vec<Predicate>,
}

impl Step {
    fn matches(&self, element: &Element) -> bool {
        self.name.as_deref().map_or(true, |n| n == element.name)
            && self.predicates.iter().all(|p| p.matches(element))
    }
}

/// A compiled path query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    steps: Vec<Step>,
}

impl Query {
    pub fn parse(path: &str) -> Result<Self> {
        let invalid = |why: &str| Error::invalid_argument(format!("invalid query '{}': {}", path, why));
        let bytes = path.as_bytes();
        let mut pos = 0;
        let mut steps = Vec::new();

        while pos < bytes.len() {
            let mut descendant = false;
            if bytes[pos..].starts_with(b"//") {
                descendant = true;
                pos += 2;
            } else if bytes[pos] == b'/' {
                pos += 1;
            } else if !steps.is_empty() {
                return Err(invalid("expected '/'"));
            }

            let name_start = pos;
            while pos < bytes.len() && bytes[pos] != b'/' && bytes[pos] != b'[' {
                pos += 1;
            }
            let name = path[name_start..pos].trim();
            if name.is_empty() {
                return Err(invalid("empty step"));
            }

            let mut predicates = Vec::new();
            while pos < bytes.len() && bytes[pos] == b'[' {
                let close = find_predicate_end(bytes, pos + 1).ok_or_else(|| invalid("unclosed '['"))?;
                predicates.push(parse_predicate(&path[pos + 1..close]).ok_or_else(|| invalid("bad predicate"))?);
                pos = close + 1;
            }

            steps.push(Step {
                descendant,
                name: (name != "*").then(|| name.to_string()),
                predicates,
            });
        }

        if steps.is_empty() {
            return Err(invalid("empty path"));
        }
        Ok(Self { steps })
    }

    /// Evaluate against a document whose root element is `root`. The first
    /// step is tested against the root itself.
    pub(crate) fn select_from_document(&self, root: &Element) -> Vec<Vec<usize>> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        if let Some((first, rest)) = self.steps.split_first() {
            if first.matches(root) {
                collect(root, &mut path, rest, &mut out);
            }
            if first.descendant {
                collect(root, &mut path, &self.steps, &mut out);
            }
        }
        normalize(out)
    }

    /// Evaluate relative to `context`; the first step is tested against its
    /// children.
    pub(crate) fn select_from(&self, context: &Element) -> Vec<Vec<usize>> {
        let mut out = Vec::new();
        collect(context, &mut Vec::new(), &self.steps, &mut out);
        normalize(out)
    }
}

fn collect(context: &Element, path: &mut Vec<usize>, steps: &[Step], out: &mut Vec<Vec<usize>>) {
    let Some((step, rest)) = steps.split_first() else {
        out.push(path.clone());
        return;
    };
    for (i, node) in context.children.iter().enumerate() {
        let Node::Element(child) = node else {
            continue;
        };
        path.push(i);
        if step.matches(child) {
            collect(child, path, rest, out);
        }
        if step.descendant {
            collect(child, path, steps, out);
        }
        path.pop();
    }
}

/// Lexicographic order of index paths is document order.
fn normalize(mut paths: Vec<Vec<usize>>) -> Vec<Vec<usize>> {
    paths.sort();
    paths.dedup();
    paths
}

fn find_predicate_end(bytes: &[u8], mut pos: usize) -> Option<usize> {
    let mut quote = None;
    while pos < bytes.len() {
        match (quote, bytes[pos]) {
            (None, b'\'' | b'"') => quote = Some(bytes[pos]),
            (Some(q), c) if c == q => quote = None,
            (None, b']') => return Some(pos),
            _ => {}
        }
        pos += 1;
    }
    None
}

fn parse_predicate(body: &str) -> Option<Predicate> {
    let body = body.trim().strip_prefix('@')?;
    let (name, value, negated) = match body.find("!=") {
        Some(i) => (&body[..i], Some(&body[i + 2..]), true),
        None => match body.find('=') {
            Some(i) => (&body[..i], Some(&body[i + 1..]), false),
            None => (body, None, false),
        },
    };
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let Some(value) = value else {
        return Some(Predicate::Has(name.to_string()));
    };
    let value = value.trim();
    let unquoted = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))?;
    Some(if negated {
        Predicate::NotEquals(name.to_string(), unquoted.to_string())
    } else {
        Predicate::Equals(name.to_string(), unquoted.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::super::Document;
    use super::*;

    const MACHINE: &str = r#"<VirtualBox>
  <Machine name="vm">
    <Hardware>
      <Network>
        <Adapter slot="0" enabled="true"/>
        <Adapter slot="1" enabled="true"/>
        <Adapter slot="2"/>
      </Network>
    </Hardware>
    <StorageControllers>
      <StorageController name="SATA">
        <AttachedDevice type="HardDisk"/>
        <AttachedDevice type="DVD"/>
      </StorageController>
    </StorageControllers>
  </Machine>
</VirtualBox>"#;

    fn doc() -> Document {
        Document::parse(MACHINE.as_bytes()).unwrap()
    }

    #[test]
    fn test_absolute_path() {
        let q = Query::parse("/VirtualBox/Machine/Hardware").unwrap();
        assert_eq!(doc().find_all(&q).len(), 1);
        let q = Query::parse("/Machine").unwrap();
        assert!(doc().find(&q).is_none());
    }

    #[test]
    fn test_descendant_with_predicates() {
        let d = doc();
        assert_eq!(d.find_all(&Query::parse("//Adapter[@slot!='0']").unwrap()).len(), 2);
        assert_eq!(d.find_all(&Query::parse("//Adapter[@enabled]").unwrap()).len(), 2);
        assert_eq!(
            d.find_all(&Query::parse("//AttachedDevice[@type=\"HardDisk\"]").unwrap()).len(),
            1
        );
    }

    #[test]
    fn test_wildcard_and_relative() {
        let d = doc();
        let machine = d.find(&Query::parse("/VirtualBox/Machine").unwrap()).unwrap();
        let q = Query::parse("*/*").unwrap();
        let names: Vec<_> = machine.find_all(&q).iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Network", "StorageController"]);
    }

    #[test]
    fn test_document_order_without_duplicates() {
        let d = doc();
        let q = Query::parse("//*//Adapter").unwrap();
        let slots: Vec<_> = d.find_all(&q).iter().filter_map(|e| e.attr("slot")).collect();
        assert_eq!(slots, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Query::parse("").is_err());
        assert!(Query::parse("/a[@b='c'").is_err());
        assert!(Query::parse("/a//").is_err());
        assert!(Query::parse("/a[b]").is_err());
    }
}
