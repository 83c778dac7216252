use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::{IslError, IslResult};

/// One element of a parsed script: tag name, attributes in document
/// order, accumulated child text, and child elements.
///
/// Attribute order matters (`foreach` binds its attributes in the order
/// they were written), so attributes are a list rather than a map.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptNode {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<ScriptNode>,
}

impl ScriptNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    /// A synthetic `<group>` wrapping the given children.
    pub fn group(children: Vec<ScriptNode>) -> Self {
        Self {
            tag: "group".to_string(),
            attrs: Vec::new(),
            text: None,
            children,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.attrs.push((name, value));
        }
    }

    pub fn find_child(&self, tag: &str) -> Option<&ScriptNode> {
        self.children.iter().find(|c| c.tag == tag)
    }

    pub fn find_children<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a ScriptNode> {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    /// Trimmed child text, or `None` when absent or all-whitespace.
    pub fn child_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// One-line rendering of the node without children, for error
    /// messages identifying the offending tag.
    pub fn describe(&self) -> String {
        let mut out = format!("<{}", self.tag);
        for (k, v) in &self.attrs {
            out.push_str(&format!(" {k}=\"{v}\""));
        }
        out.push_str("/>");
        out
    }
}

/// Parse an XML script into its root node.
pub fn parse_script(xml: &str) -> IslResult<ScriptNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // Nodes under construction; the root lands alone in `stack[0]`'s
    // children once the document closes.
    let mut stack: Vec<ScriptNode> = vec![ScriptNode::new("#document")];

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                stack.push(element_to_node(&e)?);
            }
            Ok(Event::Empty(e)) => {
                let node = element_to_node(&e)?;
                stack
                    .last_mut()
                    .expect("document node is always present")
                    .children
                    .push(node);
            }
            Ok(Event::End(_)) => {
                let node = stack.pop().expect("start/end events are balanced");
                if stack.is_empty() {
                    return Err(IslError::parse("unbalanced closing tag"));
                }
                stack
                    .last_mut()
                    .expect("document node is always present")
                    .children
                    .push(node);
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| IslError::parse(e.to_string()))?
                    .into_owned();
                append_text(stack.last_mut().expect("stack is non-empty"), &text);
            }
            Ok(Event::CData(t)) => {
                let text = String::from_utf8_lossy(&t).into_owned();
                append_text(stack.last_mut().expect("stack is non-empty"), &text);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(IslError::parse(e.to_string())),
        }
    }

    if stack.len() != 1 {
        return Err(IslError::parse("unclosed element at end of script"));
    }
    let mut document = stack.pop().expect("document node remains");
    match document.children.len() {
        1 => Ok(document.children.remove(0)),
        0 => Err(IslError::parse("script has no root element")),
        _ => Err(IslError::parse("script has more than one root element")),
    }
}

fn element_to_node(e: &quick_xml::events::BytesStart<'_>) -> IslResult<ScriptNode> {
    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut node = ScriptNode::new(tag);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| IslError::parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| IslError::parse(e.to_string()))?
            .into_owned();
        node.attrs.push((key, value));
    }
    Ok(node)
}

fn append_text(node: &mut ScriptNode, text: &str) {
    if text.is_empty() {
        return;
    }
    match &mut node.text {
        Some(existing) => existing.push_str(text),
        None => node.text = Some(text.to_string()),
    }
}

/// Expand the line-oriented shorthand `"tag a=1 b=2; tag2 c=3"` into
/// nodes: clauses split on `;`, the first whitespace token of each
/// clause is the tag name, remaining `key=value` tokens its attributes.
pub fn parse_shorthand(s: &str) -> IslResult<Vec<ScriptNode>> {
    let mut nodes = Vec::new();
    for clause in s.split(';') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        let mut tokens = clause.split_whitespace();
        let tag = tokens.next().expect("clause is non-empty");
        let mut node = ScriptNode::new(tag);
        for token in tokens {
            let (key, value) = token.split_once('=').ok_or_else(|| {
                IslError::parse(format!("expected key=value in shorthand, got '{token}'"))
            })?;
            node.attrs
                .push((key.to_string(), value.trim_matches('"').to_string()));
        }
        nodes.push(node);
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_and_attributes() {
        let root = parse_script(
            r#"<isl debug="true"><group loop="3"><image file="out_${loopindex}.png"/></group></isl>"#,
        )
        .unwrap();
        assert_eq!(root.tag, "isl");
        assert_eq!(root.attr("debug"), Some("true"));
        assert_eq!(root.children.len(), 1);
        let group = &root.children[0];
        assert_eq!(group.attr("loop"), Some("3"));
        assert_eq!(group.children[0].attr("file"), Some("out_${loopindex}.png"));
    }

    #[test]
    fn preserves_attribute_order() {
        let root = parse_script(r#"<foreach x="1,2" y="a,b" z="q,r"/>"#).unwrap();
        let names: Vec<_> = root.attrs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, ["x", "y", "z"]);
    }

    #[test]
    fn collects_child_text() {
        let root = parse_script("<if>1 == 1</if>").unwrap();
        assert_eq!(root.child_text(), Some("1 == 1"));
    }

    #[test]
    fn cdata_is_text() {
        let root = parse_script("<property name=\"t\"><![CDATA[a < b]]></property>").unwrap();
        assert_eq!(root.child_text(), Some("a < b"));
    }

    #[test]
    fn rejects_malformed_xml() {
        assert!(matches!(
            parse_script("<isl><group></isl>"),
            Err(IslError::Parse(_))
        ));
        assert!(matches!(parse_script(""), Err(IslError::Parse(_))));
    }

    #[test]
    fn shorthand_expands_to_nodes() {
        let nodes = parse_shorthand("resize width=200; matte space=10 background=red").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].tag, "resize");
        assert_eq!(nodes[0].attr("width"), Some("200"));
        assert_eq!(nodes[1].tag, "matte");
        assert_eq!(nodes[1].attr("background"), Some("red"));
    }

    #[test]
    fn shorthand_rejects_bare_tokens() {
        assert!(parse_shorthand("resize width").is_err());
    }

    #[test]
    fn describe_renders_tag_and_attrs() {
        let mut node = ScriptNode::new("clip");
        node.set_attr("left", "10");
        assert_eq!(node.describe(), "<clip left=\"10\"/>");
    }
}
