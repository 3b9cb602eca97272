use serde_json::Value;
use std::fmt;

/// One step into a record value: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Typed address of a (possibly nested) field value inside a record.
///
/// Rendered with dots, e.g. `items.0.title`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    pub fn root() -> Self {
        FieldPath(Vec::new())
    }

    pub fn field(name: &str) -> Self {
        FieldPath(vec![PathSegment::Key(name.to_string())])
    }

    /// Parse a dotted path. Purely numeric segments become indices.
    pub fn parse_dotted(path: &str) -> Self {
        FieldPath(
            path.split('.')
                .filter(|s| !s.is_empty())
                .map(segment_from_str)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn key(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.0.push(PathSegment::Key(name.to_string()));
        next
    }

    pub fn index(&self, index: usize) -> Self {
        let mut next = self.clone();
        next.0.push(PathSegment::Index(index));
        next
    }

    pub fn parent(&self) -> Self {
        let mut parent = self.clone();
        parent.0.pop();
        parent
    }

    /// Resolve a rule path relative to this field, the way a relative URL
    /// resolves against a document path: `a` and `./a` address a sibling,
    /// `../a` walks out of the enclosing container, `/a` starts at the
    /// record root. Segments may be percent-encoded.
    pub fn resolve_relative(&self, relative: &str) -> Self {
        let mut resolved = if relative.starts_with('/') {
            Vec::new()
        } else {
            self.parent().0
        };

        for raw in relative.split('/') {
            match raw {
                "" | "." => {}
                ".." => {
                    resolved.pop();
                }
                segment => {
                    let decoded = urlencoding::decode(segment)
                        .map(|s| s.into_owned())
                        .unwrap_or_else(|_| segment.to_string());
                    resolved.push(segment_from_str(&decoded));
                }
            }
        }

        FieldPath(resolved)
    }

    /// Look up the value at this path inside `root`.
    pub fn lookup<'v>(&self, root: &'v Value) -> Option<&'v Value> {
        let mut current = root;
        for segment in &self.0 {
            current = match (segment, current) {
                (PathSegment::Key(k), Value::Object(map)) => map.get(k)?,
                (PathSegment::Index(i), Value::Array(items)) => items.get(*i)?,
                (PathSegment::Index(i), Value::Object(map)) => map.get(&i.to_string())?,
                _ => return None,
            };
        }
        Some(current)
    }
}

fn segment_from_str(s: &str) -> PathSegment {
    match s.parse::<usize>() {
        Ok(i) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => PathSegment::Index(i),
        _ => PathSegment::Key(s.to_string()),
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match segment {
                PathSegment::Key(k) => f.write_str(k)?,
                PathSegment::Index(idx) => write!(f, "{idx}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_and_display() {
        let path = FieldPath::parse_dotted("items.0.title");
        assert_eq!(path.segments()[1], PathSegment::Index(0));
        assert_eq!(path.to_string(), "items.0.title");
    }

    #[test]
    fn test_resolve_sibling() {
        let path = FieldPath::parse_dotted("items.0.title");
        assert_eq!(path.resolve_relative("subtitle").to_string(), "items.0.subtitle");
        assert_eq!(path.resolve_relative("./subtitle").to_string(), "items.0.subtitle");
    }

    #[test]
    fn test_resolve_parent_and_root() {
        let path = FieldPath::parse_dotted("items.0.title");
        assert_eq!(path.resolve_relative("../../enabled").to_string(), "enabled");
        assert_eq!(path.resolve_relative("/enabled").to_string(), "enabled");
        assert_eq!(path.resolve_relative("../1/title").to_string(), "items.1.title");
    }

    #[test]
    fn test_resolve_percent_encoded() {
        let path = FieldPath::field("b");
        assert_eq!(path.resolve_relative("odd%2Fname").segments()[0], PathSegment::Key("odd/name".into()));
    }

    #[test]
    fn test_lookup() {
        let value = json!({ "items": [{ "title": "a" }, { "title": "b" }] });
        let path = FieldPath::parse_dotted("items.1.title");
        assert_eq!(path.lookup(&value), Some(&json!("b")));
        assert_eq!(FieldPath::parse_dotted("items.5.title").lookup(&value), None);
    }
}
