//! Resource paths.
//!
//! A resource path names a node in the resource tree. Paths are normalized on
//! parse: a leading slash is stripped, empty segments are dropped and the root
//! is the empty path.

use std::fmt;

/// Why a string is not a valid resource path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty path component at position {position}")]
    EmptyComponent { position: usize },
    #[error("path component {component:?} contains reserved character {character:?}")]
    ReservedCharacter { component: String, character: char },
}

/// A normalized, slash-separated resource path.
///
/// ```rust
/// use kvtree_core_store::Path;
///
/// let path = Path::parse("/orders/eu-west/2024").unwrap();
/// assert_eq!(path.len(), 3);
/// assert_eq!(path.name(), Some("2024"));
/// assert_eq!(path.to_absolute(), "/orders/eu-west/2024");
///
/// assert_eq!(Path::parse("a/b/").unwrap(), Path::parse("a//b").unwrap());
/// ```
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Path {
    components: Vec<String>,
}

/// Components may hold anything but `/`, `?` and control characters. The
/// query part of an address belongs to [`RequestContext`](crate::RequestContext).
fn check_component(component: &str, position: usize) -> Result<(), PathError> {
    if component.is_empty() {
        return Err(PathError::EmptyComponent { position });
    }
    match component
        .chars()
        .find(|c| matches!(c, '/' | '?') || c.is_control())
    {
        Some(character) => Err(PathError::ReservedCharacter {
            component: component.to_string(),
            character,
        }),
        None => Ok(()),
    }
}

impl Path {
    pub fn root() -> Self {
        Path::default()
    }

    pub fn parse(s: &str) -> Result<Self, PathError> {
        let components = s
            .split('/')
            .filter(|segment| !segment.is_empty())
            .enumerate()
            .map(|(position, segment)| {
                check_component(segment, position).map(|()| segment.to_string())
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Path { components })
    }

    /// True for the root.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Depth below the root.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(String::as_str)
    }

    /// The last component, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        let (_, ancestors) = self.components.split_last()?;
        Some(Path {
            components: ancestors.to_vec(),
        })
    }

    /// This path extended by one component.
    pub fn child(&self, name: &str) -> Result<Path, PathError> {
        check_component(name, self.components.len())?;
        let mut components = self.components.clone();
        components.push(name.to_string());
        Ok(Path { components })
    }

    /// True if `ancestor` is this path or one of its ancestors.
    pub fn is_within(&self, ancestor: &Path) -> bool {
        self.components.starts_with(&ancestor.components)
    }

    /// Render with a leading slash, the form used in wire addresses.
    pub fn to_absolute(&self) -> String {
        format!("/{}", self)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.components.join("/"))
    }
}

impl std::str::FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

/// A [`Path`] from a literal known to be valid.
///
/// ```rust
/// use kvtree_core_store::path;
///
/// let p = path!("orders/eu");
/// assert_eq!(p.len(), 2);
/// ```
#[macro_export]
macro_rules! path {
    ($s:expr) => {
        $crate::Path::parse($s).expect("invalid path literal")
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_paths() {
        assert_eq!(Path::parse("").unwrap().len(), 0);
        assert_eq!(Path::parse("/").unwrap().len(), 0);
        assert_eq!(Path::parse("orders").unwrap().len(), 1);
        assert_eq!(Path::parse("group/subject").unwrap().len(), 2);
    }

    #[test]
    fn slashes_are_normalized() {
        let expected = path!("foo/bar");
        for raw in ["foo/bar/", "foo//bar", "/foo/bar", "//foo/bar//"] {
            assert_eq!(Path::parse(raw).unwrap(), expected, "{}", raw);
        }
    }

    #[test]
    fn resource_names_are_permissive() {
        let p = Path::parse("prices/EUR-USD/fx.rates").unwrap();
        assert_eq!(p.len(), 3);
        assert_eq!(p.name(), Some("fx.rates"));
    }

    #[test]
    fn reserved_characters_rejected() {
        assert_eq!(
            Path::parse("orders?view=map").unwrap_err(),
            PathError::ReservedCharacter {
                component: "orders?view=map".to_string(),
                character: '?',
            }
        );
        assert!(Path::parse("bad\nname").is_err());
        assert!(path!("a").child("b/c").is_err());
        assert_eq!(
            path!("a").child("").unwrap_err(),
            PathError::EmptyComponent { position: 1 }
        );
    }

    #[test]
    fn parent_and_name() {
        let p = path!("group/subject");
        assert_eq!(p.parent(), Some(path!("group")));
        assert_eq!(p.name(), Some("subject"));
        assert_eq!(Path::root().parent(), None);
        assert_eq!(Path::root().name(), None);
    }

    #[test]
    fn within_ancestors() {
        let p = path!("foo/bar/baz");
        assert!(p.is_within(&Path::root()));
        assert!(p.is_within(&path!("foo/bar")));
        assert!(p.is_within(&p));
        assert!(!p.is_within(&path!("bar")));
        assert!(!p.is_within(&path!("foo/bar/baz/qux")));
    }

    #[test]
    fn absolute_rendering() {
        assert_eq!(path!("orders").to_absolute(), "/orders");
        assert_eq!(Path::root().to_absolute(), "/");
        assert_eq!(format!("{}", path!("/a/b")), "a/b");
    }
}
