//! Wildcard Path Patterns
//!
//! Patterns such as `work/tiles/{dataset}` are parsed once into path
//! segments and matched component by component:
//! - A segment that is a single `{name}` matches any one path component
//! - A segment mixing text and wildcards (`metadata.{tag}.json`) matches
//!   inside one component, each wildcard taking a non-empty substring
//! - A wildcard used more than once must bind the same value everywhere
//!
//! Matching a concrete path yields [`Bindings`]; substituting bindings
//! back into a pattern yields a concrete path.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PatternError;

/// Wildcard name -> captured value.
pub type Bindings = BTreeMap<String, String>;

/// One piece of a path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    Literal(String),
    Wildcard(String),
}

/// One path component of a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pieces: Vec<Piece>,
}

impl Segment {
    /// Parses a single path component.
    ///
    /// # Example
    /// ```
    /// use slidegraph::workflow::wildcards::Segment;
    ///
    /// let seg = Segment::parse("metadata.{tag}.json").unwrap();
    /// let bound = seg.match_component("metadata.ds1.json").unwrap();
    /// assert_eq!(bound["tag"], "ds1");
    /// ```
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        if text.is_empty() {
            return Err(PatternError::Empty);
        }
        parse_segment(text, text)
    }

    /// Matches one path component with fresh bindings.
    pub fn match_component(&self, component: &str) -> Option<Bindings> {
        let mut bindings = Bindings::new();
        match_pieces(&self.pieces, component, &mut bindings).then_some(bindings)
    }

    fn is_literal(&self) -> bool {
        self.pieces.iter().all(|p| matches!(p, Piece::Literal(_)))
    }

    fn render(&self, bindings: &Bindings, raw: &str) -> Result<String, PatternError> {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Wildcard(name) => {
                    let value = bindings.get(name).ok_or_else(|| PatternError::Unbound {
                        pattern: raw.to_string(),
                        name: name.clone(),
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// A parsed path pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    raw: String,
    absolute: bool,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parses a path pattern.
    ///
    /// # Example
    /// ```
    /// use slidegraph::workflow::wildcards::Pattern;
    ///
    /// let pattern = Pattern::parse("work/tiles/{dataset}").unwrap();
    /// let bindings = pattern.matches("work/tiles/sample1").unwrap();
    /// assert_eq!(bindings["dataset"], "sample1");
    /// ```
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }

        let absolute = trimmed.starts_with('/');
        let segments = trimmed
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .map(|c| parse_segment(c, trimmed))
            .collect::<Result<Vec<_>, _>>()?;

        if segments.is_empty() && !absolute {
            return Err(PatternError::Empty);
        }

        Ok(Self {
            raw: trimmed.to_string(),
            absolute,
            segments,
        })
    }

    /// Builds a pattern from a concrete directory plus a relative pattern.
    ///
    /// The directory is taken literally, so braces in it are not wildcards.
    pub fn under(base: &Path, relative: &str) -> Result<Self, PatternError> {
        let mut pattern = Self::parse(relative)?;
        let base_str = base.to_string_lossy();
        let mut segments: Vec<Segment> = base_components(base)
            .into_iter()
            .map(|c| Segment {
                pieces: vec![Piece::Literal(c)],
            })
            .collect();
        segments.append(&mut pattern.segments);

        pattern.absolute = base.is_absolute();
        pattern.segments = segments;
        pattern.raw = format!("{}/{}", base_str.trim_end_matches('/'), pattern.raw);
        Ok(pattern)
    }

    /// The original text of the pattern.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the pattern contains no wildcards.
    pub fn is_concrete(&self) -> bool {
        self.segments.iter().all(Segment::is_literal)
    }

    /// Returns the set of wildcard names used in this pattern.
    pub fn wildcard_names(&self) -> BTreeSet<String> {
        self.segments
            .iter()
            .flat_map(|s| s.pieces.iter())
            .filter_map(|p| match p {
                Piece::Wildcard(name) => Some(name.clone()),
                Piece::Literal(_) => None,
            })
            .collect()
    }

    /// Matches a concrete path, returning the captured bindings.
    pub fn matches(&self, path: impl AsRef<Path>) -> Option<Bindings> {
        let path = path.as_ref();
        if path.is_absolute() != self.absolute {
            return None;
        }

        let components = path_components(path)?;
        if components.len() != self.segments.len() {
            return None;
        }

        let mut bindings = Bindings::new();
        for (segment, component) in self.segments.iter().zip(&components) {
            if !match_pieces(&segment.pieces, component, &mut bindings) {
                return None;
            }
        }
        Some(bindings)
    }

    /// Substitutes bindings into the pattern, producing a concrete path.
    pub fn substitute(&self, bindings: &Bindings) -> Result<PathBuf, PatternError> {
        let mut path = if self.absolute {
            PathBuf::from("/")
        } else {
            PathBuf::new()
        };
        for segment in &self.segments {
            path.push(segment.render(bindings, &self.raw)?);
        }
        Ok(path)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for Pattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Pattern::parse(&value)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.raw
    }
}

/// Normalizes a path into comparable string components.
///
/// `.` components are dropped; non-UTF-8 paths yield `None`.
pub fn path_components(path: &Path) -> Option<Vec<String>> {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part.to_str()?.to_string()),
            Component::ParentDir => out.push("..".to_string()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Some(out)
}

/// Normalizes a path so equal locations compare equal (`./a/b` == `a/b`).
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = if path.is_absolute() {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => out.push(".."),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

fn base_components(base: &Path) -> Vec<String> {
    base.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect()
}

fn parse_segment(text: &str, raw: &str) -> Result<Segment, PatternError> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut chars = text.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if !closed {
                    return Err(PatternError::UnbalancedBrace(raw.to_string()));
                }
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(PatternError::InvalidWildcardName {
                        pattern: raw.to_string(),
                        name,
                    });
                }
                if literal.is_empty() && matches!(pieces.last(), Some(Piece::Wildcard(_))) {
                    return Err(PatternError::AdjacentWildcards(raw.to_string()));
                }
                if !literal.is_empty() {
                    pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                }
                pieces.push(Piece::Wildcard(name));
            }
            '}' => return Err(PatternError::UnbalancedBrace(raw.to_string())),
            _ => literal.push(ch),
        }
    }

    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal));
    }

    Ok(Segment { pieces })
}

/// Backtracking match of pieces against one component.
///
/// Unbound wildcards try the longest candidate first.
fn match_pieces(pieces: &[Piece], text: &str, bindings: &mut Bindings) -> bool {
    let Some((first, rest)) = pieces.split_first() else {
        return text.is_empty();
    };

    match first {
        Piece::Literal(lit) => text
            .strip_prefix(lit.as_str())
            .is_some_and(|tail| match_pieces(rest, tail, bindings)),
        Piece::Wildcard(name) => {
            if let Some(bound) = bindings.get(name).cloned() {
                return !bound.is_empty()
                    && text
                        .strip_prefix(bound.as_str())
                        .is_some_and(|tail| match_pieces(rest, tail, bindings));
            }

            let mut ends: Vec<usize> = text.char_indices().map(|(i, _)| i).skip(1).collect();
            ends.push(text.len());

            for end in ends.into_iter().rev() {
                if end == 0 {
                    continue;
                }
                bindings.insert(name.clone(), text[..end].to_string());
                if match_pieces(rest, &text[end..], bindings) {
                    return true;
                }
                bindings.remove(name);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(pairs: &[(&str, &str)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_match_single_wildcard_component() {
        let pattern = Pattern::parse("out/{dataset}").unwrap();
        assert_eq!(pattern.matches("out/ds1"), Some(bind(&[("dataset", "ds1")])));
        assert_eq!(pattern.matches("./out/ds1"), Some(bind(&[("dataset", "ds1")])));
    }

    #[test]
    fn test_wildcard_does_not_cross_components() {
        let pattern = Pattern::parse("out/{dataset}").unwrap();
        assert!(pattern.matches("out/a/b").is_none());
        assert!(pattern.matches("out").is_none());
    }

    #[test]
    fn test_repeated_wildcard_must_agree() {
        let pattern = Pattern::parse("{dataset}/records/{dataset}").unwrap();
        assert!(pattern.matches("ds1/records/ds1").is_some());
        assert!(pattern.matches("ds1/records/ds2").is_none());
    }

    #[test]
    fn test_mixed_segment_match() {
        let seg = Segment::parse("metadata.{tag}.json").unwrap();
        assert_eq!(seg.match_component("metadata.a.b.json").unwrap()["tag"], "a.b");
        assert!(seg.match_component("metadata..json").is_none());
        assert!(seg.match_component("metadata.x.yaml").is_none());
    }

    #[test]
    fn test_absolute_must_match_absolute() {
        let pattern = Pattern::parse("/data/{dataset}").unwrap();
        assert!(pattern.matches("/data/ds1").is_some());
        assert!(pattern.matches("data/ds1").is_none());
    }

    #[test]
    fn test_substitute() {
        let pattern = Pattern::parse("work/sorted/{dataset}").unwrap();
        let path = pattern.substitute(&bind(&[("dataset", "ds2")])).unwrap();
        assert_eq!(path, PathBuf::from("work/sorted/ds2"));
    }

    #[test]
    fn test_substitute_unbound() {
        let pattern = Pattern::parse("work/{dataset}/{stage}").unwrap();
        let err = pattern.substitute(&bind(&[("dataset", "ds2")])).unwrap_err();
        assert!(matches!(err, PatternError::Unbound { ref name, .. } if name == "stage"));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Pattern::parse("  "), Err(PatternError::Empty));
        assert!(matches!(
            Pattern::parse("out/{dataset"),
            Err(PatternError::UnbalancedBrace(_))
        ));
        assert!(matches!(
            Pattern::parse("out/data}set"),
            Err(PatternError::UnbalancedBrace(_))
        ));
        assert!(matches!(
            Pattern::parse("out/{data-set}"),
            Err(PatternError::InvalidWildcardName { .. })
        ));
        assert!(matches!(
            Pattern::parse("out/{a}{b}"),
            Err(PatternError::AdjacentWildcards(_))
        ));
    }

    #[test]
    fn test_wildcard_names() {
        let pattern = Pattern::parse("{run}/tiles/{dataset}_{run}").unwrap();
        let names: Vec<_> = pattern.wildcard_names().into_iter().collect();
        assert_eq!(names, vec!["dataset", "run"]);
        assert!(!pattern.is_concrete());
        assert!(Pattern::parse("a/b").unwrap().is_concrete());
    }

    #[test]
    fn test_under_treats_base_literally() {
        let pattern = Pattern::under(Path::new("/data/{odd}"), "{dataset}").unwrap();
        let bindings = pattern.matches("/data/{odd}/ds1").unwrap();
        assert_eq!(bindings, bind(&[("dataset", "ds1")]));
        assert!(pattern.matches("/data/x/ds1").is_none());
    }

    #[test]
    fn test_serde_roundtrip_as_string() {
        let pattern: Pattern = serde_yaml::from_str("\"out/{dataset}\"").unwrap();
        assert_eq!(pattern.as_str(), "out/{dataset}");
        assert!(serde_yaml::from_str::<Pattern>("\"out/{\"").is_err());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("./a//b/.")), PathBuf::from("a/b"));
        assert_eq!(normalize_path(Path::new("/a/./b")), PathBuf::from("/a/b"));
    }
}
