//! Label views and equality-based label selectors.

use serde_json::{Map, Value};
use smallvec::SmallVec;

/// Borrowed view over a `metadata.labels` (or annotations) object.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelSet<'a> {
    map: Option<&'a Map<String, Value>>,
}

impl<'a> LabelSet<'a> {
    pub fn from_value(v: Option<&'a Value>) -> Self {
        Self { map: v.and_then(|m| m.as_object()) }
    }

    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.map.and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.map(|m| m.contains_key(key)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.map.map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// String-valued pairs; non-string values are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.map
            .into_iter()
            .flat_map(|m| m.iter())
            .filter_map(|(k, v)| v.as_str().map(|s| (k.as_str(), s)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid label selector term: {0:?}")]
pub struct SelectorParseError(pub String);

/// Equality-based selector: `k=v`, `k==v`, `k!=v`, `k`, `!k`, comma separated.
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    reqs: SmallVec<[Requirement; 4]>,
}

fn valid_key(k: &str) -> bool {
    !k.is_empty() && !k.contains(|c: char| c.is_whitespace() || c == '=' || c == '!')
}

impl LabelSelector {
    pub fn parse(s: &str) -> Result<Self, SelectorParseError> {
        let mut reqs = SmallVec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::NotExists(k.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };
            let key = match &req {
                Requirement::Equals(k, _) | Requirement::NotEquals(k, _) => k,
                Requirement::Exists(k) | Requirement::NotExists(k) => k,
            };
            if !valid_key(key) {
                return Err(SelectorParseError(term.to_string()));
            }
            reqs.push(req);
        }
        Ok(Self { reqs })
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn matches(&self, labels: &LabelSet<'_>) -> bool {
        self.reqs.iter().all(|r| match r {
            Requirement::Equals(k, v) => labels.get(k) == Some(v.as_str()),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v.as_str()),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        })
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, r) in self.reqs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match r {
                Requirement::Equals(k, v) => write!(f, "{}={}", k, v)?,
                Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v)?,
                Requirement::Exists(k) => write!(f, "{}", k)?,
                Requirement::NotExists(k) => write!(f, "!{}", k)?,
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for LabelSelector {
    type Err = SelectorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_matches_all_requirement_forms() {
        let v = json!({ "app": "web", "tier": "front" });
        let labels = LabelSet::from_value(Some(&v));
        assert!(LabelSelector::parse("app=web,tier").unwrap().matches(&labels));
        assert!(LabelSelector::parse("app==web,!legacy").unwrap().matches(&labels));
        assert!(!LabelSelector::parse("tier!=front").unwrap().matches(&labels));
        assert!(LabelSelector::parse("").unwrap().matches(&labels));
    }

    #[test]
    fn selector_rejects_empty_keys() {
        assert!(LabelSelector::parse("=web").is_err());
        assert!(LabelSelector::parse("!").is_err());
    }

    #[test]
    fn selector_display_is_canonical() {
        let s = LabelSelector::parse(" app == web , !old ").unwrap();
        assert_eq!(s.to_string(), "app=web,!old");
    }
}
