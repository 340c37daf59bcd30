use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::collections::PersistentMap;

#[derive(Clone)]
pub struct Symbol {
    ns: Option<Arc<str>>,
    name: Arc<str>,
    meta: Option<PersistentMap>,
}

impl Symbol {
    pub fn new(ns: Option<&str>, name: &str) -> Self {
        Self {
            ns: ns.map(Arc::from),
            name: Arc::from(name),
            meta: None,
        }
    }

    pub fn simple(name: impl AsRef<str>) -> Self {
        Self::new(None, name.as_ref())
    }

    /// Splits `ns/name` on the last slash. A lone `/` stays unqualified.
    pub fn parse(text: &str) -> Self {
        if text == "/" {
            return Self::simple(text);
        }
        match text.rfind('/') {
            Some(idx) if idx > 0 && idx + 1 < text.len() => {
                Self::new(Some(&text[..idx]), &text[idx + 1..])
            }
            _ => Self::simple(text),
        }
    }

    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> Option<&PersistentMap> {
        self.meta.as_ref()
    }

    pub fn with_meta(&self, meta: Option<PersistentMap>) -> Self {
        Self {
            ns: self.ns.clone(),
            name: self.name.clone(),
            meta,
        }
    }

    pub fn without_ns(&self) -> Self {
        Self {
            ns: None,
            name: self.name.clone(),
            meta: self.meta.clone(),
        }
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.ns == other.ns && self.name == other.name
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ns.hash(state);
        self.name.hash(state);
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ns.as_deref(), &*self.name).cmp(&(other.ns.as_deref(), &*other.name))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ns {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self)
    }
}

#[derive(Debug)]
struct KeywordData {
    ns: Option<String>,
    name: String,
}

/// Interned keyword. Two keywords with the same name share one allocation,
/// so identity and equality agree.
#[derive(Clone)]
pub struct Keyword(Arc<KeywordData>);

static KEYWORDS: Lazy<Mutex<HashMap<(Option<String>, String), Keyword>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl Keyword {
    pub fn intern(ns: Option<&str>, name: &str) -> Self {
        let key = (ns.map(str::to_string), name.to_string());
        let mut table = KEYWORDS.lock().unwrap();
        table
            .entry(key)
            .or_insert_with(|| {
                Keyword(Arc::new(KeywordData {
                    ns: ns.map(str::to_string),
                    name: name.to_string(),
                }))
            })
            .clone()
    }

    pub fn simple(name: &str) -> Self {
        Self::intern(None, name)
    }

    pub fn ns(&self) -> Option<&str> {
        self.0.ns.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn ptr_eq(&self, other: &Keyword) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Keyword {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || (self.0.ns == other.0.ns && self.0.name == other.0.name)
    }
}

impl Eq for Keyword {}

impl Hash for Keyword {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.ns.hash(state);
        self.0.name.hash(state);
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.ns {
            Some(ns) => write!(f, ":{}/{}", ns, self.0.name),
            None => write!(f, ":{}", self.0.name),
        }
    }
}

impl fmt::Debug for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub fn line_key() -> Keyword {
    Keyword::simple("line")
}

pub fn macro_key() -> Keyword {
    Keyword::simple("macro")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_namespace() {
        let sym = Symbol::parse("cinder.core/+");
        assert_eq!(sym.ns(), Some("cinder.core"));
        assert_eq!(sym.name(), "+");
        assert_eq!(Symbol::parse("/").name(), "/");
        assert_eq!(Symbol::parse("plain").ns(), None);
    }

    #[test]
    fn keywords_are_interned() {
        let a = Keyword::simple("line");
        let b = line_key();
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn symbol_meta_is_ignored_by_equality() {
        let plain = Symbol::simple("x");
        let tagged = plain.with_meta(Some(PersistentMap::new()));
        assert_eq!(plain, tagged);
    }
}
