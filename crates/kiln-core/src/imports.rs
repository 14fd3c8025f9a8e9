//! The debug-import chain: a persistent, structurally shared list of the
//! `using` scopes in effect for a member.
//!
//! Swapping the chain for a member and restoring it afterwards copies one
//! `Arc`, never the scopes themselves.

use std::sync::Arc;

/// One level of imports, innermost first in a chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportScope {
    pub usings: Vec<Arc<str>>,
    /// `(alias, target)` pairs.
    pub aliases: Vec<(Arc<str>, Arc<str>)>,
}

impl ImportScope {
    pub fn usings<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            usings: names.into_iter().map(Arc::from).collect(),
            aliases: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct ImportNode {
    scope: ImportScope,
    parent: ImportChain,
}

/// Persistent cons list of [`ImportScope`]s.
#[derive(Debug, Clone, Default)]
pub struct ImportChain {
    head: Option<Arc<ImportNode>>,
}

impl ImportChain {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A new chain with `scope` in front; `self` is unchanged.
    pub fn push(&self, scope: ImportScope) -> Self {
        Self {
            head: Some(Arc::new(ImportNode {
                scope,
                parent: self.clone(),
            })),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn depth(&self) -> usize {
        self.iter().count()
    }

    /// Innermost scope first.
    pub fn iter(&self) -> impl Iterator<Item = &ImportScope> {
        let mut current = self.head.as_deref();
        std::iter::from_fn(move || {
            let node = current?;
            current = node.parent.head.as_deref();
            Some(&node.scope)
        })
    }

    /// Whether both handles share the same head node.
    pub fn ptr_eq(&self, other: &ImportChain) -> bool {
        match (&self.head, &other.head) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_shares_the_tail() {
        let outer = ImportChain::empty().push(ImportScope::usings(["System"]));
        let inner = outer.push(ImportScope::usings(["System.Text"]));
        assert_eq!(inner.depth(), 2);
        assert_eq!(outer.depth(), 1);

        let names: Vec<_> = inner.iter().map(|s| s.usings[0].to_string()).collect();
        assert_eq!(names, vec!["System.Text", "System"]);
    }

    #[test]
    fn clones_are_pointer_equal() {
        let chain = ImportChain::empty().push(ImportScope::default());
        let saved = chain.clone();
        assert!(saved.ptr_eq(&chain));
        assert!(!chain.ptr_eq(&ImportChain::empty()));
    }
}
