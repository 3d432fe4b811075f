use std::collections::HashSet;

use dns_types::protocol::types::DomainName;

/// Per-query state threaded through a single resolution: which names
/// have already been visited (for CNAME/ANAME loop detection) and how
/// many indirections remain before giving up.
///
/// Lives only for the duration of one `ResolverEngine::handle` call -
/// there is nothing here that should, or could, outlive a query.
pub struct Context {
    visited: HashSet<DomainName>,
    remaining_chain: usize,
}

impl Context {
    pub fn new(max_chain: usize) -> Self {
        Self {
            visited: HashSet::new(),
            remaining_chain: max_chain,
        }
    }

    /// Record a visit to `name`, returning `false` if it had already
    /// been visited (a loop) or the chain bound has been exhausted.
    pub fn visit(&mut self, name: &DomainName) -> bool {
        if self.remaining_chain == 0 || !self.visited.insert(name.clone()) {
            return false;
        }
        self.remaining_chain -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::domain;

    #[test]
    fn visit_rejects_repeats() {
        let mut context = Context::new(10);
        assert!(context.visit(&domain("a.example.com.")));
        assert!(!context.visit(&domain("a.example.com.")));
    }

    #[test]
    fn visit_rejects_once_chain_is_exhausted() {
        let mut context = Context::new(2);
        assert!(context.visit(&domain("a.example.com.")));
        assert!(context.visit(&domain("b.example.com.")));
        assert!(!context.visit(&domain("c.example.com.")));
    }
}
