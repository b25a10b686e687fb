use std::cell::RefCell;

use lasso::{Rodeo, Spur};

thread_local! {
    static INTERNER: RefCell<Rodeo> = RefCell::new(Rodeo::default());
}

/// Intern a string, returning a Spur key.
pub fn intern(s: &str) -> Spur {
    INTERNER.with(|r| r.borrow_mut().get_or_intern(s))
}

/// Resolve a Spur key back to a String.
pub fn resolve(spur: Spur) -> String {
    INTERNER.with(|r| r.borrow().resolve(&spur).to_string())
}

/// Resolve a Spur and call f with the &str, avoiding allocation.
pub fn with_resolved<F, R>(spur: Spur, f: F) -> R
where
    F: FnOnce(&str) -> R,
{
    INTERNER.with(|r| {
        let interner = r.borrow();
        f(interner.resolve(&spur))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_roundtrip() {
        let a = intern("foo");
        let b = intern("foo");
        assert_eq!(a, b);
        assert_eq!(resolve(a), "foo");
    }

    #[test]
    fn test_distinct_symbols() {
        assert_ne!(intern("foo"), intern("bar"));
    }

    #[test]
    fn test_with_resolved() {
        let spur = intern("baz");
        let len = with_resolved(spur, |s| s.len());
        assert_eq!(len, 3);
    }
}
