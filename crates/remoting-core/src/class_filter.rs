//! Any object leaving the export table toward the wire, and any class
//! resolved on the way in, is screened by a `ClassFilter`.
//! The default blacklist below is the one historically carried by this
//! protocol; implementations may extend it via an override, set once at
//! process start.

/// Patterns refused by the default blacklist. A historical performance
/// regression used regex here; `startsWith`-equivalent prefix matching is
/// enough for every entry below, so that is all this does.
const DEFAULT_BLACKLIST: &[&str] = &[
    "javax.imageio.",
    "java.util.ServiceLoader",
    "java.net.URLClassLoader",
    "java.lang.reflect.Method",
    "net.sf.json.",
    "java.security.SignedObject",
];

pub trait ClassFilter: Send + Sync {
    fn matches(&self, class_name: &str) -> bool;

    /// Method-signature screening uses the same blacklist logic, applied to
    /// the declaring class embedded in the signature string.
    fn matches_signature(&self, signature: &str) -> bool {
        self.matches(signature)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefaultClassFilter {
    extra_blacklist: Vec<String>,
}

impl DefaultClassFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the blacklist. Per, the process-wide filter is a
    /// one-shot initializer: callers are expected to build the final
    /// `DefaultClassFilter` once and hand it to every `Channel`, not mutate
    /// it afterwards.
    pub fn with_extra_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.extra_blacklist.push(pattern.into());
        self
    }
}

impl ClassFilter for DefaultClassFilter {
    fn matches(&self, class_name: &str) -> bool {
        DEFAULT_BLACKLIST
            .iter()
            .any(|pattern| class_name.starts_with(pattern) || class_name == *pattern)
            || self
                .extra_blacklist
                .iter()
                .any(|pattern| class_name.starts_with(pattern.as_str()))
    }
}

/// A filter that allows everything through. Useful for tests and for
/// embedders that implement their own screening upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveClassFilter;

impl ClassFilter for PermissiveClassFilter {
    fn matches(&self, _class_name: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_known_dangerous_classes() {
        let filter = DefaultClassFilter::new();
        assert!(filter.matches("java.net.URLClassLoader"));
        assert!(filter.matches("javax.imageio.ImageIO"));
        assert!(filter.matches("net.sf.json.JSONObject"));
    }

    #[test]
    fn allows_unrelated_classes() {
        let filter = DefaultClassFilter::new();
        assert!(!filter.matches("com.example.Probe"));
    }

    #[test]
    fn extra_patterns_extend_the_default_set() {
        let filter = DefaultClassFilter::new().with_extra_pattern("com.evil.");
        assert!(filter.matches("com.evil.Payload"));
        assert!(!filter.matches("com.fine.Payload"));
    }
}
