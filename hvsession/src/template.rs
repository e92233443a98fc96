//! `${name}` / `${name:default}` substitution for user data.
//!
//! Expansion is a single left-to-right pass; substituted text is never
//! re-scanned, so a value containing `${...}` is emitted as-is. An opening
//! `${` without a closing `}` ends expansion and the remainder is copied
//! verbatim.

/// Anything that can resolve a macro name to a value.
pub trait Lookup {
    fn lookup(&self, name: &str) -> Option<String>;
}

impl Lookup for std::collections::BTreeMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl Lookup for std::collections::HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

pub fn expand(input: &str, vars: &impl Lookup) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };

        out.push_str(&rest[..start]);

        let token = &after[..end];
        let (name, default) = match token.split_once(':') {
            Some((name, default)) => (name, default),
            None => (token, ""),
        };
        match vars.lookup(name) {
            Some(value) => out.push_str(&value),
            None => out.push_str(default),
        }

        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
