use indexmap::IndexMap;

/// Variables substituted into boot option values, e.g. `root=${ROOT}`.
///
/// Parsed from `KEY=VALUE` tokens, usually the kernel command line of the running system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootVars(IndexMap<String, String>);

impl BootVars {
    /// Parses whitespace separated `KEY=VALUE` tokens. Values may contain `=`,
    /// bare flags without a value are skipped.
    pub fn parse(input: &str) -> Self {
        Self(
            input
                .split_whitespace()
                .filter_map(|token| token.split_once('='))
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replaces every `${KEY}` whose key is known. Unknown placeholders stay as written.
    pub fn substitute(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let key = &after[..end];
                    match self.get(key) {
                        Some(replacement) => out.push_str(replacement),
                        None => out.push_str(&rest[start..start + 2 + end + 1]),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}
