/// A container image reference split into its name and its tag or digest.
///
/// Parsing never fails. An empty `tag` means the reference could not be split
/// and callers must skip it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
}

impl ImageReference {
    pub fn parse(s: &str) -> Self {
        // digest references: repo/app@sha256:abcd
        if let Some(pos) = s.rfind('@') {
            return Self::split_at(s, pos);
        }

        // Must contain a tag (colon after last slash), otherwise the colon
        // belongs to a registry port. A plain last-colon split would turn
        // `registry:5000/app` into name `registry` and tag `5000/app`; such a
        // reference is deliberately left untagged and skipped instead.
        if let Some(pos) = s.rfind(':') {
            if !s[pos + 1..].contains('/') {
                return Self::split_at(s, pos);
            }
        }

        Self {
            name: s.to_string(),
            tag: String::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.tag.is_empty()
    }

    fn split_at(s: &str, pos: usize) -> Self {
        Self {
            name: s[..pos].to_string(),
            tag: s[pos + 1..].to_string(),
        }
    }
}
