//! Short region codes.

/// Shortcut table. Keys are at most five characters, shorter than any
/// canonical region name, so canonical names pass straight through.
const SHORTCUTS: &[(&str, &str)] = &[
    ("use1", "us-east-1"),
    ("use2", "us-east-2"),
    ("usw1", "us-west-1"),
    ("usw2", "us-west-2"),
    ("cac1", "ca-central-1"),
    ("caw1", "ca-west-1"),
    ("sae1", "sa-east-1"),
    ("euw1", "eu-west-1"),
    ("euw2", "eu-west-2"),
    ("euw3", "eu-west-3"),
    ("euc1", "eu-central-1"),
    ("euc2", "eu-central-2"),
    ("eun1", "eu-north-1"),
    ("eus1", "eu-south-1"),
    ("eus2", "eu-south-2"),
    ("afs1", "af-south-1"),
    ("mes1", "me-south-1"),
    ("mec1", "me-central-1"),
    ("ilc1", "il-central-1"),
    ("aps1", "ap-south-1"),
    ("aps2", "ap-south-2"),
    ("ape1", "ap-east-1"),
    ("apse1", "ap-southeast-1"),
    ("apse2", "ap-southeast-2"),
    ("apse3", "ap-southeast-3"),
    ("apse4", "ap-southeast-4"),
    ("apne1", "ap-northeast-1"),
    ("apne2", "ap-northeast-2"),
    ("apne3", "ap-northeast-3"),
];

/// Maps short region codes to canonical region identifiers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegionResolver {
    default_region: String,
}

impl RegionResolver {
    /// Creates a resolver that maps empty input to `default_region`.
    #[must_use]
    pub fn new(default_region: impl Into<String>) -> Self {
        Self {
            default_region: default_region.into(),
        }
    }

    /// Resolves `code`. Unknown codes are returned unchanged; this never
    /// fails.
    #[must_use]
    pub fn resolve(&self, code: &str) -> String {
        let trimmed = code.trim();
        if trimmed.is_empty() {
            return self.default_region.clone();
        }
        let lowered = trimmed.to_ascii_lowercase();
        SHORTCUTS
            .iter()
            .find(|(short, _)| *short == lowered)
            .map_or_else(|| trimmed.to_owned(), |(_, canonical)| (*canonical).to_owned())
    }

    /// The region used for empty input.
    #[must_use]
    pub fn default_region(&self) -> &str {
        &self.default_region
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("cac1", "ca-central-1")]
    #[case("CAC1", "ca-central-1")]
    #[case("ca-central-1", "ca-central-1")]
    #[case("", "us-west-2")]
    #[case("   ", "us-west-2")]
    #[case("apne1", "ap-northeast-1")]
    #[case("xx-unknown-9", "xx-unknown-9")]
    fn resolves_codes(#[case] code: &str, #[case] expected: &str) {
        let resolver = RegionResolver::new("us-west-2");
        assert_eq!(resolver.resolve(code), expected);
    }

    #[test]
    fn shortcut_keys_are_shorter_than_canonical_names() {
        for (short, canonical) in SHORTCUTS {
            assert!(short.len() < canonical.len(), "{short} vs {canonical}");
            let resolver = RegionResolver::new("unused");
            assert_eq!(resolver.resolve(canonical), *canonical);
        }
    }
}
