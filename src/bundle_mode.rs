use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::bail;

/// Determines whether time tags of unwrapped bundles are honored.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum TimeTagMode {
    /// deliver all messages immediately, regardless of their bundle's time tag
    Ignore,
    /// OSC 1.0 semantics: deliver messages when their bundle's time tag is due, i.e. immediately
    ///  for time tags in the past and deferred for time tags in the future
    #[default]
    Osc1_0,
}

/// Determines how an endpoint delivers incoming bundles to application code.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BundleMode {
    /// Bundles are passed to the bundle handler as they are, without looking at their contents
    ///  or time tags
    Forward,
    /// Bundles are flattened recursively, and each contained message is passed to the message
    ///  handler individually. Bundles are never passed to the bundle handler in this mode.
    Unwrap(TimeTagMode),
}

impl BundleMode {
    pub fn time_tag_mode(&self) -> Option<TimeTagMode> {
        match self {
            BundleMode::Forward => None,
            BundleMode::Unwrap(mode) => Some(*mode),
        }
    }
}

impl Default for BundleMode {
    fn default() -> Self {
        BundleMode::Unwrap(TimeTagMode::default())
    }
}

impl Display for BundleMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleMode::Forward => write!(f, "forward"),
            BundleMode::Unwrap(TimeTagMode::Ignore) => write!(f, "unwrap-ignore"),
            BundleMode::Unwrap(TimeTagMode::Osc1_0) => write!(f, "unwrap"),
        }
    }
}

impl FromStr for BundleMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(BundleMode::Forward),
            "unwrap" | "unwrap-osc1.0" => Ok(BundleMode::Unwrap(TimeTagMode::Osc1_0)),
            "unwrap-ignore" => Ok(BundleMode::Unwrap(TimeTagMode::Ignore)),
            other => bail!("unknown bundle mode '{}' - expected 'forward', 'unwrap' or 'unwrap-ignore'", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_defaults() {
        assert_eq!(TimeTagMode::default(), TimeTagMode::Osc1_0);
        assert_eq!(BundleMode::default(), BundleMode::Unwrap(TimeTagMode::Osc1_0));
    }

    #[rstest]
    #[case::forward(BundleMode::Forward, None)]
    #[case::unwrap_ignore(BundleMode::Unwrap(TimeTagMode::Ignore), Some(TimeTagMode::Ignore))]
    #[case::unwrap_osc(BundleMode::Unwrap(TimeTagMode::Osc1_0), Some(TimeTagMode::Osc1_0))]
    fn test_time_tag_mode(#[case] bundle_mode: BundleMode, #[case] expected: Option<TimeTagMode>) {
        assert_eq!(bundle_mode.time_tag_mode(), expected);
    }

    #[rstest]
    #[case::forward("forward", Some(BundleMode::Forward))]
    #[case::forward_upper(" Forward ", Some(BundleMode::Forward))]
    #[case::unwrap("unwrap", Some(BundleMode::Unwrap(TimeTagMode::Osc1_0)))]
    #[case::unwrap_explicit("unwrap-osc1.0", Some(BundleMode::Unwrap(TimeTagMode::Osc1_0)))]
    #[case::unwrap_ignore("unwrap-ignore", Some(BundleMode::Unwrap(TimeTagMode::Ignore)))]
    #[case::invalid("bundle", None)]
    fn test_from_str(#[case] s: &str, #[case] expected: Option<BundleMode>) {
        assert_eq!(s.parse::<BundleMode>().ok(), expected);
    }

    #[test]
    fn test_display_parses_back() {
        for mode in [BundleMode::Forward, BundleMode::Unwrap(TimeTagMode::Ignore), BundleMode::Unwrap(TimeTagMode::Osc1_0)] {
            assert_eq!(mode.to_string().parse::<BundleMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_structural_hash() {
        let mut set = FxHashSet::default();
        set.insert(BundleMode::Unwrap(TimeTagMode::Ignore));
        set.insert(BundleMode::Unwrap(TimeTagMode::Ignore));
        set.insert(BundleMode::Unwrap(TimeTagMode::Osc1_0));
        set.insert(BundleMode::Forward);
        assert_eq!(set.len(), 3);
    }
}
