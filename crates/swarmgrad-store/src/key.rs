//! Canonical storage keys: `{kind}-{window}-{role_id}-v{version}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// What an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A peer's compressed gradient for one window.
    Gradient,
    /// A small parameter sample published after applying a window.
    Debug,
    /// Full training state.
    Checkpoint,
    /// An evaluator's sign-packed aggregated update for one window.
    Aggregation,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Gradient,
        ArtifactKind::Debug,
        ArtifactKind::Checkpoint,
        ArtifactKind::Aggregation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Gradient => "gradient",
            ArtifactKind::Debug => "debug",
            ArtifactKind::Checkpoint => "checkpoint",
            ArtifactKind::Aggregation => "aggregation",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StoreError::UnknownKind(s.to_string()))
    }
}

/// Address of one stored artifact.
///
/// Role ids must not contain `-`; the window is always the window the payload
/// was computed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    pub kind: ArtifactKind,
    pub window: u64,
    pub role_id: String,
    pub version: String,
}

impl StorageKey {
    pub fn new(
        kind: ArtifactKind,
        window: u64,
        role_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            window,
            role_id: role_id.into(),
            version: version.into(),
        }
    }

    /// Prefix shared by every key of this kind (`"gradient-"`).
    pub fn kind_prefix(kind: ArtifactKind) -> String {
        format!("{kind}-")
    }

    /// True if this key belongs to the `(role_id, kind, version)` series.
    pub fn in_series(&self, role_id: &str, kind: ArtifactKind, version: &str) -> bool {
        self.kind == kind && self.role_id == role_id && self.version == version
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-v{}",
            self.kind, self.window, self.role_id, self.version
        )
    }
}

impl FromStr for StorageKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidKey(s.to_string());

        let mut parts = s.splitn(3, '-');
        let kind: ArtifactKind = parts.next().ok_or_else(invalid)?.parse()?;
        let window: u64 = parts
            .next()
            .ok_or_else(invalid)?
            .parse()
            .map_err(|_| invalid())?;
        let rest = parts.next().ok_or_else(invalid)?;
        let (role_id, version) = rest.rsplit_once("-v").ok_or_else(invalid)?;
        if role_id.is_empty() || role_id.contains('-') || version.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(kind, window, role_id, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format_matches_wire_convention() {
        let key = StorageKey::new(ArtifactKind::Gradient, 4821, "17", "3");
        assert_eq!(key.to_string(), "gradient-4821-17-v3");
    }

    #[test]
    fn key_parse_roundtrip() {
        let key = StorageKey::new(ArtifactKind::Aggregation, 9, "204", "0.2.1");
        let parsed: StorageKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn key_parse_rejects_garbage() {
        assert!("gradient".parse::<StorageKey>().is_err());
        assert!("gradient-abc-1-v1".parse::<StorageKey>().is_err());
        assert!("weights-1-1-v1".parse::<StorageKey>().is_err());
        assert!("gradient-1-1".parse::<StorageKey>().is_err());
        assert!("gradient-1--v1".parse::<StorageKey>().is_err());
    }

    #[test]
    fn kind_from_str() {
        for kind in ArtifactKind::ALL {
            assert_eq!(kind.as_str().parse::<ArtifactKind>().unwrap(), kind);
        }
    }

    #[test]
    fn series_membership() {
        let key = StorageKey::new(ArtifactKind::Debug, 3, "5", "1");
        assert!(key.in_series("5", ArtifactKind::Debug, "1"));
        assert!(!key.in_series("5", ArtifactKind::Gradient, "1"));
        assert!(!key.in_series("6", ArtifactKind::Debug, "1"));
        assert!(!key.in_series("5", ArtifactKind::Debug, "2"));
    }
}
