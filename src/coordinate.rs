//! Maven artifact coordinates in the `group:artifact:version[:classifier]` form.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

use crate::error::DecodeError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactCoordinate {
    group_id: String,
    artifact_id: String,
    version: String,
    classifier: Option<String>,
}

impl ArtifactCoordinate {
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version: version.into(),
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    /// Decodes a raw queue message body.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(body).map_err(|_| DecodeError::NotUtf8 {
            raw: String::from_utf8_lossy(body).into_owned(),
        })?;
        text.parse()
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn classifier(&self) -> Option<&str> {
        self.classifier.as_deref()
    }

    /// Stable identity used as the key in every store.
    pub fn library_id(&self) -> String {
        self.to_string()
    }

    /// `org/acme/lib/1.0`, relative to a repository root.
    pub fn repository_dir(&self) -> String {
        format!(
            "{}/{}/{}",
            self.group_id.replace('.', "/"),
            self.artifact_id,
            self.version
        )
    }

    pub fn file_name(&self, extension: &str) -> String {
        match &self.classifier {
            Some(c) => format!("{}-{}-{c}.{extension}", self.artifact_id, self.version),
            None => format!("{}-{}.{extension}", self.artifact_id, self.version),
        }
    }

    pub fn jar_path(&self) -> String {
        format!("{}/{}", self.repository_dir(), self.file_name("jar"))
    }

    /// Gradle module metadata never carries a classifier.
    pub fn module_metadata_path(&self) -> String {
        format!(
            "{}/{}-{}.module",
            self.repository_dir(),
            self.artifact_id,
            self.version
        )
    }

    /// Recovers a coordinate from a jar laid out as
    /// `<root>/<group path>/<artifact>/<version>/<artifact>-<version>[-<classifier>].jar`.
    pub fn from_repository_path(root: &Path, jar_path: &Path) -> Option<Self> {
        let relative = jar_path.strip_prefix(root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        if parts.len() < 4 {
            return None;
        }

        let file_name = parts[parts.len() - 1];
        let version = parts[parts.len() - 2];
        let artifact_id = parts[parts.len() - 3];
        let group_id = parts[..parts.len() - 3].join(".");

        let stem = file_name.strip_suffix(".jar")?;
        let rest = stem.strip_prefix(&format!("{artifact_id}-{version}"))?;
        let classifier = match rest {
            "" => None,
            r => Some(r.strip_prefix('-')?.to_string()),
        };

        let coordinate = Self {
            group_id,
            artifact_id: artifact_id.to_string(),
            version: version.to_string(),
            classifier,
        };
        coordinate.validate().ok()?;
        Some(coordinate)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        let fields = [
            ("groupId", Some(self.group_id.as_str())),
            ("artifactId", Some(self.artifact_id.as_str())),
            ("version", Some(self.version.as_str())),
            ("classifier", self.classifier.as_deref()),
        ];
        for (field, value) in fields {
            let Some(value) = value else { continue };
            let traverses = value == "." || value == "..";
            let hollow_group = field == "groupId" && value.split('.').any(str::is_empty);
            if value.is_empty()
                || traverses
                || hollow_group
                || value.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\')
            {
                return Err(DecodeError::InvalidField {
                    raw: self.to_string(),
                    field,
                });
            }
        }
        Ok(())
    }
}

impl FromStr for ArtifactCoordinate {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let parts: Vec<&str> = raw.split(':').collect();
        let coordinate = match parts.as_slice() {
            [g, a, v] => Self::new(*g, *a, *v),
            [g, a, v, c] => Self::new(*g, *a, *v).with_classifier(*c),
            _ => {
                return Err(DecodeError::WrongArity {
                    raw: raw.to_string(),
                    parts: parts.len(),
                });
            }
        };
        coordinate.validate()?;
        Ok(coordinate)
    }
}

impl fmt::Display for ArtifactCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version)?;
        if let Some(c) = &self.classifier {
            write!(f, ":{c}")?;
        }
        Ok(())
    }
}

impl Serialize for ArtifactCoordinate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtifactCoordinate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parses_and_displays_with_and_without_classifier() {
        for raw in ["com.acme:lib:1.0", "com.acme:lib:1.0:sources", "  org.x:y:2.3.4-SNAPSHOT \n"] {
            let coord: ArtifactCoordinate = raw.parse().unwrap();
            let again: ArtifactCoordinate = coord.to_string().parse().unwrap();
            assert_eq!(coord, again);
        }

        let coord: ArtifactCoordinate = "com.acme:lib:1.0:sources".parse().unwrap();
        assert_eq!(coord.group_id(), "com.acme");
        assert_eq!(coord.artifact_id(), "lib");
        assert_eq!(coord.version(), "1.0");
        assert_eq!(coord.classifier(), Some("sources"));
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!(matches!(
            "not-a-coordinate".parse::<ArtifactCoordinate>(),
            Err(DecodeError::WrongArity { parts: 1, .. })
        ));
        assert!(matches!(
            "a::1.0".parse::<ArtifactCoordinate>(),
            Err(DecodeError::InvalidField { field: "artifactId", .. })
        ));
        assert!("a:b:c:d:e".parse::<ArtifactCoordinate>().is_err());
        assert!("a:b c:1".parse::<ArtifactCoordinate>().is_err());
    }

    #[test]
    fn rejects_fields_that_escape_the_repository_layout() {
        for (raw, bad) in [
            ("g:..:..", "artifactId"),
            ("g:lib:.", "version"),
            ("..:lib:1.0", "groupId"),
            ("com..acme:lib:1.0", "groupId"),
            ("com.acme.:lib:1.0", "groupId"),
            ("com.acme:lib:1.0:..", "classifier"),
            ("com.acme:lib\\x:1.0", "artifactId"),
        ] {
            match raw.parse::<ArtifactCoordinate>() {
                Err(DecodeError::InvalidField { field, .. }) => assert_eq!(field, bad, "{raw}"),
                other => panic!("{raw} should be rejected, got {other:?}"),
            }
        }
        assert!("org.example:lib:1.0..2".parse::<ArtifactCoordinate>().is_ok());
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        assert!(matches!(
            ArtifactCoordinate::decode(&[0xff, 0xfe, b':']),
            Err(DecodeError::NotUtf8 { .. })
        ));
        assert!(ArtifactCoordinate::decode(b"com.acme:lib:1.0").is_ok());
    }

    #[test]
    fn repository_layout_paths() {
        let coord = ArtifactCoordinate::new("org.apache.commons", "commons-lang3", "3.12.0");
        assert_eq!(
            coord.jar_path(),
            "org/apache/commons/commons-lang3/3.12.0/commons-lang3-3.12.0.jar"
        );
        assert_eq!(
            coord.module_metadata_path(),
            "org/apache/commons/commons-lang3/3.12.0/commons-lang3-3.12.0.module"
        );
        let sources = coord.clone().with_classifier("sources");
        assert!(sources.jar_path().ends_with("commons-lang3-3.12.0-sources.jar"));
    }

    #[test]
    fn from_repository_path_recovers_coordinate() {
        let root = PathBuf::from("/repo");
        let jar = root.join("org/example/demo/1.0/demo-1.0.jar");
        assert_eq!(
            ArtifactCoordinate::from_repository_path(&root, &jar),
            Some(ArtifactCoordinate::new("org.example", "demo", "1.0"))
        );

        let classified = root.join("org/example/demo/1.0/demo-1.0-tests.jar");
        assert_eq!(
            ArtifactCoordinate::from_repository_path(&root, &classified)
                .and_then(|c| c.classifier().map(str::to_string)),
            Some("tests".to_string())
        );

        let stray = root.join("org/example/demo/1.0/other.jar");
        assert_eq!(ArtifactCoordinate::from_repository_path(&root, &stray), None);
    }

    #[test]
    fn serde_uses_string_form() {
        let coord = ArtifactCoordinate::new("g", "a", "1");
        let json = serde_json::to_string(&coord).unwrap();
        assert_eq!(json, "\"g:a:1\"");
        let back: ArtifactCoordinate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, coord);
    }
}
