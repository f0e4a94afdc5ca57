//! Seeding the work queue: coordinate lists and local repository discovery.

use anyhow::Result;
use ignore::WalkBuilder;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use crate::coordinate::ArtifactCoordinate;
use crate::error::DecodeError;

/// Classifiers whose jars carry no classes worth measuring.
const SKIPPED_CLASSIFIERS: &[&str] = &["sources", "javadoc"];

pub fn default_m2_repository() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Failed to resolve home directory"))?;
    Ok(home.join(".m2").join("repository"))
}

pub fn scan_jars(base_path: &Path) -> Result<Vec<PathBuf>> {
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(base_path)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "jar") {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    Ok(rx.iter().collect())
}

/// Every artifact with a jar under `m2_repo`, sorted. Jars outside the
/// repository layout are ignored.
pub fn discover_coordinates(m2_repo: &Path) -> Result<Vec<ArtifactCoordinate>> {
    let found: BTreeSet<ArtifactCoordinate> = scan_jars(m2_repo)?
        .iter()
        .filter_map(|jar| ArtifactCoordinate::from_repository_path(m2_repo, jar))
        .filter(|c| {
            c.classifier()
                .is_none_or(|classifier| !SKIPPED_CLASSIFIERS.contains(&classifier))
        })
        .collect();
    Ok(found.into_iter().collect())
}

/// Parses a coordinate list, one per line. Blank lines and `#` comments are
/// skipped; bad lines are returned with their 1-based line number.
pub fn parse_coordinate_list(
    text: &str,
) -> (Vec<ArtifactCoordinate>, Vec<(usize, DecodeError)>) {
    let mut coordinates = Vec::new();
    let mut rejected = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.parse::<ArtifactCoordinate>() {
            Ok(c) => coordinates.push(c),
            Err(e) => rejected.push((idx + 1, e)),
        }
    }
    (coordinates, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn discovers_repository_jars() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let m2 = dir.path();
        touch(&m2.join("org/acme/lib/1.0/lib-1.0.jar"));
        touch(&m2.join("org/acme/lib/1.0/lib-1.0-sources.jar"));
        touch(&m2.join("org/acme/lib/1.0/lib-1.0-linux.jar"));
        touch(&m2.join("org/acme/lib/1.0/lib-1.0.pom"));
        touch(&m2.join("stray.jar"));

        let found: Vec<String> = discover_coordinates(m2)?
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(found, ["org.acme:lib:1.0", "org.acme:lib:1.0:linux"]);
        Ok(())
    }

    #[test]
    fn coordinate_list_skips_comments_and_reports_bad_lines() {
        let text = "# seed\ncom.acme:lib:1.0\n\nnot-a-coordinate\n  com.acme:core:2.0:jdk8  \n";
        let (ok, bad) = parse_coordinate_list(text);
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[1].classifier(), Some("jdk8"));
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].0, 4);
    }
}
