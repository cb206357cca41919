use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::core::domain::TestCase;

const SOURCE_EXTENSIONS: [&str; 4] = ["c", "cc", "cpp", "cxx"];

/// Optional `<stem>.toml` next to a fixture.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Sidecar {
    category: Option<String>,
    description: Option<String>,
}

/// Loads every C/C++ source directly under `dir`, sorted by file name.
pub fn load_corpus(dir: &Path) -> Result<Vec<TestCase>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading corpus directory {}", dir.display()))?;

    let mut sources: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("listing {}", dir.display()))?
            .path();
        let is_source = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext));
        if is_source && path.is_file() {
            sources.push(path);
        }
    }
    sources.sort();

    let mut seen = HashSet::new();
    let mut cases = Vec::with_capacity(sources.len());
    for source in sources {
        let Some(stem) = source.file_stem().and_then(|s| s.to_str()) else {
            bail!("fixture name is not valid UTF-8: {}", source.display());
        };
        if !seen.insert(stem.to_string()) {
            bail!(
                "two fixtures share the id {} (ids are file names without extension)",
                stem
            );
        }

        let sidecar = load_sidecar(&source.with_extension("toml"))?;
        let mut case = TestCase::new(stem, &source);
        case.category = sidecar.category;
        case.description = sidecar.description;
        cases.push(case);
    }

    tracing::info!(dir = %dir.display(), cases = cases.len(), "Loaded corpus");
    Ok(cases)
}

fn load_sidecar(path: &Path) -> Result<Sidecar> {
    if !path.exists() {
        return Ok(Sidecar::default());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_sources_sorted_with_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_shift.cpp"), "int main() {}").unwrap();
        std::fs::write(dir.path().join("a_null.c"), "int main() {}").unwrap();
        std::fs::write(
            dir.path().join("a_null.toml"),
            "category = \"CWE-476\"\ndescription = \"Null pointer dereference\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "notes").unwrap();

        let cases = load_corpus(dir.path()).unwrap();

        let ids: Vec<_> = cases.iter().map(|c| c.id.0.as_str()).collect();
        assert_eq!(ids, vec!["a_null", "b_shift"]);
        assert_eq!(cases[0].category.as_deref(), Some("CWE-476"));
        assert_eq!(cases[0].description.as_deref(), Some("Null pointer dereference"));
        assert_eq!(cases[1].category, None);
    }

    #[test]
    fn test_duplicate_stems_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("overflow.c"), "").unwrap();
        std::fs::write(dir.path().join("overflow.cpp"), "").unwrap();

        let err = load_corpus(dir.path()).unwrap_err();

        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_bad_sidecar_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.cpp"), "").unwrap();
        std::fs::write(dir.path().join("x.toml"), "severity = 3").unwrap();

        assert!(load_corpus(dir.path()).is_err());
    }

    #[test]
    fn test_shipped_corpus() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("corpus");

        let cases = load_corpus(&dir).unwrap();

        let ids: Vec<_> = cases.iter().map(|c| c.id.0.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "test_CWE190_Juliet_Overflow",
                "test_accumulate",
                "test_dereference",
                "test_loop_overflow",
                "test_shift",
            ]
        );
        assert!(cases.iter().all(|c| c.category.is_some()));
    }
}
