use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use crate::error::SyncError;
use crate::fingerprint::fingerprint;

/// Front-matter key/value pairs, ordered by key.
pub type Metadata = BTreeMap<String, Value>;

/// Statuses that keep a document out of the publish queue.
const UNREADY_STATUSES: &[&str] = &["draft", "wip"];

/// Front-matter keys that opt a document out of publishing when `false`.
const OPT_OUT_KEYS: &[&str] = &["publish", "notion"];

/// A local Markdown document with optional YAML front-matter.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: PathBuf,
    pub raw_content: String,
    pub metadata: Metadata,
    pub body: String,
    pub title: String,
    /// Set when the front-matter block exists but could not be parsed.
    pub front_matter_error: Option<String>,
}

/// Whether a document should be handed to the publish pipeline at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
}

impl Document {
    /// Parse raw file content into a document.
    ///
    /// Malformed front-matter does not fail the parse; the error is kept in
    /// `front_matter_error` and the metadata is left empty.
    pub fn parse(path: impl Into<PathBuf>, raw_content: impl Into<String>) -> Self {
        let path = path.into();
        let raw_content = raw_content.into();

        let (metadata, body, front_matter_error) = match split_front_matter(&raw_content) {
            Some((yaml, body)) => match parse_metadata(yaml) {
                Ok(metadata) => (metadata, body.to_string(), None),
                Err(e) => (Metadata::new(), body.to_string(), Some(e)),
            },
            None => (Metadata::new(), raw_content.clone(), None),
        };

        let title = resolve_title(&path, &metadata, &body);

        Self {
            path,
            raw_content,
            metadata,
            body,
            title,
            front_matter_error,
        }
    }

    /// Read and parse a document from disk.
    ///
    /// The stored path is canonical, so every spelling of one file maps to the
    /// same lifecycle key.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            SyncError::Io(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let canonical = match tokio::fs::canonicalize(path).await {
            Ok(canonical) => canonical,
            Err(_) => absolute_path(path)?,
        };
        Ok(Self::parse(canonical, raw))
    }

    /// Stable string key used by the lifecycle store and the lock manager.
    pub fn key(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    /// Content fingerprint over title, metadata and normalized body.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.title, &self.metadata, &self.body)
    }

    /// String value of a metadata key, trimmed; `None` when absent or empty.
    pub fn meta_str(&self, key: &str) -> Option<String> {
        match self.metadata.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// The report type (`daily`, `weekly`, ...), if declared.
    pub fn doc_type(&self) -> Option<String> {
        self.meta_str("type")
    }

    pub fn status(&self) -> Option<String> {
        self.meta_str("status")
    }

    /// Decide whether this document may be published.
    pub fn readiness(&self) -> Readiness {
        for key in OPT_OUT_KEYS {
            let opted_out = match self.metadata.get(*key) {
                Some(Value::Bool(false)) => true,
                Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "false" | "no"),
                _ => false,
            };
            if opted_out {
                return Readiness::NotReady("opted_out".to_string());
            }
        }

        if let Some(status) = self.status() {
            let status = status.to_lowercase();
            if UNREADY_STATUSES.contains(&status.as_str()) {
                return Readiness::NotReady(format!("status_{}", status));
            }
        }

        Readiness::Ready
    }

    pub fn is_ready_for_sync(&self) -> bool {
        self.readiness() == Readiness::Ready
    }
}

/// Absolute, lexically cleaned form of `path` (`.` dropped, `..` folded).
fn absolute_path(path: &Path) -> Result<PathBuf, SyncError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| SyncError::Io(format!("Failed to read current dir: {}", e)))?
            .join(path)
    };

    let mut cleaned = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    Ok(cleaned)
}

/// Split `---` delimited front-matter from the body.
fn split_front_matter(raw: &str) -> Option<(&str, &str)> {
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let rest = raw
        .strip_prefix("---\r\n")
        .or_else(|| raw.strip_prefix("---\n"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

fn parse_metadata(yaml: &str) -> Result<Metadata, String> {
    if yaml.trim().is_empty() {
        return Ok(Metadata::new());
    }
    serde_yaml::from_str::<Option<Metadata>>(yaml)
        .map(Option::unwrap_or_default)
        .map_err(|e| format!("Invalid front-matter: {}", e))
}

fn resolve_title(path: &Path, metadata: &Metadata, body: &str) -> String {
    if let Some(Value::String(title)) = metadata.get("title") {
        if !title.trim().is_empty() {
            return title.trim().to_string();
        }
    }

    if let Some(heading) = body
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
    {
        if !heading.trim().is_empty() {
            return heading.trim().to_string();
        }
    }

    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Untitled".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DAILY: &str = "---\ntitle: Daily Brief\ntype: daily\ntags: [btc, macro]\ndate: 2024-03-05\nstatus: ready\n---\n# Ignored Heading\n\nMarkets were calm.\n";

    #[test]
    fn test_parse_front_matter() {
        let doc = Document::parse("reports/daily.md", DAILY);
        assert_eq!(doc.title, "Daily Brief");
        assert_eq!(doc.doc_type().as_deref(), Some("daily"));
        assert_eq!(doc.metadata.get("tags"), Some(&json!(["btc", "macro"])));
        assert_eq!(doc.meta_str("date").as_deref(), Some("2024-03-05"));
        assert!(doc.body.starts_with("# Ignored Heading"));
        assert!(doc.front_matter_error.is_none());
    }

    #[test]
    fn test_title_falls_back_to_heading_then_stem() {
        let doc = Document::parse("notes/weekly-outlook.md", "# Weekly Outlook\n\ntext");
        assert_eq!(doc.title, "Weekly Outlook");

        let doc = Document::parse("notes/weekly-outlook.md", "no heading here");
        assert_eq!(doc.title, "weekly-outlook");
    }

    #[test]
    fn test_no_front_matter_keeps_body() {
        let doc = Document::parse("a.md", "plain body\n---\nnot yaml");
        assert!(doc.metadata.is_empty());
        assert_eq!(doc.body, "plain body\n---\nnot yaml");
    }

    #[test]
    fn test_malformed_front_matter_is_recorded() {
        let doc = Document::parse("a.md", "---\ntags: [unclosed\n---\nbody");
        assert!(doc.front_matter_error.is_some());
        assert!(doc.metadata.is_empty());
        assert_eq!(doc.body, "body");
    }

    #[test]
    fn test_empty_front_matter() {
        let doc = Document::parse("a.md", "---\n---\nbody");
        assert!(doc.front_matter_error.is_none());
        assert_eq!(doc.body, "body");
    }

    #[test]
    fn test_draft_is_not_ready() {
        let doc = Document::parse("a.md", "---\nstatus: Draft\n---\nbody");
        match doc.readiness() {
            Readiness::NotReady(reason) => assert!(reason.contains("draft")),
            Readiness::Ready => panic!("draft document must not be ready"),
        }
        assert!(!doc.is_ready_for_sync());
    }

    #[test]
    fn test_opt_out() {
        let doc = Document::parse("a.md", "---\npublish: false\nstatus: ready\n---\nbody");
        assert_eq!(doc.readiness(), Readiness::NotReady("opted_out".to_string()));

        let doc = Document::parse("a.md", "---\nnotion: \"no\"\n---\nbody");
        assert_eq!(doc.readiness(), Readiness::NotReady("opted_out".to_string()));
    }

    #[test]
    fn test_published_status_is_ready() {
        let doc = Document::parse("a.md", "---\nstatus: published\n---\nbody");
        assert!(doc.is_ready_for_sync());
    }

    #[test]
    fn test_absolute_path_is_cleaned() {
        assert_eq!(
            absolute_path(Path::new("/data/./reports/../reports/daily.md")).unwrap(),
            PathBuf::from("/data/reports/daily.md")
        );
        assert!(absolute_path(Path::new("reports/daily.md"))
            .unwrap()
            .is_absolute());
    }

    #[tokio::test]
    async fn test_load_uses_one_key_for_every_spelling() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("daily.md"), DAILY).unwrap();

        let plain = Document::load(dir.path().join("daily.md")).await.unwrap();
        let dotted = Document::load(dir.path().join("./daily.md")).await.unwrap();
        let parent = Document::load(dir.path().join("sub/../daily.md")).await.unwrap();

        assert_eq!(plain.key(), dotted.key());
        assert_eq!(plain.key(), parent.key());
        assert!(plain.path.is_absolute());
    }

    #[test]
    fn test_fingerprint_tracks_body() {
        let a = Document::parse("a.md", DAILY);
        let b = Document::parse("a.md", DAILY.replace("calm", "calm!"));
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), Document::parse("b.md", DAILY).fingerprint());
    }
}
