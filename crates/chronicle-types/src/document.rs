//! Immutable output artifacts and the drafts agents hand back.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunId;
use crate::window::WindowKey;
use crate::{ChronicleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Post,
    Profile,
    Announcement,
    Journal,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Post => "post",
            DocumentKind::Profile => "profile",
            DocumentKind::Announcement => "announcement",
            DocumentKind::Journal => "journal",
        }
    }

    /// Profiles and announcements are routed by the subject they describe.
    pub fn requires_subject(&self) -> bool {
        matches!(self, DocumentKind::Profile | DocumentKind::Announcement)
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = ChronicleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "post" => Ok(DocumentKind::Post),
            "profile" => Ok(DocumentKind::Profile),
            "announcement" => Ok(DocumentKind::Announcement),
            "journal" => Ok(DocumentKind::Journal),
            other => Err(ChronicleError::InvalidArtifact {
                slug: String::new(),
                reason: format!("unknown document kind '{other}'"),
            }),
        }
    }
}

/// Lowercase, hyphen-separated, at most 64 characters.
pub fn slugify(text: &str) -> String {
    static NON_ALNUM: OnceLock<Regex> = OnceLock::new();
    let re = NON_ALNUM.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern is valid"));
    let lowered = text.to_lowercase();
    let slug = re.replace_all(&lowered, "-");
    let mut slug: String = slug.trim_matches('-').chars().take(64).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

// ---------------------------------------------------------------------------
// DraftArtifact: what a generation agent returns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftArtifact {
    pub kind: DocumentKind,
    /// Explicit slug; derived from the title when absent.
    #[serde(default)]
    pub slug: Option<String>,
    pub title: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl DraftArtifact {
    pub fn post(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: DocumentKind::Post,
            slug: None,
            title: title.into(),
            subject: None,
            body: body.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn profile(
        subject: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind: DocumentKind::Profile,
            subject: Some(subject.into()),
            ..Self::post(title, body)
        }
    }

    pub fn announcement(
        subject: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind: DocumentKind::Announcement,
            subject: Some(subject.into()),
            ..Self::post(title, body)
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn resolved_slug(&self) -> String {
        match &self.slug {
            Some(slug) => slugify(slug),
            None => slugify(&self.title),
        }
    }

    /// Journals are written by the checkpoint journal only, and subject-routed
    /// kinds must name their subject.
    pub fn validate(&self) -> Result<()> {
        if self.kind == DocumentKind::Journal {
            return Err(ChronicleError::InvalidArtifact {
                slug: self.resolved_slug(),
                reason: "agents may not emit journal documents".into(),
            });
        }
        let has_subject = self.subject.as_deref().is_some_and(|s| !s.trim().is_empty());
        if self.kind.requires_subject() && !has_subject {
            return Err(ChronicleError::InvalidArtifact {
                slug: self.resolved_slug(),
                reason: format!("{} documents require a subject", self.kind),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Document: persisted, append-only
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub kind: DocumentKind,
    pub tenant_id: String,
    pub source: String,
    pub slug: String,
    pub title: String,
    pub subject: Option<String>,
    pub body: String,
    pub metadata: serde_json::Value,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub produced_by: RunId,
}

impl Document {
    /// Materialise a validated draft produced for `window` by `run`.
    pub fn from_draft(draft: DraftArtifact, window: &WindowKey, run: RunId) -> Result<Self> {
        draft.validate()?;
        let slug = draft.resolved_slug();
        Ok(Self {
            id: Uuid::new_v4(),
            kind: draft.kind,
            tenant_id: window.tenant_id.clone(),
            source: window.source.clone(),
            slug,
            title: draft.title,
            subject: draft.subject,
            body: draft.body,
            metadata: draft.metadata,
            window_start: Some(window.start),
            window_end: Some(window.end),
            created_at: crate::table::truncate_to_micros(Utc::now()),
            produced_by: run,
        })
    }

    /// The completion marker for `window`, summarising what was written.
    pub fn journal(window: &WindowKey, run: RunId, artifacts: &[Document]) -> Self {
        let count = |kind: DocumentKind| artifacts.iter().filter(|d| d.kind == kind).count();
        let start = window.start.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true);
        let end = window.end.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true);
        let body = format!(
            "Window {start} to {end}\n\nposts: {}\nprofiles: {}\nannouncements: {}\n",
            count(DocumentKind::Post),
            count(DocumentKind::Profile),
            count(DocumentKind::Announcement),
        );
        let metadata = serde_json::json!({
            "window_start": start,
            "window_end": end,
            "artifacts": artifacts.iter().map(|d| d.slug.clone()).collect::<Vec<_>>(),
        });
        Self {
            id: Uuid::new_v4(),
            kind: DocumentKind::Journal,
            tenant_id: window.tenant_id.clone(),
            source: window.source.clone(),
            slug: format!(
                "journal-{}-{}",
                window.start.format("%Y%m%dT%H%M%S%.6f"),
                window.end.format("%Y%m%dT%H%M%S%.6f")
            ),
            title: format!("Journal {start}"),
            subject: None,
            body,
            metadata,
            window_start: Some(window.start),
            window_end: Some(window.end),
            created_at: crate::table::truncate_to_micros(Utc::now()),
            produced_by: run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> WindowKey {
        WindowKey {
            tenant_id: "acme".into(),
            source: "chat".into(),
            start: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn slugify_normalises() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("  --Weekly   Recap--  "), "weekly-recap");
        assert_eq!(slugify("!!!"), "untitled");
        assert!(slugify(&"a ".repeat(100)).len() <= 64);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            DocumentKind::Post,
            DocumentKind::Profile,
            DocumentKind::Announcement,
            DocumentKind::Journal,
        ] {
            assert_eq!(kind.as_str().parse::<DocumentKind>().unwrap(), kind);
        }
        assert!("memo".parse::<DocumentKind>().is_err());
    }

    #[test]
    fn profile_requires_subject() {
        let mut draft = DraftArtifact::profile("author-1", "About author 1", "body");
        assert!(draft.validate().is_ok());
        draft.subject = Some("  ".into());
        assert!(matches!(
            draft.validate(),
            Err(ChronicleError::InvalidArtifact { .. })
        ));
    }

    #[test]
    fn journal_drafts_are_rejected() {
        let draft = DraftArtifact {
            kind: DocumentKind::Journal,
            ..DraftArtifact::post("j", "b")
        };
        assert!(draft.validate().is_err());
    }

    #[test]
    fn from_draft_carries_window_and_run() {
        let run = RunId::new();
        let doc = Document::from_draft(DraftArtifact::post("Daily Recap", "..."), &key(), run).unwrap();
        assert_eq!(doc.slug, "daily-recap");
        assert_eq!(doc.produced_by, run);
        assert_eq!(doc.window_start, Some(key().start));
        assert_eq!(doc.tenant_id, "acme");
    }

    #[test]
    fn journal_records_exact_bounds() {
        let run = RunId::new();
        let post = Document::from_draft(DraftArtifact::post("p", "b"), &key(), run).unwrap();
        let journal = Document::journal(&key(), run, &[post]);
        assert_eq!(journal.kind, DocumentKind::Journal);
        assert_eq!(journal.window_start, Some(key().start));
        assert_eq!(journal.window_end, Some(key().end));
        assert_eq!(journal.metadata["window_start"], "2024-03-01T00:00:00Z");
        assert!(journal.body.contains("posts: 1"));
    }
}
