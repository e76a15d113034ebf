use serde::{Deserialize, Serialize};

use crate::parser::ForwardMeta;

/// One harvested post.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    /// Site-assigned id, globally unique (e.g. `M_AbCdEf123`).
    pub id: String,
    pub user_id: String,
    /// Free-form site timestamp string, not strictly normalized.
    pub created_at: Option<String>,
    pub text: Option<String>,
    /// Client label ("via iPhone" style).
    pub source: Option<String>,
    pub reposts_count: i64,
    pub comments_count: i64,
    pub attitudes_count: i64,
    /// Tri-state: NULL = unknown, 0 = original, 1 = retweet.
    pub is_retweet: Option<i64>,
    pub is_truncated: i64,
    pub retweet_category: Option<String>,
    pub detail_fetched: i64,
    /// Serialized [`PostExtra`].
    pub extra_json: Option<String>,
    pub fetched_at: Option<String>,
}

/// Short projection used by the detail phase.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PostBrief {
    pub id: String,
    pub text: Option<String>,
    pub is_retweet: Option<i64>,
    pub detail_fetched: i64,
    pub extra_json: Option<String>,
}

/// Typed extension record, stored serialized in `posts.extra_json`.
///
/// Fields that do not warrant a column of their own live here so they can be
/// enriched without a schema migration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostExtra {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub detail_missing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_missing_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_with_links: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_meta: Option<ForwardMeta>,
}

impl PostExtra {
    /// Parse from a stored column value; malformed or absent JSON yields the
    /// default record rather than failing enrichment.
    #[must_use]
    pub fn from_json(raw: Option<&str>) -> Self {
        raw.and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    /// Serialize for storage.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Authoritative post classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetweetCategory {
    Original,
    Retweet,
    LongComment,
    /// Assigned by the offline text heuristic, not a detail fetch.
    OriginalHeuristic,
    RetweetHeuristic,
}

impl RetweetCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Retweet => "retweet",
            Self::LongComment => "long_comment",
            Self::OriginalHeuristic => "original_heuristic",
            Self::RetweetHeuristic => "retweet_heuristic",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "original" => Some(Self::Original),
            "retweet" => Some(Self::Retweet),
            "long_comment" => Some(Self::LongComment),
            "original_heuristic" => Some(Self::OriginalHeuristic),
            "retweet_heuristic" => Some(Self::RetweetHeuristic),
            _ => None,
        }
    }

    /// Boolean projection stored in `is_retweet`: a long comment counts as
    /// original content.
    #[must_use]
    pub fn is_retweet(self) -> bool {
        matches!(self, Self::Retweet | Self::RetweetHeuristic)
    }
}

/// Enrichment lifecycle of a post.
///
/// Both enriched states are terminal: once a post is enriched or marked
/// permanently missing, the detail phase never selects it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentState {
    Unenriched,
    Enriched,
    PermanentlyMissing,
}

impl EnrichmentState {
    #[must_use]
    pub fn of(brief: &PostBrief) -> Self {
        if brief.detail_fetched == 0 {
            return Self::Unenriched;
        }
        if PostExtra::from_json(brief.extra_json.as_deref()).detail_missing {
            Self::PermanentlyMissing
        } else {
            Self::Enriched
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Unenriched)
    }
}

/// Data for inserting a newly sighted post (list phase).
#[derive(Debug, Clone)]
pub struct NewPost {
    pub id: String,
    pub user_id: String,
    pub created_at: Option<String>,
    pub text: String,
    pub source: Option<String>,
    pub reposts_count: i64,
    pub comments_count: i64,
    pub attitudes_count: i64,
    pub is_retweet: bool,
    pub is_truncated: bool,
    pub retweet_category: RetweetCategory,
    pub extra: PostExtra,
}

/// Partial update for the enrichable columns of a post.
///
/// The set of expressible fields *is* the allow-list: anything outside it
/// cannot be written through this type, so an out-of-contract update is a
/// compile error rather than a runtime surprise. An empty patch is a no-op.
#[derive(Debug, Clone, Default)]
pub struct PostPatch {
    pub text: Option<String>,
    pub extra_json: Option<String>,
    pub is_retweet: Option<bool>,
    pub is_truncated: Option<bool>,
    pub retweet_category: Option<RetweetCategory>,
    pub detail_fetched: Option<bool>,
    pub fetched_at: Option<String>,
}

impl PostPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.extra_json.is_none()
            && self.is_retweet.is_none()
            && self.is_truncated.is_none()
            && self.retweet_category.is_none()
            && self.detail_fetched.is_none()
            && self.fetched_at.is_none()
    }
}

/// A media row (image or video) referenced by a post.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MediaRow {
    pub id: i64,
    pub post_id: String,
    pub url: String,
    pub local_path: Option<String>,
}

impl MediaRow {
    /// Downloaded-ness is derived from the presence of a local path.
    #[must_use]
    pub fn is_downloaded(&self) -> bool {
        self.local_path.as_deref().is_some_and(|p| !p.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips() {
        for cat in [
            RetweetCategory::Original,
            RetweetCategory::Retweet,
            RetweetCategory::LongComment,
            RetweetCategory::OriginalHeuristic,
            RetweetCategory::RetweetHeuristic,
        ] {
            assert_eq!(RetweetCategory::from_str(cat.as_str()), Some(cat));
        }
        assert_eq!(RetweetCategory::from_str("bogus"), None);
    }

    #[test]
    fn long_comment_projects_to_original() {
        assert!(!RetweetCategory::LongComment.is_retweet());
        assert!(RetweetCategory::Retweet.is_retweet());
    }

    #[test]
    fn extra_json_tolerates_garbage() {
        let extra = PostExtra::from_json(Some("not json"));
        assert!(!extra.detail_missing);
        assert!(PostExtra::from_json(None).html_with_links.is_none());
    }

    #[test]
    fn enrichment_state_derivation() {
        let mut brief = PostBrief {
            id: "M_1".to_string(),
            text: None,
            is_retweet: None,
            detail_fetched: 0,
            extra_json: None,
        };
        assert_eq!(EnrichmentState::of(&brief), EnrichmentState::Unenriched);

        brief.detail_fetched = 1;
        assert_eq!(EnrichmentState::of(&brief), EnrichmentState::Enriched);

        brief.extra_json = Some(
            PostExtra {
                detail_missing: true,
                detail_missing_reason: Some("missing_or_deleted".to_string()),
                ..PostExtra::default()
            }
            .to_json(),
        );
        let state = EnrichmentState::of(&brief);
        assert_eq!(state, EnrichmentState::PermanentlyMissing);
        assert!(state.is_terminal());
    }
}
