//! Core domain model for the competency taxonomy reconciler.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ctr-core";

/// Hard limit on persisted display names, ellipsis included.
pub const DISPLAY_NAME_MAX: usize = 100;
/// Qualifier short form appended to shortnames is capped separately.
pub const QUALIFIER_SHORT_MAX: usize = 40;
/// Joiner between the edu-level, school-type and subject titles of a framework.
pub const PATH_JOINER: &str = " >> ";

/// Composite key identifying a node in the upstream taxonomy.
///
/// The pair is immutable once issued upstream and is unique within a node
/// type. Local primary keys live in a different namespace entirely; the
/// mapping store bridges the two.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalKey {
    pub source_id: String,
    pub item_id: i64,
}

impl ExternalKey {
    pub fn new(source_id: impl Into<String>, item_id: i64) -> Self {
        Self {
            source_id: source_id.into(),
            item_id,
        }
    }

    /// Stable internal identifier stamped on tree nodes as `idnumber`.
    ///
    /// Derived as the hex MD5 of `"{source_id}_{item_id}"`, so the same
    /// upstream node always resolves to the same idnumber regardless of
    /// local primary keys.
    pub fn internal_key(&self) -> String {
        format!("{:x}", md5::compute(format!("{}_{}", self.source_id, self.item_id)))
    }
}

impl fmt::Display for ExternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.source_id, self.item_id)
    }
}

/// Node kind a mapping row refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Framework,
    Subject,
    Topic,
    Descriptor,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Framework => "framework",
            NodeType::Subject => "subject",
            NodeType::Topic => "topic",
            NodeType::Descriptor => "descriptor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "framework" => Some(NodeType::Framework),
            "subject" => Some(NodeType::Subject),
            "topic" => Some(NodeType::Topic),
            "descriptor" => Some(NodeType::Descriptor),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted correspondence between an upstream key and an internal node id.
///
/// Unique on `(node_type, source_id, item_id)`. Timestamps are epoch seconds
/// to match the relational schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: i64,
    pub node_type: NodeType,
    pub source_id: String,
    pub item_id: i64,
    pub internal_id: i64,
    pub time_created: i64,
    pub time_modified: i64,
}

impl Mapping {
    pub fn external_key(&self) -> ExternalKey {
        ExternalKey::new(self.source_id.clone(), self.item_id)
    }
}

/// Proficiency-level qualifier rendered as a bracketed suffix on descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qualifier {
    pub title: String,
}

/// One level of a framework's synthetic path (edu-level, school-type, subject).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    pub key: ExternalKey,
    pub title: String,
}

/// Canonical framework record: a 3-level upstream path collapsed into one
/// framework whose deepest segment doubles as the subject node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkRecord {
    /// Key of the deepest path segment; identifies the framework as a whole.
    pub key: ExternalKey,
    pub segments: Vec<PathSegment>,
    pub display_name: String,
    pub topics: Vec<TopicRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRecord {
    pub key: ExternalKey,
    pub title: String,
    pub description: String,
    pub sorting: i64,
    pub descriptors: Vec<DescriptorRecord>,
}

/// A competency statement under a topic. `children` nests exactly one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorRecord {
    pub key: ExternalKey,
    pub title: String,
    pub description: String,
    pub sorting: i64,
    pub qualifier: Option<Qualifier>,
    pub children: Vec<DescriptorRecord>,
}

/// The whole extracted upstream document, ready for reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomySnapshot {
    pub frameworks: Vec<FrameworkRecord>,
}

impl TaxonomySnapshot {
    /// Keys of every node a framework contributes, the framework itself
    /// included. Used to freeze disabled frameworks out of retirement.
    pub fn keys_of_framework(record: &FrameworkRecord) -> Vec<(NodeType, ExternalKey)> {
        let mut keys = Vec::new();
        for (level, segment) in record.segments.iter().enumerate() {
            let node_type = if level == 0 {
                NodeType::Framework
            } else {
                NodeType::Subject
            };
            keys.push((node_type, segment.key.clone()));
        }
        for topic in &record.topics {
            keys.push((NodeType::Topic, topic.key.clone()));
            for descriptor in &topic.descriptors {
                keys.push((NodeType::Descriptor, descriptor.key.clone()));
                for child in &descriptor.children {
                    keys.push((NodeType::Descriptor, child.key.clone()));
                }
            }
        }
        keys
    }
}

/// Truncate a display value to `max` characters, ellipsis included.
pub fn truncate_display(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = value.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Shortname for a descriptor: title truncated to the display limit, with the
/// qualifier's short form appended so the combined result stays within the
/// limit.
pub fn annotated_shortname(title: &str, qualifier: Option<&Qualifier>) -> String {
    match qualifier {
        None => truncate_display(title, DISPLAY_NAME_MAX),
        Some(q) => {
            let short = truncate_display(&q.title, QUALIFIER_SHORT_MAX);
            let reserved = short.chars().count() + 3;
            let base = truncate_display(title, DISPLAY_NAME_MAX.saturating_sub(reserved));
            format!("{base} ({short})")
        }
    }
}

/// Description for a persisted node: falls back to the title when the
/// upstream description is empty, and carries the qualifier's long form.
pub fn annotated_description(description: &str, title: &str, qualifier: Option<&Qualifier>) -> String {
    let base = if description.trim().is_empty() {
        title
    } else {
        description
    };
    match qualifier {
        None => base.to_string(),
        Some(q) => format!("{base} ({})", q.title),
    }
}

/// Framework display name from its path segment titles.
pub fn joined_display_name(segments: &[PathSegment]) -> String {
    segments
        .iter()
        .map(|s| s.title.as_str())
        .collect::<Vec<_>>()
        .join(PATH_JOINER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_key_is_stable_across_runs() {
        let key = ExternalKey::new("komet", 42);
        assert_eq!(key.internal_key(), key.internal_key());
        // Known digest of "komet_42"; any change here breaks idnumber
        // continuity for every deployed mapping.
        assert_eq!(key.internal_key(), format!("{:x}", md5::compute("komet_42")));
        assert_eq!(key.internal_key().len(), 32);
    }

    #[test]
    fn internal_keys_differ_between_items() {
        let a = ExternalKey::new("komet", 1);
        let b = ExternalKey::new("komet", 2);
        assert_ne!(a.internal_key(), b.internal_key());
    }

    #[test]
    fn truncation_keeps_short_values_untouched() {
        assert_eq!(truncate_display("Mathematik", DISPLAY_NAME_MAX), "Mathematik");
    }

    #[test]
    fn truncation_counts_the_ellipsis() {
        let long = "x".repeat(140);
        let truncated = truncate_display(&long, DISPLAY_NAME_MAX);
        assert_eq!(truncated.chars().count(), DISPLAY_NAME_MAX);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn qualifier_suffix_never_exceeds_display_limit() {
        let title = "t".repeat(120);
        let qualifier = Qualifier {
            title: "Grundstufe".to_string(),
        };
        let shortname = annotated_shortname(&title, Some(&qualifier));
        assert!(shortname.chars().count() <= DISPLAY_NAME_MAX);
        assert!(shortname.ends_with("(Grundstufe)"));
    }

    #[test]
    fn qualifier_short_form_is_capped_at_forty() {
        let qualifier = Qualifier {
            title: "q".repeat(60),
        };
        let shortname = annotated_shortname("Listening comprehension", Some(&qualifier));
        assert!(shortname.chars().count() <= DISPLAY_NAME_MAX);
        let open = shortname.find('(').expect("suffix present");
        // 40 chars of qualifier plus the parentheses.
        assert_eq!(shortname[open..].chars().count(), QUALIFIER_SHORT_MAX + 2);
    }

    #[test]
    fn description_falls_back_to_title() {
        assert_eq!(annotated_description("", "Reading", None), "Reading");
        assert_eq!(annotated_description("  ", "Reading", None), "Reading");
        assert_eq!(annotated_description("Full text", "Reading", None), "Full text");
    }

    #[test]
    fn description_carries_long_qualifier_form() {
        let qualifier = Qualifier {
            title: "Grundstufe vertieft".to_string(),
        };
        assert_eq!(
            annotated_description("Full text", "Reading", Some(&qualifier)),
            "Full text (Grundstufe vertieft)"
        );
    }

    #[test]
    fn display_name_joins_segments() {
        let segments = vec![
            PathSegment {
                key: ExternalKey::new("komet", 1),
                title: "Sek 1".into(),
            },
            PathSegment {
                key: ExternalKey::new("komet", 2),
                title: "AHS".into(),
            },
            PathSegment {
                key: ExternalKey::new("komet", 3),
                title: "Deutsch (3a)".into(),
            },
        ];
        assert_eq!(joined_display_name(&segments), "Sek 1 >> AHS >> Deutsch (3a)");
    }

    #[test]
    fn framework_key_listing_covers_every_level() {
        let record = FrameworkRecord {
            key: ExternalKey::new("komet", 3),
            segments: vec![
                PathSegment {
                    key: ExternalKey::new("komet", 1),
                    title: "Sek 1".into(),
                },
                PathSegment {
                    key: ExternalKey::new("komet", 3),
                    title: "Deutsch".into(),
                },
            ],
            display_name: "Sek 1 >> Deutsch".into(),
            topics: vec![TopicRecord {
                key: ExternalKey::new("komet", 10),
                title: "Lesen".into(),
                description: String::new(),
                sorting: 1,
                descriptors: vec![DescriptorRecord {
                    key: ExternalKey::new("komet", 100),
                    title: "D1".into(),
                    description: "desc".into(),
                    sorting: 0,
                    qualifier: None,
                    children: vec![DescriptorRecord {
                        key: ExternalKey::new("komet", 101),
                        title: "D1a".into(),
                        description: "desc".into(),
                        sorting: 0,
                        qualifier: None,
                        children: Vec::new(),
                    }],
                }],
            }],
        };

        let keys = TaxonomySnapshot::keys_of_framework(&record);
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[0].0, NodeType::Framework);
        assert_eq!(keys[1].0, NodeType::Subject);
        assert_eq!(keys[2].0, NodeType::Topic);
        assert_eq!(keys[3].0, NodeType::Descriptor);
        assert_eq!(keys[4].0, NodeType::Descriptor);
    }
}
