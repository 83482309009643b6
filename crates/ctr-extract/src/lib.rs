//! Taxonomy extraction: the upstream XML snapshot into canonical records.
//!
//! The upstream document is a four-level hierarchy (edu-level, school-type,
//! subject, topic) plus a flat descriptor pool that topics reference by
//! external key. Extraction collapses the first three levels into synthetic
//! framework records and resolves descriptor references eagerly, so the
//! reconciler never touches XML.

use std::collections::{HashMap, HashSet};

use ctr_core::{
    joined_display_name, DescriptorRecord, ExternalKey, FrameworkRecord, PathSegment, Qualifier,
    TaxonomySnapshot, TopicRecord,
};
use roxmltree::{Document, Node};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ctr-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The document cannot be parsed at all; nothing can be salvaged.
    #[error("unparsable upstream document: {0}")]
    Document(#[from] roxmltree::Error),
    /// A node is missing an expected substructure or carries a malformed
    /// value. Aborts the run; reconciling a partial tree would retire nodes
    /// that still exist upstream.
    #[error("malformed upstream structure at {at}: {detail}")]
    Structure { at: String, detail: String },
}

impl ExtractError {
    fn structure(at: impl Into<String>, detail: impl Into<String>) -> Self {
        ExtractError::Structure {
            at: at.into(),
            detail: detail.into(),
        }
    }
}

/// Parse the raw document text into a navigable tree.
pub fn parse_document(text: &str) -> Result<Document<'_>, ExtractError> {
    Ok(Document::parse(text)?)
}

/// Lookup tables for the bracketed qualifier suffixes. A descriptor's
/// `niveauid` takes precedence over its `skillid` when both resolve.
#[derive(Debug, Default, Clone)]
pub struct QualifierTables {
    niveaus: HashMap<ExternalKey, String>,
    skills: HashMap<ExternalKey, String>,
}

impl QualifierTables {
    pub fn resolve(
        &self,
        niveau: Option<&ExternalKey>,
        skill: Option<&ExternalKey>,
    ) -> Option<Qualifier> {
        if let Some(title) = niveau.and_then(|k| self.niveaus.get(k)) {
            return Some(Qualifier {
                title: title.clone(),
            });
        }
        skill
            .and_then(|k| self.skills.get(k))
            .map(|title| Qualifier {
                title: title.clone(),
            })
    }
}

/// Extract the whole document into an owned snapshot.
pub fn extract_snapshot(text: &str) -> Result<TaxonomySnapshot, ExtractError> {
    let doc = parse_document(text)?;
    let qualifiers = extract_qualifiers(&doc)?;
    let pool = extract_descriptors(&doc, None, &qualifiers)?;
    let frameworks = extract_frameworks(&doc, &pool)?;
    debug!(
        frameworks = frameworks.len(),
        descriptors = pool.len(),
        "extracted upstream snapshot"
    );
    Ok(TaxonomySnapshot { frameworks })
}

/// Walk `edulevels / schooltypes / subjects` into framework records, each
/// carrying its ordered path segments and fully resolved topics.
pub fn extract_frameworks(
    doc: &Document<'_>,
    pool: &HashMap<ExternalKey, DescriptorRecord>,
) -> Result<Vec<FrameworkRecord>, ExtractError> {
    let root = doc.root_element();
    let edulevels = collection(root, "edulevels")
        .ok_or_else(|| ExtractError::structure(root.tag_name().name(), "no edulevels collection"))?;

    let mut frameworks = Vec::new();
    for edulevel in element_children(edulevels) {
        let edulevel_key = external_key(edulevel)?;
        let edulevel_title = text_of(edulevel, "title");
        let schooltypes = collection(edulevel, "schooltypes").ok_or_else(|| {
            ExtractError::structure(edulevel_key.to_string(), "no schooltypes collection")
        })?;
        for schooltype in element_children(schooltypes) {
            let schooltype_key = external_key(schooltype)?;
            let schooltype_title = text_of(schooltype, "title");
            let subjects = collection(schooltype, "subjects").ok_or_else(|| {
                ExtractError::structure(schooltype_key.to_string(), "no subjects collection")
            })?;
            for subject in element_children(subjects) {
                let subject_key = external_key(subject)?;
                let mut subject_title = text_of(subject, "title");
                let class = text_of(subject, "class");
                if !class.is_empty() {
                    subject_title = format!("{subject_title} ({class})");
                }

                let segments = vec![
                    PathSegment {
                        key: edulevel_key.clone(),
                        title: edulevel_title.clone(),
                    },
                    PathSegment {
                        key: schooltype_key.clone(),
                        title: schooltype_title.clone(),
                    },
                    PathSegment {
                        key: subject_key.clone(),
                        title: subject_title,
                    },
                ];

                frameworks.push(FrameworkRecord {
                    key: subject_key.clone(),
                    display_name: joined_display_name(&segments),
                    segments,
                    topics: extract_topics(subject, &subject_key, pool)?,
                });
            }
        }
    }
    Ok(frameworks)
}

/// Topics of one subject, with descriptor references resolved against the
/// pool in upstream reference order. Dangling references are skipped; the
/// upstream feed carries them routinely.
fn extract_topics(
    subject: Node<'_, '_>,
    subject_key: &ExternalKey,
    pool: &HashMap<ExternalKey, DescriptorRecord>,
) -> Result<Vec<TopicRecord>, ExtractError> {
    let topics_el = collection(subject, "topics").ok_or_else(|| {
        ExtractError::structure(subject_key.to_string(), "no topics collection")
    })?;

    let mut topics = Vec::new();
    for topic in element_children(topics_el) {
        let topic_key = external_key(topic)?;
        let refs_el = collection(topic, "descriptors").ok_or_else(|| {
            ExtractError::structure(topic_key.to_string(), "no descriptors collection")
        })?;

        let mut descriptors = Vec::new();
        for reference in element_children(refs_el) {
            let ref_key = external_key(reference)?;
            match pool.get(&ref_key) {
                Some(descriptor) => descriptors.push(descriptor.clone()),
                None => debug!(%ref_key, %topic_key, "skipping dangling descriptor reference"),
            }
        }

        topics.push(TopicRecord {
            key: topic_key.clone(),
            title: text_of(topic, "title"),
            description: text_of(topic, "description"),
            sorting: int_of(topic, "sorting", &topic_key)?,
            descriptors,
        });
    }
    Ok(topics)
}

/// The top-level descriptor pool, keyed by external key.
///
/// With a selection filter, only the referenced descriptors are returned;
/// this is how a topic's reference list is resolved. Child descriptors
/// expand one extra nesting level, reusing the parent's description when
/// their own is absent (upstream-format quirk kept as an explicit rule).
pub fn extract_descriptors(
    doc: &Document<'_>,
    selection: Option<&HashSet<ExternalKey>>,
    qualifiers: &QualifierTables,
) -> Result<HashMap<ExternalKey, DescriptorRecord>, ExtractError> {
    let root = doc.root_element();
    let Some(pool_el) = collection(root, "descriptors") else {
        return Ok(HashMap::new());
    };

    let mut pool = HashMap::new();
    for descriptor in element_children(pool_el) {
        let key = external_key(descriptor)?;
        if let Some(filter) = selection {
            if !filter.contains(&key) {
                continue;
            }
        }
        let title = text_of(descriptor, "title");
        let description = text_of(descriptor, "description");
        let qualifier = descriptor_qualifier(descriptor, &key, qualifiers)?;

        let mut children = Vec::new();
        if let Some(children_el) = collection(descriptor, "children") {
            for child in element_children(children_el) {
                let child_key = external_key(child)?;
                let child_description = text_of(child, "description");
                children.push(DescriptorRecord {
                    key: child_key.clone(),
                    title: text_of(child, "title"),
                    description: if child_description.is_empty() {
                        description.clone()
                    } else {
                        child_description
                    },
                    sorting: int_of(child, "sorting", &child_key)?,
                    qualifier: descriptor_qualifier(child, &child_key, qualifiers)?,
                    children: Vec::new(),
                });
            }
        }

        pool.insert(
            key.clone(),
            DescriptorRecord {
                key: key.clone(),
                title,
                description,
                sorting: int_of(descriptor, "sorting", &key)?,
                qualifier,
                children,
            },
        );
    }
    Ok(pool)
}

/// The `niveaus` and `skills` lookup tables.
pub fn extract_qualifiers(doc: &Document<'_>) -> Result<QualifierTables, ExtractError> {
    let root = doc.root_element();
    let mut tables = QualifierTables::default();
    if let Some(niveaus) = collection(root, "niveaus") {
        for niveau in element_children(niveaus) {
            let key = external_key(niveau)?;
            tables.niveaus.insert(key, text_of(niveau, "title"));
        }
    }
    if let Some(skills) = collection(root, "skills") {
        for skill in element_children(skills) {
            let key = external_key(skill)?;
            tables.skills.insert(key, text_of(skill, "title"));
        }
    }
    Ok(tables)
}

fn descriptor_qualifier(
    descriptor: Node<'_, '_>,
    key: &ExternalKey,
    qualifiers: &QualifierTables,
) -> Result<Option<Qualifier>, ExtractError> {
    let niveau = opt_int_of(descriptor, "niveauid", key)?
        .map(|id| ExternalKey::new(key.source_id.clone(), id));
    let skill = opt_int_of(descriptor, "skillid", key)?
        .map(|id| ExternalKey::new(key.source_id.clone(), id));
    Ok(qualifiers.resolve(niveau.as_ref(), skill.as_ref()))
}

fn element_children<'a, 'input>(
    node: Node<'a, 'input>,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn collection<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

/// Composite key from the `source` and `id` attributes. A missing attribute
/// or a non-numeric id makes the node unaddressable.
fn external_key(node: Node<'_, '_>) -> Result<ExternalKey, ExtractError> {
    let name = node.tag_name().name().to_string();
    let source = node
        .attribute("source")
        .ok_or_else(|| ExtractError::structure(&name, "missing source attribute"))?;
    let raw_id = node
        .attribute("id")
        .ok_or_else(|| ExtractError::structure(&name, "missing id attribute"))?;
    let item_id = raw_id.trim().parse::<i64>().map_err(|_| {
        ExtractError::structure(&name, format!("non-numeric id attribute {raw_id:?}"))
    })?;
    Ok(ExternalKey::new(source, item_id))
}

/// Text content of a named child element, coerced to plain trimmed text.
fn text_of(node: Node<'_, '_>, name: &str) -> String {
    collection(node, name)
        .map(|el| {
            el.descendants()
                .filter_map(|n| n.text())
                .collect::<String>()
                .trim()
                .to_string()
        })
        .unwrap_or_default()
}

/// Integer content of a named child element. Absent means zero; malformed
/// text fails the run rather than silently producing a wrong ordering.
fn int_of(node: Node<'_, '_>, name: &str, key: &ExternalKey) -> Result<i64, ExtractError> {
    Ok(opt_int_of(node, name, key)?.unwrap_or(0))
}

fn opt_int_of(
    node: Node<'_, '_>,
    name: &str,
    key: &ExternalKey,
) -> Result<Option<i64>, ExtractError> {
    let Some(el) = collection(node, name) else {
        return Ok(None);
    };
    let raw = el
        .descendants()
        .filter_map(|n| n.text())
        .collect::<String>();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed.parse::<i64>().map(Some).map_err(|_| {
        ExtractError::structure(key.to_string(), format!("malformed {name} value {trimmed:?}"))
    })
}
