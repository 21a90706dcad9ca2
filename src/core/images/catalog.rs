// src/core/images/catalog.rs

//! The merged, immutable-by-swap image catalog: the `Image Service`'s
//! published snapshot, and the pure `NodeView` computation (`Node Cache
//! View`) it is built from.

use super::tag::{RSPTag, TagClass};
use super::source::RawImageList;
use crate::config::{ImagesConfig, Toleration};
use k8s_openapi::api::core::v1::Node;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Platform suffixes hidden from the menu whenever a same-digest-or-generic
/// tag without the suffix also exists, per the documented platform-specific
/// tag suppression rule.
const PLATFORM_SUFFIXES: &[&str] = &["-amd64", "-arm64", "-linux-amd64", "-linux-arm64"];

/// `(repository, digest)` identity merged from every tag that resolves to
/// it. Identity is by digest: at most one `RSPImage` exists per digest in a
/// given catalog snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RSPImage {
    pub digest: String,
    pub tags: Vec<String>,
    pub class: TagClass,
    pub version: super::tag::VersionKey,
    pub description: String,
    pub nodes: HashSet<String>,
    pub prepulled: bool,
    pub is_recommended: bool,
}

impl RSPImage {
    /// The tag used to reference this image when none more specific is
    /// requested: the first non-alias tag, falling back to any tag.
    pub fn primary_tag(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.as_str() != "recommended")
            .map(|s| s.as_str())
            .unwrap_or_else(|| self.tags.first().map(|s| s.as_str()).unwrap_or(&self.digest))
    }

    pub fn reference(&self, repository: &str) -> String {
        format!("{}@{}", repository, self.digest)
    }
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub eligible: bool,
    pub ready: bool,
    pub digests: HashSet<String>,
}

/// `{node -> set<digest>}` plus eligibility, recomputed on every refresh
/// from the raw Node list. A pure function over API objects.
#[derive(Debug, Clone, Default)]
pub struct NodeView {
    pub nodes: BTreeMap<String, NodeInfo>,
}

impl NodeView {
    pub fn build(
        raw_nodes: &[Node],
        node_selector: &BTreeMap<String, String>,
        tolerations: &[Toleration],
    ) -> Self {
        let mut nodes = BTreeMap::new();
        for node in raw_nodes {
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            let labels = node.metadata.labels.clone().unwrap_or_default();
            let eligible = node_selector.iter().all(|(k, v)| labels.get(k) == Some(v))
                && taints_tolerated(node, tolerations);

            let ready = node
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .map(|conds| {
                    conds
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
                .unwrap_or(false);

            let mut digests = HashSet::new();
            if let Some(status) = &node.status {
                if let Some(images) = &status.images {
                    for image in images {
                        if let Some(names) = &image.names {
                            for name in names {
                                // `status.images[].names` holds repo:tag and
                                // repo@digest forms mixed together; only the
                                // digest form identifies a cached image.
                                if let Some(digest) = name.split('@').nth(1) {
                                    digests.insert(format!("sha256:{}", digest.trim_start_matches("sha256:")));
                                }
                            }
                        }
                    }
                }
            }

            nodes.insert(
                name.clone(),
                NodeInfo {
                    name,
                    eligible,
                    ready,
                    digests,
                },
            );
        }
        Self { nodes }
    }

    pub fn eligible_nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values().filter(|n| n.eligible && n.ready)
    }
}

fn taints_tolerated(node: &Node, tolerations: &[Toleration]) -> bool {
    let Some(spec) = &node.spec else { return true };
    let Some(taints) = &spec.taints else { return true };
    taints.iter().all(|taint| {
        tolerations.iter().any(|tol| {
            tol.key == taint.key
                && tol.effect == taint.effect
                && (tol.value.is_none() || tol.value.as_deref() == taint.value.as_deref())
        })
    })
}

/// The immutable, atomically-swapped snapshot published by the Image
/// Service after each refresh.
#[derive(Debug, Clone, Default)]
pub struct ImageCatalog {
    pub generation: u64,
    pub by_class: BTreeMap<TagClass, Vec<Arc<RSPImage>>>,
    pub recommended: Option<Arc<RSPImage>>,
    pub prepulled_menu: Vec<Arc<RSPImage>>,
    pub dropdown_menu: Vec<Arc<RSPImage>>,
    /// digests that must be prepulled to every eligible node
    pub to_prepull: HashSet<String>,
    /// every known image, keyed by digest, for O(1) resolution
    pub by_digest: HashMap<String, Arc<RSPImage>>,
    /// every known tag, keyed by raw tag string, for O(1) resolution
    pub by_tag: HashMap<String, Arc<RSPImage>>,
}

impl ImageCatalog {
    pub fn resolve_digest(&self, digest: &str) -> Option<Arc<RSPImage>> {
        self.by_digest.get(digest).cloned()
    }

    pub fn resolve_tag(&self, tag: &str) -> Option<Arc<RSPImage>> {
        self.by_tag.get(tag).cloned()
    }

    pub fn resolve_class(&self, class: TagClass, index: usize) -> Option<Arc<RSPImage>> {
        self.by_class.get(&class)?.get(index).cloned()
    }
}

/// Runs the Image Service's refresh protocol steps 2-9 over a raw tag list
/// and a freshly computed node view, producing the next catalog snapshot.
/// Step 1 (calling the source) and step 9 (the atomic swap) are the
/// caller's responsibility.
pub fn build_catalog(
    previous_generation: u64,
    raw: &RawImageList,
    node_view: &NodeView,
    config: &ImagesConfig,
) -> ImageCatalog {
    // Step 2: parse tags, group by digest.
    let mut images_by_digest: HashMap<String, RSPImage> = HashMap::new();
    let mut alias_tags: Vec<(String, String)> = Vec::new(); // (alias tag, digest)

    for (tag, digest) in &raw.tag_digests {
        let parsed = RSPTag::parse(tag);
        if parsed.is_alias() {
            alias_tags.push((tag.clone(), digest.clone()));
            continue;
        }
        if matches!(parsed.class, TagClass::Unknown) {
            continue;
        }
        let entry = images_by_digest.entry(digest.clone()).or_insert_with(|| RSPImage {
            digest: digest.clone(),
            tags: Vec::new(),
            class: parsed.class,
            version: parsed.version,
            description: parsed.description.clone(),
            nodes: HashSet::new(),
            prepulled: false,
            is_recommended: false,
        });
        entry.tags.push(tag.clone());
        // A digest may be reachable by tags of different classes (rare);
        // keep the most specific (non-alias) class already assigned and
        // prefer the newer-looking description.
        if parsed.version > entry.version {
            entry.version = parsed.version;
            entry.class = parsed.class;
            entry.description = parsed.description;
        }
    }

    // Step 3: resolve aliases. An alias's class/version is inherited from
    // its referent image; `recommended` marks `is_recommended`.
    for (alias, digest) in &alias_tags {
        if let Some(image) = images_by_digest.get_mut(digest) {
            image.tags.push(alias.clone());
            if alias == "recommended" || config.recommended_tag.as_deref() == Some(alias.as_str()) {
                image.is_recommended = true;
            }
        } else {
            debug!("alias tag '{}' points at unknown digest '{}', dropping", alias, digest);
        }
    }
    if let Some(recommended_tag) = &config.recommended_tag {
        if let Some(digest) = raw.tag_digests.get(recommended_tag) {
            if let Some(image) = images_by_digest.get_mut(digest) {
                image.is_recommended = true;
            }
        }
    }

    // Step 4: filter. Apply the configured cycle filter and hide
    // platform-specific tags shadowed by a generic tag on the same image.
    if let Some(cycle) = config.cycle {
        images_by_digest.retain(|_, image| {
            // An image with no explicit cycle in any of its tags is kept;
            // cycle filtering only excludes images definitively tagged
            // with a *different* cycle.
            let tags_have_other_cycle = image.tags.iter().any(|t| {
                RSPTag::parse(t).cycle.is_some_and(|c| c != cycle)
            });
            !tags_have_other_cycle
        });
    }

    for image in images_by_digest.values_mut() {
        suppress_platform_specific_tags(image);
    }

    // Step 5+6: mark prepulled against eligible nodes only.
    let eligible: Vec<&NodeInfo> = node_view.eligible_nodes().collect();
    for image in images_by_digest.values_mut() {
        image.nodes = node_view
            .nodes
            .values()
            .filter(|n| n.digests.contains(&image.digest))
            .map(|n| n.name.clone())
            .collect();
        image.prepulled = !eligible.is_empty()
            && eligible.iter().all(|n| n.digests.contains(&image.digest));
    }

    // Partition by class, ordered newest-first within class.
    let mut by_class: BTreeMap<TagClass, Vec<Arc<RSPImage>>> = BTreeMap::new();
    for image in images_by_digest.into_values() {
        by_class.entry(image.class).or_default().push(Arc::new(image));
    }
    for images in by_class.values_mut() {
        images.sort_by(|a, b| {
            // tags[0] carries the canonical parsed tag for ordering purposes
            let tag_a = RSPTag::parse(a.tags.first().map(|s| s.as_str()).unwrap_or(""));
            let tag_b = RSPTag::parse(b.tags.first().map(|s| s.as_str()).unwrap_or(""));
            tag_a.cmp_within_class(&tag_b)
        });
    }

    let recommended = by_class
        .values()
        .flatten()
        .find(|i| i.is_recommended)
        .cloned();

    // Step 7: select the to-prepull set: top-N per class, explicit pins,
    // plus recommended. Cycle-filtered images only (already filtered above).
    let mut to_prepull = HashSet::new();
    if let Some(r) = &recommended {
        to_prepull.insert(r.digest.clone());
    }
    for class in [TagClass::Release, TagClass::Weekly, TagClass::Daily] {
        if let Some(images) = by_class.get(&class) {
            for image in images.iter().take(config.num_to_prepull_per_class) {
                to_prepull.insert(image.digest.clone());
            }
        }
    }
    for pin in &config.pins {
        if let Some(digest) = raw.tag_digests.get(pin) {
            to_prepull.insert(digest.clone());
        }
    }

    // Step 8: build the menu. Prepulled targets become radio options
    // ordered recommended, releases, weeklies, dailies, pins; everything
    // else goes to dropdown.
    let mut prepulled_menu = Vec::new();
    let mut seen = HashSet::new();
    if let Some(r) = &recommended {
        prepulled_menu.push(r.clone());
        seen.insert(r.digest.clone());
    }
    for class in [TagClass::Release, TagClass::Weekly, TagClass::Daily] {
        if let Some(images) = by_class.get(&class) {
            for image in images {
                if to_prepull.contains(&image.digest) && seen.insert(image.digest.clone()) {
                    prepulled_menu.push(image.clone());
                }
            }
        }
    }

    let mut dropdown_menu = Vec::new();
    for images in by_class.values() {
        for image in images {
            if !seen.contains(&image.digest) {
                dropdown_menu.push(image.clone());
            }
        }
    }

    let mut by_digest = HashMap::new();
    let mut by_tag = HashMap::new();
    for images in by_class.values() {
        for image in images {
            by_digest.insert(image.digest.clone(), image.clone());
            for tag in &image.tags {
                by_tag.insert(tag.clone(), image.clone());
            }
        }
    }

    // Per-class lists are truncated to their configured counts for display;
    // `by_digest`/`by_tag` above were already built from the untruncated
    // lists so a pinned or directly-requested image outside the visible
    // window still resolves.
    if let Some(images) = by_class.get_mut(&TagClass::Release) {
        images.truncate(config.num_releases);
    }
    if let Some(images) = by_class.get_mut(&TagClass::Weekly) {
        images.truncate(config.num_weeklies);
    }
    if let Some(images) = by_class.get_mut(&TagClass::Daily) {
        images.truncate(config.num_dailies);
    }

    ImageCatalog {
        generation: previous_generation + 1,
        by_class,
        recommended,
        prepulled_menu,
        dropdown_menu,
        to_prepull,
        by_digest,
        by_tag,
    }
}

/// Hides platform-specific tags (e.g. `w_2024_15-amd64`) whenever the
/// corresponding generic tag is also present on this image, per the
/// documented ambiguity: when the two map to *different* digests, the
/// generic tag is treated as canonical and the platform-specific one is
/// dropped from the tag list entirely.
fn suppress_platform_specific_tags(image: &mut RSPImage) {
    let generic: HashSet<String> = image
        .tags
        .iter()
        .filter(|t| !PLATFORM_SUFFIXES.iter().any(|suf| t.ends_with(suf)))
        .cloned()
        .collect();

    image.tags.retain(|tag| {
        let Some(suffix) = PLATFORM_SUFFIXES.iter().find(|suf| tag.ends_with(*suf)) else {
            return true;
        };
        let generic_form = tag.trim_end_matches(suffix);
        !generic.contains(generic_form)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageSourceConfig;
    use std::collections::BTreeMap;

    fn images_config() -> ImagesConfig {
        ImagesConfig {
            source: ImageSourceConfig::Static { tags: BTreeMap::new() },
            refresh_interval: std::time::Duration::from_secs(60),
            recommended_tag: Some("recommended".to_string()),
            num_releases: 1,
            num_weeklies: 3,
            num_dailies: 3,
            cycle: None,
            pins: vec![],
            num_to_prepull_per_class: 2,
        }
    }

    #[test]
    fn builds_catalog_and_marks_recommended() {
        let mut tag_digests = BTreeMap::new();
        tag_digests.insert("recommended".to_string(), "sha256:abc".to_string());
        tag_digests.insert("w_2024_15".to_string(), "sha256:abc".to_string());
        tag_digests.insert("w_2024_10".to_string(), "sha256:def".to_string());
        let raw = RawImageList {
            tag_digests,
            aliases: BTreeMap::new(),
        };

        let catalog = build_catalog(0, &raw, &NodeView::default(), &images_config());
        assert_eq!(catalog.generation, 1);
        let recommended = catalog.recommended.expect("recommended should resolve");
        assert_eq!(recommended.digest, "sha256:abc");
        assert!(catalog.to_prepull.contains("sha256:abc"));
    }

    #[test]
    fn by_class_list_is_truncated_to_configured_count_but_still_resolves_by_tag() {
        let mut tag_digests = BTreeMap::new();
        for week in 10..16 {
            tag_digests.insert(format!("w_2024_{week}"), format!("sha256:w{week}"));
        }
        let raw = RawImageList {
            tag_digests,
            aliases: BTreeMap::new(),
        };
        let catalog = build_catalog(0, &raw, &NodeView::default(), &images_config());
        // images_config() sets num_weeklies: 3.
        assert_eq!(catalog.by_class.get(&TagClass::Weekly).map(|v| v.len()), Some(3));
        // Even though w_2024_10 is outside the truncated display window, it
        // still resolves directly by tag.
        assert!(catalog.by_tag.contains_key("w_2024_10"));
    }

    #[test]
    fn platform_specific_tag_hidden_when_generic_present() {
        let mut tag_digests = BTreeMap::new();
        tag_digests.insert("w_2024_15".to_string(), "sha256:abc".to_string());
        tag_digests.insert("w_2024_15-amd64".to_string(), "sha256:other".to_string());
        let raw = RawImageList {
            tag_digests,
            aliases: BTreeMap::new(),
        };
        let catalog = build_catalog(0, &raw, &NodeView::default(), &images_config());
        assert!(catalog.by_tag.get("w_2024_15-amd64").is_none());
        assert!(catalog.by_tag.contains_key("w_2024_15"));
    }
}
