use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashSet};

use crate::config::model::{ImageConfig, WerfConfig};
use crate::error::GraphError;

/// One entry of the dependency-ordered image list.
#[derive(Debug, Clone)]
pub struct OrderedImage {
    pub config: ImageConfig,
    pub is_artifact: bool,
}

/// Resolve the processing order of images and artifacts.
///
/// Edges point from dependency to dependent: `fromImage` bases and import
/// sources come before the images consuming them. A non-empty `filter`
/// restricts the result to the named images plus their transitive
/// dependencies.
pub fn dimgs_in_order(
    config: &WerfConfig,
    filter: &[String],
) -> Result<Vec<OrderedImage>, GraphError> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut node_map: BTreeMap<&str, NodeIndex> = BTreeMap::new();
    let mut entries: BTreeMap<&str, OrderedImage> = BTreeMap::new();

    // First pass: every image and artifact becomes a node. The single
    // unnamed image is keyed by the empty string.
    for (image, is_artifact) in config
        .images
        .iter()
        .map(|i| (i, false))
        .chain(config.artifacts.iter().map(|a| (a, true)))
    {
        let idx = graph.add_node(image.name.clone());
        node_map.insert(image.name.as_str(), idx);
        entries.insert(
            image.name.as_str(),
            OrderedImage {
                config: image.clone(),
                is_artifact,
            },
        );
    }

    // Second pass: edges from dependency to dependent.
    for image in config.images.iter().chain(config.artifacts.iter()) {
        let dependent = node_map[image.name.as_str()];
        for dep in dependencies_of(image) {
            let dep_idx = *node_map
                .get(dep)
                .ok_or_else(|| GraphError::MissingReference {
                    image: display_name(&image.name),
                    reference: dep.to_string(),
                })?;
            graph.add_edge(dep_idx, dependent, ());
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        GraphError::Cycle(display_name(&graph[cycle.node_id()]))
    })?;

    let needed = transitive_closure(config, filter)?;
    let mut result = Vec::new();
    for idx in order {
        let name = graph[idx].clone();
        if let Some(needed) = &needed {
            if !needed.contains(name.as_str()) {
                continue;
            }
        }
        result.push(entries[name.as_str()].clone());
    }
    Ok(result)
}

fn dependencies_of(image: &ImageConfig) -> impl Iterator<Item = &str> {
    image
        .from_image
        .iter()
        .map(String::as_str)
        .chain(image.import.iter().map(|i| i.artifact.as_str()))
}

/// Names to process for a non-empty filter: the requested images plus their
/// transitive dependencies. `None` means everything.
fn transitive_closure(
    config: &WerfConfig,
    filter: &[String],
) -> Result<Option<HashSet<String>>, GraphError> {
    if filter.is_empty() {
        return Ok(None);
    }

    let by_name: BTreeMap<&str, &ImageConfig> = config
        .images
        .iter()
        .chain(config.artifacts.iter())
        .map(|i| (i.name.as_str(), i))
        .collect();

    for name in filter {
        if !by_name.contains_key(name.as_str()) {
            return Err(GraphError::MissingReference {
                image: "command line".to_string(),
                reference: name.clone(),
            });
        }
    }

    let mut needed: HashSet<String> = filter.iter().cloned().collect();
    let mut changed = true;
    while changed {
        changed = false;
        let snapshot: Vec<String> = needed.iter().cloned().collect();
        for name in &snapshot {
            if let Some(image) = by_name.get(name.as_str()) {
                for dep in dependencies_of(image) {
                    if needed.insert(dep.to_string()) {
                        changed = true;
                    }
                }
            }
        }
    }
    Ok(Some(needed))
}

fn display_name(name: &str) -> String {
    if name.is_empty() {
        "~".to_string()
    } else {
        name.to_string()
    }
}
