//! Point-in-time view of the live dependency graph for diagnostics.
//!
//! [`ResourceGraph`] serializes as `{nodes, links, types, bases}`, where each
//! link points from a resource to one of its dependents by node index.

use hashbrown::HashMap;
use serde::Serialize;

use crate::cache::ResourceCache;
use crate::key::{Location, ResourceKey};

/// One live resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceNode {
    /// Rendered [`ResourceKey`].
    pub key: String,
    /// Resource kind name.
    pub kind: &'static str,
    /// Location name.
    pub location: &'static str,
    /// Resource name within its location.
    pub name: String,
    /// Whether the resource keeps its slot when killed.
    pub root: bool,
}

/// A dependency edge: `target` dies when `source` dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLink {
    /// Index of the dependency in [`ResourceGraph::nodes`].
    pub source: usize,
    /// Index of the dependent in [`ResourceGraph::nodes`].
    pub target: usize,
}

/// Snapshot of a [`ResourceCache`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceGraph {
    /// Live resources, ordered by rendered key.
    pub nodes: Vec<ResourceNode>,
    /// Dependency edges between live resources.
    pub links: Vec<ResourceLink>,
    /// Kinds with a registered creator.
    pub types: Vec<&'static str>,
    /// Every location name.
    pub bases: Vec<&'static str>,
}

impl ResourceGraph {
    /// Returns the index of the node for `key`, if it is live.
    #[must_use]
    pub fn index_of(&self, key: &ResourceKey) -> Option<usize> {
        let rendered = key.to_string();
        self.nodes.iter().position(|node| node.key == rendered)
    }
}

impl ResourceCache {
    /// Captures the live resources and their dependency edges.
    ///
    /// Resources loaded or killed while the snapshot is taken may or may not
    /// appear; edges only connect resources that were captured.
    #[must_use]
    pub fn inspect(&self) -> ResourceGraph {
        let mut resources: Vec<_> = self
            .live_resources()
            .into_iter()
            .map(|resource| (resource.key().to_string(), resource))
            .collect();
        resources.sort_by(|(a, _), (b, _)| a.cmp(b));

        let index: HashMap<ResourceKey, usize> = resources
            .iter()
            .enumerate()
            .map(|(i, (_, resource))| (resource.key().clone(), i))
            .collect();

        let mut links = Vec::new();
        for (source, (_, resource)) in resources.iter().enumerate() {
            let mut targets: Vec<_> = resource
                .base()
                .dependents()
                .iter()
                .filter_map(|dependent| index.get(dependent.key()).copied())
                .collect();
            targets.sort_unstable();
            links.extend(targets.into_iter().map(|target| ResourceLink { source, target }));
        }

        let nodes = resources
            .into_iter()
            .map(|(key, resource)| {
                let id = resource.key();
                ResourceNode {
                    kind: id.kind().as_str(),
                    location: id.location().as_str(),
                    name: id.name().to_owned(),
                    root: !resource.remove_on_reload(),
                    key,
                }
            })
            .collect();

        ResourceGraph {
            nodes,
            links,
            types: self.kinds().iter().map(|kind| kind.as_str()).collect(),
            bases: Location::ALL.iter().map(Location::as_str).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::key::ResourceKind;
    use crate::resource::{Resource, ResourceBase};

    const NODE: ResourceKind = ResourceKind::new("node");

    struct Node {
        base: ResourceBase,
    }

    impl Resource for Node {
        fn base(&self) -> &ResourceBase {
            &self.base
        }
    }

    fn node(cache: &ResourceCache, name: &str) -> Arc<dyn Resource> {
        cache
            .load_or_create(&ResourceKey::new(NODE, Location::Virtual, name), |key| {
                Ok(Arc::new(Node {
                    base: ResourceBase::new(key.clone()),
                }))
            })
            .expect("created")
    }

    #[test]
    fn graph_lists_live_nodes_and_their_links() {
        let cache = ResourceCache::new();
        let a = node(&cache, "a");
        let b = node(&cache, "b");
        let c = node(&cache, "c");
        cache.add_dependent(&a, &b).expect("link a->b");
        cache.add_dependent(&a, &c).expect("link a->c");

        let graph = cache.inspect();

        let names: Vec<_> = graph.nodes.iter().map(|node| node.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(
            graph.links,
            [
                ResourceLink { source: 0, target: 1 },
                ResourceLink { source: 0, target: 2 },
            ]
        );
        assert_eq!(graph.index_of(c.key()), Some(2));
        assert_eq!(graph.bases, ["base", "api", "assets", "virtual"]);
        assert!(graph.types.is_empty());
    }

    #[test]
    fn killed_resources_drop_out_of_the_graph() {
        let cache = ResourceCache::new();
        let a = node(&cache, "a");
        let b = node(&cache, "b");
        cache.add_dependent(&a, &b).expect("link a->b");
        let _ = cache.kill(&b);

        let graph = cache.inspect();

        assert_eq!(graph.nodes.len(), 1);
        assert!(graph.links.is_empty());
        assert_eq!(graph.index_of(b.key()), None);

        let json = serde_json::to_value(&graph).expect("serializes");
        assert_eq!(json["nodes"][0]["key"], a.key().to_string());
        assert_eq!(json["nodes"][0]["root"], false);
    }
}
