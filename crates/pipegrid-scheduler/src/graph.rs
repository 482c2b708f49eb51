//! Block dependency graph validation and traversal.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use pipegrid_state::{BlockId, BlockRun, PipelineDef};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("pipeline '{0}' has no blocks")]
    Empty(String),

    #[error("duplicate block id '{0}'")]
    DuplicateBlock(BlockId),

    #[error("block '{block}' depends on unknown block '{upstream}'")]
    UnknownUpstream { block: BlockId, upstream: BlockId },

    #[error("block '{0}' cannot depend on itself")]
    SelfDependency(BlockId),

    #[error("cycle detected in block graph involving '{0}'")]
    Cycle(BlockId),
}

/// Validated block DAG of a pipeline.
#[derive(Debug, Clone)]
pub struct BlockGraph {
    order: Vec<BlockId>,
}

impl BlockGraph {
    pub fn from_pipeline(pipeline: &PipelineDef) -> Result<Self, GraphError> {
        if pipeline.blocks.is_empty() {
            return Err(GraphError::Empty(pipeline.id.clone()));
        }

        let mut seen = HashSet::new();
        for block in &pipeline.blocks {
            if !seen.insert(block.id.as_str()) {
                return Err(GraphError::DuplicateBlock(block.id.clone()));
            }
        }
        for block in &pipeline.blocks {
            for upstream in &block.upstream {
                if upstream == &block.id {
                    return Err(GraphError::SelfDependency(block.id.clone()));
                }
                if !seen.contains(upstream.as_str()) {
                    return Err(GraphError::UnknownUpstream {
                        block: block.id.clone(),
                        upstream: upstream.clone(),
                    });
                }
            }
        }

        // Edge direction: upstream -> block.
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for block in &pipeline.blocks {
            graph.add_node(block.id.as_str());
            for upstream in &block.upstream {
                graph.add_edge(upstream.as_str(), block.id.as_str(), ());
            }
        }

        match toposort(&graph, None) {
            Ok(order) => Ok(Self {
                order: order.into_iter().map(str::to_string).collect(),
            }),
            Err(cycle) => Err(GraphError::Cycle(cycle.node_id().to_string())),
        }
    }

    /// Block ids such that every block follows all of its upstreams.
    pub fn topological_order(&self) -> &[BlockId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Every block reachable downstream of `root` (excluding `root`).
pub fn descendants(blocks: &[BlockRun], root: &str) -> HashSet<BlockId> {
    let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
    for block in blocks {
        for upstream in &block.upstream {
            downstream
                .entry(upstream.as_str())
                .or_default()
                .push(block.block_id.as_str());
        }
    }

    let mut found = HashSet::new();
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        for &child in downstream.get(id).into_iter().flatten() {
            if found.insert(child.to_string()) {
                queue.push_back(child);
            }
        }
    }
    found
}
