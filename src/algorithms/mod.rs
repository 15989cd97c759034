//! Computations bundled with the engine

pub mod page_rank;
pub mod shortest_paths;

pub use page_rank::{ring_graph, PageRankMasterCompute, SimplePageRank};
pub use shortest_paths::SimpleShortestPaths;
