//! Broad phase collision detection: finding pairs of objects that might be touching.

pub mod dynamic_tree;
pub use dynamic_tree::{
    AABBIter, DynamicTree, DynamicTreeParams, PairFilter, ProxyId, RayIter, TreeProxy,
};

pub mod pair_set;
pub use pair_set::{Pair, PairHashSet};
