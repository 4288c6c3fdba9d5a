use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use crate::codec::Codec;
use crate::{SlabError, SlabResult};

/// One tile file inside the archive, addressed as a byte range.
#[derive(Debug, Clone)]
pub(crate) struct LeafEntry {
    pub level: u64,
    pub codec: Codec,
    pub offset: u64,
    pub size: u64,
    pub path: String,
}

/// One level of a variable's origin trie: interior levels map integer
/// offsets (in ascending order), leaf levels hold the stack column.
pub(crate) enum TowerNode {
    Dirs(BTreeMap<u64, TowerNode>),
    Column(Vec<LeafEntry>),
}

impl TowerNode {
    pub(crate) fn first_codec(&self) -> Option<Codec> {
        match self {
            TowerNode::Dirs(children) => children.values().find_map(TowerNode::first_codec),
            TowerNode::Column(leaves) => leaves.first().map(|l| l.codec),
        }
    }

    pub(crate) fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a LeafEntry>) {
        match self {
            TowerNode::Dirs(children) => {
                for child in children.values() {
                    child.collect_leaves(out);
                }
            }
            TowerNode::Column(leaves) => out.extend(leaves.iter()),
        }
    }
}

/// Index over every tile member of an archive, one origin trie per variable.
pub(crate) struct Tower {
    vars: BTreeMap<String, TowerNode>,
}

impl Debug for Tower {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Tower [vars: {}]", self.vars.len()))
    }
}

impl Tower {
    pub(crate) fn new() -> Self {
        Tower {
            vars: BTreeMap::new(),
        }
    }

    /// Insert one archive member path of the form
    /// `<var>/<o_1>/…/<o_{n-1}>/<level>.<codec>.<ext>`.
    pub(crate) fn insert(&mut self, path: &str, offset: u64, size: u64) -> SlabResult<()> {
        let malformed = || SlabError::InvalidEntry(path.to_string());

        let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() < 2 {
            return Err(malformed());
        }
        let file_name = parts.pop().unwrap_or_default();
        let var = parts.remove(0);
        let origins = parts
            .iter()
            .map(|p| p.parse::<u64>().map_err(|_| malformed()))
            .collect::<SlabResult<Vec<u64>>>()?;

        let mut name_parts = file_name.split('.');
        let level = name_parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(malformed)?;
        let codec = Codec::from_tag(name_parts.next().ok_or_else(malformed)?)
            .map_err(|_| malformed())?;
        if name_parts.next().is_none() {
            return Err(malformed());
        }

        let leaf = LeafEntry {
            level,
            codec,
            offset,
            size,
            path: path.to_string(),
        };
        let root = self
            .vars
            .entry(var.to_string())
            .or_insert_with(|| empty_node(&origins));
        insert_into(root, &origins, leaf).map_err(|_| malformed())
    }

    /// Sort every stack column by integer stack level. Call once after all
    /// members are inserted.
    pub(crate) fn sort_columns(&mut self) {
        fn sort(node: &mut TowerNode) {
            match node {
                TowerNode::Dirs(children) => children.values_mut().for_each(sort),
                TowerNode::Column(leaves) => leaves.sort_by_key(|l| l.level),
            }
        }
        self.vars.values_mut().for_each(sort);
    }

    pub(crate) fn get(&self, var: &str) -> Option<&TowerNode> {
        self.vars.get(var)
    }

    pub(crate) fn var_names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }
}

fn empty_node(origins: &[u64]) -> TowerNode {
    if origins.is_empty() {
        TowerNode::Column(Vec::new())
    } else {
        TowerNode::Dirs(BTreeMap::new())
    }
}

fn insert_into(node: &mut TowerNode, origins: &[u64], leaf: LeafEntry) -> SlabResult<()> {
    match (node, origins) {
        (TowerNode::Column(leaves), []) => {
            leaves.push(leaf);
            Ok(())
        }
        (TowerNode::Dirs(children), [first, rest @ ..]) => {
            let child = children.entry(*first).or_insert_with(|| empty_node(rest));
            insert_into(child, rest, leaf)
        }
        _ => Err(SlabError::InvalidEntry(leaf.path)),
    }
}
