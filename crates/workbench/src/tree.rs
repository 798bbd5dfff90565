//! In-memory project file tree.
//!
//! Nodes live in an arena and refer to each other by index. Directories keep
//! their children in a name-ordered map, so traversal order is stable:
//! depth-first, a directory before its contents, siblings by name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkbenchError};

/// One entry of a [`FileSystemTree`], in the sandbox mount format:
/// `{"file": {"contents": ".."}}` or `{"directory": {..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathNode {
    File { contents: String },
    Directory(FileSystemTree),
}

/// Root-level names mapped to their nodes.
pub type FileSystemTree = BTreeMap<String, PathNode>;

/// Output of the code generator: full paths mapped to file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedProject {
    pub files: BTreeMap<String, String>,
}

impl GeneratedProject {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| WorkbenchError::Config(format!("generated project: {e}")))
    }

    pub fn into_tree(self) -> Result<FileTree> {
        FileTree::from_flat(&self.files)
    }
}

/// Split a `/`-joined path into its segments.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Err(WorkbenchError::InvalidPath(path.to_owned()));
    }
    let segments: Vec<&str> = path.split('/').collect();
    if segments
        .iter()
        .any(|s| s.is_empty() || *s == "." || *s == "..")
    {
        return Err(WorkbenchError::InvalidPath(path.to_owned()));
    }
    Ok(segments)
}

/// Parent directory of `path`, if it has one.
pub fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    parent: Option<NodeId>,
    kind: NodeKind,
}

#[derive(Debug, Clone)]
enum NodeKind {
    File(String),
    Dir(BTreeMap<String, NodeId>),
}

/// Item yielded by [`FileTree::walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<'a> {
    Dir { path: String },
    File { path: String, contents: &'a str },
}

impl Entry<'_> {
    pub fn path(&self) -> &str {
        match self {
            Entry::Dir { path } | Entry::File { path, .. } => path,
        }
    }
}

/// Where a write would land.
enum Slot {
    /// Existing file node to overwrite.
    File(NodeId),
    /// Create under directory `dir`, starting at segment `from`.
    Create { dir: NodeId, from: usize },
}

#[derive(Debug, Clone)]
pub struct FileTree {
    nodes: Vec<Node>,
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for FileTree {
    fn eq(&self, other: &Self) -> bool {
        self.enumerate() == other.enumerate()
    }
}

impl Eq for FileTree {}

impl FileTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: String::new(),
                parent: None,
                kind: NodeKind::Dir(BTreeMap::new()),
            }],
        }
    }

    /// Build from a snapshot, validating every name.
    pub fn from_snapshot(snapshot: &FileSystemTree) -> Result<Self> {
        let mut tree = Self::new();
        let mut stack: Vec<(String, &FileSystemTree)> = vec![(String::new(), snapshot)];
        while let Some((prefix, dir)) = stack.pop() {
            for (name, node) in dir {
                let path = join(&prefix, name);
                if name.contains('/') {
                    return Err(WorkbenchError::InvalidPath(path));
                }
                match node {
                    PathNode::File { contents } => tree.write(&path, contents.clone())?,
                    PathNode::Directory(children) => {
                        tree.mkdir(&path)?;
                        stack.push((path, children));
                    }
                }
            }
        }
        Ok(tree)
    }

    /// Build from `path -> contents` pairs.
    pub fn from_flat<'a, I>(files: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut tree = Self::new();
        for (path, contents) in files {
            tree.write(path, contents.clone())?;
        }
        Ok(tree)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn file_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::File(_)))
            .count()
    }

    /// Fails with `PathConflict` or `InvalidPath` exactly when `write(path, ..)`
    /// would, without changing the tree.
    pub fn check_write(&self, path: &str) -> Result<()> {
        let segments = split_path(path)?;
        self.locate(path, &segments).map(|_| ())
    }

    /// Write a file, creating missing parent directories and replacing an
    /// existing file at `path`.
    pub fn write(&mut self, path: &str, contents: String) -> Result<()> {
        let segments = split_path(path)?;
        match self.locate(path, &segments)? {
            Slot::File(id) => {
                self.node_mut(id).kind = NodeKind::File(contents);
            }
            Slot::Create { mut dir, from } => {
                let (leaf, dirs) = match segments.split_last() {
                    Some(split) => split,
                    None => return Err(WorkbenchError::InvalidPath(path.to_owned())),
                };
                for name in dirs.iter().skip(from) {
                    dir = self.push_node(dir, name, NodeKind::Dir(BTreeMap::new()));
                }
                self.push_node(dir, leaf, NodeKind::File(contents));
            }
        }
        Ok(())
    }

    /// Create a directory and its missing parents. Existing directories are
    /// fine, an existing file anywhere on the path is a conflict.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let segments = split_path(path)?;
        let mut dir = ROOT;
        for name in &segments {
            match self.child(dir, name) {
                Some(id) => match self.node(id).kind {
                    NodeKind::Dir(_) => dir = id,
                    NodeKind::File(_) => {
                        return Err(WorkbenchError::PathConflict(self.path_of(id), "file"));
                    }
                },
                None => dir = self.push_node(dir, name, NodeKind::Dir(BTreeMap::new())),
            }
        }
        Ok(())
    }

    /// Contents of the file at `path`. Directories and missing paths are
    /// `NotFound`.
    pub fn read(&self, path: &str) -> Result<&str> {
        let segments = split_path(path)?;
        let mut current = ROOT;
        for name in &segments {
            current = self
                .child(current, name)
                .ok_or_else(|| WorkbenchError::NotFound(path.to_owned()))?;
        }
        match &self.node(current).kind {
            NodeKind::File(contents) => Ok(contents),
            NodeKind::Dir(_) => Err(WorkbenchError::NotFound(path.to_owned())),
        }
    }

    /// Owned snapshot of the whole tree.
    pub fn enumerate(&self) -> FileSystemTree {
        // Children come after their parent in walk order, so building in
        // reverse order has every child ready before its directory.
        let order = self.preorder();
        let mut built: Vec<Option<PathNode>> = vec![None; self.nodes.len()];
        let mut root = FileSystemTree::new();

        for &id in order.iter().rev() {
            let node = self.node(id);
            let value = match &node.kind {
                NodeKind::File(contents) => PathNode::File {
                    contents: contents.clone(),
                },
                NodeKind::Dir(children) => PathNode::Directory(
                    children
                        .iter()
                        .filter_map(|(name, &child)| {
                            built
                                .get_mut(child)
                                .and_then(Option::take)
                                .map(|n| (name.clone(), n))
                        })
                        .collect(),
                ),
            };
            if id == ROOT {
                if let PathNode::Directory(children) = value {
                    root = children;
                }
            } else if let Some(slot) = built.get_mut(id) {
                *slot = Some(value);
            }
        }
        root
    }

    /// Every file keyed by its full path.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        self.walk()
            .filter_map(|entry| match entry {
                Entry::File { path, contents } => Some((path, contents.to_owned())),
                Entry::Dir { .. } => None,
            })
            .collect()
    }

    /// Depth-first pre-order traversal: a directory before its contents,
    /// siblings by name. The root itself is not yielded.
    pub fn walk(&self) -> Walk<'_> {
        let mut walk = Walk {
            tree: self,
            stack: Vec::new(),
        };
        walk.push_children(ROOT, "");
        walk
    }

    fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let NodeKind::Dir(children) = &self.node(id).kind {
                stack.extend(children.values().rev());
            }
        }
        order
    }

    fn locate(&self, path: &str, segments: &[&str]) -> Result<Slot> {
        let mut dir = ROOT;
        let last = segments.len().saturating_sub(1);
        for (i, name) in segments.iter().enumerate() {
            let Some(id) = self.child(dir, name) else {
                return Ok(Slot::Create { dir, from: i });
            };
            match (&self.node(id).kind, i == last) {
                (NodeKind::File(_), true) => return Ok(Slot::File(id)),
                (NodeKind::File(_), false) => {
                    return Err(WorkbenchError::PathConflict(self.path_of(id), "file"));
                }
                (NodeKind::Dir(_), true) => {
                    return Err(WorkbenchError::PathConflict(path.to_owned(), "directory"));
                }
                (NodeKind::Dir(_), false) => dir = id,
            }
        }
        Err(WorkbenchError::InvalidPath(path.to_owned()))
    }

    fn child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        match &self.node(dir).kind {
            NodeKind::Dir(children) => children.get(name).copied(),
            NodeKind::File(_) => None,
        }
    }

    fn push_node(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_owned(),
            parent: Some(parent),
            kind,
        });
        if let NodeKind::Dir(children) = &mut self.node_mut(parent).kind {
            children.insert(name.to_owned(), id);
        }
        id
    }

    /// Full path of a node, rebuilt through parent links.
    fn path_of(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.node(id);
            if node.parent.is_some() {
                names.push(node.name.as_str());
            }
            current = node.parent;
        }
        names.reverse();
        names.join("/")
    }

    #[allow(clippy::indexing_slicing)] // ids are only minted by push_node
    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    #[allow(clippy::indexing_slicing)] // ids are only minted by push_node
    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Iterator returned by [`FileTree::walk`].
pub struct Walk<'a> {
    tree: &'a FileTree,
    stack: Vec<(NodeId, String)>,
}

impl Walk<'_> {
    fn push_children(&mut self, dir: NodeId, prefix: &str) {
        if let NodeKind::Dir(children) = &self.tree.node(dir).kind {
            self.stack.extend(
                children
                    .iter()
                    .rev()
                    .map(|(name, &id)| (id, join(prefix, name))),
            );
        }
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = Entry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (id, path) = self.stack.pop()?;
        let tree = self.tree;
        match &tree.node(id).kind {
            NodeKind::File(contents) => Some(Entry::File { path, contents }),
            NodeKind::Dir(_) => {
                self.push_children(id, &path);
                Some(Entry::Dir { path })
            }
        }
    }
}
