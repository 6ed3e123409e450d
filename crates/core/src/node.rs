use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};

/// A target machine. Identity is the hostname.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            address: None,
            cluster: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Address to reach the node, falling back to the hostname
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.hostname)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hostname.hash(state);
    }
}

/// Ordered, duplicate-free collection of nodes.
///
/// Insertion order is preserved; membership is by hostname. Equality between
/// two sets ignores order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Node>", into = "Vec<Node>")]
pub struct NodeSet {
    nodes: Vec<Node>,
    members: HashSet<String>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node if absent. Returns whether it was added.
    pub fn push(&mut self, node: Node) -> bool {
        if !self.members.insert(node.hostname.clone()) {
            return false;
        }
        self.nodes.push(node);
        true
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.members.contains(&node.hostname)
    }

    pub fn contains_host(&self, hostname: &str) -> bool {
        self.members.contains(hostname)
    }

    /// Remove a single node. Returns whether it was a member.
    pub fn remove(&mut self, node: &Node) -> bool {
        if !self.members.remove(&node.hostname) {
            return false;
        }
        self.nodes.retain(|n| n.hostname != node.hostname);
        true
    }

    /// Transfer every member into `dest`, leaving `self` empty
    pub fn move_to(&mut self, dest: &mut NodeSet) {
        for node in self.nodes.drain(..) {
            dest.push(node);
        }
        self.members.clear();
    }

    /// Remove and return the members of `subset` that are still in `self`.
    ///
    /// Nodes of `subset` that are not members are ignored. The returned set
    /// keeps the order of `self`.
    pub fn extract(&mut self, subset: &NodeSet) -> NodeSet {
        let wanted: HashSet<&str> = subset
            .iter()
            .map(|n| n.hostname.as_str())
            .filter(|h| self.members.contains(*h))
            .collect();

        if wanted.is_empty() {
            return NodeSet::new();
        }

        let (taken, kept): (Vec<Node>, Vec<Node>) = std::mem::take(&mut self.nodes)
            .into_iter()
            .partition(|n| wanted.contains(n.hostname.as_str()));

        self.nodes = kept;
        for node in &taken {
            self.members.remove(&node.hostname);
        }

        taken.into_iter().collect()
    }

    /// Split into (matching, not matching), keeping order on both sides
    pub fn partition<F>(self, mut pred: F) -> (NodeSet, NodeSet)
    where
        F: FnMut(&Node) -> bool,
    {
        let mut matching = NodeSet::new();
        let mut rest = NodeSet::new();
        for node in self.nodes {
            if pred(&node) {
                matching.push(node);
            } else {
                rest.push(node);
            }
        }
        (matching, rest)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.hostname.clone()).collect()
    }

    /// Compact rendering of the hostnames, e.g. `node-[1-4,7].site`
    pub fn folded(&self) -> String {
        fold_hostnames(self.nodes.iter().map(|n| n.hostname.as_str()))
    }
}

impl PartialEq for NodeSet {
    fn eq(&self, other: &Self) -> bool {
        self.members == other.members
    }
}

impl Eq for NodeSet {}

impl std::fmt::Display for NodeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.folded())
    }
}

impl From<Vec<Node>> for NodeSet {
    fn from(nodes: Vec<Node>) -> Self {
        nodes.into_iter().collect()
    }
}

impl From<NodeSet> for Vec<Node> {
    fn from(set: NodeSet) -> Self {
        set.nodes
    }
}

impl FromIterator<Node> for NodeSet {
    fn from_iter<I: IntoIterator<Item = Node>>(iter: I) -> Self {
        let mut set = NodeSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<Node> for NodeSet {
    fn extend<I: IntoIterator<Item = Node>>(&mut self, iter: I) {
        for node in iter {
            self.push(node);
        }
    }
}

impl IntoIterator for NodeSet {
    type Item = Node;
    type IntoIter = std::vec::IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a NodeSet {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

/// Split a hostname around the last digit run of its first label:
/// `graphene-12.nancy.grid5000.fr` -> (`graphene-`, `12`, `.nancy.grid5000.fr`)
fn split_numbered(hostname: &str) -> Option<(&str, &str, &str)> {
    let label_end = hostname.find('.').unwrap_or(hostname.len());
    let label = &hostname[..label_end];
    let end = label.rfind(|c: char| c.is_ascii_digit())? + 1;
    let start = label[..end]
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    Some((&hostname[..start], &hostname[start..end], &hostname[end..]))
}

struct HostGroup<'a> {
    prefix: &'a str,
    suffix: &'a str,
    width: usize,
    numbers: Vec<u64>,
}

enum FoldEntry<'a> {
    Plain(&'a str),
    Group(usize),
}

fn fold_hostnames<'a>(hostnames: impl Iterator<Item = &'a str>) -> String {
    let mut entries: Vec<FoldEntry<'a>> = Vec::new();
    let mut groups: Vec<HostGroup<'a>> = Vec::new();

    for hostname in hostnames {
        let parsed = split_numbered(hostname)
            .and_then(|(prefix, digits, suffix)| digits.parse::<u64>().ok().map(|n| (prefix, digits, suffix, n)));

        let Some((prefix, digits, suffix, number)) = parsed else {
            entries.push(FoldEntry::Plain(hostname));
            continue;
        };

        // Zero-padded numbers only fold with numbers of the same width
        let width = if digits.len() > 1 && digits.starts_with('0') {
            digits.len()
        } else {
            0
        };

        match groups
            .iter()
            .position(|g| g.prefix == prefix && g.suffix == suffix && g.width == width)
        {
            Some(idx) => groups[idx].numbers.push(number),
            None => {
                groups.push(HostGroup {
                    prefix,
                    suffix,
                    width,
                    numbers: vec![number],
                });
                entries.push(FoldEntry::Group(groups.len() - 1));
            }
        }
    }

    entries
        .iter()
        .map(|entry| match entry {
            FoldEntry::Plain(hostname) => hostname.to_string(),
            FoldEntry::Group(idx) => render_group(&groups[*idx]),
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn render_group(group: &HostGroup<'_>) -> String {
    let fmt = |n: u64| format!("{:0width$}", n, width = group.width);

    let mut numbers = group.numbers.clone();
    numbers.sort_unstable();
    numbers.dedup();

    if numbers.len() == 1 {
        return format!("{}{}{}", group.prefix, fmt(numbers[0]), group.suffix);
    }

    let mut ranges = Vec::new();
    let mut start = numbers[0];
    let mut prev = numbers[0];
    for &n in &numbers[1..] {
        if n != prev + 1 {
            ranges.push((start, prev));
            start = n;
        }
        prev = n;
    }
    ranges.push((start, prev));

    let body = ranges
        .into_iter()
        .map(|(a, b)| if a == b { fmt(a) } else { format!("{}-{}", fmt(a), fmt(b)) })
        .collect::<Vec<_>>()
        .join(",");

    format!("{}[{}]{}", group.prefix, body, group.suffix)
}
