//! Destination composition algebra.
//!
//! Lays out named value sequences ("destinations") in time. A short infix
//! command combines channel tokens with two operators:
//!
//! - `+` overlays channels in **parallel**: they step together over the same
//!   column range.
//! - `,` concatenates groups **sequentially**: each group occupies its own,
//!   consecutive column range.
//!
//! `+` binds tighter than `,`, tokens are case-insensitive and whitespace is
//! ignored. The result is a `[channels, steps]` matrix whose empty cells are
//! NaN ("no setpoint on this step").
//!
//! ```text
//! destinations  A=[1,2]  B=[3]  C=[4,5]
//! command       "A+B,C"
//!
//!          col0 col1 col2 col3
//!     A  [  1    2   NaN  NaN ]
//!     B  [  3   NaN  NaN  NaN ]
//!     C  [ NaN  NaN   4    5  ]
//! ```
//!
//! Tokens that name no destination are dropped without error: they get no row
//! and contribute no columns. [`Composition::unknown_tokens`] reports them so
//! the caller can decide whether that is acceptable.

use ndarray::{s, Array2, ArrayView1};
use tracing::{debug, warn};

// =============================================================================
// Destination Table
// =============================================================================

/// Ordered table of channel token -> value sequence.
///
/// Keys are stored upper-case. Row order of every composition is the order in
/// which keys were first inserted; re-inserting a key (in any case) replaces its
/// values but keeps its position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DestinationTable {
    entries: Vec<(String, Vec<f64>)>,
}

impl DestinationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) the sequence for `key`.
    pub fn insert(&mut self, key: impl AsRef<str>, values: impl Into<Vec<f64>>) {
        let key = key.as_ref().to_uppercase();
        let values = values.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = values,
            None => self.entries.push((key, values)),
        }
    }

    /// Sequence stored for an (already upper-case) key.
    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Matrix row of an (already upper-case) key.
    pub fn row(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// Keys in row order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the table holds no channels.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for DestinationTable
where
    K: AsRef<str>,
    V: Into<Vec<f64>>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (key, values) in iter {
            table.insert(key, values);
        }
        table
    }
}

// =============================================================================
// Command Tree
// =============================================================================

/// Parsed composition command.
///
/// The parser only produces a sequential root list whose children are leaves
/// or flat parallel lists, but evaluation recurses over any nesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A single channel token (upper-case).
    Leaf(String),
    /// A group of nodes. Whether it is parallel or sequential depends on its
    /// position: the root is sequential, nested lists are parallel.
    List(Vec<Node>),
}

impl Node {
    fn is_list(&self) -> bool {
        matches!(self, Node::List(_))
    }

    fn leaves<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Node::Leaf(name) => out.push(name),
            Node::List(children) => children.iter().for_each(|c| c.leaves(out)),
        }
    }
}

/// Parse `"A+B , c , d+E"` into `[[A, B], C, [D, E]]`.
///
/// Empty command and empty segments are dropped.
pub fn parse_command(text: &str) -> Node {
    let groups = text
        .split(',')
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| {
            let mut parts: Vec<Node> = chunk
                .split('+')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| Node::Leaf(p.to_uppercase()))
                .collect();
            match parts.len() {
                0 => None,
                1 => parts.pop(),
                _ => Some(Node::List(parts)),
            }
        })
        .collect();
    Node::List(groups)
}

/// Sequential command listing every key of `table` once, in table order.
pub fn auto_command(table: &DestinationTable) -> Node {
    Node::List(table.keys().map(|k| Node::Leaf(k.to_string())).collect())
}

// =============================================================================
// Composition
// =============================================================================

/// Materialized composition.
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    /// `[channels, steps]`, NaN where a channel has no setpoint.
    pub matrix: Array2<f64>,
    /// Row labels (upper-case), in table order.
    pub channels: Vec<String>,
    /// Command tokens that matched no destination, in first-seen order.
    pub unknown_tokens: Vec<String>,
}

impl Composition {
    /// Number of steps (matrix columns).
    pub fn steps(&self) -> usize {
        self.matrix.ncols()
    }
}

/// Compose `destinations` according to `command`.
///
/// With `auto_generate` the command is ignored and a purely sequential one is
/// synthesized from the table, which yields a block-diagonal matrix.
pub fn compose(
    command: Option<&str>,
    destinations: &DestinationTable,
    auto_generate: bool,
) -> Composition {
    let root = if auto_generate {
        auto_command(destinations)
    } else {
        parse_command(command.unwrap_or(""))
    };

    let composer = Composer { table: destinations };
    let total_cols = composer.length(&root, false);
    let mut matrix = Array2::from_elem((destinations.len(), total_cols), f64::NAN);
    composer.unpack(&root, 0, false, &mut matrix);

    let mut leaves = Vec::new();
    root.leaves(&mut leaves);
    let mut unknown_tokens: Vec<String> = Vec::new();
    for leaf in leaves {
        if destinations.get(leaf).is_none() && !unknown_tokens.iter().any(|u| u == leaf) {
            unknown_tokens.push(leaf.to_string());
        }
    }
    if !unknown_tokens.is_empty() {
        warn!(tokens = ?unknown_tokens, "Composition command names unknown channels; ignoring them");
    }

    debug!(
        channels = destinations.len(),
        steps = total_cols,
        "Composed destination matrix"
    );

    Composition {
        matrix,
        channels: destinations.keys().map(str::to_string).collect(),
        unknown_tokens,
    }
}

struct Composer<'a> {
    table: &'a DestinationTable,
}

impl Composer<'_> {
    /// Column count of `node`: max over a parallel list, sum over a sequential one.
    fn length(&self, node: &Node, parallel: bool) -> usize {
        match node {
            Node::Leaf(name) => self.table.get(name).map_or(0, <[f64]>::len),
            Node::List(children) if parallel => children
                .iter()
                .map(|child| self.length(child, false))
                .max()
                .unwrap_or(0),
            Node::List(children) => children
                .iter()
                .map(|child| self.length(child, child.is_list()))
                .sum(),
        }
    }

    fn unpack(&self, node: &Node, start_col: usize, parallel: bool, out: &mut Array2<f64>) {
        match node {
            Node::List(children) if parallel => {
                for child in children {
                    self.unpack(child, start_col, false, out);
                }
            }
            Node::List(children) => {
                let mut col = start_col;
                for child in children {
                    self.unpack(child, col, child.is_list(), out);
                    col += self.length(child, child.is_list());
                }
            }
            Node::Leaf(name) => {
                let (Some(values), Some(row)) = (self.table.get(name), self.table.row(name)) else {
                    return;
                };
                if values.is_empty() {
                    return;
                }
                out.slice_mut(s![row, start_col..start_col + values.len()])
                    .assign(&ArrayView1::from(values));
            }
        }
    }
}
