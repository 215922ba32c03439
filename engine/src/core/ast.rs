//! Abstract syntax tree for parsed command documents.
//!
//! The tree is a plain tagged union with an explicit recursive case.
//! Cross-references stay symbolic ([`Reference`]); resolution into an
//! adjacency structure happens in [`crate::core::graph`], never by
//! linking AST nodes to each other.

use std::fmt;

/// A parsed command document: ordered top-level blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSequence {
    pub blocks: Vec<CommandBlock>,
}

/// One DSL block.
///
/// `bash`/`python` are leaves with opaque content and no identity;
/// `task`/`service`/`package` are containers with attributes and one or
/// more groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBlock {
    Bash { content: String },
    Python { content: String },
    Container(ContainerBlock),
}

impl CommandBlock {
    /// Tool name a leaf dispatches to.
    pub fn leaf_tool(&self) -> Option<&'static str> {
        match self {
            CommandBlock::Bash { .. } => Some("bash"),
            CommandBlock::Python { .. } => Some("python"),
            CommandBlock::Container(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Task,
    Service,
    Package,
}

impl ContainerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerKind::Task => "task",
            ContainerKind::Service => "service",
            ContainerKind::Package => "package",
        }
    }
}

/// A task/service/package block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerBlock {
    pub kind: ContainerKind,
    /// Insertion-ordered attributes. Duplicate names are rejected at
    /// parse time, so lookup by name is unambiguous.
    pub attributes: Vec<(String, String)>,
    /// One or more (description, commands, dependencies) groups.
    pub groups: Vec<Group>,
}

impl ContainerBlock {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Stable node key: explicit `id` attribute if present, else `name`.
    pub fn key(&self) -> Option<&str> {
        self.attribute("id").or_else(|| self.attribute("name"))
    }

    /// Per-node timeout override in seconds, validated at parse time.
    pub fn timeout_secs(&self) -> Option<u64> {
        self.attribute("timeout").and_then(|v| v.parse().ok())
    }

    /// All dependency references declared by this block's groups and,
    /// recursively, by nested containers.
    pub fn collect_references(&self, out: &mut Vec<Reference>) {
        for group in &self.groups {
            out.extend(group.dependencies.iter().cloned());
            if let GroupCommands::Block(block) = &group.commands
                && let CommandBlock::Container(nested) = block.as_ref()
            {
                nested.collect_references(out);
            }
        }
    }

    /// Visit this container and every nested container, depth-first.
    pub fn visit_containers<'a>(&'a self, visit: &mut impl FnMut(&'a ContainerBlock)) {
        visit(self);
        for group in &self.groups {
            if let GroupCommands::Block(block) = &group.commands
                && let CommandBlock::Container(nested) = block.as_ref()
            {
                nested.visit_containers(visit);
            }
        }
    }
}

/// One repetition inside a container: what to do, how, and after what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub description: String,
    pub commands: GroupCommands,
    /// Declared dependencies; empty only when no dependency block was
    /// present (a present-but-empty list is a parse error).
    pub dependencies: Vec<Reference>,
}

/// The command body of a group: either a raw `<commands>` shell body or
/// a further nested block of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupCommands {
    Raw(String),
    Block(Box<CommandBlock>),
}

/// A dependency pointer: by explicit id (`#x`) or by name (`@x`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reference {
    ById(String),
    ByName(String),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::ById(id) => write!(f, "#{id}"),
            Reference::ByName(name) => write!(f, "@{name}"),
        }
    }
}
