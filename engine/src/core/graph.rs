//! Dependency graph construction over a parsed command sequence.
//!
//! Containers (task/service/package) are graph nodes addressed by a
//! stable key (`id` attribute, else `name`). Nested containers execute
//! inline within their enclosing top-level block, so their dependency
//! edges are hoisted to that unit for scheduling; cycle detection runs
//! over both the declared node graph and the hoisted unit graph.
//! All graph errors are fatal before any execution.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

use crate::core::ast::{CommandBlock, CommandSequence, ContainerBlock, GroupCommands, Reference};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("unresolved reference {reference}")]
    UnresolvedReference { reference: String },
    #[error("dependency cycle: {}", format_cycle(path))]
    CycleDetected { path: Vec<String> },
    #[error("duplicate identifier '{identifier}'")]
    DuplicateIdentifier { identifier: String },
    #[error("{kind} block is missing an id or name attribute")]
    MissingIdentifier { kind: String },
    #[error("reference {reference} targets a block that runs later in the same unit")]
    ForwardReference { reference: String },
}

fn format_cycle(path: &[String]) -> String {
    let mut parts: Vec<&str> = path.iter().map(String::as_str).collect();
    if let Some(first) = path.first() {
        parts.push(first);
    }
    parts.join(" -> ")
}

/// One schedulable unit: a top-level block.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Document position among top-level blocks.
    pub index: usize,
    /// Container key, or a synthetic `bash[i]` / `python[i]` label for
    /// identity-less leaves.
    pub label: String,
    /// Units that must reach `Completed` before this one starts
    /// (declared dependencies, hoisted from nested containers).
    pub deps: Vec<usize>,
    /// Previous top-level leaf; must reach a terminal state (not
    /// necessarily success) first, preserving document order of leaves.
    pub order_after: Option<usize>,
    /// Per-unit timeout override from the container's `timeout`
    /// attribute, in seconds.
    pub timeout_secs: Option<u64>,
}

/// Dependency graph over the top-level units of one command sequence.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub units: Vec<Unit>,
    /// Reverse edges of `deps`, per unit.
    pub dependents: Vec<Vec<usize>>,
    /// Node key -> unit that executes it (containers, nested included).
    pub node_units: BTreeMap<String, usize>,
}

/// Build and validate the dependency graph for a parsed sequence.
pub fn build_graph(sequence: &CommandSequence) -> Result<TaskGraph, GraphError> {
    let mut builder = GraphBuilder::default();
    builder.register_nodes(sequence)?;
    builder.build_units(sequence)?;
    builder.check_node_cycles()?;
    builder.check_unit_cycles()?;
    Ok(builder.finish())
}

#[derive(Default)]
struct GraphBuilder {
    units: Vec<Unit>,
    /// `id` attribute -> node key.
    by_id: HashMap<String, String>,
    /// `name` attribute -> node key.
    by_name: HashMap<String, String>,
    /// Node key -> owning unit index.
    node_units: BTreeMap<String, usize>,
    /// Declared node-level edges, in document order: node key -> targets.
    node_edges: Vec<(String, Vec<String>)>,
}

impl GraphBuilder {
    /// Register every container (nested included) under its stable key.
    /// Duplicates are always rejected, never resolved last-wins.
    fn register_nodes(&mut self, sequence: &CommandSequence) -> Result<(), GraphError> {
        for (index, block) in sequence.blocks.iter().enumerate() {
            let CommandBlock::Container(container) = block else {
                continue;
            };
            let mut result = Ok(());
            container.visit_containers(&mut |node: &ContainerBlock| {
                if result.is_err() {
                    return;
                }
                result = self.register_node(node, index);
            });
            result?;
        }
        Ok(())
    }

    fn register_node(&mut self, node: &ContainerBlock, unit: usize) -> Result<(), GraphError> {
        let Some(key) = node.key() else {
            return Err(GraphError::MissingIdentifier {
                kind: node.kind.as_str().to_string(),
            });
        };
        let key = key.to_string();

        if let Some(id) = node.attribute("id")
            && self.by_id.insert(id.to_string(), key.clone()).is_some()
        {
            return Err(GraphError::DuplicateIdentifier {
                identifier: id.to_string(),
            });
        }
        if let Some(name) = node.attribute("name")
            && self.by_name.insert(name.to_string(), key.clone()).is_some()
        {
            return Err(GraphError::DuplicateIdentifier {
                identifier: name.to_string(),
            });
        }
        if self.node_units.insert(key.clone(), unit).is_some() {
            return Err(GraphError::DuplicateIdentifier { identifier: key });
        }
        Ok(())
    }

    fn build_units(&mut self, sequence: &CommandSequence) -> Result<(), GraphError> {
        let mut previous_leaf: Option<usize> = None;

        for (index, block) in sequence.blocks.iter().enumerate() {
            let unit = match block {
                CommandBlock::Bash { .. } | CommandBlock::Python { .. } => {
                    let label = format!("{}[{index}]", block.leaf_tool().unwrap_or("leaf"));
                    let order_after = previous_leaf.replace(index);
                    Unit {
                        index,
                        label,
                        deps: Vec::new(),
                        order_after,
                        timeout_secs: None,
                    }
                }
                CommandBlock::Container(container) => {
                    self.container_unit(container, index)?
                }
            };
            self.units.push(unit);
        }
        Ok(())
    }

    fn container_unit(
        &mut self,
        container: &ContainerBlock,
        index: usize,
    ) -> Result<Unit, GraphError> {
        // Registration already guaranteed a key.
        let label = container.key().unwrap_or_default().to_string();

        // Node-level edges, per container (nested included).
        let mut resolve_err = None;
        container.visit_containers(&mut |node: &ContainerBlock| {
            if resolve_err.is_some() {
                return;
            }
            let Some(node_key) = node.key() else {
                return;
            };
            let mut refs = Vec::new();
            for group in &node.groups {
                refs.extend(group.dependencies.iter().cloned());
            }
            let mut targets = Vec::new();
            for reference in &refs {
                match self.resolve(reference) {
                    Ok(target) => {
                        if !targets.contains(&target) {
                            targets.push(target);
                        }
                    }
                    Err(err) => {
                        resolve_err = Some(err);
                        return;
                    }
                }
            }
            self.node_edges.push((node_key.to_string(), targets));
        });
        if let Some(err) = resolve_err {
            return Err(err);
        }

        // References into the same unit must be satisfiable by in-unit
        // textual order: the target's subtree finishes before the
        // referencing group starts.
        let mut finished = HashSet::new();
        self.check_in_unit_order(container, index, &mut finished)?;

        // Hoisted unit edges: every reference declared anywhere inside
        // this top-level block gates the whole unit.
        let mut references = Vec::new();
        container.collect_references(&mut references);
        let mut deps = Vec::new();
        for reference in &references {
            let target_key = self.resolve(reference)?;
            let target_unit = self.node_units[&target_key];
            if target_unit != index && !deps.contains(&target_unit) {
                deps.push(target_unit);
            }
        }

        Ok(Unit {
            index,
            label,
            deps,
            order_after: None,
            timeout_secs: container.timeout_secs(),
        })
    }

    /// Walk a unit in execution order (groups textually, nested blocks
    /// depth-first). A group's reference to a node of the same unit is
    /// legal only when that node has already finished at the point the
    /// group runs; anything else would execute a dependent before its
    /// dependency.
    fn check_in_unit_order(
        &self,
        container: &ContainerBlock,
        unit: usize,
        finished: &mut HashSet<String>,
    ) -> Result<(), GraphError> {
        for group in &container.groups {
            for reference in &group.dependencies {
                let target = self.resolve(reference)?;
                if self.node_units[&target] == unit && !finished.contains(&target) {
                    return Err(GraphError::ForwardReference {
                        reference: reference.to_string(),
                    });
                }
            }
            if let GroupCommands::Block(block) = &group.commands
                && let CommandBlock::Container(nested) = block.as_ref()
            {
                self.check_in_unit_order(nested, unit, finished)?;
                if let Some(key) = nested.key() {
                    finished.insert(key.to_string());
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, reference: &Reference) -> Result<String, GraphError> {
        let resolved = match reference {
            Reference::ById(id) => self.by_id.get(id),
            Reference::ByName(name) => self.by_name.get(name),
        };
        resolved.cloned().ok_or_else(|| GraphError::UnresolvedReference {
            reference: reference.to_string(),
        })
    }

    /// Depth-first coloring over the declared node graph; reports the
    /// minimal offending cycle as an ordered key list.
    fn check_node_cycles(&self) -> Result<(), GraphError> {
        let adjacency: BTreeMap<&str, &[String]> = self
            .node_edges
            .iter()
            .map(|(key, targets)| (key.as_str(), targets.as_slice()))
            .collect();

        let mut state: HashMap<&str, Color> = HashMap::new();
        for key in adjacency.keys() {
            let mut stack = Vec::new();
            if let Some(path) = visit(*key, &adjacency, &mut state, &mut stack) {
                return Err(GraphError::CycleDetected { path });
            }
        }
        return Ok(());

        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            InProgress,
            Done,
        }

        fn visit<'a>(
            key: &'a str,
            adjacency: &BTreeMap<&'a str, &'a [String]>,
            state: &mut HashMap<&'a str, Color>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match state.get(key) {
                Some(Color::Done) => return None,
                Some(Color::InProgress) => {
                    let start = stack.iter().position(|k| *k == key).unwrap_or(0);
                    return Some(stack[start..].iter().map(|k| k.to_string()).collect());
                }
                None => {}
            }
            state.insert(key, Color::InProgress);
            stack.push(key);
            if let Some(targets) = adjacency.get(key) {
                for target in *targets {
                    if let Some(path) = visit(target.as_str(), adjacency, state, stack) {
                        return Some(path);
                    }
                }
            }
            stack.pop();
            state.insert(key, Color::Done);
            None
        }
    }

    /// Cycles introduced indirectly through nesting (hoisted edges) are
    /// just as fatal as declared ones.
    fn check_unit_cycles(&self) -> Result<(), GraphError> {
        let mut state = vec![0u8; self.units.len()]; // 0 new, 1 in progress, 2 done
        let mut stack = Vec::new();
        for start in 0..self.units.len() {
            if let Some(path) = self.visit_unit(start, &mut state, &mut stack) {
                return Err(GraphError::CycleDetected { path });
            }
        }
        Ok(())
    }

    fn visit_unit(
        &self,
        unit: usize,
        state: &mut Vec<u8>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        match state[unit] {
            2 => return None,
            1 => {
                let start = stack.iter().position(|u| *u == unit).unwrap_or(0);
                return Some(
                    stack[start..]
                        .iter()
                        .map(|u| self.units[*u].label.clone())
                        .collect(),
                );
            }
            _ => {}
        }
        state[unit] = 1;
        stack.push(unit);
        for dep in &self.units[unit].deps {
            if let Some(path) = self.visit_unit(*dep, state, stack) {
                return Some(path);
            }
        }
        stack.pop();
        state[unit] = 2;
        None
    }

    fn finish(self) -> TaskGraph {
        let mut dependents = vec![Vec::new(); self.units.len()];
        for unit in &self.units {
            for dep in &unit.deps {
                dependents[*dep].push(unit.index);
            }
        }
        TaskGraph {
            units: self.units,
            dependents,
            node_units: self.node_units,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse;
    use crate::core::token::lex;

    fn graph(source: &str) -> Result<TaskGraph, GraphError> {
        build_graph(&parse(&lex(source).expect("lex")).expect("parse"))
    }

    fn task(name: &str, deps: &str) -> String {
        let dep_block = if deps.is_empty() {
            String::new()
        } else {
            format!("<dependencies>{deps}</dependencies>")
        };
        format!(
            "<task name=\"{name}\"><description>d</description><commands>c</commands>{dep_block}</task>"
        )
    }

    #[test]
    fn single_task_yields_single_node() {
        let graph = graph(&task("a", "")).expect("graph");
        assert_eq!(graph.units.len(), 1);
        assert_eq!(graph.units[0].label, "a");
        assert!(graph.units[0].deps.is_empty());
    }

    #[test]
    fn resolves_name_and_id_references() {
        let source = format!(
            "<task id=\"t1\" name=\"build\"><description>d</description><commands>c</commands></task>{}",
            task("deploy", "#t1")
        );
        let graph = graph(&source).expect("graph");
        assert_eq!(graph.units[1].deps, vec![0]);
    }

    #[test]
    fn unresolved_reference_is_fatal() {
        let err = graph(&task("a", "@ghost")).expect_err("should fail");
        assert_eq!(
            err,
            GraphError::UnresolvedReference {
                reference: "@ghost".to_string()
            }
        );
    }

    #[test]
    fn duplicate_names_are_fatal() {
        let source = format!("{}{}", task("x", ""), task("x", ""));
        let err = graph(&source).expect_err("should fail");
        assert_eq!(
            err,
            GraphError::DuplicateIdentifier {
                identifier: "x".to_string()
            }
        );
    }

    #[test]
    fn container_without_identity_is_fatal() {
        let err = graph("<task><description>d</description><commands>c</commands></task>")
            .expect_err("should fail");
        assert!(matches!(err, GraphError::MissingIdentifier { .. }));
    }

    /// A two-node cycle is reported with the minimal offending path and
    /// nothing is schedulable.
    #[test]
    fn cycle_is_detected_with_path() {
        let source = format!("{}{}", task("a", "@b"), task("b", "@a"));
        let err = graph(&source).expect_err("should fail");
        let GraphError::CycleDetected { path } = err else {
            panic!("expected cycle");
        };
        assert_eq!(path.len(), 2);
        assert!(path.contains(&"a".to_string()));
        assert!(path.contains(&"b".to_string()));
    }

    /// A cycle that only closes through a nested container's hoisted
    /// edge is still fatal.
    #[test]
    fn nesting_induced_cycle_is_detected() {
        let source = format!(
            "<task name=\"outer\"><description>d</description>\
             <task name=\"inner\"><description>d</description><commands>c</commands>\
             <dependencies>@late</dependencies></task></task>{}",
            task("late", "@outer")
        );
        let err = graph(&source).expect_err("should fail");
        assert!(matches!(err, GraphError::CycleDetected { .. }));
    }

    /// Top-level leaves chain in document order through ordering edges.
    #[test]
    fn leaves_are_ordered_by_document_position() {
        let source = "<bash>one</bash><python>two</python><bash>three</bash>";
        let graph = graph(source).expect("graph");
        assert_eq!(graph.units[0].order_after, None);
        assert_eq!(graph.units[1].order_after, Some(0));
        assert_eq!(graph.units[2].order_after, Some(1));
        assert_eq!(graph.units[0].label, "bash[0]");
        assert_eq!(graph.units[1].label, "python[1]");
    }

    /// A nested node may not depend on a sibling that runs later in the
    /// same unit; inline execution could never satisfy it.
    #[test]
    fn forward_in_unit_reference_is_fatal() {
        let source = "<task name=\"outer\">\
                      <description>d1</description>\
                      <task name=\"first\"><description>d</description><commands>c1</commands>\
                      <dependencies>@second</dependencies></task>\
                      <description>d2</description>\
                      <task name=\"second\"><description>d</description><commands>c2</commands></task>\
                      </task>";
        let err = graph(source).expect_err("should fail");
        assert_eq!(
            err,
            GraphError::ForwardReference {
                reference: "@second".to_string()
            }
        );
    }

    /// A nested node may not depend on its enclosing container either;
    /// the container finishes only after the nested node.
    #[test]
    fn reference_to_enclosing_container_is_fatal() {
        let source = "<task name=\"outer\">\
                      <description>d1</description>\
                      <task name=\"inner\"><description>d</description><commands>c</commands>\
                      <dependencies>@outer</dependencies></task>\
                      </task>";
        let err = graph(source).expect_err("should fail");
        assert!(matches!(err, GraphError::ForwardReference { .. }));
    }

    /// References that resolve within the same unit do not create
    /// self-edges; in-unit order is textual.
    #[test]
    fn in_unit_references_are_not_self_edges() {
        let source = "<task name=\"outer\"><description>d1</description>\
                      <task name=\"inner\"><description>d</description><commands>c</commands></task>\
                      <description>d2</description><commands>c2</commands>\
                      <dependencies>@inner</dependencies></task>";
        let graph = graph(source).expect("graph");
        assert!(graph.units[0].deps.is_empty());
        assert_eq!(graph.node_units["inner"], 0);
    }
}
