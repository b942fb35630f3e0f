// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Package dependency graph kept acyclic on every insertion.

use std::collections::HashMap;

use log::debug;

use crate::errors::GraphError;

/// Directed "depends on" graph between packages.
///
/// Nodes and edges remember their insertion order, which makes
/// [`DependencyGraph::overall_order`] deterministic.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str) -> usize {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(name.to_string());
        self.index.insert(name.to_string(), id);
        self.dependencies.push(Vec::new());
        id
    }

    /// Records that `pkg` depends on `dep`, unless the edge would close a
    /// cycle, in which case the graph is left untouched. Returns whether the
    /// edge is part of the graph afterwards.
    pub fn add_dependency(&mut self, pkg: &str, dep: &str) -> bool {
        let from = self.add_node(pkg);
        let to = self.add_node(dep);

        if self.depends_on(from).contains(&to) {
            return true;
        }
        if from == to || self.reaches(to, from) {
            debug!("dropping dependency {pkg} -> {dep}: it closes a cycle");
            return false;
        }
        if let Some(deps) = self.dependencies.get_mut(from) {
            deps.push(to);
        }
        true
    }

    pub fn has_dependency(&self, pkg: &str, dep: &str) -> bool {
        match (self.index.get(pkg), self.index.get(dep)) {
            (Some(&from), Some(to)) => self.depends_on(from).contains(to),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn depends_on(&self, id: usize) -> &[usize] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    fn name(&self, id: usize) -> &str {
        self.nodes.get(id).map(String::as_str).unwrap_or_default()
    }

    fn reaches(&self, start: usize, target: usize) -> bool {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if let Some(flag) = seen.get_mut(id) {
                if *flag {
                    continue;
                }
                *flag = true;
            }
            stack.extend(self.depends_on(id).iter().copied());
        }
        false
    }

    /// Every package, each listed after all of its dependencies.
    pub fn overall_order(&self) -> Result<Vec<String>, GraphError> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        for id in 0..self.nodes.len() {
            self.visit(id, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        id: usize,
        marks: &mut [Mark],
        order: &mut Vec<String>,
    ) -> Result<(), GraphError> {
        match marks.get(id).copied() {
            Some(Mark::Unvisited) => {}
            Some(Mark::InProgress) => return Err(GraphError::Cycle(self.name(id).to_string())),
            Some(Mark::Done) | None => return Ok(()),
        }
        if let Some(mark) = marks.get_mut(id) {
            *mark = Mark::InProgress;
        }
        for &dep in self.depends_on(id) {
            self.visit(dep, marks, order)?;
        }
        if let Some(mark) = marks.get_mut(id) {
            *mark = Mark::Done;
        }
        order.push(self.name(id).to_string());
        Ok(())
    }
}
