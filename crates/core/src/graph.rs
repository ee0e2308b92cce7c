//! Directed dependency graph with deterministic topological ordering.
//!
//! An edge `from -> to` means "`from` depends on `to`". The sort emits every
//! vertex after all of its transitive dependencies; independent vertices keep
//! their insertion order, so repeated passes over the same bundle always write
//! in the same sequence.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("vertex {0:?} not found")]
    VertexNotFound(String),
    #[error("cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Graph<V> {
    vertices: Vec<V>,
    index: HashMap<V, usize>,
    edges: Vec<Vec<usize>>,
}

impl<V> Default for Graph<V> {
    fn default() -> Self {
        Self { vertices: Vec::new(), index: HashMap::new(), edges: Vec::new() }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

impl<V> Graph<V>
where
    V: Clone + Eq + Hash + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn contains(&self, v: &V) -> bool {
        self.index.contains_key(v)
    }

    /// Adds a vertex; returns false when it was already present.
    pub fn add_vertex(&mut self, v: V) -> bool {
        if self.index.contains_key(&v) {
            return false;
        }
        self.index.insert(v.clone(), self.vertices.len());
        self.vertices.push(v);
        self.edges.push(Vec::new());
        true
    }

    /// Records that `from` depends on `to`. Both vertices must exist.
    pub fn add_edge(&mut self, from: &V, to: &V) -> Result<(), GraphError> {
        let f = *self.index.get(from).ok_or_else(|| GraphError::VertexNotFound(from.to_string()))?;
        let t = *self.index.get(to).ok_or_else(|| GraphError::VertexNotFound(to.to_string()))?;
        if let Some(out) = self.edges.get_mut(f) {
            if !out.contains(&t) {
                out.push(t);
            }
        }
        Ok(())
    }

    /// Direct dependencies of `v` in edge insertion order.
    pub fn dependencies(&self, v: &V) -> Vec<V> {
        let Some(&i) = self.index.get(v) else { return Vec::new() };
        self.edges
            .get(i)
            .map(|out| out.iter().filter_map(|&j| self.vertices.get(j).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn topological_sort(&self) -> Result<Vec<V>, GraphError> {
        let mut marks = vec![Mark::Unvisited; self.vertices.len()];
        let mut path: Vec<usize> = Vec::new();
        let mut order: Vec<V> = Vec::with_capacity(self.vertices.len());
        for start in 0..self.vertices.len() {
            if marks[start] == Mark::Unvisited {
                self.visit(start, &mut marks, &mut path, &mut order)?;
            }
        }
        Ok(order)
    }

    fn visit(&self, u: usize, marks: &mut [Mark], path: &mut Vec<usize>, order: &mut Vec<V>) -> Result<(), GraphError> {
        marks[u] = Mark::Visiting;
        path.push(u);
        for &dep in &self.edges[u] {
            match marks[dep] {
                Mark::Done => {}
                Mark::Visiting => {
                    let start = path.iter().position(|&p| p == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|&i| self.vertices[i].to_string()).collect();
                    cycle.push(self.vertices[dep].to_string());
                    return Err(GraphError::Cycle(cycle));
                }
                Mark::Unvisited => self.visit(dep, marks, path, order)?,
            }
        }
        path.pop();
        marks[u] = Mark::Done;
        order.push(self.vertices[u].clone());
        Ok(())
    }
}
