use std::collections::{BTreeSet, HashMap};

use crate::error::SpecError;
use crate::spec::PipelineSpec;

/// Ordering constraints between stages, resolved before anything executes.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// `edges[i]` lists the stages stage `i` depends on.
    edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new(spec: &PipelineSpec) -> Result<Self, SpecError> {
        let names: Vec<String> = spec.stages.iter().map(|stage| stage.name.clone()).collect();
        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        let mut edges = Vec::with_capacity(names.len());
        for stage in &spec.stages {
            let mut deps = Vec::new();
            for dep in stage.dependencies() {
                let Some(&dep_idx) = index.get(dep) else {
                    return Err(SpecError::UnknownDependency {
                        stage: stage.name.clone(),
                        missing: dep.to_string(),
                    });
                };
                if !deps.contains(&dep_idx) {
                    deps.push(dep_idx);
                }
            }
            edges.push(deps);
        }

        Ok(Self {
            names,
            index,
            edges,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Stable topological order: among stages whose dependencies are all
    /// scheduled, declaration order wins. Repeated calls on the same spec
    /// yield the same order.
    pub fn topological_order(&self) -> Result<Vec<String>, SpecError> {
        let mut placed = vec![false; self.names.len()];
        let mut order = Vec::with_capacity(self.names.len());

        while order.len() < self.names.len() {
            let next = (0..self.names.len()).find(|&idx| {
                !placed[idx] && self.edges[idx].iter().all(|&dep| placed[dep])
            });
            match next {
                Some(idx) => {
                    placed[idx] = true;
                    order.push(self.names[idx].clone());
                }
                None => return Err(SpecError::CycleDetected(self.find_cycle(&placed))),
            }
        }

        Ok(order)
    }

    /// The named stage plus everything it transitively depends on. `None`
    /// when the stage does not exist.
    pub fn ancestry(&self, stage: &str) -> Option<BTreeSet<String>> {
        let &start = self.index.get(stage)?;
        let mut seen = vec![false; self.names.len()];
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            if seen[idx] {
                continue;
            }
            seen[idx] = true;
            stack.extend(&self.edges[idx]);
        }
        Some(
            seen.iter()
                .enumerate()
                .filter(|&(_, &visited)| visited)
                .map(|(idx, _)| self.names[idx].clone())
                .collect(),
        )
    }

    /// Graph depth per stage: 0 for roots, 1 + max dependency depth
    /// otherwise. Stages of equal depth are independent of each other and
    /// may run concurrently.
    pub fn depths(&self) -> Result<HashMap<String, usize>, SpecError> {
        let order = self.topological_order()?;
        let mut depths: HashMap<String, usize> = HashMap::with_capacity(order.len());
        for name in &order {
            let idx = self.index[name];
            let depth = self.edges[idx]
                .iter()
                .map(|&dep| depths[&self.names[dep]] + 1)
                .max()
                .unwrap_or(0);
            depths.insert(name.clone(), depth);
        }
        Ok(depths)
    }

    /// Walk unplaced stages along unplaced dependencies until one repeats.
    fn find_cycle(&self, placed: &[bool]) -> Vec<String> {
        let Some(start) = (0..self.names.len()).find(|&idx| !placed[idx]) else {
            return Vec::new();
        };

        let mut path: Vec<usize> = Vec::new();
        let mut current = start;
        loop {
            if let Some(pos) = path.iter().position(|&idx| idx == current) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&idx| self.names[idx].clone()).collect();
                cycle.push(self.names[current].clone());
                return cycle;
            }
            path.push(current);
            match self.edges[current].iter().find(|&&dep| !placed[dep]) {
                Some(&dep) => current = dep,
                None => return vec![self.names[current].clone()],
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::StageSpec;

    fn stage(name: &str, needs: &[&str]) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            required: true,
            needs: needs.iter().map(|dep| dep.to_string()).collect(),
            hard_needs: Vec::new(),
            toolchains: Vec::new(),
            steps: Vec::new(),
            timeout_secs: None,
        }
    }

    fn pipeline(stages: Vec<StageSpec>) -> PipelineSpec {
        PipelineSpec {
            version: 1,
            pipeline: "test".to_string(),
            triggers: None,
            stages,
            artifact: None,
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let spec = pipeline(vec![stage("build", &["build"])]);
        let graph = DependencyGraph::new(&spec).unwrap();
        match graph.topological_order() {
            Err(SpecError::CycleDetected(cycle)) => {
                assert!(cycle.contains(&"build".to_string()))
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let spec = pipeline(vec![
            stage("lint", &[]),
            stage("build", &[]),
            stage("package", &["build"]),
        ]);
        let graph = DependencyGraph::new(&spec).unwrap();
        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec!["lint", "build", "package"]);
    }
}
