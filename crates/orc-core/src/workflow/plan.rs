//! Execution plan: DAG construction, cycle detection, wave layering
//! (spec §4.4).

use std::collections::{HashMap, HashSet};

use super::model::WorkflowStage;
use crate::error::OrcError;

/// One topological layer: stages in `stage_names` have no dependency on one
/// another and may run concurrently (spec §3 `ExecutionWave`).
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionWave {
    pub wave_number: usize,
    pub stage_names: Vec<String>,
    pub has_parallel: bool,
}

/// Three-color DFS / Kahn-layered execution plan over a stage list (spec
/// §4.4). Built once per workflow run from a read-only stage list.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    waves: Vec<ExecutionWave>,
    stage_wave: HashMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl ExecutionPlan {
    /// Build a plan from an ordered stage list (spec §4.4 "Construction").
    pub fn build(stages: &[WorkflowStage]) -> Result<Self, OrcError> {
        let mut index: HashMap<&str, &WorkflowStage> = HashMap::new();
        for stage in stages {
            if index.insert(stage.name.as_str(), stage).is_some() {
                return Err(OrcError::Schema(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        for stage in stages {
            for dep in &stage.depends_on {
                if !index.contains_key(dep.as_str()) {
                    return Err(OrcError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        detect_cycles(stages, &index)?;

        let waves = layer_waves(stages, &index)?;

        let total: usize = waves.iter().map(|w| w.stage_names.len()).sum();
        if total != stages.len() {
            return Err(OrcError::InvalidPlan(format!(
                "wave accounting mismatch: {total} scheduled of {} stages",
                stages.len()
            )));
        }

        let mut stage_wave = HashMap::new();
        for wave in &waves {
            for name in &wave.stage_names {
                stage_wave.insert(name.clone(), wave.wave_number);
            }
        }

        Ok(Self { waves, stage_wave })
    }

    pub fn waves(&self) -> &[ExecutionWave] {
        &self.waves
    }

    pub fn wave_count(&self) -> usize {
        self.waves.len()
    }

    pub fn max_parallelism(&self) -> usize {
        self.waves.iter().map(|w| w.stage_names.len()).max().unwrap_or(0)
    }

    pub fn has_parallel_execution(&self) -> bool {
        self.waves.iter().any(|w| w.has_parallel)
    }

    pub fn root_stages(&self) -> &[String] {
        self.waves.first().map(|w| w.stage_names.as_slice()).unwrap_or(&[])
    }

    pub fn leaf_stages(&self) -> &[String] {
        self.waves.last().map(|w| w.stage_names.as_slice()).unwrap_or(&[])
    }

    pub fn wave_of(&self, stage_name: &str) -> Option<usize> {
        self.stage_wave.get(stage_name).copied()
    }
}

/// Three-color DFS cycle detection (spec §4.4 step 3). On finding a
/// back-edge to a `Gray` node, builds the cycle path from the current DFS
/// stack and fails naming every node on the cycle.
fn detect_cycles(
    stages: &[WorkflowStage],
    index: &HashMap<&str, &WorkflowStage>,
) -> Result<(), OrcError> {
    let mut colors: HashMap<&str, Color> =
        stages.iter().map(|s| (s.name.as_str(), Color::White)).collect();
    let mut dfs_stack: Vec<&str> = Vec::new();

    for stage in stages {
        if colors[stage.name.as_str()] == Color::White {
            visit(stage.name.as_str(), index, &mut colors, &mut dfs_stack)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    name: &'a str,
    index: &HashMap<&'a str, &'a WorkflowStage>,
    colors: &mut HashMap<&'a str, Color>,
    dfs_stack: &mut Vec<&'a str>,
) -> Result<(), OrcError> {
    colors.insert(name, Color::Gray);
    dfs_stack.push(name);

    let stage = index[name];
    for dep in &stage.depends_on {
        let dep_name = dep.as_str();
        match colors[dep_name] {
            Color::White => visit(dep_name, index, colors, dfs_stack)?,
            Color::Gray => {
                let start = dfs_stack.iter().position(|n| *n == dep_name).unwrap_or(0);
                let mut cycle: Vec<String> =
                    dfs_stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep_name.to_string());
                return Err(OrcError::CircularDependency {
                    cycle: cycle.join(" -> "),
                });
            }
            Color::Black => {}
        }
    }

    dfs_stack.pop();
    colors.insert(name, Color::Black);
    Ok(())
}

/// Kahn's algorithm, layered: each round consumes every currently
/// in-degree-0 stage as one wave (spec §4.4 step 4). Stable ordering within
/// a wave follows the source stage list's insertion order.
fn layer_waves(
    stages: &[WorkflowStage],
    index: &HashMap<&str, &WorkflowStage>,
) -> Result<Vec<ExecutionWave>, OrcError> {
    let order: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> =
        order.iter().map(|&n| (n, 0usize)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = order.iter().map(|&n| (n, Vec::new())).collect();

    for stage in stages {
        *in_degree.get_mut(stage.name.as_str()).unwrap() = stage.depends_on.len();
        for dep in &stage.depends_on {
            dependents.get_mut(dep.as_str()).unwrap().push(stage.name.as_str());
        }
    }

    let mut remaining: HashSet<&str> = order.iter().copied().collect();
    let mut waves = Vec::new();
    let mut wave_number = 0;

    while !remaining.is_empty() {
        let ready: Vec<&str> = order
            .iter()
            .copied()
            .filter(|n| remaining.contains(n) && in_degree[n] == 0)
            .collect();

        if ready.is_empty() {
            return Err(OrcError::InvalidPlan(
                "no progress possible; unreachable stages remain (should have been caught by cycle detection)".into(),
            ));
        }

        for &n in &ready {
            remaining.remove(n);
            for &dependent in &dependents[n] {
                if remaining.contains(dependent) {
                    *in_degree.get_mut(dependent).unwrap() -= 1;
                }
            }
        }

        let has_parallel = ready.len() > 1 || ready.iter().any(|n| index[n].parallel);
        waves.push(ExecutionWave {
            wave_number,
            stage_names: ready.into_iter().map(|s| s.to_string()).collect(),
            has_parallel,
        });
        wave_number += 1;
    }

    Ok(waves)
}
