// Dependency Analyzer
// Tarjan's strongly-connected-components algorithm over the merged step
// map, producing topologically ordered stages

use crate::definition::Step;
use crate::error::{GantryError, Result};

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io;

/// Compute the ordered stage sequence for the given step map.
///
/// Edges run from a step to everything in its `after` and `depends_on`
/// sets; stages come out dependencies-first. Ignored steps are pruned
/// from both the node set and the edge set before analysis, so an edge
/// pointing at an ignored step simply disappears. Strongly connected
/// components are leveled by dependency depth, so independent steps
/// share a stage and can run concurrently; a cyclic component survives
/// as a unit inside its stage and is rejected by [`detect_cycles`].
pub fn execution_order(steps: &HashMap<String, Step>) -> Result<Vec<Vec<String>>> {
    let mut tarjan = Tarjan {
        steps,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        next_index: 0,
        stages: Vec::new(),
    };

    // Sorted traversal keeps the output reproducible despite map order.
    let mut names: Vec<&str> = steps
        .iter()
        .filter(|(_, step)| !step.meta.ignore)
        .map(|(name, _)| name.as_str())
        .collect();
    names.sort_unstable();

    for name in names {
        if !tarjan.index.contains_key(name) {
            tarjan.strong_connect(name)?;
        }
    }
    let components = tarjan.stages;

    // Tarjan emits components dependencies-first, so a cross-component
    // edge always points at an already-leveled component.
    let mut component_of: HashMap<&str, usize> = HashMap::new();
    for (i, component) in components.iter().enumerate() {
        for name in component {
            component_of.insert(name.as_str(), i);
        }
    }
    let mut depth = vec![0usize; components.len()];
    for (i, component) in components.iter().enumerate() {
        let mut level = 0;
        for name in component {
            for dependency in steps[name].dependencies() {
                match component_of.get(dependency) {
                    Some(&j) if j != i => level = level.max(depth[j] + 1),
                    _ => {}
                }
            }
        }
        depth[i] = level;
    }

    let stage_count = depth.iter().copied().max().map_or(0, |d| d + 1);
    let mut stages: Vec<Vec<String>> = vec![Vec::new(); stage_count];
    for (i, component) in components.into_iter().enumerate() {
        stages[depth[i]].extend(component);
    }
    for stage in &mut stages {
        stage.sort_unstable();
    }
    Ok(stages)
}

/// Fail on any stage whose members depend on each other. Steps in the
/// same stage are independent by construction, so an intra-stage edge
/// can only come from a cyclic component or a self-dependency.
pub fn detect_cycles(steps: &HashMap<String, Step>, stages: &[Vec<String>]) -> Result<()> {
    for stage in stages {
        let members: HashSet<&str> = stage.iter().map(String::as_str).collect();
        for name in stage {
            let Some(step) = steps.get(name) else {
                continue;
            };
            let mutual: Vec<&str> = step
                .dependencies()
                .into_iter()
                .filter(|dep| members.contains(dep))
                .collect();
            if mutual.contains(&name.as_str()) {
                return Err(GantryError::cycle(format!(
                    "step '{}' depends on itself",
                    name
                )));
            }
            if !mutual.is_empty() {
                let mut cycle: Vec<&str> = mutual;
                cycle.push(name.as_str());
                cycle.sort_unstable();
                return Err(GantryError::cycle(format!(
                    "steps {} are mutually dependent",
                    cycle.join(", ")
                )));
            }
        }
    }
    Ok(())
}

/// Apply selective-run filtering: when any step is selected, everything
/// outside the transitive dependency closure of the selected set is
/// marked ignored.
pub fn select_steps(steps: &mut HashMap<String, Step>) {
    let selected: BTreeSet<String> = steps
        .values()
        .filter(|step| step.meta.selected)
        .map(|step| step.name.clone())
        .collect();
    if selected.is_empty() {
        return;
    }

    let mut closure = selected.clone();
    let mut queue: VecDeque<String> = selected.into_iter().collect();
    while let Some(name) = queue.pop_front() {
        let Some(step) = steps.get(&name) else {
            continue;
        };
        // Unknown dependency names are left for the analyzer to report.
        let dependencies: Vec<String> = step
            .dependencies()
            .into_iter()
            .filter(|dep| steps.contains_key(*dep))
            .map(str::to_string)
            .collect();
        for dependency in dependencies {
            if closure.insert(dependency.clone()) {
                queue.push_back(dependency);
            }
        }
    }

    for (name, step) in steps.iter_mut() {
        if !closure.contains(name) {
            step.meta.ignore = true;
        }
    }
}

/// Render the dependency graph as a `dot` digraph.
pub fn write_dot(steps: &HashMap<String, Step>, out: &mut impl io::Write) -> io::Result<()> {
    writeln!(out, "digraph gantry {{")?;
    writeln!(out, "  rankdir=\"BT\";")?;

    let mut names: Vec<&str> = steps.keys().map(String::as_str).collect();
    names.sort_unstable();
    for name in names {
        for dependency in steps[name].dependencies() {
            writeln!(out, "  \"{}\" -> \"{}\";", name, dependency)?;
        }
    }
    writeln!(out, "}}")
}

struct Tarjan<'a> {
    steps: &'a HashMap<String, Step>,
    index: HashMap<&'a str, usize>,
    lowlink: HashMap<&'a str, usize>,
    on_stack: HashSet<&'a str>,
    stack: Vec<&'a str>,
    next_index: usize,
    stages: Vec<Vec<String>>,
}

impl<'a> Tarjan<'a> {
    fn strong_connect(&mut self, v: &'a str) -> Result<()> {
        self.index.insert(v, self.next_index);
        self.lowlink.insert(v, self.next_index);
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack.insert(v);

        let steps = self.steps;
        let step = &steps[v];
        for w in step.dependencies() {
            let Some(target) = steps.get_key_value(w) else {
                return Err(GantryError::reference(format!(
                    "unknown dependency '{}' for step '{}'",
                    w, v
                )));
            };
            let (w, target) = (target.0.as_str(), target.1);
            if target.meta.ignore {
                continue;
            }
            if !self.index.contains_key(w) {
                self.strong_connect(w)?;
                let low = self.lowlink[v].min(self.lowlink[w]);
                self.lowlink.insert(v, low);
            } else if self.on_stack.contains(w) {
                let low = self.lowlink[v].min(self.index[w]);
                self.lowlink.insert(v, low);
            }
        }

        if self.lowlink[v] == self.index[v] {
            let mut stage = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack.remove(w);
                stage.push(w.to_string());
                if w == v {
                    break;
                }
            }
            stage.sort_unstable();
            self.stages.push(stage);
        }
        Ok(())
    }
}
