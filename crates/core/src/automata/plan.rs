//! Compilation of step specifications into an executable plan.
//!
//! Every name is resolved against the registry, every config is resolved
//! against the caller overrides and every argument list is validated here,
//! so that a run never meets a configuration error.

use super::microstep::Microstep;
use super::registry::Registry;
use crate::config::{ConfigOverrides, StepConfig};
use crate::error::{ConfigError, ConfigResult};
use crate::step::{sequence_leaf_names, LeafStep, Step};
use crate::types::step_path;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) enum PlannedStep {
    Leaf(PlannedLeaf),
    Fallback(Vec<PlannedStep>),
}

#[derive(Clone)]
pub(crate) struct PlannedLeaf {
    /// Full step path, e.g. `deploy/SetDeploymentEnv`
    pub path: String,
    pub args: Vec<serde_json::Value>,
    pub config: StepConfig,
    pub work: LeafWork,
}

/// What a leaf does when invoked
#[derive(Clone)]
pub(crate) enum LeafWork {
    Micro(Arc<dyn Microstep>),
    Macro(Arc<MacroPlan>),
}

/// A macrostep compiled for one position of a workflow
pub(crate) struct MacroPlan {
    pub name: String,
    pub steps: Vec<PlannedStep>,
}

/// Compile the sequence of a workflow named `name`: its leaves are macrosteps
pub(crate) fn compile_workflow(
    name: &str,
    tasks: &[Step],
    registry: &Registry,
    overrides: &ConfigOverrides,
) -> ConfigResult<Vec<PlannedStep>> {
    let mut resolve_macro = |leaf: &LeafStep, scope: &str, path: &str| -> ConfigResult<LeafWork> {
        let macrostep = registry
            .macrostep(&leaf.name)
            .ok_or_else(|| ConfigError::UnknownStep {
                kind: "macrostep",
                name: leaf.name.clone(),
                scope: scope.to_string(),
            })?;

        if !leaf.args.is_empty() {
            return Err(ConfigError::InvalidArgs {
                step: path.to_string(),
                reason: "a macrostep takes no arguments".to_string(),
            });
        }

        let steps = compile_sequence(
            path,
            &macrostep.tasks,
            &overrides.nested(&leaf.name),
            &mut |leaf: &LeafStep, scope: &str, path: &str| resolve_micro(registry, leaf, scope, path),
        )?;

        Ok(LeafWork::Macro(Arc::new(MacroPlan {
            name: macrostep.name.clone(),
            steps,
        })))
    };

    compile_sequence(name, tasks, overrides, &mut resolve_macro)
}

fn resolve_micro(registry: &Registry, leaf: &LeafStep, scope: &str, path: &str) -> ConfigResult<LeafWork> {
    let microstep = registry
        .microstep(&leaf.name)
        .ok_or_else(|| ConfigError::UnknownStep {
            kind: "microstep",
            name: leaf.name.clone(),
            scope: scope.to_string(),
        })?;

    microstep
        .validate_args(&leaf.args)
        .map_err(|e| ConfigError::InvalidArgs {
            step: path.to_string(),
            reason: format!("{:#}", e),
        })?;

    Ok(LeafWork::Micro(microstep))
}

/// Compile one sequence under `scope`, resolving leaf work with `resolve`
fn compile_sequence<F>(
    scope: &str,
    tasks: &[Step],
    overrides: &ConfigOverrides,
    resolve: &mut F,
) -> ConfigResult<Vec<PlannedStep>>
where
    F: FnMut(&LeafStep, &str, &str) -> ConfigResult<LeafWork>,
{
    check_overrides(scope, tasks, overrides)?;

    tasks
        .iter()
        .map(|step| compile_step(scope, step, overrides, resolve))
        .collect()
}

fn compile_step<F>(
    scope: &str,
    step: &Step,
    overrides: &ConfigOverrides,
    resolve: &mut F,
) -> ConfigResult<PlannedStep>
where
    F: FnMut(&LeafStep, &str, &str) -> ConfigResult<LeafWork>,
{
    match step {
        Step::Leaf(leaf) => {
            if leaf.name.trim().is_empty() {
                return Err(ConfigError::EmptyName {
                    scope: scope.to_string(),
                });
            }

            let path = step_path(scope, &leaf.name);
            let config = overrides.resolve(&leaf.name, &leaf.config);
            config.validate(&path)?;
            let work = resolve(leaf, scope, &path)?;

            Ok(PlannedStep::Leaf(PlannedLeaf {
                path,
                args: leaf.args.clone(),
                config,
                work,
            }))
        }
        Step::Fallback { alternatives } => {
            if alternatives.is_empty() {
                return Err(ConfigError::EmptyFallback {
                    scope: scope.to_string(),
                });
            }

            let alternatives = alternatives
                .iter()
                .map(|alt| compile_step(scope, alt, overrides, resolve))
                .collect::<ConfigResult<Vec<_>>>()?;
            Ok(PlannedStep::Fallback(alternatives))
        }
    }
}

/// Every override key must name a leaf of the sequence it applies to
fn check_overrides(scope: &str, tasks: &[Step], overrides: &ConfigOverrides) -> ConfigResult<()> {
    let names: HashSet<&str> = sequence_leaf_names(tasks).into_iter().collect();
    match overrides.names().find(|name| !names.contains(name)) {
        Some(name) => Err(ConfigError::UnknownOverride {
            name: name.to_string(),
            scope: scope.to_string(),
        }),
        None => Ok(()),
    }
}
