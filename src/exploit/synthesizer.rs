//! Turning a classified leak into an exploit template.
//!
//! The primary route comes straight from the selected descriptor. Further routes
//! come from two places: the other exploitable leaks of the same run, which need no
//! input change, and input probing, which looks for one input byte whose value
//! selects the flag offset leaked at the primary output position. Probing only ever
//! changes concrete input bytes and re-traces; input never becomes symbolic.

use std::{collections::BTreeMap, sync::Arc};

use log::{debug, info};

use crate::{
    context::AnalysisContext,
    exploit::{Companion, ExploitTemplate, Route},
    expr::{ExprArena, ExprFlags, ExprRef, Variable},
    leak::{ByteDependency, InverseTransform, LeakClassifier, LeakDescriptor, NaiveLeak},
    solver::{Constraint, Enumeration},
    trace::{ExecutionTrace, FlagMode, FlagRegion, TraceByte, TraceRunner},
    Error, Result, Stage,
};

/// Builds [`ExploitTemplate`] values for the leaks of one session.
///
/// The synthesizer reads the session's concrete trace for observed output bytes and
/// the full dependency set for companion constraints; it runs the target again only
/// while probing.
pub struct ExploitSynthesizer<'a> {
    context: AnalysisContext<'a>,
    flag: FlagRegion,
    input: &'a [u8],
    concrete: &'a ExecutionTrace,
    dependencies: &'a [ByteDependency],
    descriptors: &'a [LeakDescriptor],
    max_candidates: usize,
    max_assignments: u64,
}

impl<'a> ExploitSynthesizer<'a> {
    /// Creates a synthesizer over the results of one detection pass.
    #[must_use]
    pub fn new(
        context: AnalysisContext<'a>,
        flag: FlagRegion,
        input: &'a [u8],
        concrete: &'a ExecutionTrace,
        dependencies: &'a [ByteDependency],
        descriptors: &'a [LeakDescriptor],
    ) -> Self {
        Self {
            context,
            flag,
            input,
            concrete,
            dependencies,
            descriptors,
            max_candidates: context.config.solver.max_candidates,
            max_assignments: context.config.solver.max_assignments,
        }
    }

    /// Overrides the candidate bound and assignment budget of solver-backed routes.
    ///
    /// Queries that still exceed the bounds are retried once with the expanded
    /// bounds of the configuration, whichever is larger.
    #[must_use]
    pub fn with_bounds(mut self, max_candidates: usize, max_assignments: u64) -> Self {
        self.max_candidates = max_candidates;
        self.max_assignments = max_assignments;
        self
    }

    /// Synthesizes a template whose primary route reproduces `descriptor`.
    ///
    /// # Errors
    ///
    /// - [`Error::Unsynthesizable`] if the leak is unresolved, below the confidence
    ///   threshold, or its flag byte cannot be pinned to a single value
    /// - [`Error::Timeout`] if the solver exceeds its budget
    pub fn synthesize(&self, descriptor: &LeakDescriptor) -> Result<ExploitTemplate> {
        let min_confidence = self.context.config.classifier.min_confidence;
        if !descriptor.is_exploitable(min_confidence) {
            let reason = if descriptor.confidence < min_confidence {
                format!(
                    "{} leak with confidence {:.2} below {:.2}",
                    descriptor.class, descriptor.confidence, min_confidence
                )
            } else {
                format!("{} leak cannot be reproduced", descriptor.class)
            };
            return Err(unsynthesizable(descriptor, reason));
        }

        let Some(primary_offset) = descriptor.flag_offsets().first().copied() else {
            return Err(unsynthesizable(descriptor, "leak has no flag offset"));
        };
        let primary = self.route_for(descriptor, primary_offset)?;

        let mut routes = BTreeMap::new();
        routes.insert(primary_offset, primary);
        self.add_sibling_routes(descriptor, &mut routes);

        let mut probe_positions = Vec::new();
        if self.context.config.probing.enabled && descriptor.single_flag_offset().is_some() {
            if let Some(probe) = self.probe(descriptor, primary_offset, &mut routes) {
                probe_positions.push(probe);
            }
        }

        info!(
            "synthesized {} routes for {} (probe positions {:?})",
            routes.len(),
            descriptor,
            probe_positions
        );
        Ok(ExploitTemplate::new(
            self.input.to_vec(),
            probe_positions,
            descriptor.channel,
            primary_offset,
            routes,
        ))
    }

    /// Route with the unmodified input for the leak described by `descriptor`.
    fn route_for(&self, descriptor: &LeakDescriptor, target: u32) -> Result<Route> {
        if let Some(inverse) = &descriptor.inverse {
            return Ok(Route {
                patches: Vec::new(),
                position: descriptor.position,
                inverse: inverse.clone(),
                expression: descriptor.expression().clone(),
                companions: Vec::new(),
                max_assignments: 0,
            });
        }

        let output = self.concrete.channel_output(descriptor.channel);
        let observe = |position: usize| {
            output.get(position).copied().ok_or_else(|| {
                unsynthesizable(
                    descriptor,
                    format!("concrete output has no byte at position {position}"),
                )
            })
        };

        // Bytes that also depend on runtime state cannot be replayed as constraints.
        let companions: Vec<Companion> = self
            .dependencies
            .iter()
            .filter(|dep| {
                dep.channel == descriptor.channel
                    && dep.position != descriptor.position
                    && dep.flag_offsets.is_subset(descriptor.flag_offsets())
                    && !dep.expression.flags().contains(ExprFlags::EXTERNAL)
            })
            .map(|dep| Companion {
                position: dep.position,
                expression: dep.expression.clone(),
            })
            .collect();

        let expression = descriptor.expression();
        let mut arena = ExprArena::new();
        let mut constraints = vec![Constraint::new(
            arena.import(expression.arena(), expression.id()),
            observe(descriptor.position)?,
        )];
        for companion in &companions {
            let expr = arena.import(companion.expression.arena(), companion.expression.id());
            constraints.push(Constraint::new(expr, observe(companion.position)?));
        }

        let (found, max_assignments) = self.solve(&arena, target, &constraints)?;
        debug!(
            "{} candidates for flag[{}] under {} constraints (complete: {})",
            found.values.len(),
            target,
            constraints.len(),
            found.complete
        );

        if found.unique().is_none() {
            let reason = match (found.complete, found.values.len()) {
                (true, 0) => "no flag value matches the observed output".to_string(),
                (true, count) => format!("{count} flag values match the observed output"),
                (false, count) => format!(
                    "more than {count} flag values match the observed output"
                ),
            };
            return Err(unsynthesizable(descriptor, reason));
        }

        Ok(Route {
            patches: Vec::new(),
            position: descriptor.position,
            inverse: InverseTransform::Solve,
            expression: expression.clone(),
            companions,
            max_assignments,
        })
    }

    /// Enumerates the values of flag byte `target`, widening the bounds once when
    /// the first attempt runs out of budget or cannot tell a unique value from a
    /// truncated one. Returns the enumeration and the budget it completed under.
    fn solve(
        &self,
        arena: &ExprArena,
        target: u32,
        constraints: &[Constraint],
    ) -> Result<(Enumeration, u64)> {
        let variable = Variable::Flag(target);
        let solver = self.context.solver;
        let first = solver.enumerate_within(
            arena,
            &variable,
            constraints,
            self.max_candidates,
            self.max_assignments,
        );
        let settled = match &first {
            Ok(found) => found.complete || found.values.len() > 1,
            Err(Error::Timeout { .. }) => false,
            Err(_) => true,
        };

        let limits = self.context.config.solver;
        let max_candidates = limits.expanded_candidates.max(self.max_candidates);
        let max_assignments = limits.expanded_assignments.max(self.max_assignments);
        let widened =
            max_candidates > self.max_candidates || max_assignments > self.max_assignments;
        if settled || !widened {
            return first.map(|found| (found, self.max_assignments));
        }

        match &first {
            Err(err) => debug!("widening search for flag[{target}]: {err}"),
            Ok(found) => debug!(
                "widening search for flag[{target}]: {} values under a bound of {}",
                found.values.len(),
                self.max_candidates
            ),
        }
        let found =
            solver.enumerate_within(arena, &variable, constraints, max_candidates, max_assignments)?;
        Ok((found, max_assignments))
    }

    fn add_sibling_routes(&self, primary: &LeakDescriptor, routes: &mut BTreeMap<u32, Route>) {
        let min_confidence = self.context.config.classifier.min_confidence;
        for sibling in self.descriptors {
            if sibling.channel != primary.channel || !sibling.is_exploitable(min_confidence) {
                continue;
            }
            let Some(offset) = sibling.single_flag_offset() else {
                continue;
            };
            if routes.contains_key(&offset) {
                continue;
            }
            match self.route_for(sibling, offset) {
                Ok(route) => {
                    routes.insert(offset, route);
                }
                Err(err) => debug!("no sibling route for flag[{offset}]: {err}"),
            }
        }
    }

    /// Finds an input byte that selects the flag offset leaked at the primary
    /// position, then sweeps its values for routes to uncovered offsets.
    fn probe(
        &self,
        descriptor: &LeakDescriptor,
        primary_offset: u32,
        routes: &mut BTreeMap<u32, Route>,
    ) -> Option<usize> {
        let probing = self.context.config.probing;
        let runner = self.context.runner(self.flag, Stage::ExploitSynthesizer);
        let classifier = LeakClassifier::new(self.context.config.classifier);
        let mut runs = 0usize;

        let mut probe = None;
        for position in 0..self.input.len().min(probing.max_positions) {
            if runs >= probing.max_runs {
                break;
            }
            runs += 1;
            let mut mutated = self.input.to_vec();
            mutated[position] = mutated[position].wrapping_add(1);
            let Some(leaked) = self.leak_at(&runner, &mutated, descriptor) else {
                continue;
            };
            if leaked.single_flag_offset().is_some_and(|offset| offset != primary_offset) {
                probe = Some(position);
                break;
            }
        }
        let probe = probe?;
        debug!("input byte {probe} selects the leaked flag offset");

        for value in 0..=u8::MAX {
            if runs >= probing.max_runs || routes.len() >= self.flag.len() as usize {
                break;
            }
            runs += 1;
            let mut mutated = self.input.to_vec();
            mutated[probe] = value;
            let Some(leaked) = self.leak_at(&runner, &mutated, descriptor) else {
                continue;
            };
            let Some(offset) = leaked.single_flag_offset() else {
                continue;
            };
            if routes.contains_key(&offset) {
                continue;
            }

            let classified = classifier.classify(&leaked);
            if !classified.is_exploitable(self.context.config.classifier.min_confidence) {
                continue;
            }
            let Some(inverse) = classified
                .inverse
                .filter(InverseTransform::is_closed_form)
            else {
                continue;
            };
            routes.insert(
                offset,
                Route {
                    patches: vec![(probe, value)],
                    position: descriptor.position,
                    inverse,
                    expression: leaked.expression,
                    companions: Vec::new(),
                    max_assignments: 0,
                },
            );
        }
        debug!("probing used {runs} runs");
        Some(probe)
    }

    /// Re-traces with `input` and returns the flag dependency at the primary position.
    fn leak_at(
        &self,
        runner: &TraceRunner<'_>,
        input: &[u8],
        descriptor: &LeakDescriptor,
    ) -> Option<ByteDependency> {
        let trace = match runner.run(input, FlagMode::Symbolic) {
            Ok(trace) => trace,
            Err(err) => {
                debug!("probe run failed: {err}");
                return None;
            }
        };
        let TraceByte::Symbolic(id) = trace.byte_at(descriptor.channel, descriptor.position)?
        else {
            return None;
        };
        let flag_offsets = trace.arena().flag_offsets(id);
        if flag_offsets.is_empty() {
            return None;
        }
        let step = trace
            .events()
            .iter()
            .find(|event| {
                event.channel == descriptor.channel
                    && (event.offset..event.offset + event.bytes.len())
                        .contains(&descriptor.position)
            })
            .map_or(0, |event| event.step);
        Some(ByteDependency {
            channel: descriptor.channel,
            position: descriptor.position,
            step,
            flag_offsets,
            expression: trace.expr(id),
        })
    }
}

/// Builds a template from verbatim flag runs found by a concrete scan.
///
/// Every route reads its flag byte unchanged from the unmodified `input`. Only runs
/// on the channel of the first run are used; where runs overlap, the earlier one
/// wins. Returns `None` if there are no runs.
#[must_use]
pub fn verbatim_template(input: &[u8], leaks: &[NaiveLeak]) -> Option<ExploitTemplate> {
    let channel = leaks.first()?.channel;
    let mut routes = BTreeMap::new();
    for leak in leaks.iter().filter(|leak| leak.channel == channel) {
        for step in 0..leak.len {
            let Some(offset) = u32::try_from(step)
                .ok()
                .and_then(|step| leak.flag_offset.checked_add(step))
            else {
                break;
            };
            routes.entry(offset).or_insert_with(|| {
                let mut arena = ExprArena::new();
                let id = arena.flag_byte(offset);
                Route {
                    patches: Vec::new(),
                    position: leak.position + step,
                    inverse: InverseTransform::Identity,
                    expression: ExprRef::new(Arc::new(arena), id),
                    companions: Vec::new(),
                    max_assignments: 0,
                }
            });
        }
    }

    let primary_offset = *routes.keys().next()?;
    info!(
        "built {} verbatim routes on channel {}",
        routes.len(),
        channel
    );
    Some(ExploitTemplate::new(
        input.to_vec(),
        Vec::new(),
        channel,
        primary_offset,
        routes,
    ))
}

fn unsynthesizable(descriptor: &LeakDescriptor, reason: impl Into<String>) -> Error {
    Error::Unsynthesizable {
        descriptor: Box::new(descriptor.clone()),
        reason: reason.into(),
    }
}
