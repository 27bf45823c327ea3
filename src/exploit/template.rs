use std::collections::BTreeMap;

use crate::{
    engine::ChannelId,
    expr::{ExprArena, ExprRef, Variable},
    leak::InverseTransform,
    solver::{Constraint, Solver},
    Error, Result,
};

/// Another output byte over the same flag bytes, used to pin down a solver-backed
/// recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct Companion {
    /// Position of the byte in the template's channel.
    pub position: usize,
    /// The byte's expression.
    pub expression: ExprRef,
}

/// How to make the target disclose one flag offset, and how to read it back.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Input bytes to overwrite in the skeleton, as `(position, value)`.
    pub patches: Vec<(usize, u8)>,
    /// Output position disclosing the flag byte.
    pub position: usize,
    /// Recovery from the output byte at `position`.
    pub inverse: InverseTransform,
    /// Expression of the output byte at `position`.
    pub expression: ExprRef,
    /// Further constraints for [`InverseTransform::Solve`] recoveries.
    pub companions: Vec<Companion>,
    /// Assignment budget a [`InverseTransform::Solve`] recovery was proven unique
    /// under. Closed-form routes leave it at 0.
    pub max_assignments: u64,
}

impl Route {
    /// Predicts the output byte at [`Route::position`] for the given flag content.
    ///
    /// Returns `None` if the expression depends on anything but the flag.
    #[must_use]
    pub fn expected_output(&self, flag: &[u8]) -> Option<u8> {
        self.expression
            .evaluate(|variable| {
                variable
                    .flag_offset()
                    .and_then(|offset| flag.get(offset as usize))
                    .map(|byte| u64::from(*byte))
            })
            .map(|value| value as u8)
    }

    /// Recovers flag byte `offset` from the channel output of a replay.
    ///
    /// Returns `Ok(None)` if the output is too short or the observation does not
    /// determine a single flag value.
    ///
    /// # Errors
    ///
    /// Propagates solver failures of [`InverseTransform::Solve`] recoveries.
    pub fn recover(&self, offset: u32, output: &[u8], solver: &dyn Solver) -> Result<Option<u8>> {
        let Some(observed) = output.get(self.position) else {
            return Ok(None);
        };
        if let Some(value) = self.inverse.apply(*observed) {
            return Ok(Some(value));
        }

        let mut arena = ExprArena::new();
        let mut constraints = vec![Constraint::new(
            arena.import(self.expression.arena(), self.expression.id()),
            *observed,
        )];
        for companion in &self.companions {
            let Some(value) = output.get(companion.position) else {
                return Ok(None);
            };
            let expr = arena.import(companion.expression.arena(), companion.expression.id());
            constraints.push(Constraint::new(expr, *value));
        }

        let found = solver.enumerate_within(
            &arena,
            &Variable::Flag(offset),
            &constraints,
            1,
            self.max_assignments,
        )?;
        Ok(found.unique())
    }
}

/// A reproducible input-generation procedure for one channel.
///
/// The template is immutable once built: every input it produces is the skeleton
/// with the patches of one route applied, so building the input for the same offset
/// twice yields identical bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExploitTemplate {
    skeleton: Vec<u8>,
    probe_positions: Vec<usize>,
    channel: ChannelId,
    primary_offset: u32,
    routes: BTreeMap<u32, Route>,
}

impl ExploitTemplate {
    pub(crate) fn new(
        skeleton: Vec<u8>,
        probe_positions: Vec<usize>,
        channel: ChannelId,
        primary_offset: u32,
        routes: BTreeMap<u32, Route>,
    ) -> Self {
        Self {
            skeleton,
            probe_positions,
            channel,
            primary_offset,
            routes,
        }
    }

    /// The unmodified input every route starts from.
    #[must_use]
    pub fn skeleton(&self) -> &[u8] {
        &self.skeleton
    }

    /// Input positions found to select the leaked flag offset.
    #[must_use]
    pub fn probe_positions(&self) -> &[usize] {
        &self.probe_positions
    }

    /// The channel all routes read from.
    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// The flag offset of the leak the template was synthesized for.
    #[must_use]
    pub fn primary_offset(&self) -> u32 {
        self.primary_offset
    }

    /// Every route, by flag offset.
    #[must_use]
    pub fn routes(&self) -> &BTreeMap<u32, Route> {
        &self.routes
    }

    /// The route for `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetNotCovered`] if no route discloses `offset`.
    pub fn route(&self, offset: u32) -> Result<&Route> {
        self.routes.get(&offset).ok_or(Error::OffsetNotCovered(offset))
    }

    /// The flag offsets the template can disclose, ascending.
    #[must_use]
    pub fn covered_offsets(&self) -> Vec<u32> {
        self.routes.keys().copied().collect()
    }

    /// Builds the input that makes the target disclose `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetNotCovered`] if no route discloses `offset`.
    pub fn build_input_for_offset(&self, offset: u32) -> Result<Vec<u8>> {
        let route = self.route(offset)?;
        let mut input = self.skeleton.clone();
        for (position, value) in &route.patches {
            if *position >= input.len() {
                input.resize(position + 1, 0);
            }
            input[*position] = *value;
        }
        Ok(input)
    }

    /// Output position, in [`ExploitTemplate::channel`], that discloses `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetNotCovered`] if no route discloses `offset`.
    pub fn expected_output_position(&self, offset: u32) -> Result<usize> {
        Ok(self.route(offset)?.position)
    }

    /// The recovery applied to the output byte for `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetNotCovered`] if no route discloses `offset`.
    pub fn inverse_transform(&self, offset: u32) -> Result<&InverseTransform> {
        Ok(&self.route(offset)?.inverse)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{expr::SymbolicOp, solver::EnumerativeSolver};

    fn xor_route(offset: u32, position: usize, patches: Vec<(usize, u8)>) -> Route {
        let mut arena = ExprArena::new();
        let flag = arena.flag_byte(offset);
        let key = arena.constant(0x20);
        let id = arena.binary(SymbolicOp::Xor, flag, key);
        Route {
            patches,
            position,
            inverse: InverseTransform::Xor(0x20),
            expression: ExprRef::new(Arc::new(arena), id),
            companions: Vec::new(),
            max_assignments: 0,
        }
    }

    fn template() -> ExploitTemplate {
        let mut routes = BTreeMap::new();
        routes.insert(1, xor_route(1, 10, Vec::new()));
        routes.insert(3, xor_route(3, 10, vec![(0, 3)]));
        routes.insert(2, xor_route(2, 10, vec![(9, 2)]));
        ExploitTemplate::new(b"AAAA".to_vec(), vec![0], ChannelId::STDOUT, 1, routes)
    }

    #[test]
    fn test_build_input_for_offset() {
        let template = template();
        assert_eq!(template.build_input_for_offset(1).unwrap(), b"AAAA");
        assert_eq!(template.build_input_for_offset(3).unwrap(), b"\x03AAA");
        assert_eq!(
            template.build_input_for_offset(3).unwrap(),
            template.build_input_for_offset(3).unwrap()
        );

        let extended = template.build_input_for_offset(2).unwrap();
        assert_eq!(extended.len(), 10);
        assert_eq!(extended[9], 2);

        assert!(matches!(
            template.build_input_for_offset(0),
            Err(Error::OffsetNotCovered(0))
        ));
        assert_eq!(template.covered_offsets(), vec![1, 2, 3]);
        assert_eq!(template.expected_output_position(3).unwrap(), 10);
    }

    #[test]
    fn test_route_prediction_and_recovery() {
        let route = xor_route(1, 2, Vec::new());
        let flag = [0xde, 0xad, 0xbe, 0xef];
        assert_eq!(route.expected_output(&flag), Some(0xad ^ 0x20));

        let solver = EnumerativeSolver::default();
        let output = [0, 0, 0xad ^ 0x20];
        assert_eq!(route.recover(1, &output, &solver).unwrap(), Some(0xad));
        assert_eq!(route.recover(1, &output[..2], &solver).unwrap(), None);
    }

    #[test]
    fn test_solve_recovery_uses_companions() {
        let mut arena = ExprArena::new();
        let flag = arena.flag_byte(0);
        let high = arena.constant(4);
        let high = arena.binary(SymbolicOp::ShrU, flag, high);
        let mask = arena.constant(0xf);
        let low = arena.binary(SymbolicOp::And, flag, mask);
        let arena = Arc::new(arena);

        let route = Route {
            patches: Vec::new(),
            position: 0,
            inverse: InverseTransform::Solve,
            expression: ExprRef::new(arena.clone(), high),
            companions: vec![Companion {
                position: 1,
                expression: ExprRef::new(arena, low),
            }],
            max_assignments: 1 << 16,
        };

        let solver = EnumerativeSolver::default();
        assert_eq!(route.recover(0, &[0xb, 0xe], &solver).unwrap(), Some(0xbe));

        let mut alone = route.clone();
        alone.companions.clear();
        assert_eq!(alone.recover(0, &[0xb], &solver).unwrap(), None);
    }

    #[test]
    fn test_solve_recovery_uses_route_budget() {
        let mut arena = ExprArena::new();
        let f0 = arena.flag_byte(0);
        let f1 = arena.flag_byte(1);
        let pair = arena.binary(SymbolicOp::Xor, f0, f1);
        let key = arena.constant(0x5a);
        let single = arena.binary(SymbolicOp::Xor, f1, key);
        let arena = Arc::new(arena);

        let route = Route {
            patches: Vec::new(),
            position: 0,
            inverse: InverseTransform::Solve,
            expression: ExprRef::new(arena.clone(), pair),
            companions: vec![Companion {
                position: 1,
                expression: ExprRef::new(arena, single),
            }],
            max_assignments: 1 << 16,
        };

        // The session solver alone only covers one free byte.
        let solver = EnumerativeSolver::new(256);
        assert_eq!(route.recover(0, &[0x11, 0x00], &solver).unwrap(), Some(0x4b));

        let mut narrow = route.clone();
        narrow.max_assignments = 256;
        assert!(matches!(
            narrow.recover(0, &[0x11, 0x00], &solver),
            Err(Error::Timeout { .. })
        ));
    }
}
