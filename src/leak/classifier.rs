//! Grading flag dependencies by how their flag bytes can be read back.
//!
//! Single-byte dependencies are classified from their full truth table: with one
//! free byte there are only 256 inputs, so deciding whether the relation is the
//! identity, a xor, an addition or some other bijection is exact rather than
//! syntactic. Multi-byte dependencies are left to the solver.

use std::{cmp::Ordering, collections::BTreeMap};

use log::debug;

use crate::{
    config::ClassifierConfig,
    engine::ChannelId,
    expr::Variable,
    leak::{ByteDependency, InverseTransform, LeakClass, LeakDescriptor, RepeatPattern},
};

/// Low output byte for every value of a single flag byte.
type TruthTable = [u8; 256];

/// Classifies [`ByteDependency`] values into [`LeakDescriptor`] values.
#[derive(Debug, Clone, Default)]
pub struct LeakClassifier {
    config: ClassifierConfig,
}

impl LeakClassifier {
    /// Creates a classifier.
    #[must_use]
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Classifies one dependency on its own.
    #[must_use]
    pub fn classify(&self, dependency: &ByteDependency) -> LeakDescriptor {
        let expression = &dependency.expression;
        let depth = expression.depth();
        let flag_bytes = dependency.flag_offsets.len();

        let external = expression
            .free_variables()
            .iter()
            .any(|variable| !variable.is_flag());

        let (class, inverse, ambiguity) = if external {
            (LeakClass::Unresolved, None, 1)
        } else if flag_bytes == 1 {
            classify_table(&truth_table(dependency))
        } else if flag_bytes <= self.config.max_flag_bytes {
            (LeakClass::Transformed, None, 1)
        } else {
            (LeakClass::Unresolved, None, 1)
        };

        LeakDescriptor {
            class,
            channel: dependency.channel,
            position: dependency.position,
            pattern: None,
            dependency: dependency.clone(),
            inverse,
            confidence: self.confidence(class, depth, flag_bytes, ambiguity),
            depth,
            ambiguity,
        }
    }

    /// Classifies every dependency, then grades companions jointly, annotates repeat
    /// patterns and sorts the result in selection order.
    ///
    /// `dependencies` is expected in (channel, position) order, as
    /// [`crate::leak::LeakLocator::locate`] returns it.
    #[must_use]
    pub fn classify_all(&self, dependencies: &[ByteDependency]) -> Vec<LeakDescriptor> {
        let mut descriptors: Vec<LeakDescriptor> =
            dependencies.iter().map(|dep| self.classify(dep)).collect();

        self.refine_joint_ambiguity(&mut descriptors);
        annotate_patterns(&mut descriptors);
        descriptors.sort_by(selection_order);

        debug!(
            "classified {} dependencies: {} direct, {} transformed, {} unresolved",
            descriptors.len(),
            count_class(&descriptors, LeakClass::Direct),
            count_class(&descriptors, LeakClass::Transformed),
            count_class(&descriptors, LeakClass::Unresolved)
        );
        descriptors
    }

    fn confidence(&self, class: LeakClass, depth: u32, flag_bytes: usize, ambiguity: u32) -> f64 {
        let depth_factor =
            1.0 + self.config.depth_penalty * f64::from(depth.saturating_sub(1));
        let flag_factor = flag_bytes.max(1) as f64;
        let ambiguity_factor = f64::from(ambiguity.max(1));
        class.base_confidence() / depth_factor / flag_factor / ambiguity_factor
    }

    /// Non-injective single-byte leaks of the same flag byte on the same channel
    /// are recovered together, so they are graded by the ambiguity of the tuple.
    fn refine_joint_ambiguity(&self, descriptors: &mut [LeakDescriptor]) {
        let mut groups: BTreeMap<(ChannelId, u32), Vec<usize>> = BTreeMap::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            if descriptor.class != LeakClass::Transformed
                || descriptor.inverse.is_some()
                || descriptor.ambiguity <= 1
            {
                continue;
            }
            if let Some(offset) = descriptor.single_flag_offset() {
                groups
                    .entry((descriptor.channel, offset))
                    .or_default()
                    .push(index);
            }
        }

        for members in groups.values().filter(|members| members.len() > 1) {
            let tables: Vec<TruthTable> = members
                .iter()
                .map(|index| truth_table(&descriptors[*index].dependency))
                .collect();
            let joint = joint_ambiguity(&tables);

            for index in members {
                let descriptor = &mut descriptors[*index];
                if joint < descriptor.ambiguity {
                    descriptor.ambiguity = joint;
                    descriptor.confidence = self.confidence(
                        descriptor.class,
                        descriptor.depth,
                        1,
                        joint,
                    );
                }
            }
        }
    }
}

/// Orders descriptors by preference: class, confidence (descending), position,
/// number of flag bytes, expression size.
#[must_use]
pub fn selection_order(a: &LeakDescriptor, b: &LeakDescriptor) -> Ordering {
    a.class
        .rank()
        .cmp(&b.class.rank())
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.position.cmp(&b.position))
        .then_with(|| a.flag_offsets().len().cmp(&b.flag_offsets().len()))
        .then_with(|| a.node_count().cmp(&b.node_count()))
        .then_with(|| a.channel.cmp(&b.channel))
}

fn count_class(descriptors: &[LeakDescriptor], class: LeakClass) -> usize {
    descriptors.iter().filter(|d| d.class == class).count()
}

fn truth_table(dependency: &ByteDependency) -> TruthTable {
    let compiled = dependency.expression.compile();
    debug_assert!(compiled.variables().iter().all(Variable::is_flag));

    let mut table = [0u8; 256];
    for (value, entry) in table.iter_mut().enumerate() {
        *entry = compiled.evaluate(&[value as u64]) as u8;
    }
    table
}

fn classify_table(table: &TruthTable) -> (LeakClass, Option<InverseTransform>, u32) {
    let key = table[0];
    if (0..=255u8).all(|value| table[usize::from(value)] == value) {
        return (LeakClass::Direct, Some(InverseTransform::Identity), 1);
    }
    if (0..=255u8).all(|value| table[usize::from(value)] == value ^ key) {
        return (LeakClass::Direct, Some(InverseTransform::Xor(key)), 1);
    }
    if (0..=255u8).all(|value| table[usize::from(value)] == value.wrapping_add(key)) {
        return (LeakClass::Direct, Some(InverseTransform::Sub(key)), 1);
    }

    let mut preimages = [0u32; 256];
    for output in table {
        preimages[usize::from(*output)] += 1;
    }
    let ambiguity = preimages.iter().copied().max().unwrap_or(256);

    match ambiguity {
        1 => {
            let mut inverse = [0u8; 256];
            for (flag, output) in table.iter().enumerate() {
                inverse[usize::from(*output)] = flag as u8;
            }
            (
                LeakClass::Transformed,
                Some(InverseTransform::Table(Box::new(inverse))),
                1,
            )
        }
        256 => (LeakClass::Unresolved, None, 256),
        _ => (LeakClass::Transformed, None, ambiguity),
    }
}

fn joint_ambiguity(tables: &[TruthTable]) -> u32 {
    let mut preimages: BTreeMap<Vec<u8>, u32> = BTreeMap::new();
    for value in 0..256usize {
        let outputs: Vec<u8> = tables.iter().map(|table| table[value]).collect();
        *preimages.entry(outputs).or_insert(0) += 1;
    }
    preimages.values().copied().max().unwrap_or(256)
}

/// Marks runs of same-class, same-inverse single-byte leaks whose positions and
/// flag offsets advance by constant strides.
fn annotate_patterns(descriptors: &mut [LeakDescriptor]) {
    let mut start = 0;
    while start < descriptors.len() {
        let end = run_end(descriptors, start);
        let count = end - start;
        if count >= 2 {
            let first = &descriptors[start];
            let second = &descriptors[start + 1];
            let pattern = RepeatPattern {
                start: first.position,
                stride: second.position - first.position,
                count,
                flag_start: first.single_flag_offset().unwrap_or(0),
                flag_stride: flag_delta(first, second).unwrap_or(0),
            };
            for descriptor in &mut descriptors[start..end] {
                descriptor.pattern = Some(pattern);
            }
        }
        start = end;
    }
}

/// Exclusive end of the run starting at `start`.
fn run_end(descriptors: &[LeakDescriptor], start: usize) -> usize {
    let Some(next) = descriptors.get(start + 1) else {
        return start + 1;
    };
    let first = &descriptors[start];
    if !can_chain(first, next) {
        return start + 1;
    }
    let stride = next.position - first.position;
    let Some(flag_stride) = flag_delta(first, next) else {
        return start + 1;
    };

    let mut end = start + 2;
    while let Some(candidate) = descriptors.get(end) {
        let previous = &descriptors[end - 1];
        if !can_chain(previous, candidate)
            || candidate.position - previous.position != stride
            || flag_delta(previous, candidate) != Some(flag_stride)
        {
            break;
        }
        end += 1;
    }
    end
}

fn can_chain(a: &LeakDescriptor, b: &LeakDescriptor) -> bool {
    a.channel == b.channel
        && a.class == b.class
        && a.class != LeakClass::Unresolved
        && b.position > a.position
        && a.inverse.is_some()
        && a.inverse == b.inverse
}

fn flag_delta(a: &LeakDescriptor, b: &LeakDescriptor) -> Option<i64> {
    let delta = i64::from(b.single_flag_offset()?) - i64::from(a.single_flag_offset()?);
    (delta != 0).then_some(delta)
}
