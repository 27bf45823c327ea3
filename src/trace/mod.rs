//! Execution traces and the flag region they are recorded against.
//!
//! A trace is the output side of one run of the target: every write to every output
//! channel, in order, with the position of each byte in its channel's stream. In a
//! [`FlagMode::Symbolic`] run, bytes that depend on symbolic state carry an
//! expression over the flag bytes in addition to a placeholder value.
//!
//! # Key Components
//!
//! - [`FlagRegion`] - The protected memory range holding the secret
//! - [`FlagGroundTruth`] - The real secret, known only in self-test settings
//! - [`ExecutionTrace`] - The immutable record of one run
//! - [`TraceRunner`] - Produces traces through an [`ExecutionEngine`](crate::engine::ExecutionEngine)

mod runner;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use strum::Display;

pub use runner::TraceRunner;

use crate::{
    engine::{ChannelId, EngineByte, EngineTrace, MemoryRegion},
    expr::{ExprArena, ExprId, ExprRef},
    Result,
};

/// The protected memory range holding secret data.
///
/// The analysis never reads or writes the region itself. It only asks the engine to
/// treat it as symbolic during tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagRegion {
    base: u64,
    len: u32,
}

impl FlagRegion {
    /// Creates a flag region.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInput`] for an empty region or one that wraps
    /// around the address space.
    pub fn new(base: u64, len: u32) -> Result<Self> {
        if len == 0 {
            return Err(invalid_input!("flag region at {:#x} is empty", base));
        }
        if base.checked_add(u64::from(len)).is_none() {
            return Err(invalid_input!(
                "flag region at {:#x} with {} bytes wraps around",
                base,
                len
            ));
        }
        Ok(Self { base, len })
    }

    /// First address of the region.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length in bytes; never zero.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Always `false`; empty regions are rejected on construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if `offset` lies inside the region.
    #[must_use]
    pub fn contains_offset(&self, offset: u32) -> bool {
        offset < self.len
    }

    /// The region as an engine memory range.
    #[must_use]
    pub fn memory(&self) -> MemoryRegion {
        MemoryRegion {
            base: self.base,
            len: self.len,
        }
    }
}

/// The real content of a flag region, for validation in self-test settings.
#[derive(Clone, PartialEq, Eq)]
pub struct FlagGroundTruth {
    bytes: Vec<u8>,
}

impl FlagGroundTruth {
    /// Binds `bytes` to `region`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInput`] if the length does not match the region.
    pub fn new(region: &FlagRegion, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != region.len() as usize {
            return Err(invalid_input!(
                "ground truth has {} bytes, flag region has {}",
                bytes.len(),
                region.len()
            ));
        }
        Ok(Self { bytes })
    }

    /// The flag byte at `offset`.
    #[must_use]
    pub fn byte(&self, offset: u32) -> Option<u8> {
        self.bytes.get(offset as usize).copied()
    }

    /// All flag bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for FlagGroundTruth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagGroundTruth")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// How the flag region is treated during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum FlagMode {
    /// The flag region holds its real, opaque content.
    #[strum(serialize = "concrete")]
    Concrete,
    /// Every flag byte is a free variable.
    #[strum(serialize = "symbolic")]
    Symbolic,
}

/// One write of the target to an output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    /// The written channel.
    pub channel: ChannelId,
    /// The engine step that performed the write.
    pub step: u64,
    /// Position of the first byte in the channel's output stream.
    pub offset: usize,
    /// The written bytes; symbolic bytes hold a `0` placeholder.
    pub bytes: Vec<u8>,
    /// Per-byte expressions, present if any byte of the write is symbolic.
    pub expressions: Option<Vec<Option<ExprId>>>,
}

/// One output byte of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceByte {
    /// A known value.
    Concrete(u8),
    /// An expression in the trace arena.
    Symbolic(ExprId),
}

/// A symbolic byte together with its location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolicByte {
    /// The channel.
    pub channel: ChannelId,
    /// Position in the channel's output stream.
    pub position: usize,
    /// The engine step that wrote it.
    pub step: u64,
    /// The byte's expression.
    pub expr: ExprId,
}

/// The immutable record of one run.
#[derive(Debug, Clone)]
pub struct ExecutionTrace {
    mode: FlagMode,
    events: Vec<OutputEvent>,
    arena: Arc<ExprArena>,
    steps: u64,
}

impl ExecutionTrace {
    pub(crate) fn from_engine(mode: FlagMode, raw: EngineTrace) -> Self {
        let mut offsets: BTreeMap<ChannelId, usize> = BTreeMap::new();
        let events = raw
            .writes
            .into_iter()
            .map(|write| {
                let offset = offsets.entry(write.channel).or_insert(0);
                let start = *offset;
                *offset += write.bytes.len();

                let symbolic = write
                    .bytes
                    .iter()
                    .any(|byte| matches!(byte, EngineByte::Symbolic(_)));
                let bytes = write
                    .bytes
                    .iter()
                    .map(|byte| match byte {
                        EngineByte::Concrete(value) => *value,
                        EngineByte::Symbolic(_) => 0,
                    })
                    .collect();
                let expressions = symbolic.then(|| {
                    write
                        .bytes
                        .iter()
                        .map(|byte| match byte {
                            EngineByte::Concrete(_) => None,
                            EngineByte::Symbolic(id) => Some(*id),
                        })
                        .collect()
                });

                OutputEvent {
                    channel: write.channel,
                    step: write.step,
                    offset: start,
                    bytes,
                    expressions,
                }
            })
            .collect();

        Self {
            mode,
            events,
            arena: Arc::new(raw.arena),
            steps: raw.steps,
        }
    }

    /// The flag mode of the run.
    #[must_use]
    pub fn mode(&self) -> FlagMode {
        self.mode
    }

    /// Output writes in execution order.
    #[must_use]
    pub fn events(&self) -> &[OutputEvent] {
        &self.events
    }

    /// The arena holding every symbolic output expression.
    #[must_use]
    pub fn arena(&self) -> &Arc<ExprArena> {
        &self.arena
    }

    /// Number of engine steps of the run.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// A shared handle to an expression of this trace.
    #[must_use]
    pub fn expr(&self, id: ExprId) -> ExprRef {
        ExprRef::new(self.arena.clone(), id)
    }

    /// Channels written during the run.
    #[must_use]
    pub fn channels(&self) -> BTreeSet<ChannelId> {
        self.events.iter().map(|event| event.channel).collect()
    }

    /// Total bytes written per channel.
    #[must_use]
    pub fn layout(&self) -> BTreeMap<ChannelId, usize> {
        let mut layout = BTreeMap::new();
        for event in &self.events {
            *layout.entry(event.channel).or_insert(0) += event.bytes.len();
        }
        layout
    }

    /// The byte stream of one channel; symbolic bytes read as `0`.
    #[must_use]
    pub fn channel_output(&self, channel: ChannelId) -> Vec<u8> {
        self.events
            .iter()
            .filter(|event| event.channel == channel)
            .flat_map(|event| event.bytes.iter().copied())
            .collect()
    }

    /// The byte at `position` of `channel`.
    #[must_use]
    pub fn byte_at(&self, channel: ChannelId, position: usize) -> Option<TraceByte> {
        let event = self.events.iter().find(|event| {
            event.channel == channel
                && position >= event.offset
                && position < event.offset + event.bytes.len()
        })?;
        let index = position - event.offset;
        let symbolic = event
            .expressions
            .as_ref()
            .and_then(|expressions| expressions[index]);
        Some(match symbolic {
            Some(id) => TraceByte::Symbolic(id),
            None => TraceByte::Concrete(event.bytes[index]),
        })
    }

    /// Every symbolic output byte, ordered by channel, then position.
    #[must_use]
    pub fn symbolic_bytes(&self) -> Vec<SymbolicByte> {
        let mut found: Vec<SymbolicByte> = self
            .events
            .iter()
            .filter_map(|event| Some((event, event.expressions.as_ref()?)))
            .flat_map(|(event, expressions)| {
                expressions
                    .iter()
                    .enumerate()
                    .filter_map(move |(index, expr)| {
                        expr.map(|expr| SymbolicByte {
                            channel: event.channel,
                            position: event.offset + index,
                            step: event.step,
                            expr,
                        })
                    })
            })
            .collect();
        found.sort_by_key(|byte| (byte.channel, byte.position));
        found
    }

    /// Returns `true` if no output byte is symbolic.
    #[must_use]
    pub fn is_fully_concrete(&self) -> bool {
        self.events.iter().all(|event| event.expressions.is_none())
    }
}
