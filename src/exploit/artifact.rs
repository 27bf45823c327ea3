use std::fmt;

use crate::{
    engine::ChannelId,
    exploit::{ExploitTemplate, Mismatch},
    leak::InverseTransform,
    solver::Solver,
    trace::FlagRegion,
    Error, Result,
};

/// Outcome of replaying a template against the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationStatus {
    /// Every sampled offset reproduced on every repetition.
    Validated {
        /// The sampled flag offsets.
        samples: Vec<u32>,
    },
    /// At least one replay disagreed with the prediction.
    Unvalidated {
        /// Every failed replay.
        mismatches: Vec<Mismatch>,
    },
}

/// The durable result of an analysis: a template plus its validation record.
#[derive(Debug, Clone, PartialEq)]
pub struct ExploitArtifact {
    template: ExploitTemplate,
    flag: FlagRegion,
    status: ValidationStatus,
}

impl ExploitArtifact {
    /// Wraps a template with its validation status.
    #[must_use]
    pub fn new(template: ExploitTemplate, flag: FlagRegion, status: ValidationStatus) -> Self {
        Self {
            template,
            flag,
            status,
        }
    }

    /// The underlying template.
    #[must_use]
    pub fn template(&self) -> &ExploitTemplate {
        &self.template
    }

    /// The flag region the exploit reads.
    #[must_use]
    pub fn flag(&self) -> FlagRegion {
        self.flag
    }

    /// The validation record.
    #[must_use]
    pub fn status(&self) -> &ValidationStatus {
        &self.status
    }

    /// Returns `true` if every sampled replay reproduced.
    #[must_use]
    pub fn is_validated(&self) -> bool {
        matches!(self.status, ValidationStatus::Validated { .. })
    }

    /// The recorded mismatches; empty for validated artifacts.
    #[must_use]
    pub fn mismatches(&self) -> &[Mismatch] {
        match &self.status {
            ValidationStatus::Validated { .. } => &[],
            ValidationStatus::Unvalidated { mismatches } => mismatches,
        }
    }

    /// The flag offsets the exploit can disclose, ascending.
    #[must_use]
    pub fn covered_offsets(&self) -> Vec<u32> {
        self.template.covered_offsets()
    }

    /// Builds the input that discloses `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetNotCovered`] if no route discloses `offset`.
    pub fn build_input_for_offset(&self, offset: u32) -> Result<Vec<u8>> {
        self.template.build_input_for_offset(offset)
    }

    /// Output position that discloses `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetNotCovered`] if no route discloses `offset`.
    pub fn expected_output_position(&self, offset: u32) -> Result<usize> {
        self.template.expected_output_position(offset)
    }

    /// The recovery applied to the output byte for `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetNotCovered`] if no route discloses `offset`.
    pub fn inverse_transform(&self, offset: u32) -> Result<&InverseTransform> {
        self.template.inverse_transform(offset)
    }

    /// Recovers flag byte `offset` from the channel output produced by
    /// [`ExploitArtifact::build_input_for_offset`].
    ///
    /// # Errors
    ///
    /// - [`Error::OffsetNotCovered`] if no route discloses `offset`
    /// - [`Error::InvalidInput`] if the output does not determine the byte
    /// - solver failures for solver-backed routes
    pub fn recover_flag_byte(&self, offset: u32, output: &[u8], solver: &dyn Solver) -> Result<u8> {
        let route = self.template.route(offset)?;
        route.recover(offset, output, solver)?.ok_or_else(|| {
            invalid_input!(
                "output of {} bytes does not determine flag[{}] at position {}",
                output.len(),
                offset,
                route.position
            )
        })
    }

    /// Describes the exploit for an external packager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotExportable`] unless the artifact is validated.
    pub fn export(&self) -> Result<ExploitExport> {
        if !self.is_validated() {
            return Err(Error::NotExportable);
        }

        let routes = self
            .template
            .routes()
            .iter()
            .map(|(offset, route)| {
                Ok(ExportedRoute {
                    offset: *offset,
                    input: self.template.build_input_for_offset(*offset)?,
                    channel: self.template.channel(),
                    position: route.position,
                    transform: route.inverse.name(),
                    parameters: route.inverse.parameters(),
                    constraints: std::iter::once(&route.expression)
                        .chain(route.companions.iter().map(|c| &c.expression))
                        .filter(|_| !route.inverse.is_closed_form())
                        .map(ToString::to_string)
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ExploitExport {
            flag_base: self.flag.base(),
            flag_len: self.flag.len(),
            routes,
        })
    }
}

/// Packaging-neutral description of a validated exploit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExploitExport {
    /// Base address of the flag region.
    pub flag_base: u64,
    /// Length of the flag region.
    pub flag_len: u32,
    /// One entry per covered flag offset, ascending.
    pub routes: Vec<ExportedRoute>,
}

/// How to disclose and recover one flag offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedRoute {
    /// The disclosed flag offset.
    pub offset: u32,
    /// The complete input to send.
    pub input: Vec<u8>,
    /// The channel to read.
    pub channel: ChannelId,
    /// Position of the disclosing byte in the channel.
    pub position: usize,
    /// Name of the inverse transform.
    pub transform: &'static str,
    /// Parameters of the inverse transform.
    pub parameters: String,
    /// Rendered output expressions to solve, for solver-backed routes.
    pub constraints: Vec<String>,
}

impl fmt::Display for ExploitExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "flag region {:#x}+{} ({} routes)",
            self.flag_base,
            self.flag_len,
            self.routes.len()
        )?;
        for route in &self.routes {
            write!(
                f,
                "  flag[{}]: {}:{} via {}",
                route.offset, route.channel, route.position, route.transform
            )?;
            if !route.parameters.is_empty() && route.transform != "table" {
                write!(f, "({})", route.parameters)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
