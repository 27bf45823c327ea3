//! Exploit synthesis and validation.
//!
//! An exploit here is not a payload but a procedure: for each flag offset it can
//! disclose, an [`ExploitTemplate`] knows which input to send, where in the output
//! the disclosed byte appears, and how to turn that byte back into the flag byte.
//! The [`Validator`] replays sampled routes against the target with known ground
//! truth before an [`ExploitArtifact`] may be exported.
//!
//! # Key Components
//!
//! - [`ExploitSynthesizer`] - Builds templates from classified leaks
//! - [`verbatim_template`] - Builds a template from verbatim flag runs alone
//! - [`ExploitTemplate`] / [`Route`] - The input-generation procedure
//! - [`Validator`] - Replays routes under several environment seeds
//! - [`ExploitArtifact`] / [`ExploitExport`] - Validated result and its export form
//!
//! # Example
//!
//! ```rust,ignore
//! let artifact = analysis.exploit(&ground_truth)?;
//! for offset in artifact.covered_offsets() {
//!     let input = artifact.build_input_for_offset(offset)?;
//!     let position = artifact.expected_output_position(offset)?;
//!     println!("flag[{offset}]: send {input:02x?}, read byte {position}");
//! }
//! ```

mod artifact;
mod synthesizer;
mod template;
mod validator;

pub use artifact::{ExploitArtifact, ExploitExport, ExportedRoute, ValidationStatus};
pub use synthesizer::{verbatim_template, ExploitSynthesizer};
pub use template::{Companion, ExploitTemplate, Route};
pub use validator::{sample_offsets, Mismatch, Validator};
