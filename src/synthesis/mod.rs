//! Query Synthesis Engine
//!
//! Prompt in, [`QueryCandidate`] out. `Absent` and `Incomplete` candidates
//! are ordinary results; only oracle transport and auth failures are errors.

pub mod extract;
pub mod prompt;

pub use extract::{extract, CompletenessState, QueryCandidate, MAX_STITCH_LINES};
pub use prompt::{build_prompt, PromptMode};

use crate::error::Result;
use crate::llm::{OracleReply, TextOracle};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct QuerySynthesizer {
    oracle: Arc<dyn TextOracle>,
}

impl QuerySynthesizer {
    pub fn new(oracle: Arc<dyn TextOracle>) -> Self {
        Self { oracle }
    }

    /// One oracle round trip followed by extraction.
    pub async fn synthesize(
        &self,
        question: &str,
        context_text: &str,
        suggestions: &str,
        mode: PromptMode,
    ) -> Result<QueryCandidate> {
        let prompt = build_prompt(question, context_text, suggestions, mode);
        debug!("Synthesis prompt ({:?}): {} chars", mode, prompt.len());

        let candidate = match self.oracle.complete(&prompt).await? {
            OracleReply::Choices { text, truncated } => {
                if truncated {
                    warn!("Oracle reply hit its token limit; extraction may stitch or report it incomplete");
                }
                extract(&text)
            }
            OracleReply::Malformed(reason) => {
                warn!("Oracle reply unusable: {}", reason);
                QueryCandidate::absent(String::new())
            }
        };

        info!(
            "Synthesis ({:?}) produced {:?} candidate",
            mode, candidate.completeness_state
        );
        Ok(candidate)
    }
}
