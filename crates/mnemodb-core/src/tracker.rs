//! Side-logger for retrieval inspection.
//!
//! Buffers, per decode step, the predicted token and the retrieved
//! token/id side-channels, then writes one line per (batch row, step):
//! `prediction tok id tok id …` interleaved per head then per
//! neighbor. Emission for a row stops before its first end-of-sequence
//! prediction; rows are separated by a blank line.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{MnemoError, Result};

#[derive(Debug)]
enum TrackSink {
    File(BufWriter<File>),
    Stdout,
}

impl TrackSink {
    fn write_line(&mut self, line: &str) -> Result<()> {
        match self {
            TrackSink::File(w) => {
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")?;
            }
            TrackSink::Stdout => println!("{line}"),
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let TrackSink::File(w) = self {
            w.flush()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Step {
    /// Predicted token per batch row.
    predictions: Vec<i32>,
    /// Retrieved tokens, `(batch, n_heads, k)` row-major.
    tokens: Vec<i32>,
    /// Retrieved example ids, `(batch, n_heads, k)` row-major.
    ids: Vec<i32>,
    k: usize,
}

#[derive(Debug)]
pub struct RetrievalTracker {
    sink: TrackSink,
    n_heads: usize,
    eos_token_id: i32,
    steps: Vec<Step>,
}

impl RetrievalTracker {
    /// `track_file = None` logs to stdout. A file sink gets the head
    /// count and topk baked into its name so runs with different
    /// retrieval settings never clobber each other.
    pub fn open(
        track_file: Option<&Path>,
        n_heads: usize,
        topk: usize,
        eos_token_id: i32,
    ) -> Result<Self> {
        let sink = match track_file {
            Some(base) => {
                let path = PathBuf::from(format!("{}_h{n_heads}_k{topk}.txt", base.display()));
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                TrackSink::File(BufWriter::new(File::create(path)?))
            }
            None => TrackSink::Stdout,
        };
        Ok(Self {
            sink,
            n_heads,
            eos_token_id,
            steps: Vec::new(),
        })
    }

    /// Buffer one decode step. `predictions` is `(batch)`; `tokens`
    /// and `ids` are `(batch, n_heads, k)` row-major.
    pub fn record(
        &mut self,
        predictions: &[i32],
        tokens: &[i32],
        ids: &[i32],
        k: usize,
    ) -> Result<()> {
        let batch = predictions.len();
        if tokens.len() != batch * self.n_heads * k || ids.len() != tokens.len() {
            return Err(MnemoError::Config(format!(
                "tracker step: {} tokens / {} ids for batch {batch}, {} heads, k {k}",
                tokens.len(),
                ids.len(),
                self.n_heads
            )));
        }
        if let Some(first) = self.steps.first() {
            if first.predictions.len() != batch {
                return Err(MnemoError::Config(format!(
                    "tracker step batch {batch} differs from buffered batch {}",
                    first.predictions.len()
                )));
            }
        }
        self.steps.push(Step {
            predictions: predictions.to_vec(),
            tokens: tokens.to_vec(),
            ids: ids.to_vec(),
            k,
        });
        Ok(())
    }

    /// Number of buffered steps.
    pub fn buffered(&self) -> usize {
        self.steps.len()
    }

    /// Format and emit everything buffered, then clear. Steps whose
    /// retrieval width differs from the widest step are zero-padded so
    /// every line has the same column count. A flush with nothing
    /// buffered emits nothing.
    pub fn flush(&mut self) -> Result<()> {
        if self.steps.is_empty() {
            return Ok(());
        }
        let batch = self.steps[0].predictions.len();
        let max_k = self.steps.iter().map(|s| s.k).max().unwrap_or(0);

        for row in 0..batch {
            for step in &self.steps {
                let prediction = step.predictions[row];
                if prediction == self.eos_token_id {
                    break;
                }
                let mut line = String::new();
                line.push_str(&prediction.to_string());
                for h in 0..self.n_heads {
                    for k in 0..max_k {
                        let (tok, id) = if k < step.k {
                            let slot = (row * self.n_heads + h) * step.k + k;
                            (step.tokens[slot], step.ids[slot])
                        } else {
                            (0, 0)
                        };
                        line.push(' ');
                        line.push_str(&tok.to_string());
                        line.push(' ');
                        line.push_str(&id.to_string());
                    }
                }
                self.sink.write_line(&line)?;
            }
            self.sink.write_line("")?;
        }

        self.steps.clear();
        self.sink.flush()
    }
}

impl Drop for RetrievalTracker {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to flush retrieval tracker on drop");
        }
    }
}
