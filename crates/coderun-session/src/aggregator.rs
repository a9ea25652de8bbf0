//! Ordered output buffer for a single run.

use coderun_core::{OutputFragment, RunId};

/// Result of offering a fragment to an aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Fragment was next in sequence and is now part of the snapshot.
    Accepted,
    /// Sequence already seen. Dropped.
    Duplicate,
    /// Sequence skipped ahead. Dropped.
    Gap { expected: u64, received: u64 },
    /// Fragment belongs to another run. Dropped.
    WrongRun,
}

/// Append-only output of one run.
///
/// Only the fragment whose sequence equals the number of fragments accepted
/// so far is taken, so the text is always a gap-free prefix of the run's
/// output.
#[derive(Debug, Clone)]
pub struct OutputAggregator {
    run_id: RunId,
    text: String,
    next_sequence: u64,
}

impl OutputAggregator {
    /// Empty aggregator for a run.
    #[must_use]
    pub const fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            text: String::new(),
            next_sequence: 0,
        }
    }

    /// Run this output belongs to.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Sequence number the next accepted fragment must carry.
    #[must_use]
    pub const fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Whether nothing has been accepted yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.next_sequence == 0
    }

    /// Offer a fragment.
    pub fn append(&mut self, fragment: &OutputFragment) -> AppendOutcome {
        if fragment.run_id != self.run_id {
            tracing::debug!(
                run_id = %self.run_id,
                fragment_run = %fragment.run_id,
                "Dropping fragment for another run"
            );
            return AppendOutcome::WrongRun;
        }

        let expected = self.next_sequence;
        if fragment.sequence < expected {
            tracing::debug!(
                run_id = %self.run_id,
                sequence = fragment.sequence,
                "Dropping duplicate fragment"
            );
            return AppendOutcome::Duplicate;
        }
        if fragment.sequence > expected {
            tracing::warn!(
                run_id = %self.run_id,
                expected,
                received = fragment.sequence,
                "Output gap detected, fragment dropped"
            );
            return AppendOutcome::Gap {
                expected,
                received: fragment.sequence,
            };
        }

        self.text.push_str(&fragment.payload);
        self.next_sequence += 1;
        AppendOutcome::Accepted
    }

    /// Concatenated output so far.
    #[must_use]
    pub fn snapshot(&self) -> String {
        self.text.clone()
    }

    /// Borrowed view of the output so far.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn fragment(run_id: RunId, sequence: u64, payload: &str) -> OutputFragment {
        OutputFragment::new(run_id, sequence, payload)
    }

    #[test]
    fn test_in_order_fragments_concatenate() {
        let id = Uuid::new_v4();
        let mut output = OutputAggregator::new(id);

        assert_eq!(output.append(&fragment(id, 0, "Hello, ")), AppendOutcome::Accepted);
        assert_eq!(output.append(&fragment(id, 1, "World!\n")), AppendOutcome::Accepted);
        assert_eq!(output.snapshot(), "Hello, World!\n");
        assert_eq!(output.next_sequence(), 2);
    }

    #[test]
    fn test_first_fragment_must_be_zero() {
        let id = Uuid::new_v4();
        let mut output = OutputAggregator::new(id);

        assert_eq!(
            output.append(&fragment(id, 1, "late")),
            AppendOutcome::Gap {
                expected: 0,
                received: 1
            }
        );
        assert!(output.is_empty());
        assert_eq!(output.snapshot(), "");
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let id = Uuid::new_v4();
        let mut output = OutputAggregator::new(id);

        output.append(&fragment(id, 0, "x\n"));
        let before = output.snapshot();
        assert_eq!(output.append(&fragment(id, 0, "x\n")), AppendOutcome::Duplicate);
        assert_eq!(output.snapshot(), before);
    }

    #[test]
    fn test_gap_then_fill() {
        let id = Uuid::new_v4();
        let mut output = OutputAggregator::new(id);

        output.append(&fragment(id, 0, "a"));
        assert!(matches!(
            output.append(&fragment(id, 2, "c")),
            AppendOutcome::Gap { expected: 1, .. }
        ));
        output.append(&fragment(id, 1, "b"));
        assert_eq!(output.snapshot(), "ab");
    }

    #[test]
    fn test_foreign_fragment_is_ignored() {
        let id = Uuid::new_v4();
        let mut output = OutputAggregator::new(id);

        assert_eq!(
            output.append(&fragment(Uuid::new_v4(), 0, "stale")),
            AppendOutcome::WrongRun
        );
        assert!(output.is_empty());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn snapshot_is_contiguous_prefix(
                offers in proptest::collection::vec((0u64..8, "[a-z]{0,4}"), 0..40)
            ) {
                let id = Uuid::new_v4();
                let mut output = OutputAggregator::new(id);
                let mut accepted = Vec::new();

                for (sequence, payload) in &offers {
                    let outcome = output.append(&fragment(id, *sequence, payload));
                    if outcome == AppendOutcome::Accepted {
                        prop_assert_eq!(*sequence, accepted.len() as u64);
                        accepted.push(payload.clone());
                    } else {
                        prop_assert!(*sequence != accepted.len() as u64);
                    }
                }

                prop_assert_eq!(output.snapshot(), accepted.concat());
                prop_assert_eq!(output.next_sequence(), accepted.len() as u64);
            }

            #[test]
            fn replaying_accepted_fragments_changes_nothing(
                payloads in proptest::collection::vec("[a-z]{1,4}", 1..10)
            ) {
                let id = Uuid::new_v4();
                let mut output = OutputAggregator::new(id);
                for (sequence, payload) in payloads.iter().enumerate() {
                    output.append(&fragment(id, sequence as u64, payload));
                }
                let before = output.snapshot();

                for (sequence, payload) in payloads.iter().enumerate() {
                    prop_assert_eq!(
                        output.append(&fragment(id, sequence as u64, payload)),
                        AppendOutcome::Duplicate
                    );
                }
                prop_assert_eq!(output.snapshot(), before);
            }
        }
    }
}
