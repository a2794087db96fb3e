//! Block-wise causal attention mask for the readout transformer.
//!
//! Tokens are laid out step by step: `n_obs_tokens_per_step` observation
//! tokens followed by `n_readouts_per_step` readout tokens. With two steps,
//! two observation tokens and one readout:
//!
//! ```text
//! step         | 0 | 0 | 0 | 1 | 1 | 1 |
//! kind         | o | o | r | o | o | r |
//! -------------|---|---|---|---|---|---|
//! 0 attends to | ✓ | ✗ | ✗ | ✗ | ✗ | ✗ |
//! 1 attends to | ✓ | ✓ | ✗ | ✗ | ✗ | ✗ |
//! 2 attends to | ✓ | ✓ | ✓ | ✗ | ✗ | ✗ |
//! 3 attends to | ✓ | ✓ | ✗ | ✓ | ✗ | ✗ |
//! 4 attends to | ✓ | ✓ | ✗ | ✓ | ✓ | ✗ |
//! 5 attends to | ✓ | ✓ | ✗ | ✓ | ✓ | ✓ |
//! ```
//!
//! Nothing attends to a readout token except the readout itself.

use ndarray::Array2;

/// Role of a token in the flattened sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Observation,
    Readout,
}

/// Number of tokens in the flattened sequence.
pub fn sequence_len(n_obs_tokens_per_step: usize, n_obs_steps: usize, n_readouts_per_step: usize) -> usize {
    (n_obs_tokens_per_step + n_readouts_per_step) * n_obs_steps
}

/// `(step, kind)` tag of every token, in sequence order.
pub fn token_layout(
    n_obs_tokens_per_step: usize,
    n_obs_steps: usize,
    n_readouts_per_step: usize,
) -> Vec<(usize, TokenKind)> {
    let mut layout = Vec::with_capacity(sequence_len(
        n_obs_tokens_per_step,
        n_obs_steps,
        n_readouts_per_step,
    ));
    for step in 0..n_obs_steps {
        layout.extend((0..n_obs_tokens_per_step).map(|_| (step, TokenKind::Observation)));
        layout.extend((0..n_readouts_per_step).map(|_| (step, TokenKind::Readout)));
    }
    layout
}

/// Additive attention bias: `0.0` where row `i` may attend to column `j`,
/// `-inf` elsewhere.
pub fn make_causal_mask(
    n_obs_tokens_per_step: usize,
    n_obs_steps: usize,
    n_readouts_per_step: usize,
) -> Array2<f32> {
    let len = sequence_len(n_obs_tokens_per_step, n_obs_steps, n_readouts_per_step);
    let block = n_obs_tokens_per_step + n_readouts_per_step;

    // Strict upper triangle blocked: plain causal order over the sequence.
    let mut mask = Array2::from_shape_fn((len, len), |(i, j)| {
        if j > i {
            f32::NEG_INFINITY
        } else {
            0.0
        }
    });

    for start in (n_obs_tokens_per_step..len).step_by(block.max(1)) {
        for col in start..start + n_readouts_per_step {
            mask.column_mut(col).fill(f32::NEG_INFINITY);
            mask[[col, col]] = 0.0;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(mask: &Array2<f32>, i: usize, j: usize) -> bool {
        mask[[i, j]] == 0.0
    }

    #[test]
    fn test_small_mask_matches_diagram() {
        let mask = make_causal_mask(2, 2, 1);
        let expected = [
            [1, 0, 0, 0, 0, 0],
            [1, 1, 0, 0, 0, 0],
            [1, 1, 1, 0, 0, 0],
            [1, 1, 0, 1, 0, 0],
            [1, 1, 0, 1, 1, 0],
            [1, 1, 0, 1, 1, 1],
        ];
        for i in 0..6 {
            for j in 0..6 {
                assert_eq!(allowed(&mask, i, j), expected[i][j] == 1, "cell ({i}, {j})");
            }
        }
    }

    #[test]
    fn test_mask_values_are_zero_or_neg_inf() {
        let mask = make_causal_mask(3, 4, 2);
        assert!(mask
            .iter()
            .all(|&v| v == 0.0 || (v.is_infinite() && v < 0.0)));
    }

    #[test]
    fn test_mask_invariants_over_triples() {
        for n_tokens in 1..5 {
            for n_steps in 1..4 {
                for n_readouts in 1..3 {
                    let mask = make_causal_mask(n_tokens, n_steps, n_readouts);
                    let layout = token_layout(n_tokens, n_steps, n_readouts);
                    let len = sequence_len(n_tokens, n_steps, n_readouts);
                    assert_eq!(mask.dim(), (len, len));
                    assert_eq!(layout.len(), len);

                    for (i, &(step_i, kind_i)) in layout.iter().enumerate() {
                        for (j, &(step_j, kind_j)) in layout.iter().enumerate() {
                            let expect = match (kind_i, kind_j) {
                                // Readout columns only admit their own diagonal.
                                (_, TokenKind::Readout) => i == j,
                                (TokenKind::Observation, TokenKind::Observation) => j <= i,
                                (TokenKind::Readout, TokenKind::Observation) => step_j <= step_i,
                            };
                            assert_eq!(
                                allowed(&mask, i, j),
                                expect,
                                "triple ({n_tokens}, {n_steps}, {n_readouts}) cell ({i}, {j})"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_single_step_still_hides_readouts() {
        let mask = make_causal_mask(3, 1, 2);
        // Readouts occupy columns 3 and 4.
        assert!(allowed(&mask, 3, 3));
        assert!(!allowed(&mask, 4, 3));
        assert!(allowed(&mask, 4, 4));
        for i in 0..3 {
            assert!(!allowed(&mask, i, 3));
            assert!(!allowed(&mask, i, 4));
        }
    }

    #[test]
    fn test_mask_is_deterministic() {
        assert_eq!(make_causal_mask(38, 2, 1), make_causal_mask(38, 2, 1));
    }

    #[test]
    fn test_sequence_len_reference() {
        assert_eq!(sequence_len(38, 2, 1), 78);
    }
}
