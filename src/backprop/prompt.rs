//! Training prompts
//!
//! A [`Prompt`] is a token sequence plus the context size: positions whose
//! target token falls inside the context are conditioning only and do not
//! contribute to the loss. [`ReverseSequenceSampler`] produces the synthetic
//! reverse-copy task used by the gradient verification suite: the model sees
//! a payload and must emit it reversed after a separator.

use rand::Rng;

/// Token id type used throughout the gradient engine.
pub type Token = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub tokens: Vec<Token>,
    /// Targets at positions `< context_size` are not scored.
    pub context_size: usize,
}

impl Prompt {
    /// Number of positions the forward pass processes; each position `t`
    /// predicts `tokens[t + 1]`.
    #[must_use]
    pub fn num_positions(&self) -> usize {
        self.tokens.len().saturating_sub(1)
    }

    /// Whether the prediction made at position `pos` is scored.
    #[must_use]
    pub fn is_scored(&self, pos: usize) -> bool {
        pos + 1 >= self.context_size
    }
}

/// Start-of-sequence marker.
pub const BOS_TOKEN: Token = 0;
/// Separator between payload and its reversal.
pub const SEP_TOKEN: Token = 1;
/// First token id usable as payload.
pub const PAYLOAD_BASE: Token = 2;

/// Samples reverse-copy prompts: `BOS payload SEP reverse(payload)`, with
/// the context covering everything up to and including the separator.
#[derive(Debug, Clone)]
pub struct ReverseSequenceSampler {
    lengths: Vec<usize>,
    payload_tokens: usize,
}

impl ReverseSequenceSampler {
    /// `lengths` is the multiset of payload-length offsets to sample from
    /// uniformly (payload length is `offset + 1`); `vocab_size` bounds the
    /// token ids drawn.
    #[must_use]
    pub fn new(lengths: Vec<usize>, vocab_size: usize) -> Self {
        assert!(!lengths.is_empty());
        assert!(vocab_size > PAYLOAD_BASE);
        Self {
            lengths,
            payload_tokens: vocab_size - PAYLOAD_BASE,
        }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> Prompt {
        let pick = self.lengths[rng.gen_range(0..self.lengths.len())];
        let len = pick + 1;
        let payload: Vec<Token> = (0..len)
            .map(|_| PAYLOAD_BASE + rng.gen_range(0..self.payload_tokens))
            .collect();
        let mut tokens = Vec::with_capacity(2 * len + 2);
        tokens.push(BOS_TOKEN);
        tokens.extend_from_slice(&payload);
        tokens.push(SEP_TOKEN);
        tokens.extend(payload.iter().rev());
        Prompt {
            tokens,
            // BOS + payload + SEP are conditioning.
            context_size: len + 2,
        }
    }

    pub fn sample_batch<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<Prompt> {
        (0..batch_size).map(|_| self.sample(rng)).collect()
    }

    pub fn log_prompt(prompt: &Prompt) {
        eprintln!(
            "prompt: {:?} (context {})",
            prompt.tokens, prompt.context_size
        );
    }
}
