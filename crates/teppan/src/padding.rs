//! Assembling ragged token sequences into a rectangular batch.

/// A batch of token sequences padded to a common width.
///
/// Sequences are padded at the front so the most recent token of every
/// sequence sits in the last column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBatch {
    /// `(batch, width)` token ids
    pub tokens: Vec<Vec<u32>>,
    /// Unpadded length of each sequence
    pub lengths: Vec<usize>,
}

impl PaddedBatch {
    /// Number of sequences in the batch
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Length of the longest sequence
    pub fn width(&self) -> usize {
        self.tokens.first().map(Vec::len).unwrap_or(0)
    }

    /// The real (unpadded) tokens of sequence `index`
    pub fn sequence(&self, index: usize) -> &[u32] {
        let row = &self.tokens[index];
        &row[row.len() - self.lengths[index]..]
    }

    /// The last real token of sequence `index`, if it has any
    pub fn last_token(&self, index: usize) -> Option<u32> {
        self.sequence(index).last().copied()
    }

    /// `1` where a position holds a real token, `0` where it is padding
    pub fn attention_mask(&self) -> Vec<Vec<u8>> {
        let width = self.width();
        self.lengths
            .iter()
            .map(|&len| {
                let mut mask = vec![0u8; width - len];
                mask.resize(width, 1);
                mask
            })
            .collect()
    }
}

/// Left-pad `sequences` with `pad_token` to the length of the longest one.
pub fn pad_batch(sequences: &[Vec<u32>], pad_token: u32) -> PaddedBatch {
    let width = sequences.iter().map(Vec::len).max().unwrap_or(0);
    let mut tokens = Vec::with_capacity(sequences.len());
    let mut lengths = Vec::with_capacity(sequences.len());
    for sequence in sequences {
        let mut row = vec![pad_token; width - sequence.len()];
        row.extend_from_slice(sequence);
        tokens.push(row);
        lengths.push(sequence.len());
    }
    PaddedBatch { tokens, lengths }
}
