use candle_core::{DType, Tensor};

use super::Logits;
use crate::error::{Error, Result};

fn model_error(e: candle_core::Error) -> Error {
    Error::Model(e.to_string())
}

/// Accepts `(batch, vocab)` scores, or `(batch, seq, vocab)` in which case
/// the last position of every sequence is used.
impl Logits for Tensor {
    fn into_rows(self) -> Result<Vec<Vec<f32>>> {
        let dims = self.dims().to_vec();
        let tensor = match dims.as_slice() {
            [_, _] => self,
            &[_, seq, _] => {
                if seq == 0 {
                    return Err(Error::Model("scores have an empty sequence dimension".to_string()));
                }
                self.narrow(1, seq - 1, 1)
                    .and_then(|t| t.squeeze(1))
                    .map_err(model_error)?
            }
            dims => {
                return Err(Error::Model(format!(
                    "expected rank 2 or 3 scores, got shape {:?}",
                    dims
                )));
            }
        };
        tensor
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec2::<f32>())
            .map_err(model_error)
    }
}
