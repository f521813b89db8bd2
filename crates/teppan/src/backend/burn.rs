//! Burn tensors are constrained by their rank, so scores are accepted as
//! `(batch, vocab)` float tensors only.
use burn::tensor::Tensor;
use burn::tensor::backend::Backend as BurnBackend;

use super::Logits;
use crate::error::{Error, Result};

impl<B> Logits for Tensor<B, 2>
where
    B: BurnBackend,
{
    fn into_rows(self) -> Result<Vec<Vec<f32>>> {
        let [rows, cols] = self.dims();
        let values = self
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::Model(format!("{:?}", e)))?;
        if values.len() != rows * cols {
            return Err(Error::Model(format!(
                "expected {} scores, got {}",
                rows * cols,
                values.len()
            )));
        }
        if cols == 0 {
            return Ok(vec![Vec::new(); rows]);
        }
        Ok(values.chunks(cols).map(<[f32]>::to_vec).collect())
    }
}
