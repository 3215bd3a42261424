/// Model construction and pretrained embedding loading
use std::fs::File;
use std::path::Path;

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use ndarray::Array2;
use ndarray_npy::ReadNpyExt;

use super::{BaselineQaNet, ModelArgs};
use crate::data::Vocab;
use crate::device::ComputeContext;

/// Name of the question embedding table inside the parameter map
pub const QUESTION_EMBEDDING: &str = "question_embed.weight";

/// Build the baseline network with fresh parameters registered in `varmap`
pub fn build_model(
    args: &ModelArgs,
    vocab: &Vocab,
    varmap: &VarMap,
    ctx: &ComputeContext,
) -> crate::Result<BaselineQaNet> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, ctx.device());
    Ok(BaselineQaNet::new(args, vocab, vb)?)
}

/// Overwrite the question embedding table with a pretrained matrix (.npy, f32)
///
/// # Arguments
/// * `varmap` - Parameter map holding `question_embed.weight`
/// * `path` - Matrix of shape [question vocabulary, hidden size]
pub fn seed_question_embeddings<P: AsRef<Path>>(
    varmap: &mut VarMap,
    path: P,
    ctx: &ComputeContext,
) -> crate::Result<()> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        crate::TrainError::Config(format!("cannot open embeddings {}: {}", path.display(), e))
    })?;
    let matrix = Array2::<f32>::read_npy(file)?;

    let expected = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| crate::TrainError::Training("parameter map lock poisoned".to_string()))?;
        let var = data.get(QUESTION_EMBEDDING).ok_or_else(|| {
            crate::TrainError::Config(format!("model has no parameter {}", QUESTION_EMBEDDING))
        })?;
        var.dims().to_vec()
    };
    if matrix.shape() != expected.as_slice() {
        return Err(crate::TrainError::Config(format!(
            "embedding matrix {:?} does not match table {:?}",
            matrix.shape(),
            expected
        )));
    }

    let tensor: Tensor = ctx.place_f32(&matrix)?;
    varmap.set_one(QUESTION_EMBEDDING, &tensor)?;
    log::info!("loaded question embeddings from {}", path.display());

    Ok(())
}
