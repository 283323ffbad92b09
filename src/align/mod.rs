//! Collection of submodel reconstructions into one aligned model.
//!
//! Large datasets get split into submodels that reconstruct independently;
//! this module walks them, gathers every partial reconstruction and hands
//! the whole batch to a [`ReconstructionAligner`] in one call. The merge
//! algorithm itself lives behind that trait.

use crate::dataset::{Config, DataSet, DataSetError, MetaDataSet, PartialReconstructionKey};
use crate::map::Reconstruction;
use log::{debug, info, warn};

/// Output name the aligned reconstruction is saved under.
pub const ALIGNED_RECONSTRUCTION_NAME: &str = "reconstruction.aligned.json";

#[derive(thiserror::Error, Debug)]
pub enum AlignError {
    #[error("No partial reconstructions found across submodels")]
    NoPartialReconstructions,
    #[error(transparent)]
    Dataset(#[from] DataSetError),
    #[error("Merging reconstructions failed: {0}")]
    Merge(String),
}

/// Merges a batch of partial reconstructions into a single aligned one.
pub trait ReconstructionAligner {
    fn merge(
        &self,
        reconstructions: &[Reconstruction],
        config: &Config,
    ) -> Result<Reconstruction, AlignError>;
}

/// Collect every partial reconstruction of every submodel, merge them and
/// save the result through the top-level dataset under `output_name`.
///
/// Submodels without a reconstruction are skipped with a warning. The
/// aligner always receives the top-level configuration, never a submodel's.
///
/// # Errors
///
/// [`AlignError::NoPartialReconstructions`] when no submodel contributed
/// anything, so an empty merge never masquerades as an aligned model.
pub fn align_submodels<D, M, A>(
    data: &D,
    meta: &M,
    aligner: &A,
    output_name: &str,
) -> Result<Reconstruction, AlignError>
where
    D: DataSet,
    M: MetaDataSet,
    A: ReconstructionAligner,
{
    let mut reconstructions = Vec::new();

    for submodel_path in meta.submodel_paths() {
        let submodel = meta.open_submodel(&submodel_path)?;
        if !submodel.reconstruction_exists() {
            warn!(
                "No reconstruction in submodel {}, skipping",
                submodel_path.display()
            );
            continue;
        }
        for (index, partial) in submodel.load_reconstruction()?.into_iter().enumerate() {
            let key = PartialReconstructionKey {
                submodel_path: submodel_path.clone(),
                index,
            };
            debug!(
                "Collected partial reconstruction {:?} with {} shots",
                key,
                partial.shots.len()
            );
            reconstructions.push(partial);
        }
    }

    if reconstructions.is_empty() {
        return Err(AlignError::NoPartialReconstructions);
    }
    info!(
        "Aligning {} partial reconstructions",
        reconstructions.len()
    );

    let merged = aligner.merge(&reconstructions, data.config())?;
    data.save_reconstruction(std::slice::from_ref(&merged), output_name)?;
    Ok(merged)
}
