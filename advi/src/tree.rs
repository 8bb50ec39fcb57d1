//! Named parameter trees and their flat-vector layout.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{AdviError, Result};
use crate::reparam::ApproxNormalPrior;

/// Named parameter values. Leaves carry any leading (sample) dims followed by
/// the parameter's event shape.
pub type ParamTree = BTreeMap<String, Tensor>;

/// Fixed layout of a parameter tree inside a flat vector: ordered
/// `(key, event_shape)` pairs, concatenated in lexicographic key order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeSpec {
    entries: Vec<(String, Vec<usize>)>,
    offsets: Vec<usize>,
    dim: usize,
}

impl TreeSpec {
    pub fn new(mut entries: Vec<(String, Vec<usize>)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut offsets = Vec::with_capacity(entries.len());
        let mut dim = 0;
        for (_, shape) in entries.iter() {
            offsets.push(dim);
            dim += shape.iter().product::<usize>();
        }
        Self {
            entries,
            offsets,
            dim,
        }
    }

    /// Layout of the unconstrained parameters of `prior`
    pub fn from_prior(prior: &ApproxNormalPrior) -> Self {
        prior.tree_spec().clone()
    }

    /// Total length of the flat vector
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn entries(&self) -> &[(String, Vec<usize>)] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Event shape of `key`
    pub fn shape_of(&self, key: &str) -> Option<&[usize]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, s)| s.as_slice())
    }

    /// Concatenate leaves `(*lead, *event)` into `(*lead, D)`
    pub fn flatten(&self, tree: &ParamTree) -> Result<Tensor> {
        if tree.len() != self.entries.len() || !self.keys().all(|k| tree.contains_key(k)) {
            return Err(AdviError::ShapeMismatch(format!(
                "tree keys {:?} do not match layout keys {:?}",
                tree.keys().collect::<Vec<_>>(),
                self.keys().collect::<Vec<_>>()
            )));
        }

        let mut lead: Option<Vec<usize>> = None;
        let mut parts = Vec::with_capacity(self.entries.len());
        for (key, event) in self.entries.iter() {
            let leaf = &tree[key];
            let dims = leaf.dims();
            if dims.len() < event.len() || &dims[dims.len() - event.len()..] != event.as_slice() {
                return Err(AdviError::ShapeMismatch(format!(
                    "leaf '{}' has shape {:?}, expected trailing event shape {:?}",
                    key, dims, event
                )));
            }
            let leaf_lead = dims[..dims.len() - event.len()].to_vec();
            match &lead {
                Some(l) if *l != leaf_lead => {
                    return Err(AdviError::ShapeMismatch(format!(
                        "leaf '{}' has leading dims {:?}, others have {:?}",
                        key, leaf_lead, l
                    )));
                }
                Some(_) => {}
                None => lead = Some(leaf_lead.clone()),
            }
            let mut flat_shape = leaf_lead;
            flat_shape.push(event.iter().product());
            parts.push(leaf.reshape(flat_shape)?);
        }

        let axis = lead.map(|l| l.len()).unwrap_or(0);
        Ok(Tensor::cat(&parts, axis)?)
    }

    /// Split `(*lead, D)` back into leaves `(*lead, *event)`
    pub fn unravel(&self, flat: &Tensor) -> Result<ParamTree> {
        let dims = flat.dims();
        if dims.last() != Some(&self.dim) {
            return Err(AdviError::ShapeMismatch(format!(
                "flat tensor of shape {:?} cannot be unraveled into {} elements",
                dims, self.dim
            )));
        }
        let lead = &dims[..dims.len() - 1];
        let axis = lead.len();

        let mut tree = ParamTree::new();
        for ((key, event), &offset) in self.entries.iter().zip(self.offsets.iter()) {
            let size: usize = event.iter().product();
            let mut shape = lead.to_vec();
            shape.extend_from_slice(event);
            let leaf = flat.narrow(axis, offset, size)?.contiguous()?.reshape(shape)?;
            tree.insert(key.clone(), leaf);
        }
        Ok(tree)
    }
}
